//! Cluster Message Protocol
//!
//! Every inter-node message is a `ClusterEnvelope`: the originating node's id,
//! a kind discriminant and an opaque body. Envelopes use bincode for a compact
//! binary format; all nodes of one cluster must run the same encoding.
use bincode::{Decode, Encode};

use crate::decode_error;
use crate::error::Result;
use crate::settings::NodeId;

/// Largest body length a decoded envelope may claim
pub const MAX_ENVELOPE_LEN: usize = 10 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Decode, Encode)]
pub enum MessageKind {
    /// Raw UTF-8 text, for diagnostic or administrative traffic
    String,
    /// An encoded `protocol::Message`
    Application,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::String => write!(f, "string"),
            MessageKind::Application => write!(f, "application"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Decode, Encode)]
pub struct ClusterEnvelope {
    /// Configured id of the node that built the envelope
    pub sender_node_id: NodeId,
    pub kind: MessageKind,
    pub body: Vec<u8>,
}

impl ClusterEnvelope {
    pub fn new(sender_node_id: NodeId, kind: MessageKind, body: Vec<u8>) -> Self {
        Self {
            sender_node_id,
            kind,
            body,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let config = bincode::config::standard().with_big_endian();
        Ok(bincode::encode_to_vec(self, config)?)
    }

    /// Decode a complete envelope; trailing bytes are rejected
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(decode_error!("empty cluster message"));
        }
        let config = bincode::config::standard()
            .with_big_endian()
            .with_limit::<MAX_ENVELOPE_LEN>();
        let (envelope, read): (Self, usize) = bincode::decode_from_slice(data, config)?;
        if read != data.len() {
            return Err(decode_error!(
                "{} trailing bytes after cluster message",
                data.len() - read
            ));
        }
        Ok(envelope)
    }
}
