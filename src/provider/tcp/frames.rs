//! Wire frames of the TCP membership protocol
//!
//! Each connection carries one request frame and one response frame. On the
//! socket a frame is a 4-byte big-endian length followed by its bincode body.
use std::net::SocketAddr;

use bincode::{Decode, Encode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::decode_error;
use crate::error::Result;
use crate::provider::Member;
use crate::transport_error;

/// Largest frame body accepted from a peer
pub const MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq, Decode, Encode)]
pub enum Frame {
    /// A node asks to be admitted, pushing its local state. `incarnation` is
    /// random per provider instance.
    Join {
        member: Member,
        incarnation: u64,
        state: Vec<u8>,
    },
    /// Reply to `Join`: the responder's member list, local state and pending broadcasts
    JoinAck {
        members: Vec<Member>,
        state: Vec<u8>,
        broadcasts: Vec<Vec<u8>>,
    },
    /// Point-to-point user message
    User(Vec<u8>),
    /// The member `name` at `address` is leaving
    Leave { name: String, address: SocketAddr },
    Ack,
    Error(String),
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let config = bincode::config::standard().with_big_endian();
        Ok(bincode::encode_to_vec(self, config)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(decode_error!("empty frame"));
        }
        let config = bincode::config::standard()
            .with_big_endian()
            .with_limit::<MAX_FRAME_LEN>();
        let (frame, read): (Self, usize) = bincode::decode_from_slice(data, config)?;
        if read != data.len() {
            return Err(decode_error!(
                "{} trailing bytes after frame",
                data.len() - read
            ));
        }
        Ok(frame)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Join { .. } => "join",
            Frame::JoinAck { .. } => "join-ack",
            Frame::User(_) => "user",
            Frame::Leave { .. } => "leave",
            Frame::Ack => "ack",
            Frame::Error(_) => "error",
        }
    }
}

/// Write one length-prefixed frame body
pub async fn write_frame<W>(stream: &mut W, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if data.len() > MAX_FRAME_LEN {
        return Err(transport_error!("Frame too large: {} bytes", data.len()));
    }
    let len = data.len() as u32;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(data).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame body
pub async fn read_frame<R>(stream: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    stream
        .read_exact(&mut len_bytes)
        .await
        .map_err(|e| transport_error!("Failed to read length prefix: {}", e))?;

    let frame_len = u32::from_be_bytes(len_bytes) as usize;
    if frame_len > MAX_FRAME_LEN {
        return Err(transport_error!("Frame too large: {} bytes", frame_len));
    }

    let mut buf = vec![0u8; frame_len];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|e| transport_error!("Failed to read frame data: {}", e))?;
    Ok(buf)
}
