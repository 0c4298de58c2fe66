//! Membership Provider
//!
//! The coordination layer never talks to the network itself. A provider supplies
//! peer discovery, join/leave detection, a health score and reliable
//! point-to-point delivery, and reports events through the `Delegates` it was
//! created with.
//!
//! Two providers ship with the crate:
//! - `tcp::TcpProviderFactory`: length-prefixed TCP exchanges between real processes
//! - `local::LocalNetwork`: in-process delivery, for tests and single-process embedding
pub mod delegate;
pub mod local;
pub mod tcp;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bincode::{Decode, Encode};
use serde::Serialize;

use crate::error::Result;
pub use delegate::{ConflictDelegate, Delegate, Delegates, EventDelegate};
pub use local::{LocalNetwork, LocalProvider};
pub use tcp::{TcpProvider, TcpProviderFactory};

/// A node as seen in the membership list
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Decode, Encode)]
pub struct Member {
    pub name: String,
    pub address: SocketAddr,
    pub meta: Vec<u8>,
}

impl Member {
    pub fn new(name: impl Into<String>, address: SocketAddr) -> Self {
        Self {
            name: name.into(),
            address,
            meta: Vec::new(),
        }
    }
}

impl std::fmt::Display for Member {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.address)
    }
}

/// What a provider needs to know about the local node
#[derive(Clone, Debug)]
pub struct ProviderConfig {
    pub name: String,
    pub bind_address: SocketAddr,
    /// Address peers should use to reach this node when it differs from
    /// `bind_address`. A zero port means "the bound port".
    pub advertise_address: Option<SocketAddr>,
}

#[async_trait]
pub trait MembershipProvider: Send + Sync {
    /// Contact `remotes` and merge their view of the cluster.
    /// Returns how many of them were reached.
    async fn join(&self, remotes: &[SocketAddr]) -> Result<usize>;

    /// Leave the cluster and release the listener
    async fn shutdown(&self) -> Result<()>;

    /// Lower is healthier; 0 is perfect
    fn health_score(&self) -> u32;

    /// Live membership snapshot, including the local node
    fn members(&self) -> Vec<Member>;

    async fn send_reliable(&self, peer: &Member, data: &[u8]) -> Result<()>;

    /// Address the provider is actually bound to
    fn local_address(&self) -> SocketAddr;
}

#[async_trait]
pub trait ProviderFactory: Send + Sync {
    /// Bind and initialize a provider that reports to `delegates`.
    /// Failures are `ClusterError::ProviderInit`.
    async fn create(
        &self,
        config: ProviderConfig,
        delegates: Delegates,
    ) -> Result<Arc<dyn MembershipProvider>>;
}
