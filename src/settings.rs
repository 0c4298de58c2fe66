//! Murmur cluster settings
use std::net::{SocketAddr, ToSocketAddrs};

use crate::config_error;
use crate::error::Result;

pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DEFAULT_PORT_CLUSTER: &str = "10000";
pub const DEFAULT_HTTP_LISTEN: &str = "0.0.0.0:8080";
pub const DEFAULT_HEALTH_SCORE_THRESHOLD: &str = "0";

pub type NodeId = u32;

/// What to do when two members claim the same identity
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConflictAction {
    /// Log and abort the process
    #[default]
    Abort,
    /// Log and publish on the coordinator's fatal signal; the host must stop
    Notify,
}

impl std::fmt::Display for ConflictAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictAction::Abort => write!(f, "abort"),
            ConflictAction::Notify => write!(f, "notify"),
        }
    }
}

impl std::str::FromStr for ConflictAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "abort" => Ok(ConflictAction::Abort),
            "notify" => Ok(ConflictAction::Notify),
            _ => Err(format!("Invalid conflict action: {}", s)),
        }
    }
}

/// Configuration used by the local node when creating and running the cluster
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    // Numeric node identifier, unique within the cluster
    pub id: NodeId,

    // Cluster bind host
    pub host: String,

    // Cluster bind port
    pub port: u16,

    // Host other members reach this node at; defaults to the bind address
    pub advertise_host: Option<String>,

    // Addresses contacted on join
    pub remotes: Vec<SocketAddr>,

    // Inclusive upper bound of a healthy score
    pub health_score_threshold: u32,

    pub conflict_action: ConflictAction,
}

impl ClusterConfig {
    pub fn new(id: NodeId, host: impl Into<String>, port: u16, remotes: Vec<SocketAddr>) -> Self {
        Self {
            id,
            host: host.into(),
            port,
            advertise_host: None,
            remotes,
            health_score_threshold: 0,
            conflict_action: ConflictAction::default(),
        }
    }

    pub fn with_health_score_threshold(mut self, threshold: u32) -> Self {
        self.health_score_threshold = threshold;
        self
    }

    pub fn with_advertise_host(mut self, host: impl Into<String>) -> Self {
        self.advertise_host = Some(host.into());
        self
    }

    pub fn with_conflict_action(mut self, action: ConflictAction) -> Self {
        self.conflict_action = action;
        self
    }

    /// The name this node is known by in the membership list
    pub fn name(&self) -> String {
        self.id.to_string()
    }

    /// Resolve `host:port` into the address the provider binds to
    pub fn bind_address(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| config_error!("Invalid bind address {}:{}: {}", self.host, self.port, e))?
            .next()
            .ok_or_else(|| config_error!("No address for {}:{}", self.host, self.port))
    }

    /// Resolve `advertise_host:port` into the address announced to other members
    pub fn advertise_address(&self) -> Result<Option<SocketAddr>> {
        let Some(host) = self.advertise_host.as_deref() else {
            return Ok(None);
        };
        (host, self.port)
            .to_socket_addrs()
            .map_err(|e| config_error!("Invalid advertise address {}:{}: {}", host, self.port, e))?
            .next()
            .map(Some)
            .ok_or_else(|| config_error!("No address for {}:{}", host, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_is_decimal_id() {
        let config = ClusterConfig::new(42, "127.0.0.1", 0, vec![]);
        assert_eq!(config.name(), "42");
    }

    #[test]
    fn test_bind_address() {
        let config = ClusterConfig::new(1, "127.0.0.1", 10001, vec![]);
        assert_eq!(
            config.bind_address().unwrap(),
            "127.0.0.1:10001".parse::<SocketAddr>().unwrap()
        );

        let config = ClusterConfig::new(1, "not a host!", 10001, vec![]);
        assert!(config.bind_address().is_err());
    }

    #[test]
    fn test_advertise_address() {
        let config = ClusterConfig::new(1, "0.0.0.0", 10001, vec![]);
        assert_eq!(config.advertise_address().unwrap(), None);

        let config = config.with_advertise_host("10.0.0.7");
        assert_eq!(
            config.advertise_address().unwrap(),
            Some("10.0.0.7:10001".parse::<SocketAddr>().unwrap())
        );

        let config = ClusterConfig::new(1, "0.0.0.0", 10001, vec![]).with_advertise_host("not a host!");
        assert!(config.advertise_address().is_err());
    }

    #[test]
    fn test_conflict_action_parse() {
        assert_eq!("abort".parse::<ConflictAction>(), Ok(ConflictAction::Abort));
        assert_eq!("NOTIFY".parse::<ConflictAction>(), Ok(ConflictAction::Notify));
        assert!("ignore".parse::<ConflictAction>().is_err());
        assert_eq!(ConflictAction::default().to_string(), "abort");
    }
}
