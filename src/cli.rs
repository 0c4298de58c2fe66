//! CLI for this application
//!
use std::net::SocketAddr;

use crate::settings::{self, ClusterConfig, ConflictAction, NodeId};

#[derive(Clone, Debug, clap::Parser)]
#[clap(version)]
pub struct Cli {
    // Node identifier
    #[clap(
        long,
        env("MURMUR_NODE_ID"),
        help = "Unique numeric identifier of this node in the cluster"
    )]
    pub node_id: NodeId,

    // Cluster listen address
    #[clap(
        long,
        default_value = "0.0.0.0",
        env("MURMUR_HOST"),
        help = "IP Address to bind the cluster listener to"
    )]
    pub host: String,

    // Cluster listen port
    #[clap(
        long,
        default_value = settings::DEFAULT_PORT_CLUSTER,
        env("MURMUR_PORT"),
        help = "Port to bind the cluster listener to"
    )]
    pub port: u16,

    #[clap(
        long,
        env("MURMUR_ADVERTISE_HOST"),
        help = "Host other members reach this node at; defaults to the bind address"
    )]
    pub advertise_host: Option<String>,

    // Cluster configuration information: remotes contacted on join
    #[clap(
        long,
        env("MURMUR_REMOTES"),
        value_delimiter = ',',
        required = true,
        help = "Cluster addresses to join (e.g., 10.0.0.1:10000,10.0.0.2:10000). May include this node."
    )]
    pub remotes: Vec<SocketAddr>,

    #[clap(
        long,
        default_value = settings::DEFAULT_HEALTH_SCORE_THRESHOLD,
        env("MURMUR_HEALTH_SCORE_THRESHOLD"),
        help = "Highest health score still reported as healthy"
    )]
    pub health_score_threshold: u32,

    #[clap(
        long,
        default_value = "abort",
        env("MURMUR_CONFLICT_ACTION"),
        help = "On duplicate node identity: 'abort' or 'notify'"
    )]
    pub conflict_action: ConflictAction,

    // Monitoring HTTP API; the full `std::option::Option` path keeps clap from making it optional
    #[clap(
        long,
        default_value = settings::DEFAULT_HTTP_LISTEN,
        env("MURMUR_HTTP_LISTEN"),
        value_parser = parse_http_listen,
        help = "Address for the monitoring HTTP API; empty disables it"
    )]
    pub http_listen: std::option::Option<SocketAddr>,

    #[clap(
        long,
        default_value = "/cluster/chat",
        help = "Topic path used for lines read from stdin"
    )]
    pub path: String,

    #[clap(long, env("MURMUR_LOG_JSON"), help = "Emit logs as JSON")]
    pub log_json: bool,
}

impl Cli {
    pub fn cluster_config(&self) -> ClusterConfig {
        let config =
            ClusterConfig::new(self.node_id, self.host.clone(), self.port, self.remotes.clone())
                .with_health_score_threshold(self.health_score_threshold)
                .with_conflict_action(self.conflict_action);
        match &self.advertise_host {
            Some(host) => config.with_advertise_host(host.clone()),
            None => config,
        }
    }
}

fn parse_http_listen(s: &str) -> Result<Option<SocketAddr>, String> {
    if s.is_empty() {
        return Ok(None);
    }
    s.parse()
        .map(Some)
        .map_err(|e| format!("Invalid monitoring address {:?}: {}", s, e))
}
