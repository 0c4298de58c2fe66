use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info};

use super::callbacks::{CoordinatorCore, MemberConflict};
use super::messages::{ClusterEnvelope, MessageKind};
use super::stats::EventCounts;
use crate::config_error;
use crate::error::{ClusterError, Result};
use crate::protocol::{Message, MessageHandler};
use crate::provider::{
    Delegates, Member, MembershipProvider, ProviderConfig, ProviderFactory, TcpProviderFactory,
};
use crate::settings::{ClusterConfig, NodeId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinatorState {
    Created,
    Started,
    Stopped,
}

impl std::fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordinatorState::Created => write!(f, "created"),
            CoordinatorState::Started => write!(f, "started"),
            CoordinatorState::Stopped => write!(f, "stopped"),
        }
    }
}

/// This node's membership in the cluster.
///
/// Owns the membership provider it created and the callback core the provider
/// reports to. A message handler must be set after construction and before
/// `start`.
pub struct ClusterCoordinator {
    config: ClusterConfig,
    core: Arc<CoordinatorCore>,
    provider: Arc<dyn MembershipProvider>,
    state: RwLock<CoordinatorState>,
    // serializes start/stop; held across the provider's join and shutdown
    lifecycle: Mutex<()>,
    fatal_rx: watch::Receiver<Option<MemberConflict>>,
    runtime: Handle,
}

impl std::fmt::Debug for ClusterCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterCoordinator")
            .field("node_id", &self.config.id)
            .field("state", &self.state())
            .field("local_address", &self.provider.local_address())
            .field("has_handler", &self.core.has_handler())
            .finish()
    }
}

impl ClusterCoordinator {
    /// Create a coordinator backed by the TCP membership provider
    pub async fn new(config: ClusterConfig) -> Result<Self> {
        Self::with_provider(config, &TcpProviderFactory::default()).await
    }

    pub async fn with_provider(config: ClusterConfig, factory: &dyn ProviderFactory) -> Result<Self> {
        let bind_address = config.bind_address()?;
        let advertise_address = config.advertise_address()?;
        let (core, fatal_rx) = CoordinatorCore::new(config.name(), config.conflict_action);
        let core = Arc::new(core);

        let provider_config = ProviderConfig {
            name: core.name().to_string(),
            bind_address,
            advertise_address,
        };
        let provider = factory
            .create(provider_config, Delegates::from_shared(core.clone()))
            .await
            .map_err(|e| {
                error!(
                    "[Node<{}>] Error when creating the membership provider of the cluster: {}",
                    config.id, e
                );
                match e {
                    ClusterError::ProviderInit(_) => e,
                    other => ClusterError::ProviderInit(other.to_string()),
                }
            })?;

        info!(
            "[Node<{}>] Created cluster coordinator bound to {}",
            config.id,
            provider.local_address()
        );

        Ok(Self {
            config,
            core,
            provider,
            state: RwLock::new(CoordinatorState::Created),
            lifecycle: Mutex::new(()),
            fatal_rx,
            runtime: Handle::current(),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.config.id
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.read()
    }

    pub fn local_address(&self) -> SocketAddr {
        self.provider.local_address()
    }

    pub fn members(&self) -> Vec<Member> {
        self.provider.members()
    }

    pub fn health_score(&self) -> u32 {
        self.provider.health_score()
    }

    pub fn event_counts(&self) -> EventCounts {
        self.core.event_counts()
    }

    /// Receives a value when a member conflict is detected under `ConflictAction::Notify`.
    /// The embedding application must treat that as fatal.
    pub fn fatal_signal(&self) -> watch::Receiver<Option<MemberConflict>> {
        self.fatal_rx.clone()
    }

    /// Register the consumer of application messages. Can only be set once.
    pub fn set_message_handler(&self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        self.core.set_handler(handler)
    }

    /// Join the cluster through the configured remotes
    pub async fn start(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        let state = self.state();
        if state != CoordinatorState::Created {
            return Err(ClusterError::Lifecycle(format!(
                "cannot start a {} coordinator",
                state
            )));
        }
        debug!(
            "[Node<{}>] Starting cluster with remotes {:?}",
            self.config.id, self.config.remotes
        );
        if !self.core.has_handler() {
            let err = config_error!("There should be a valid MessageHandler already set-up");
            error!("[Node<{}>] {}", self.config.id, err);
            return Err(err);
        }

        let reached = self
            .provider
            .join(&self.config.remotes)
            .await
            .map_err(|e| {
                error!(
                    "[Node<{}>] Error when this node wanted to join the cluster: {}",
                    self.config.id, e
                );
                match e {
                    ClusterError::Join(_) => e,
                    other => ClusterError::Join(other.to_string()),
                }
            })?;
        if reached == 0 {
            let msg = "No remote hosts were successfully contacted when this node wanted to join the cluster";
            error!("[Node<{}>] {}", self.config.id, msg);
            return Err(ClusterError::Join(msg.to_string()));
        }

        *self.state.write() = CoordinatorState::Started;
        info!(
            "[Node<{}>] Started cluster: reached {} of {} remotes, {} members known",
            self.config.id,
            reached,
            self.config.remotes.len(),
            self.provider.members().len()
        );
        Ok(())
    }

    /// Leave the cluster. The coordinator is stopped afterwards even if the
    /// provider reports a shutdown error.
    pub async fn stop(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.state() == CoordinatorState::Stopped {
            debug!("[Node<{}>] Cluster already stopped", self.config.id);
            return Ok(());
        }
        let result = self.provider.shutdown().await;
        *self.state.write() = CoordinatorState::Stopped;
        match &result {
            Ok(()) => info!("[Node<{}>] Stopped cluster", self.config.id),
            Err(e) => error!(
                "[Node<{}>] Error while shutting down the membership provider: {}",
                self.config.id, e
            ),
        }
        result
    }

    /// Fails if the health score (as seen by this node) is above the threshold
    pub fn check(&self) -> Result<()> {
        let score = self.provider.health_score();
        let threshold = self.config.health_score_threshold;
        if score > threshold {
            error!(
                health_score = score,
                "[Node<{}>] Cluster Health Score is not perfect", self.config.id
            );
            return Err(ClusterError::Health { score, threshold });
        }
        Ok(())
    }

    /// Broadcast a string to all the other nodes of the cluster.
    /// Returns the number of deliveries initiated.
    pub fn broadcast_string(&self, text: &str) -> Result<usize> {
        debug!("[Node<{}>] BroadcastString: {}", self.config.id, text);
        self.broadcast_envelope(ClusterEnvelope::new(
            self.config.id,
            MessageKind::String,
            text.as_bytes().to_vec(),
        ))
    }

    /// Broadcast an application message to all the other nodes of the cluster.
    /// Returns the number of deliveries initiated.
    pub fn broadcast_message(&self, message: &Message) -> Result<usize> {
        debug!(
            "[Node<{}>] BroadcastMessage: {} ({} bytes)",
            self.config.id,
            message.path,
            message.body.len()
        );
        self.broadcast_envelope(ClusterEnvelope::new(
            self.config.id,
            MessageKind::Application,
            message.encode(),
        ))
    }

    // Encode once, then one independent delivery task per peer. Returns once
    // the tasks are spawned; their outcome is only logged.
    fn broadcast_envelope(&self, envelope: ClusterEnvelope) -> Result<usize> {
        let data: Arc<[u8]> = envelope
            .encode()
            .map_err(|e| {
                error!(
                    "[Node<{}>] Could not encode and broadcast cluster message: {}",
                    self.config.id, e
                );
                e
            })?
            .into();

        let mut initiated = 0;
        for member in self.provider.members() {
            if member.name == self.core.name() {
                continue;
            }
            let provider = self.provider.clone();
            let data = data.clone();
            let node_id = self.config.id;
            self.runtime.spawn(async move {
                debug!(
                    "[Node<{}>] Sending cluster message to node {}",
                    node_id, member
                );
                if let Err(e) = provider.send_reliable(&member, &data).await {
                    error!(
                        "[Node<{}>] Error sending cluster message to node {}: {}",
                        node_id, member, e
                    );
                }
            });
            initiated += 1;
        }
        Ok(initiated)
    }
}
