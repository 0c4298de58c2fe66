//! Provider callbacks: inbound dispatch and membership bookkeeping
//!
//! `CoordinatorCore` is the part of the coordinator the membership provider
//! calls into. It owns no provider handle, so a provider can keep it alive
//! without a reference cycle.
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::messages::{ClusterEnvelope, MessageKind};
use super::stats::{EventCounters, EventCounts};
use crate::config_error;
use crate::error::{ClusterError, Result};
use crate::protocol::{Message, MessageHandler};
use crate::provider::{ConflictDelegate, Delegate, EventDelegate, Member};
use crate::settings::ConflictAction;

/// Two members that claimed the same name
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberConflict {
    pub existing: Member,
    pub other: Member,
}

impl MemberConflict {
    pub fn into_error(self) -> ClusterError {
        ClusterError::ConflictFatal(format!(
            "existing member {} conflicts with {}",
            self.existing, self.other
        ))
    }
}

/// Outcome of handing one inbound cluster message to the dispatcher
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// Parsed and passed to the message handler
    Delivered,
    /// Accepted but not forwarded (string traffic, or no handler yet)
    Skipped,
}

pub struct CoordinatorCore {
    name: String,
    handler: OnceLock<Arc<dyn MessageHandler>>,
    counters: EventCounters,
    conflict_action: ConflictAction,
    fatal_tx: watch::Sender<Option<MemberConflict>>,
}

impl std::fmt::Debug for CoordinatorCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorCore")
            .field("name", &self.name)
            .field("has_handler", &self.handler.get().is_some())
            .field("counters", &self.counters.freeze())
            .finish()
    }
}

impl CoordinatorCore {
    pub fn new(
        name: impl Into<String>,
        conflict_action: ConflictAction,
    ) -> (Self, watch::Receiver<Option<MemberConflict>>) {
        let (fatal_tx, fatal_rx) = watch::channel(None);
        let core = Self {
            name: name.into(),
            handler: OnceLock::new(),
            counters: EventCounters::default(),
            conflict_action,
            fatal_tx,
        };
        (core, fatal_rx)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_handler(&self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        self.handler
            .set(handler)
            .map_err(|_| config_error!("A MessageHandler is already set for node {}", self.name))
    }

    pub fn has_handler(&self) -> bool {
        self.handler.get().is_some()
    }

    pub fn event_counts(&self) -> EventCounts {
        self.counters.freeze()
    }

    /// Decode an inbound cluster message and deliver it if it carries an application message
    pub fn dispatch(&self, data: &[u8]) -> Result<Dispatch> {
        let envelope = ClusterEnvelope::decode(data)?;
        debug!(
            "[Node<{}>] Received {} cluster message from node {} ({} bytes)",
            self.name,
            envelope.kind,
            envelope.sender_node_id,
            envelope.body.len()
        );

        match envelope.kind {
            MessageKind::String => {
                debug!(
                    "[Node<{}>] String message from node {}: {}",
                    self.name,
                    envelope.sender_node_id,
                    String::from_utf8_lossy(&envelope.body)
                );
                Ok(Dispatch::Skipped)
            }
            MessageKind::Application => {
                let Some(handler) = self.handler.get() else {
                    warn!(
                        "[Node<{}>] No MessageHandler set; dropping message from node {}",
                        self.name, envelope.sender_node_id
                    );
                    return Ok(Dispatch::Skipped);
                };
                let message = Message::parse(&envelope.body)?;
                // a panicking handler must not take the provider's dispatcher down with it
                catch_unwind(AssertUnwindSafe(|| handler.handle_message(message))).map_err(
                    |panic| {
                        let reason = panic
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "unknown panic".to_string());
                        ClusterError::Handler(format!("MessageHandler panicked: {}", reason))
                    },
                )??;
                Ok(Dispatch::Delivered)
            }
        }
    }

    fn log_event(&self, member: &Member, event: &str) {
        let counts = self.counters.freeze();
        debug!(
            node = %member,
            num_joins = counts.joins,
            num_leaves = counts.leaves,
            num_updates = counts.updates,
            "[Node<{}>] {}",
            self.name,
            event
        );
    }
}

impl Delegate for CoordinatorCore {
    fn notify_msg(&self, msg: &[u8]) {
        match self.dispatch(msg) {
            Ok(_) => {}
            Err(e @ ClusterError::Decode(_)) => {
                error!("[Node<{}>] Decoding of cluster message failed: {}", self.name, e);
            }
            Err(e @ ClusterError::HandlerParse(_)) => {
                error!(
                    "[Node<{}>] Parsing of application message in cluster message failed: {}",
                    self.name, e
                );
            }
            Err(e) => {
                error!("[Node<{}>] MessageHandler failed: {}", self.name, e);
            }
        }
    }

    // Fan-out uses direct sends, nothing is queued for piggybacking
    fn get_broadcasts(&self, _overhead: usize, _limit: usize) -> Vec<Vec<u8>> {
        Vec::new()
    }

    fn node_meta(&self, _limit: usize) -> Vec<u8> {
        Vec::new()
    }

    fn local_state(&self, _join: bool) -> Vec<u8> {
        Vec::new()
    }

    fn merge_remote_state(&self, state: &[u8], join: bool) {
        if !state.is_empty() {
            debug!(
                "[Node<{}>] Ignoring {} bytes of remote state (join: {})",
                self.name,
                state.len(),
                join
            );
        }
    }
}

impl EventDelegate for CoordinatorCore {
    fn notify_join(&self, member: &Member) {
        self.counters.record_join();
        self.log_event(member, "Cluster Node Join");
    }

    fn notify_leave(&self, member: &Member) {
        self.counters.record_leave();
        self.log_event(member, "Cluster Node Leave");
    }

    fn notify_update(&self, member: &Member) {
        self.counters.record_update();
        self.log_event(member, "Cluster Node Update");
    }
}

impl ConflictDelegate for CoordinatorCore {
    fn notify_conflict(&self, existing: &Member, other: &Member) {
        error!(
            existing = %existing,
            other = %other,
            "[Node<{}>] Member name conflict: duplicate node identifier in cluster configuration",
            self.name
        );
        match self.conflict_action {
            ConflictAction::Abort => std::process::abort(),
            ConflictAction::Notify => {
                info!("[Node<{}>] Publishing fatal member conflict", self.name);
                self.fatal_tx.send_replace(Some(MemberConflict {
                    existing: existing.clone(),
                    other: other.clone(),
                }));
            }
        }
    }
}
