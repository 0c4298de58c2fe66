//! Callback contract a membership provider drives
//!
//! A provider holds one `Delegates` bundle and invokes it from its own tasks,
//! possibly concurrently. None of these callbacks return errors: implementations
//! log their own failures.
use std::sync::Arc;

use super::Member;

/// Message delegate: inbound user messages, piggybacked broadcasts, metadata and state
pub trait Delegate: Send + Sync {
    /// Raw bytes sent by a peer with `send_reliable`
    fn notify_msg(&self, msg: &[u8]);

    /// Pending messages the provider may piggyback on its own traffic
    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>>;

    /// Per-node metadata advertised to peers, at most `limit` bytes
    fn node_meta(&self, limit: usize) -> Vec<u8>;

    /// State pushed to a peer during join (`join == true`) or anti-entropy
    fn local_state(&self, join: bool) -> Vec<u8>;

    fn merge_remote_state(&self, state: &[u8], join: bool);
}

/// Event delegate: membership changes
pub trait EventDelegate: Send + Sync {
    fn notify_join(&self, member: &Member);
    fn notify_leave(&self, member: &Member);
    fn notify_update(&self, member: &Member);
}

/// Conflict delegate: two members with the same name
pub trait ConflictDelegate: Send + Sync {
    fn notify_conflict(&self, existing: &Member, other: &Member);
}

#[derive(Clone)]
pub struct Delegates {
    pub message: Arc<dyn Delegate>,
    pub events: Arc<dyn EventDelegate>,
    pub conflict: Arc<dyn ConflictDelegate>,
}

impl Delegates {
    /// Use one value for all three capability sets
    pub fn from_shared<T>(target: Arc<T>) -> Self
    where
        T: Delegate + EventDelegate + ConflictDelegate + 'static,
    {
        Self {
            message: target.clone(),
            events: target.clone(),
            conflict: target,
        }
    }
}

impl std::fmt::Debug for Delegates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delegates").finish_non_exhaustive()
    }
}
