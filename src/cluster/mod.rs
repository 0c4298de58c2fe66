//! Cluster coordination
//!
//! Joins this node to the cluster through a membership provider, fans out
//! broadcasts to the other members and turns inbound cluster messages into
//! application messages for the registered `MessageHandler`.
pub mod callbacks;
pub mod coordinator;
pub mod messages;
pub mod stats;

pub use callbacks::{CoordinatorCore, Dispatch, MemberConflict};
pub use coordinator::{ClusterCoordinator, CoordinatorState};
pub use messages::{ClusterEnvelope, MessageKind};
pub use stats::EventCounts;
