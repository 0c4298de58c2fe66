//! Messages exchanged by publishers and subscribers of the broker
pub mod message;

pub use message::{Message, Path};

use crate::error::Result;

/// Consumer of application messages received from other nodes
///
/// Called synchronously from the membership provider's receive path, so
/// implementations should hand long work off rather than block.
pub trait MessageHandler: Send + Sync {
    fn handle_message(&self, message: Message) -> Result<()>;
}
