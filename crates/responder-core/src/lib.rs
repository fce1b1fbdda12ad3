pub mod action;
pub mod conversation;
pub mod error;
pub mod persist;
pub mod policy;
pub mod router;
pub mod store;

pub use action::{ActionDescriptor, ActionKind, ActionRegistrar, ActionTarget};
pub use conversation::{AdminCommand, ConversationEngine, Mode, SelectionIndex, Wizard};
pub use error::StoreError;
pub use policy::AdminPolicy;
pub use router::MessageRouter;
pub use store::{ResponseEntry, ResponseStore, Trigger};

use anyhow::Result;
use async_trait::async_trait;

/// Outbound side of the messaging network: deliver `text` to a single user.
///
/// Delivery is fire-and-forget from the conversation's point of view; callers
/// log failures and move on.
#[async_trait]
pub trait Outbox: Send + Sync {
    async fn send_text(&self, recipient: &str, text: &str) -> Result<()>;
}

#[must_use]
pub fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
