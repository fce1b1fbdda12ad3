use core::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use crate::{
    action::ActionRegistrar,
    conversation::{AdminCommand, ConversationEngine, Session},
    policy::AdminPolicy,
    store::{ResponseEntry, ResponseStore},
};

/// Entry point for every inbound message.
///
/// A sender inside a wizard has the message handed to the wizard. Everyone
/// else gets a plain lookup (case-insensitive first, then exact-case), and
/// admins may start a wizard with a command phrase. Anything else is ignored.
#[derive(Clone)]
pub struct MessageRouter {
    store: ResponseStore,
    policy: Arc<AdminPolicy>,
    engine: ConversationEngine,
    actions: Arc<dyn ActionRegistrar>,
}

impl fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageRouter")
            .field("store", &self.store)
            .field("policy", &self.policy)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl MessageRouter {
    pub fn new(
        store: ResponseStore,
        policy: Arc<AdminPolicy>,
        actions: Arc<dyn ActionRegistrar>,
    ) -> Self {
        let engine = ConversationEngine::new(store.clone(), Arc::clone(&actions));
        Self {
            store,
            policy,
            engine,
            actions,
        }
    }

    #[must_use]
    pub const fn engine(&self) -> &ConversationEngine {
        &self.engine
    }

    /// Handle one message and return the replies for its sender, in order.
    pub async fn dispatch(&self, sender: &str, text: &str) -> Vec<String> {
        let mut session = self.engine.session(sender).await;
        let replies = self.route(&mut session, sender, text).await;
        self.engine.release(sender, session).await;
        replies
    }

    async fn route(&self, session: &mut Session, sender: &str, text: &str) -> Vec<String> {
        if session.is_some() {
            return self.engine.advance(session, sender, text).await;
        }

        if let Some(entry) = self.plain_lookup(text).await {
            debug!(sender, trigger = entry.trigger.key(), "Matched response");
            self.actions.on_response(&entry.trigger, sender).await;
            return vec![entry.reply];
        }

        if self.policy.is_admin(sender)
            && let Some(command) = AdminCommand::parse(text)
        {
            info!(sender, command = command.phrase(), "Admin command");
            return self.engine.start(session, command).await;
        }

        Vec::new()
    }

    async fn plain_lookup(&self, text: &str) -> Option<ResponseEntry> {
        match self.store.lookup(text).await {
            Some(entry) => Some(entry),
            None => self.store.lookup_case_sensitive_exact(text).await,
        }
    }
}
