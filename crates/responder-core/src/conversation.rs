//! Per-user wizard state machine.
//!
//! Each user has at most one active [`Wizard`]. The wizard value carries both
//! the current step and the data collected so far, so its shape always matches
//! its mode. [`ConversationEngine::advance`] checks the cancel token before
//! dispatching to the step handler, for every step of every wizard.
//!
//! The cancel token is compared exactly (`cancel` only), while Y/N answers
//! are compared after upper-casing.

use core::fmt;
use std::{collections::HashMap, sync::Arc};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::{
    action::{ACTION_KINDS, ActionDescriptor, ActionKind, ActionRegistrar, ActionTarget},
    store::{ResponseEntry, ResponseStore, Trigger},
};

pub const CANCEL_TOKEN: &str = "cancel";

pub(crate) const CANCEL_HINT: &str = "If at anytime you want to cancel, simply type cancel.";
pub(crate) const CANCELLED: &str = "Action cancelled.";
pub(crate) const NO_RESPONSES: &str =
    "There are currently no responses, type \"add response\" (no quotes) to get started.";
pub(crate) const PROMPT_TRIGGER: &str = "Please enter the message you would like me to respond to.";
pub(crate) const PROMPT_SENSITIVITY: &str = "Do you want the message to be case-sensitive? (Y/N)";
pub(crate) const ONLY_YES_NO: &str = "Please only enter Y or N.";
pub(crate) const PROMPT_REPLY: &str = "Please enter the response that I should send to this message.";
pub(crate) const RESPONSE_ADDED: &str =
    "Response added, if you want further actions, type \"add action\" (no quotes).";
pub(crate) const ADD_FAILED: &str = "Failed to add response, please try again later.";
pub(crate) const REMOVE_HEADING: &str = "Please type the ID of the response to remove:";
pub(crate) const INVALID_ID: &str = "Invalid ID, please type a correct ID or type cancel to cancel.";
pub(crate) const REMOVE_FAILED: &str = "Failed to remove response, please try again later.";
pub(crate) const ACTION_HEADING: &str =
    "Please type the ID of the response to attach an action to:";
pub(crate) const PROMPT_KIND: &str = "Which kind of action should I perform? Available: message";
pub(crate) const UNKNOWN_KIND: &str = "Unknown action kind. Available: message";
pub(crate) const PROMPT_ACTION_BODY: &str = "Please enter the message that should be sent.";
pub(crate) const PROMPT_TARGET: &str = "Who should receive it? Enter a user ID (e.g. @someone:example.org), \"admins\" for every admin, or \"user\" for the user who triggered the response.";
pub(crate) const INVALID_TARGET: &str = "That is not a valid user ID, \"admins\" or \"user\".";
pub(crate) const PROMPT_DELAY_CHOICE: &str = "Should the action be delayed? (Y/N)";
pub(crate) const PROMPT_DELAY: &str = "How many seconds should I wait before performing the action?";
pub(crate) const INVALID_DELAY: &str = "Please enter a whole number of seconds.";
pub(crate) const ACTION_FAILED: &str = "Failed to add action, please try again later.";

/// Management commands an admin can type while idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminCommand {
    AddResponse,
    RemoveResponse,
    AddAction,
}

impl AdminCommand {
    /// Case-insensitive match against the whole message.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        match text.to_lowercase().as_str() {
            "add response" => Some(Self::AddResponse),
            "remove response" => Some(Self::RemoveResponse),
            "add action" => Some(Self::AddAction),
            _ => None,
        }
    }

    #[must_use]
    pub const fn phrase(self) -> &'static str {
        match self {
            Self::AddResponse => "add response",
            Self::RemoveResponse => "remove response",
            Self::AddAction => "add action",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Idle,
    Adding,
    Removing,
    ConfiguringAction,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "none",
            Self::Adding => "adding",
            Self::Removing => "removing",
            Self::ConfiguringAction => "configuring-action",
        })
    }
}

/// Numbered snapshot of the store taken when a listing is shown.
///
/// IDs run from 1 and stay valid for the wizard that owns the snapshot, no
/// matter what happens to the live store meanwhile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionIndex {
    triggers: Vec<Trigger>,
}

impl SelectionIndex {
    #[must_use]
    pub fn snapshot(entries: &[ResponseEntry]) -> Self {
        Self {
            triggers: entries.iter().map(|e| e.trigger.clone()).collect(),
        }
    }

    /// Resolve an ID exactly as listed: `"2"` matches, `"02"` or `" 2"` do not.
    #[must_use]
    pub fn resolve(&self, id: &str) -> Option<&Trigger> {
        let n: usize = id.parse().ok()?;
        if n.to_string() != id {
            return None;
        }
        n.checked_sub(1).and_then(|idx| self.triggers.get(idx))
    }

    #[must_use]
    pub fn render(&self, heading: &str) -> String {
        let mut lines = Vec::with_capacity(self.triggers.len() + 1);
        lines.push(heading.to_owned());
        for (idx, trigger) in self.triggers.iter().enumerate() {
            lines.push(format!("{}: {}", idx + 1, trigger.display_text()));
        }
        lines.join("\n")
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddResponse {
    AwaitingMessage,
    AwaitingSensitivity { message: String },
    AwaitingResponseText { message: String, sensitive: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddAction {
    AwaitingSelection {
        index: SelectionIndex,
    },
    AwaitingKind {
        trigger: Trigger,
    },
    AwaitingMessage {
        trigger: Trigger,
    },
    AwaitingTarget {
        trigger: Trigger,
        kind: ActionKind,
    },
    AwaitingDelayChoice {
        trigger: Trigger,
        kind: ActionKind,
        target: ActionTarget,
    },
    AwaitingDelay {
        trigger: Trigger,
        kind: ActionKind,
        target: ActionTarget,
    },
}

/// An in-progress wizard together with its partially built entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Wizard {
    Adding(AddResponse),
    Removing(SelectionIndex),
    ConfiguringAction(AddAction),
}

impl Wizard {
    #[must_use]
    pub const fn mode(&self) -> Mode {
        match self {
            Self::Adding(_) => Mode::Adding,
            Self::Removing(_) => Mode::Removing,
            Self::ConfiguringAction(_) => Mode::ConfiguringAction,
        }
    }

    #[must_use]
    pub const fn step(&self) -> &'static str {
        match self {
            Self::Adding(AddResponse::AwaitingMessage) => "awaiting-message",
            Self::Adding(AddResponse::AwaitingSensitivity { .. }) => "awaiting-sensitivity",
            Self::Adding(AddResponse::AwaitingResponseText { .. }) => "awaiting-response-text",
            Self::Removing(_) | Self::ConfiguringAction(AddAction::AwaitingSelection { .. }) => {
                "awaiting-selection"
            }
            Self::ConfiguringAction(AddAction::AwaitingKind { .. }) => "awaiting-kind",
            Self::ConfiguringAction(AddAction::AwaitingMessage { .. }) => "awaiting-message",
            Self::ConfiguringAction(AddAction::AwaitingTarget { .. }) => "awaiting-target",
            Self::ConfiguringAction(AddAction::AwaitingDelayChoice { .. }) => {
                "awaiting-delay-choice"
            }
            Self::ConfiguringAction(AddAction::AwaitingDelay { .. }) => "awaiting-delay",
        }
    }
}

/// Outcome of one step handler: the next state (`None` returns to idle) and
/// the replies for the user.
#[derive(Debug)]
struct Step {
    next: Option<Wizard>,
    replies: Vec<String>,
}

impl Step {
    fn stay<const N: usize>(next: Wizard, replies: [&str; N]) -> Self {
        Self {
            next: Some(next),
            replies: replies.iter().map(|&r| r.to_owned()).collect(),
        }
    }

    fn done(reply: impl Into<String>) -> Self {
        Self {
            next: None,
            replies: vec![reply.into()],
        }
    }
}

/// Exclusive handle on one user's conversation slot.
pub type Session = OwnedMutexGuard<Option<Wizard>>;

type Slots = HashMap<String, Arc<Mutex<Option<Wizard>>>>;

#[derive(Clone)]
pub struct ConversationEngine {
    sessions: Arc<Mutex<Slots>>,
    store: ResponseStore,
    actions: Arc<dyn ActionRegistrar>,
}

impl fmt::Debug for ConversationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationEngine")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl ConversationEngine {
    pub fn new(store: ResponseStore, actions: Arc<dyn ActionRegistrar>) -> Self {
        Self {
            sessions: Arc::default(),
            store,
            actions,
        }
    }

    /// Lock `user`'s slot. Messages from one user are handled one at a time;
    /// different users proceed independently. Hand the session back with
    /// [`Self::release`].
    pub async fn session(&self, user: &str) -> Session {
        let slot = {
            let mut sessions = self.sessions.lock().await;
            Arc::clone(sessions.entry(user.to_owned()).or_default())
        };
        slot.lock_owned().await
    }

    /// Unlock `user`'s slot, dropping it when the user is idle and nobody else
    /// is waiting on it.
    pub async fn release(&self, user: &str, session: Session) {
        let idle = session.is_none();
        let mut sessions = self.sessions.lock().await;
        drop(session);
        if idle && sessions.get(user).is_some_and(|slot| Arc::strong_count(slot) == 1) {
            sessions.remove(user);
        }
    }

    pub async fn mode(&self, user: &str) -> Mode {
        let slot = self.sessions.lock().await.get(user).map(Arc::clone);
        let Some(slot) = slot else {
            return Mode::Idle;
        };
        let wizard = slot.lock().await;
        wizard.as_ref().map_or(Mode::Idle, Wizard::mode)
    }

    #[cfg(test)]
    pub(crate) async fn slot_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Begin the wizard for `command`. Only valid from idle; an active wizard
    /// is left untouched.
    pub async fn start(&self, session: &mut Session, command: AdminCommand) -> Vec<String> {
        if let Some(active) = &**session {
            warn!(mode = %active.mode(), step = active.step(), "Wizard already active; not starting another");
            return Vec::new();
        }
        let (wizard, listing) = match command {
            AdminCommand::AddResponse => {
                (Wizard::Adding(AddResponse::AwaitingMessage), PROMPT_TRIGGER.to_owned())
            }
            AdminCommand::RemoveResponse => {
                let Some(index) = self.selection().await else {
                    return vec![NO_RESPONSES.to_owned()];
                };
                let listing = index.render(REMOVE_HEADING);
                (Wizard::Removing(index), listing)
            }
            AdminCommand::AddAction => {
                let Some(index) = self.selection().await else {
                    return vec![NO_RESPONSES.to_owned()];
                };
                let listing = index.render(ACTION_HEADING);
                (
                    Wizard::ConfiguringAction(AddAction::AwaitingSelection { index }),
                    listing,
                )
            }
        };
        debug!(mode = %wizard.mode(), step = wizard.step(), "Wizard started");
        **session = Some(wizard);
        vec![CANCEL_HINT.to_owned(), listing]
    }

    /// Feed one message to the active wizard. Idle sessions produce nothing.
    pub async fn advance(&self, session: &mut Session, sender: &str, text: &str) -> Vec<String> {
        let Some(wizard) = session.take() else {
            return Vec::new();
        };
        let (mode, from) = (wizard.mode(), wizard.step());
        if text == CANCEL_TOKEN {
            info!(sender, %mode, step = from, "Wizard cancelled");
            return vec![CANCELLED.to_owned()];
        }

        let Step { next, replies } = match wizard {
            Wizard::Adding(state) => self.advance_adding(state, text).await,
            Wizard::Removing(index) => self.advance_removing(index, text).await,
            Wizard::ConfiguringAction(state) => self.advance_action(state, text).await,
        };
        match &next {
            Some(w) => debug!(sender, %mode, from, to = w.step(), "Wizard advanced"),
            None => info!(sender, %mode, from, "Wizard finished"),
        }
        **session = next;
        replies
    }

    async fn selection(&self) -> Option<SelectionIndex> {
        let index = SelectionIndex::snapshot(&self.store.list().await);
        if index.is_empty() {
            None
        } else {
            debug!(entries = index.len(), "Listing responses");
            Some(index)
        }
    }

    async fn advance_adding(&self, state: AddResponse, text: &str) -> Step {
        match state {
            AddResponse::AwaitingMessage => Step::stay(
                Wizard::Adding(AddResponse::AwaitingSensitivity {
                    message: text.to_owned(),
                }),
                [PROMPT_SENSITIVITY],
            ),
            AddResponse::AwaitingSensitivity { message } => match parse_yes_no(text) {
                Some(sensitive) => Step::stay(
                    Wizard::Adding(AddResponse::AwaitingResponseText { message, sensitive }),
                    [PROMPT_REPLY],
                ),
                None => Step::stay(
                    Wizard::Adding(AddResponse::AwaitingSensitivity { message }),
                    [ONLY_YES_NO, PROMPT_SENSITIVITY],
                ),
            },
            AddResponse::AwaitingResponseText { message, sensitive } => {
                let trigger = if sensitive {
                    Trigger::case_sensitive(&message)
                } else {
                    Trigger::case_insensitive(&message)
                };
                match self.store.put(trigger.clone(), text).await {
                    Ok(()) => {
                        info!(trigger = trigger.key(), "Response added");
                        Step::done(RESPONSE_ADDED)
                    }
                    Err(e) => {
                        warn!(error = %e, trigger = trigger.key(), "Failed to persist new response");
                        Step::done(ADD_FAILED)
                    }
                }
            }
        }
    }

    async fn advance_removing(&self, index: SelectionIndex, text: &str) -> Step {
        let Some(trigger) = index.resolve(text).cloned() else {
            return Step::stay(Wizard::Removing(index), [INVALID_ID]);
        };
        if let Err(e) = self.store.remove(&trigger).await {
            warn!(error = %e, trigger = trigger.key(), "Failed to persist response removal");
            return Step::done(REMOVE_FAILED);
        }
        info!(trigger = trigger.key(), "Response removed");
        match self.actions.forget(&trigger).await {
            Ok(0) => {}
            Ok(dropped) => info!(trigger = trigger.key(), dropped, "Dropped attached actions"),
            Err(e) => warn!(error = %e, trigger = trigger.key(), "Failed to drop attached actions"),
        }
        Step::done(format!(
            "Response #{text} ({}) has been removed.",
            trigger.display_text()
        ))
    }

    async fn advance_action(&self, state: AddAction, text: &str) -> Step {
        match state {
            AddAction::AwaitingSelection { index } => match index.resolve(text).cloned() {
                Some(trigger) => Step::stay(
                    Wizard::ConfiguringAction(AddAction::AwaitingKind { trigger }),
                    [PROMPT_KIND],
                ),
                None => Step::stay(
                    Wizard::ConfiguringAction(AddAction::AwaitingSelection { index }),
                    [INVALID_ID],
                ),
            },
            AddAction::AwaitingKind { trigger } => {
                let known = ACTION_KINDS
                    .iter()
                    .any(|k| k.eq_ignore_ascii_case(text.trim()));
                if known {
                    Step::stay(
                        Wizard::ConfiguringAction(AddAction::AwaitingMessage { trigger }),
                        [PROMPT_ACTION_BODY],
                    )
                } else {
                    Step::stay(
                        Wizard::ConfiguringAction(AddAction::AwaitingKind { trigger }),
                        [UNKNOWN_KIND],
                    )
                }
            }
            AddAction::AwaitingMessage { trigger } => Step::stay(
                Wizard::ConfiguringAction(AddAction::AwaitingTarget {
                    trigger,
                    kind: ActionKind::Message {
                        body: text.to_owned(),
                    },
                }),
                [PROMPT_TARGET],
            ),
            AddAction::AwaitingTarget { trigger, kind } => match ActionTarget::parse(text) {
                Some(target) => Step::stay(
                    Wizard::ConfiguringAction(AddAction::AwaitingDelayChoice {
                        trigger,
                        kind,
                        target,
                    }),
                    [PROMPT_DELAY_CHOICE],
                ),
                None => Step::stay(
                    Wizard::ConfiguringAction(AddAction::AwaitingTarget { trigger, kind }),
                    [INVALID_TARGET, PROMPT_TARGET],
                ),
            },
            AddAction::AwaitingDelayChoice {
                trigger,
                kind,
                target,
            } => match parse_yes_no(text) {
                Some(true) => Step::stay(
                    Wizard::ConfiguringAction(AddAction::AwaitingDelay {
                        trigger,
                        kind,
                        target,
                    }),
                    [PROMPT_DELAY],
                ),
                Some(false) => {
                    self.finish_action(ActionDescriptor {
                        trigger,
                        kind,
                        target,
                        delay_secs: 0,
                    })
                    .await
                }
                None => Step::stay(
                    Wizard::ConfiguringAction(AddAction::AwaitingDelayChoice {
                        trigger,
                        kind,
                        target,
                    }),
                    [ONLY_YES_NO, PROMPT_DELAY_CHOICE],
                ),
            },
            AddAction::AwaitingDelay {
                trigger,
                kind,
                target,
            } => match text.trim().parse::<u64>() {
                Ok(delay_secs) => {
                    self.finish_action(ActionDescriptor {
                        trigger,
                        kind,
                        target,
                        delay_secs,
                    })
                    .await
                }
                Err(_) => Step::stay(
                    Wizard::ConfiguringAction(AddAction::AwaitingDelay {
                        trigger,
                        kind,
                        target,
                    }),
                    [INVALID_DELAY],
                ),
            },
        }
    }

    async fn finish_action(&self, action: ActionDescriptor) -> Step {
        let trigger = action.trigger.clone();
        match self.actions.register(action).await {
            Ok(()) => {
                info!(trigger = trigger.key(), "Action registered");
                Step::done(format!(
                    "Action added to response \"{}\".",
                    trigger.display_text()
                ))
            }
            Err(e) => {
                warn!(error = %e, trigger = trigger.key(), "Failed to register action");
                Step::done(ACTION_FAILED)
            }
        }
    }
}

fn parse_yes_no(text: &str) -> Option<bool> {
    match text.to_uppercase().as_str() {
        "Y" => Some(true),
        "N" => Some(false),
        _ => None,
    }
}
