//! Follow-up actions attached to a response.

use core::fmt;

use anyhow::Result;
use async_trait::async_trait;
use matrix_sdk::ruma::UserId;
use serde::{Deserialize, Serialize};

use crate::store::Trigger;

/// Action kinds an admin can pick while configuring an action.
pub const ACTION_KINDS: &[&str] = &["message"];

const TARGET_SENDER: &str = "user";
const TARGET_ADMINS: &str = "admins";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionKind {
    Message { body: String },
}

impl ActionKind {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
        }
    }
}

/// Who receives the output of an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ActionTarget {
    /// The user whose message triggered the response.
    Sender,
    /// Every configured admin.
    Admins,
    User(String),
}

impl ActionTarget {
    /// Accepts `user`, `admins` (any casing) or a well-formed user ID.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.eq_ignore_ascii_case(TARGET_SENDER) {
            Some(Self::Sender)
        } else if text.eq_ignore_ascii_case(TARGET_ADMINS) {
            Some(Self::Admins)
        } else {
            UserId::parse(text)
                .ok()
                .map(|id| Self::User(id.to_string()))
        }
    }
}

impl fmt::Display for ActionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sender => f.write_str(TARGET_SENDER),
            Self::Admins => f.write_str(TARGET_ADMINS),
            Self::User(id) => f.write_str(id),
        }
    }
}

impl From<ActionTarget> for String {
    fn from(target: ActionTarget) -> Self {
        target.to_string()
    }
}

impl TryFrom<String> for ActionTarget {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("invalid action target: {value}"))
    }
}

/// A fully collected action, ready to be registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionDescriptor {
    pub trigger: Trigger,
    #[serde(flatten)]
    pub kind: ActionKind,
    pub target: ActionTarget,
    #[serde(default)]
    pub delay_secs: u64,
}

/// Receives completed actions and runs them when their response fires.
#[async_trait]
pub trait ActionRegistrar: Send + Sync {
    async fn register(&self, action: ActionDescriptor) -> Result<()>;

    /// Drop every action attached to `trigger`; returns how many were removed.
    async fn forget(&self, trigger: &Trigger) -> Result<usize>;

    /// Called after `trigger`'s reply was sent to `sender`.
    async fn on_response(&self, trigger: &Trigger, sender: &str);
}
