//! Registered follow-up actions and their execution.
//!
//! Actions are persisted as a JSON array next to the responses file. When a
//! response fires, each attached action is resolved into deliveries that run
//! on their own task after the configured delay.

use core::{fmt, time::Duration};
use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use responder_core::{
    ActionDescriptor, ActionKind, ActionRegistrar, ActionTarget, AdminPolicy, Outbox, StoreError,
    Trigger, persist,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    #[serde(flatten)]
    pub action: ActionDescriptor,
    #[serde(default)]
    pub created_at: String,
}

/// One message to send as the result of an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub recipient: String,
    pub text: String,
    pub delay: Duration,
}

pub struct ActionBook {
    records: RwLock<Vec<ActionRecord>>,
    path: PathBuf,
    timeout: Duration,
    outbox: Arc<dyn Outbox>,
    policy: Arc<AdminPolicy>,
}

impl fmt::Debug for ActionBook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionBook")
            .field("path", &self.path)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ActionBook {
    /// Load actions from `path`; a missing file starts empty.
    ///
    /// # Errors
    ///
    /// Fails when the file exists but cannot be read or decoded.
    pub async fn open(
        path: impl Into<PathBuf>,
        timeout: Duration,
        outbox: Arc<dyn Outbox>,
        policy: Arc<AdminPolicy>,
    ) -> Result<Self, StoreError> {
        let path = path.into();
        let records: Vec<ActionRecord> = persist::read_json(&path).await?.unwrap_or_default();
        info!(file = %path.display(), actions = records.len(), "Loaded actions");
        Ok(Self {
            records: RwLock::new(records),
            path,
            timeout,
            outbox,
            policy,
        })
    }

    pub async fn records(&self) -> Vec<ActionRecord> {
        self.records.read().await.clone()
    }

    /// Resolve the deliveries for `trigger` firing on a message from `sender`.
    pub async fn plan(&self, trigger: &Trigger, sender: &str) -> Vec<Delivery> {
        let records = self.records.read().await;
        records
            .iter()
            .filter(|r| &r.action.trigger == trigger)
            .flat_map(|r| deliveries(&r.action, &self.policy, sender))
            .collect()
    }

    async fn persist(&self, records: &[ActionRecord]) -> Result<(), StoreError> {
        persist::write_json_atomic(&self.path, records, self.timeout).await
    }
}

fn deliveries(action: &ActionDescriptor, policy: &AdminPolicy, sender: &str) -> Vec<Delivery> {
    let recipients: Vec<String> = match &action.target {
        ActionTarget::Sender => vec![sender.to_owned()],
        ActionTarget::Admins => policy.admins().map(ToOwned::to_owned).collect(),
        ActionTarget::User(id) => vec![id.clone()],
    };
    let text = match &action.kind {
        ActionKind::Message { body } => body.clone(),
    };
    let delay = Duration::from_secs(action.delay_secs);
    recipients
        .into_iter()
        .map(|recipient| Delivery {
            recipient,
            text: text.clone(),
            delay,
        })
        .collect()
}

fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_owned())
}

#[async_trait]
impl ActionRegistrar for ActionBook {
    async fn register(&self, action: ActionDescriptor) -> Result<()> {
        let mut records = self.records.write().await;
        info!(
            trigger = action.trigger.key(),
            kind = action.kind.name(),
            target = %action.target,
            delay_secs = action.delay_secs,
            "Registering action"
        );
        let mut updated = records.clone();
        updated.push(ActionRecord {
            action,
            created_at: now_rfc3339(),
        });
        self.persist(&updated).await?;
        *records = updated;
        Ok(())
    }

    async fn forget(&self, trigger: &Trigger) -> Result<usize> {
        let mut records = self.records.write().await;
        let kept: Vec<ActionRecord> = records
            .iter()
            .filter(|r| &r.action.trigger != trigger)
            .cloned()
            .collect();
        let dropped = records.len() - kept.len();
        if dropped > 0 {
            self.persist(&kept).await?;
            *records = kept;
        }
        Ok(dropped)
    }

    async fn on_response(&self, trigger: &Trigger, sender: &str) {
        for delivery in self.plan(trigger, sender).await {
            debug!(
                trigger = trigger.key(),
                recipient = %delivery.recipient,
                delay_secs = delivery.delay.as_secs(),
                "Scheduling action delivery"
            );
            let outbox = Arc::clone(&self.outbox);
            tokio::spawn(async move {
                if !delivery.delay.is_zero() {
                    tokio::time::sleep(delivery.delay).await;
                }
                if let Err(e) = outbox.send_text(&delivery.recipient, &delivery.text).await {
                    warn!(error = %e, recipient = %delivery.recipient, "Action delivery failed");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    const LIMIT: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct RecordingOutbox {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Outbox for RecordingOutbox {
        async fn send_text(&self, recipient: &str, text: &str) -> Result<()> {
            self.sent
                .lock()
                .await
                .push((recipient.to_owned(), text.to_owned()));
            Ok(())
        }
    }

    fn message(trigger: Trigger, body: &str, target: ActionTarget, delay_secs: u64) -> ActionDescriptor {
        ActionDescriptor {
            trigger,
            kind: ActionKind::Message {
                body: body.to_owned(),
            },
            target,
            delay_secs,
        }
    }

    async fn book(path: PathBuf) -> (ActionBook, Arc<RecordingOutbox>) {
        let outbox = Arc::new(RecordingOutbox::default());
        let policy = Arc::new(AdminPolicy::new(["@a:example.org", "@b:example.org"]));
        let book = ActionBook::open(
            path,
            LIMIT,
            Arc::clone(&outbox) as Arc<dyn Outbox>,
            policy,
        )
        .await
        .unwrap();
        (book, outbox)
    }

    #[tokio::test]
    async fn plan_resolves_targets() {
        let dir = tempfile::tempdir().unwrap();
        let (book, _) = book(dir.path().join("actions.json")).await;
        let hello = Trigger::case_insensitive("hello");
        book.register(message(hello.clone(), "to sender", ActionTarget::Sender, 0))
            .await
            .unwrap();
        book.register(message(hello.clone(), "to admins", ActionTarget::Admins, 10))
            .await
            .unwrap();
        book.register(message(
            Trigger::case_insensitive("other"),
            "elsewhere",
            ActionTarget::Sender,
            0,
        ))
        .await
        .unwrap();

        let plan = book.plan(&hello, "@u:example.org").await;
        let got: Vec<(&str, &str, u64)> = plan
            .iter()
            .map(|d| (d.recipient.as_str(), d.text.as_str(), d.delay.as_secs()))
            .collect();
        assert_eq!(
            got,
            [
                ("@u:example.org", "to sender", 0),
                ("@a:example.org", "to admins", 10),
                ("@b:example.org", "to admins", 10),
            ]
        );
    }

    #[tokio::test]
    async fn registered_actions_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("actions.json");
        let action = message(
            Trigger::case_sensitive("Hi"),
            "psst",
            ActionTarget::User("@c:example.org".to_owned()),
            5,
        );
        {
            let (book, _) = book(path.clone()).await;
            book.register(action.clone()).await.unwrap();
        }
        let (reopened, _) = book(path).await;
        let records = reopened.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, action);
        assert!(!records[0].created_at.is_empty());
    }

    #[tokio::test]
    async fn forget_drops_only_matching_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("actions.json");
        let (book, _) = book(path.clone()).await;
        let keep = Trigger::case_insensitive("keep");
        let gone = Trigger::case_insensitive("drop");
        book.register(message(gone.clone(), "x", ActionTarget::Sender, 0))
            .await
            .unwrap();
        book.register(message(gone.clone(), "y", ActionTarget::Admins, 0))
            .await
            .unwrap();
        book.register(message(keep.clone(), "z", ActionTarget::Sender, 0))
            .await
            .unwrap();

        assert_eq!(book.forget(&gone).await.unwrap(), 2);
        assert_eq!(book.forget(&gone).await.unwrap(), 0);

        let on_disk: Vec<ActionRecord> =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk.len(), 1);
        assert_eq!(on_disk[0].action.trigger, keep);
    }

    #[tokio::test]
    async fn immediate_delivery_reaches_outbox() {
        let dir = tempfile::tempdir().unwrap();
        let (book, outbox) = book(dir.path().join("actions.json")).await;
        let hello = Trigger::case_insensitive("hello");
        book.register(message(hello.clone(), "welcome", ActionTarget::Sender, 0))
            .await
            .unwrap();

        book.on_response(&hello, "@u:example.org").await;
        for _ in 0..100 {
            if !outbox.sent.lock().await.is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(
            *outbox.sent.lock().await,
            [("@u:example.org".to_owned(), "welcome".to_owned())]
        );
    }

    #[tokio::test]
    async fn failed_write_leaves_action_inactive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("actions.json");
        let (book, _) = book(path.clone()).await;
        std::fs::create_dir(&path).unwrap();
        let a = Trigger::case_insensitive("a");

        let res = book
            .register(message(a.clone(), "b", ActionTarget::Sender, 0))
            .await;
        assert!(res.is_err());
        assert!(book.records().await.is_empty());
        assert!(book.plan(&a, "@u:example.org").await.is_empty());

        std::fs::remove_dir(&path).unwrap();
        book.register(message(a.clone(), "b", ActionTarget::Sender, 0))
            .await
            .unwrap();
        assert_eq!(book.plan(&a, "@u:example.org").await.len(), 1);
    }

    #[tokio::test]
    async fn failed_forget_keeps_actions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("actions.json");
        let (book, _) = book(path.clone()).await;
        let a = Trigger::case_insensitive("a");
        book.register(message(a.clone(), "b", ActionTarget::Sender, 0))
            .await
            .unwrap();
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        assert!(book.forget(&a).await.is_err());
        assert_eq!(book.records().await.len(), 1);
    }
}
