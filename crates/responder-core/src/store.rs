use core::{fmt, time::Duration};
use std::{path::PathBuf, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::info;

use crate::{error::StoreError, persist};

/// Key prefix marking a trigger that only matches its exact casing.
pub const CASE_SENSITIVE_MARKER: &str = "MATCH ";

/// Store key a message is matched against.
///
/// Case-insensitive triggers are stored lower-cased. Case-sensitive triggers
/// keep the text exactly as typed behind [`CASE_SENSITIVE_MARKER`], so the two
/// kinds never share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Trigger(String);

impl Trigger {
    #[must_use]
    pub fn case_insensitive(text: &str) -> Self {
        Self(text.to_lowercase())
    }

    #[must_use]
    pub fn case_sensitive(text: &str) -> Self {
        Self(format!("{CASE_SENSITIVE_MARKER}{text}"))
    }

    /// Wrap a raw key as found in the persisted file.
    #[must_use]
    pub fn from_key(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_case_sensitive(&self) -> bool {
        self.0.starts_with(CASE_SENSITIVE_MARKER)
    }

    /// The trigger text as shown to admins, without the marker.
    #[must_use]
    pub fn display_text(&self) -> &str {
        self.0
            .strip_prefix(CASE_SENSITIVE_MARKER)
            .unwrap_or(&self.0)
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_text())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseEntry {
    pub trigger: Trigger,
    pub reply: String,
}

#[derive(Debug)]
struct Backing {
    path: PathBuf,
    timeout: Duration,
}

/// Trigger to reply mapping, kept in insertion order.
///
/// Mutations update memory first and then rewrite the whole file while still
/// holding the write lock. A failed write is reported but the in-memory
/// change is kept.
#[derive(Debug, Clone)]
pub struct ResponseStore {
    entries: Arc<RwLock<Vec<ResponseEntry>>>,
    backing: Option<Arc<Backing>>,
}

impl ResponseStore {
    /// Open the store persisted at `path`; a missing file starts empty.
    ///
    /// # Errors
    ///
    /// Fails when the file exists but cannot be read, is not a JSON object, or
    /// maps a trigger to anything other than a string.
    pub async fn open(path: impl Into<PathBuf>, timeout: Duration) -> Result<Self, StoreError> {
        let path = path.into();
        let map: Map<String, Value> = persist::read_json(&path).await?.unwrap_or_default();
        let mut entries = Vec::with_capacity(map.len());
        for (key, value) in map {
            let reply: String =
                serde_json::from_value(value).map_err(|source| StoreError::Decode {
                    path: path.clone(),
                    source,
                })?;
            entries.push(ResponseEntry {
                trigger: Trigger::from_key(key),
                reply,
            });
        }
        info!(file = %path.display(), responses = entries.len(), "Loaded responses");
        Ok(Self {
            entries: Arc::new(RwLock::new(entries)),
            backing: Some(Arc::new(Backing { path, timeout })),
        })
    }

    #[cfg(test)]
    pub(crate) fn in_memory() -> Self {
        Self {
            entries: Arc::default(),
            backing: None,
        }
    }

    /// Case-insensitive match of `text`.
    pub async fn lookup(&self, text: &str) -> Option<ResponseEntry> {
        self.get(&Trigger::case_insensitive(text)).await
    }

    /// Match `text` against case-sensitive triggers only, exact casing.
    pub async fn lookup_case_sensitive_exact(&self, text: &str) -> Option<ResponseEntry> {
        self.get(&Trigger::case_sensitive(text)).await
    }

    async fn get(&self, trigger: &Trigger) -> Option<ResponseEntry> {
        let entries = self.entries.read().await;
        entries.iter().find(|e| &e.trigger == trigger).cloned()
    }

    /// Insert or overwrite `trigger`. An existing entry keeps its position.
    ///
    /// # Errors
    ///
    /// Returns the persistence failure; the in-memory mapping already holds
    /// the new reply in that case.
    pub async fn put(&self, trigger: Trigger, reply: impl Into<String>) -> Result<(), StoreError> {
        let reply = reply.into();
        let mut entries = self.entries.write().await;
        if let Some(existing) = entries.iter_mut().find(|e| e.trigger == trigger) {
            existing.reply = reply;
        } else {
            entries.push(ResponseEntry { trigger, reply });
        }
        self.persist(&entries).await
    }

    /// Delete `trigger`, returning its reply if it was present.
    ///
    /// # Errors
    ///
    /// Returns the persistence failure; the entry is already gone from memory.
    pub async fn remove(&self, trigger: &Trigger) -> Result<Option<String>, StoreError> {
        let mut entries = self.entries.write().await;
        let removed = entries
            .iter()
            .position(|e| &e.trigger == trigger)
            .map(|idx| entries.remove(idx).reply);
        self.persist(&entries).await?;
        Ok(removed)
    }

    pub async fn list(&self) -> Vec<ResponseEntry> {
        self.entries.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    async fn persist(&self, entries: &[ResponseEntry]) -> Result<(), StoreError> {
        let Some(backing) = self.backing.as_deref() else {
            return Ok(());
        };
        let map: Map<String, Value> = entries
            .iter()
            .map(|e| (e.trigger.key().to_owned(), Value::String(e.reply.clone())))
            .collect();
        persist::write_json_atomic(&backing.path, &map, backing.timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: Duration = Duration::from_secs(5);

    #[test]
    fn trigger_kinds_never_share_a_key() {
        let loose = Trigger::case_insensitive("Hello");
        let strict = Trigger::case_sensitive("hello");
        assert_eq!(loose.key(), "hello");
        assert_eq!(strict.key(), "MATCH hello");
        assert_ne!(loose, strict);
        assert!(strict.is_case_sensitive());
        assert!(!loose.is_case_sensitive());
        assert_eq!(strict.display_text(), "hello");
    }

    #[test]
    fn insensitive_trigger_cannot_forge_the_marker() {
        let t = Trigger::case_insensitive("MATCH Hello");
        assert!(!t.is_case_sensitive());
        assert_eq!(t.display_text(), "match hello");
    }

    #[tokio::test]
    async fn insensitive_lookup_matches_any_casing() {
        let store = ResponseStore::in_memory();
        store
            .put(Trigger::case_insensitive("Hello"), "hi there")
            .await
            .unwrap();
        for casing in ["hello", "Hello", "HELLO", "hElLo"] {
            let hit = store.lookup(casing).await.map(|e| e.reply);
            assert_eq!(hit.as_deref(), Some("hi there"), "casing {casing}");
        }
    }

    #[tokio::test]
    async fn sensitive_lookup_requires_exact_casing() {
        let store = ResponseStore::in_memory();
        store
            .put(Trigger::case_sensitive("Hello"), "exact")
            .await
            .unwrap();
        assert!(store.lookup("Hello").await.is_none());
        assert!(store.lookup_case_sensitive_exact("hello").await.is_none());
        assert!(store.lookup_case_sensitive_exact("HELLO").await.is_none());
        let hit = store.lookup_case_sensitive_exact("Hello").await.unwrap();
        assert_eq!(hit.reply, "exact");
    }

    #[tokio::test]
    async fn overwrite_replaces_reply_in_place() {
        let store = ResponseStore::in_memory();
        store.put(Trigger::case_insensitive("a"), "1").await.unwrap();
        store.put(Trigger::case_insensitive("b"), "2").await.unwrap();
        store.put(Trigger::case_insensitive("A"), "3").await.unwrap();

        let listed = store.list().await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].trigger.key(), "a");
        assert_eq!(listed[0].reply, "3");
        assert_eq!(listed[1].trigger.key(), "b");
    }

    #[tokio::test]
    async fn remove_reports_previous_reply() {
        let store = ResponseStore::in_memory();
        let t = Trigger::case_insensitive("bye");
        store.put(t.clone(), "see you").await.unwrap();
        assert_eq!(store.remove(&t).await.unwrap().as_deref(), Some("see you"));
        assert_eq!(store.remove(&t).await.unwrap(), None);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn reopen_restores_entries_in_file_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("responses.json");
        {
            let store = ResponseStore::open(&path, LIMIT).await.unwrap();
            store.put(Trigger::case_insensitive("zeta"), "z").await.unwrap();
            store.put(Trigger::case_sensitive("Alpha"), "a").await.unwrap();
            store.put(Trigger::case_insensitive("mid"), "m").await.unwrap();
        }
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"MATCH Alpha\""));

        let reopened = ResponseStore::open(&path, LIMIT).await.unwrap();
        let keys: Vec<String> = reopened
            .list()
            .await
            .into_iter()
            .map(|e| e.trigger.key().to_owned())
            .collect();
        assert_eq!(keys, ["zeta", "MATCH Alpha", "mid"]);
    }

    #[tokio::test]
    async fn failed_write_is_reported_and_memory_keeps_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("responses.json");
        let store = ResponseStore::open(&path, LIMIT).await.unwrap();
        std::fs::create_dir(&path).unwrap();

        let err = store
            .put(Trigger::case_insensitive("x"), "y")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
        assert_eq!(store.lookup("x").await.map(|e| e.reply).as_deref(), Some("y"));
    }

    #[tokio::test]
    async fn non_text_value_fails_open_and_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("responses.json");
        let raw = r#"{"ok": "fine", "bad": 3}"#;
        std::fs::write(&path, raw).unwrap();

        let err = ResponseStore::open(&path, LIMIT).await.unwrap_err();
        assert!(matches!(err, StoreError::Decode { .. }));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), raw);
    }
}
