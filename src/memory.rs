use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs as async_fs;
use tokio::sync::Mutex;
use tracing::warn;

use crate::agent::{AgentError, MemoryStore};
use crate::conversation::{merge_history, ContactId, LastReply, Message};
use crate::facts::{ContactFacts, ScalarPolicy};

/// JSON files under one directory:
/// `conversations/@<contact>.json`, `memory/@<contact>.json` and `last-reply.json`.
pub struct DiskMemoryStore {
    base_dir: PathBuf,
}

impl DiskMemoryStore {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self { base_dir: base.as_ref().to_path_buf() }
    }

    fn history_path(&self, contact: &ContactId) -> PathBuf {
        self.base_dir.join("conversations").join(format!("{contact}.json"))
    }

    fn facts_path(&self, contact: &ContactId) -> PathBuf {
        self.base_dir.join("memory").join(format!("{contact}.json"))
    }

    fn last_reply_path(&self) -> PathBuf {
        self.base_dir.join("last-reply.json")
    }

    async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, AgentError> {
        let raw = match async_fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(AgentError::Memory(format!("read {}: {}", path.display(), e))),
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| AgentError::Decode(format!("{}: {}", path.display(), e)))
    }

    /// Whole-record overwrite through a sibling temp file and a rename.
    async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), AgentError> {
        if let Some(dir) = path.parent() {
            async_fs::create_dir_all(dir)
                .await
                .map_err(|e| AgentError::Memory(format!("create_dir: {}", e)))?;
        }
        let body = serde_json::to_vec_pretty(value)
            .map_err(|e| AgentError::Memory(format!("encode: {}", e)))?;
        let tmp = path.with_extension("json.tmp");
        async_fs::write(&tmp, &body)
            .await
            .map_err(|e| AgentError::Memory(format!("write: {}", e)))?;
        async_fs::rename(&tmp, path)
            .await
            .map_err(|e| AgentError::Memory(format!("rename: {}", e)))
    }
}

#[async_trait]
impl MemoryStore for DiskMemoryStore {
    async fn load_history(&self, contact: &ContactId) -> Result<Vec<Message>, AgentError> {
        Ok(Self::read_json(&self.history_path(contact)).await?.unwrap_or_default())
    }

    async fn merge_and_save_history(
        &self,
        contact: &ContactId,
        new_messages: &[Message],
    ) -> Result<Vec<Message>, AgentError> {
        let existing = self.load_history(contact).await.unwrap_or_else(|err| {
            warn!(contact = %contact, error = %err, "stored history unreadable; starting over");
            Vec::new()
        });
        let merged = merge_history(&existing, new_messages);
        Self::write_json(&self.history_path(contact), &merged).await?;
        Ok(merged)
    }

    async fn load_facts(&self, contact: &ContactId) -> Result<ContactFacts, AgentError> {
        Ok(Self::read_json(&self.facts_path(contact)).await?.unwrap_or_default())
    }

    async fn merge_and_save_facts(
        &self,
        contact: &ContactId,
        partial: &ContactFacts,
        policy: ScalarPolicy,
    ) -> Result<ContactFacts, AgentError> {
        let mut facts = self.load_facts(contact).await.unwrap_or_else(|err| {
            warn!(contact = %contact, error = %err, "stored facts unreadable; starting over");
            ContactFacts::default()
        });
        facts.merge(partial, policy);
        Self::write_json(&self.facts_path(contact), &facts).await?;
        Ok(facts)
    }

    async fn load_last_reply(&self) -> Result<Option<LastReply>, AgentError> {
        Self::read_json(&self.last_reply_path()).await
    }

    async fn save_last_reply(&self, reply: &LastReply) -> Result<(), AgentError> {
        Self::write_json(&self.last_reply_path(), reply).await
    }
}

#[derive(Default)]
struct Records {
    history: HashMap<ContactId, Vec<Message>>,
    facts: HashMap<ContactId, ContactFacts>,
    last_reply: Option<LastReply>,
}

#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Records>,
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn load_history(&self, contact: &ContactId) -> Result<Vec<Message>, AgentError> {
        Ok(self.inner.lock().await.history.get(contact).cloned().unwrap_or_default())
    }

    async fn merge_and_save_history(
        &self,
        contact: &ContactId,
        new_messages: &[Message],
    ) -> Result<Vec<Message>, AgentError> {
        let mut inner = self.inner.lock().await;
        let slot = inner.history.entry(contact.clone()).or_default();
        *slot = merge_history(slot.as_slice(), new_messages);
        Ok(slot.clone())
    }

    async fn load_facts(&self, contact: &ContactId) -> Result<ContactFacts, AgentError> {
        Ok(self.inner.lock().await.facts.get(contact).cloned().unwrap_or_default())
    }

    async fn merge_and_save_facts(
        &self,
        contact: &ContactId,
        partial: &ContactFacts,
        policy: ScalarPolicy,
    ) -> Result<ContactFacts, AgentError> {
        let mut inner = self.inner.lock().await;
        let slot = inner.facts.entry(contact.clone()).or_default();
        slot.merge(partial, policy);
        Ok(slot.clone())
    }

    async fn load_last_reply(&self) -> Result<Option<LastReply>, AgentError> {
        Ok(self.inner.lock().await.last_reply.clone())
    }

    async fn save_last_reply(&self, reply: &LastReply) -> Result<(), AgentError> {
        self.inner.lock().await.last_reply = Some(reply.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_store_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskMemoryStore::new(dir.path());
        let c = ContactId::new("alex");
        assert!(store.load_history(&c).await.unwrap().is_empty());
        assert!(store.load_facts(&c).await.unwrap().is_empty());
        assert!(store.load_last_reply().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn history_is_merged_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskMemoryStore::new(dir.path());
        let c = ContactId::new("@Alex");

        store.merge_and_save_history(&c, &[Message::user("hey"), Message::bot("hi")]).await.unwrap();
        let merged = store
            .merge_and_save_history(&c, &[Message::user("HEY"), Message::user("how are you")])
            .await
            .unwrap();
        assert_eq!(merged.len(), 3);

        assert!(dir.path().join("conversations").join("@alex.json").exists());
        let reopened = DiskMemoryStore::new(dir.path());
        assert_eq!(reopened.load_history(&c).await.unwrap(), merged);
    }

    #[tokio::test]
    async fn facts_follow_policy_across_saves() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskMemoryStore::new(dir.path());
        let c = ContactId::new("sam");

        let first = ContactFacts { name: Some("sam".into()), hobbies: vec!["hiking".into()], ..Default::default() };
        store.merge_and_save_facts(&c, &first, ScalarPolicy::FirstWriteWins).await.unwrap();
        let second = ContactFacts { name: Some("samuel".into()), hobbies: vec!["chess".into()], ..Default::default() };
        let facts = store.merge_and_save_facts(&c, &second, ScalarPolicy::FirstWriteWins).await.unwrap();

        assert_eq!(facts.name.as_deref(), Some("sam"));
        assert_eq!(facts.hobbies, vec!["hiking".to_string(), "chess".to_string()]);
        assert_eq!(store.load_facts(&c).await.unwrap(), facts);
        assert!(dir.path().join("memory").join("@sam.json").exists());
    }

    #[tokio::test]
    async fn last_reply_round_trips_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskMemoryStore::new(dir.path());
        let marker = LastReply::new("hey you. what's up?", &["hey you".into(), "whats up?".into()]);
        store.save_last_reply(&marker).await.unwrap();
        assert_eq!(store.load_last_reply().await.unwrap(), Some(marker));
        assert!(!dir.path().join("last-reply.json.tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_history_is_reported_then_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskMemoryStore::new(dir.path());
        let c = ContactId::new("alex");
        std::fs::create_dir_all(dir.path().join("conversations")).unwrap();
        std::fs::write(dir.path().join("conversations").join("@alex.json"), "{not json").unwrap();

        assert!(matches!(store.load_history(&c).await, Err(AgentError::Decode(_))));
        let merged = store.merge_and_save_history(&c, &[Message::user("hey")]).await.unwrap();
        assert_eq!(merged, vec![Message::user("hey")]);
        assert_eq!(store.load_history(&c).await.unwrap(), merged);
    }

    #[tokio::test]
    async fn in_memory_store_merges_like_disk() {
        let store = InMemoryStore::default();
        let c = ContactId::new("alex");
        store.merge_and_save_history(&c, &[Message::user("a"), Message::user("b")]).await.unwrap();
        let merged = store.merge_and_save_history(&c, &[Message::user("b"), Message::user("c")]).await.unwrap();
        let texts: Vec<&str> = merged.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
    }
}
