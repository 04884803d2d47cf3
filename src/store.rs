//! Store abstraction for the per-user goal documents.
//!
//! The engine never talks to a concrete database: it receives a `Store` and
//! composes typed reads/writes over four logical collections (Users, Dreams,
//! CurrentWeek, PastWeeks), each keyed by user id. Backends are assumed to be
//! only eventually consistent — the consistency reader mitigates that, the
//! trait does not promise anything.
//!
//! Every read returns a `Versioned` document and every write carries the
//! version the caller read. A backend must reject the write when the stored
//! version moved, so concurrent rollovers for the same user fail closed
//! instead of silently losing counter updates.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::types::{CurrentWeekDocument, DreamsDocument, PastWeeksDocument, UserRecord};

pub const COLLECTION_USERS: &str = "users";
pub const COLLECTION_DREAMS: &str = "dreams";
pub const COLLECTION_CURRENT_WEEK: &str = "currentWeek";
pub const COLLECTION_PAST_WEEKS: &str = "pastWeeks";

#[derive(Debug, Error)]
pub enum StoreError {
    /// The document's stored version moved between read and write.
    #[error("version conflict writing {collection}/{key}")]
    VersionConflict { collection: String, key: String },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not determine home directory")]
    HomeDirNotFound,
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn conflict(collection: &str, key: &str) -> Self {
        Self::VersionConflict {
            collection: collection.to_string(),
            key: key.to_string(),
        }
    }
}

/// A document together with the backend version it was read at.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub version: u64,
    pub doc: T,
}

/// Typed document store, injected into the orchestrator.
///
/// `None` from a getter is a legitimate empty state (user has no document
/// yet), never an error. `expected_version` of `None` on a put means "create;
/// must not exist yet".
#[async_trait]
pub trait Store: Send + Sync {
    async fn list_user_ids(&self) -> Result<Vec<String>, StoreError>;
    async fn put_user(&self, user: &UserRecord) -> Result<(), StoreError>;

    async fn get_dreams(&self, user_id: &str)
        -> Result<Option<Versioned<DreamsDocument>>, StoreError>;
    async fn put_dreams(
        &self,
        user_id: &str,
        doc: &DreamsDocument,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError>;

    async fn get_current_week(
        &self,
        user_id: &str,
    ) -> Result<Option<Versioned<CurrentWeekDocument>>, StoreError>;
    async fn put_current_week(
        &self,
        user_id: &str,
        doc: &CurrentWeekDocument,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError>;

    async fn get_past_weeks(
        &self,
        user_id: &str,
    ) -> Result<Option<Versioned<PastWeeksDocument>>, StoreError>;
    async fn put_past_weeks(
        &self,
        user_id: &str,
        doc: &PastWeeksDocument,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError>;
}

pub(crate) fn decode<T: DeserializeOwned>(
    raw: Option<(u64, Value)>,
) -> Result<Option<Versioned<T>>, StoreError> {
    match raw {
        Some((version, value)) => Ok(Some(Versioned {
            version,
            doc: serde_json::from_value(value)?,
        })),
        None => Ok(None),
    }
}

struct StaleDreams {
    version: u64,
    value: Value,
    reads_left: u32,
}

/// In-memory store — the deterministic test double.
///
/// Beyond plain storage it can inject the failure modes the engine must
/// tolerate: stale dreams reads (eventual consistency), write failures on the
/// dreams aggregate (best-effort counter persistence), and read failures for
/// a specific user (batch isolation).
#[derive(Default)]
pub struct MemoryStore {
    docs: RwLock<HashMap<(&'static str, String), (u64, Value)>>,
    stale_dreams: Mutex<HashMap<String, StaleDreams>>,
    dreams_write_failures: Mutex<HashSet<String>>,
    read_failures: Mutex<HashSet<String>>,
    dreams_read_counts: Mutex<HashMap<String, u32>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `doc` (at `version`) for the next `reads` calls to `get_dreams`
    /// before revealing the live document, simulating an eventually-consistent
    /// backend that has not yet caught up.
    pub fn inject_stale_dreams(
        &self,
        user_id: &str,
        doc: &DreamsDocument,
        version: u64,
        reads: u32,
    ) {
        let value = serde_json::to_value(doc).expect("fixture serializes");
        self.stale_dreams.lock().insert(
            user_id.to_string(),
            StaleDreams {
                version,
                value,
                reads_left: reads,
            },
        );
    }

    /// Make every `put_dreams` for this user fail with a backend error.
    pub fn fail_dreams_writes(&self, user_id: &str) {
        self.dreams_write_failures.lock().insert(user_id.to_string());
    }

    /// Make every read for this user fail with a backend error.
    pub fn fail_reads(&self, user_id: &str) {
        self.read_failures.lock().insert(user_id.to_string());
    }

    /// Number of `get_dreams` calls observed for this user.
    pub fn dreams_reads(&self, user_id: &str) -> u32 {
        self.dreams_read_counts
            .lock()
            .get(user_id)
            .copied()
            .unwrap_or(0)
    }

    fn check_read(&self, user_id: &str) -> Result<(), StoreError> {
        if self.read_failures.lock().contains(user_id) {
            return Err(StoreError::Backend(format!(
                "injected read failure for {user_id}"
            )));
        }
        Ok(())
    }

    fn get_value(&self, collection: &'static str, user_id: &str) -> Option<(u64, Value)> {
        self.docs
            .read()
            .get(&(collection, user_id.to_string()))
            .cloned()
    }

    fn put_value<T: Serialize>(
        &self,
        collection: &'static str,
        user_id: &str,
        doc: &T,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        let value = serde_json::to_value(doc)?;
        let mut docs = self.docs.write();
        let key = (collection, user_id.to_string());
        let stored = docs.get(&key).map(|(v, _)| *v);
        let next = match (stored, expected_version) {
            (None, None) => 1,
            (Some(current), Some(expected)) if current == expected => current + 1,
            _ => return Err(StoreError::conflict(collection, user_id)),
        };
        docs.insert(key, (next, value));
        Ok(next)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_user_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = self
            .docs
            .read()
            .keys()
            .filter(|(collection, _)| *collection == COLLECTION_USERS)
            .map(|(_, id)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn put_user(&self, user: &UserRecord) -> Result<(), StoreError> {
        let value = serde_json::to_value(user)?;
        let mut docs = self.docs.write();
        let key = (COLLECTION_USERS, user.id.clone());
        let version = docs.get(&key).map(|(v, _)| v + 1).unwrap_or(1);
        docs.insert(key, (version, value));
        Ok(())
    }

    async fn get_dreams(
        &self,
        user_id: &str,
    ) -> Result<Option<Versioned<DreamsDocument>>, StoreError> {
        self.check_read(user_id)?;
        *self
            .dreams_read_counts
            .lock()
            .entry(user_id.to_string())
            .or_insert(0) += 1;

        let mut stale = self.stale_dreams.lock();
        if let Some(entry) = stale.get_mut(user_id) {
            if entry.reads_left > 0 {
                entry.reads_left -= 1;
                let raw = Some((entry.version, entry.value.clone()));
                if entry.reads_left == 0 {
                    stale.remove(user_id);
                }
                return decode(raw);
            }
        }
        drop(stale);

        decode(self.get_value(COLLECTION_DREAMS, user_id))
    }

    async fn put_dreams(
        &self,
        user_id: &str,
        doc: &DreamsDocument,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        if self.dreams_write_failures.lock().contains(user_id) {
            return Err(StoreError::Backend(format!(
                "injected write failure for {user_id}"
            )));
        }
        self.put_value(COLLECTION_DREAMS, user_id, doc, expected_version)
    }

    async fn get_current_week(
        &self,
        user_id: &str,
    ) -> Result<Option<Versioned<CurrentWeekDocument>>, StoreError> {
        self.check_read(user_id)?;
        decode(self.get_value(COLLECTION_CURRENT_WEEK, user_id))
    }

    async fn put_current_week(
        &self,
        user_id: &str,
        doc: &CurrentWeekDocument,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        self.put_value(COLLECTION_CURRENT_WEEK, user_id, doc, expected_version)
    }

    async fn get_past_weeks(
        &self,
        user_id: &str,
    ) -> Result<Option<Versioned<PastWeeksDocument>>, StoreError> {
        self.check_read(user_id)?;
        decode(self.get_value(COLLECTION_PAST_WEEKS, user_id))
    }

    async fn put_past_weeks(
        &self,
        user_id: &str,
        doc: &PastWeeksDocument,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        self.put_value(COLLECTION_PAST_WEEKS, user_id, doc, expected_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn user(id: &str) -> UserRecord {
        UserRecord {
            id: id.to_string(),
            display_name: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn absent_documents_read_as_none() {
        let store = MemoryStore::new();
        assert!(store.get_dreams("u1").await.unwrap().is_none());
        assert!(store.get_current_week("u1").await.unwrap().is_none());
        assert!(store.get_past_weeks("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_then_update_bumps_version() {
        let store = MemoryStore::new();
        let doc = DreamsDocument::empty("u1");

        let v1 = store.put_dreams("u1", &doc, None).await.unwrap();
        assert_eq!(v1, 1);

        let read = store.get_dreams("u1").await.unwrap().unwrap();
        assert_eq!(read.version, 1);

        let v2 = store.put_dreams("u1", &doc, Some(1)).await.unwrap();
        assert_eq!(v2, 2);
    }

    #[tokio::test]
    async fn stale_expected_version_fails_closed() {
        let store = MemoryStore::new();
        let doc = DreamsDocument::empty("u1");
        store.put_dreams("u1", &doc, None).await.unwrap();
        store.put_dreams("u1", &doc, Some(1)).await.unwrap();

        let err = store.put_dreams("u1", &doc, Some(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));

        // Creating over an existing document also conflicts.
        let err = store.put_dreams("u1", &doc, None).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn stale_injection_serves_snapshot_then_live() {
        let store = MemoryStore::new();
        let mut live = DreamsDocument::empty("u1");
        live.user_id = "u1".to_string();
        store.put_dreams("u1", &live, None).await.unwrap();

        let mut stale = live.clone();
        stale.templates
            .push(crate::types::GoalTemplate::new_weekly("d1", "old view", 2, 1));
        store.inject_stale_dreams("u1", &stale, 1, 2);

        let first = store.get_dreams("u1").await.unwrap().unwrap();
        assert_eq!(first.doc.templates.len(), 1);
        let second = store.get_dreams("u1").await.unwrap().unwrap();
        assert_eq!(second.doc.templates.len(), 1);
        let third = store.get_dreams("u1").await.unwrap().unwrap();
        assert!(third.doc.templates.is_empty());
        assert_eq!(store.dreams_reads("u1"), 3);
    }

    #[tokio::test]
    async fn list_user_ids_is_sorted_and_scoped_to_users() {
        let store = MemoryStore::new();
        store.put_user(&user("zoe")).await.unwrap();
        store.put_user(&user("ana")).await.unwrap();
        store
            .put_dreams("not-a-user-doc", &DreamsDocument::empty("not-a-user-doc"), None)
            .await
            .unwrap();

        assert_eq!(store.list_user_ids().await.unwrap(), vec!["ana", "zoe"]);
    }
}
