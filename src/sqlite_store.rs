//! SQLite-backed document store.
//!
//! The database lives at `~/.momentum/momentum.db` and holds every collection
//! in a single `documents` table keyed by (collection, key), with the JSON
//! body and a monotonically increasing version per row. Writes run inside an
//! immediate transaction and re-check the stored version, so the
//! compare-and-set contract of [`Store`] holds even with a second process on
//! the same file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::store::{
    decode, Store, StoreError, Versioned, COLLECTION_CURRENT_WEEK, COLLECTION_DREAMS,
    COLLECTION_PAST_WEEKS, COLLECTION_USERS,
};
use crate::types::{CurrentWeekDocument, DreamsDocument, PastWeeksDocument, UserRecord};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS documents (
    collection TEXT NOT NULL,
    key        TEXT NOT NULL,
    version    INTEGER NOT NULL,
    body       TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (collection, key)
);
";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `~/.momentum/momentum.db` and apply
    /// the schema.
    pub fn open() -> Result<Self, StoreError> {
        Self::open_at(Self::db_path()?)
    }

    /// Open a database at an explicit path. Useful for testing.
    pub fn open_at(path: PathBuf) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&path)?;
        // WAL for concurrent readers while a rollover batch writes.
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn db_path() -> Result<PathBuf, StoreError> {
        let home = dirs::home_dir().ok_or(StoreError::HomeDirNotFound)?;
        Ok(home.join(".momentum").join("momentum.db"))
    }

    fn read_raw(&self, collection: &str, key: &str) -> Result<Option<(u64, Value)>, StoreError> {
        let conn = self.conn.lock();
        let row: Option<(i64, String)> = conn
            .query_row(
                "SELECT version, body FROM documents WHERE collection = ?1 AND key = ?2",
                params![collection, key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((version, body)) => {
                let value: Value = serde_json::from_str(&body)?;
                Ok(Some((version as u64, value)))
            }
            None => Ok(None),
        }
    }

    fn read_doc<T: DeserializeOwned>(
        &self,
        collection: &str,
        key: &str,
    ) -> Result<Option<Versioned<T>>, StoreError> {
        decode(self.read_raw(collection, key)?)
    }

    /// Compare-and-set write. `expected_version: None` requires the row not
    /// to exist yet.
    fn write_doc<T: Serialize>(
        &self,
        collection: &str,
        key: &str,
        doc: &T,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        let body = serde_json::to_string(doc)?;
        let conn = self.conn.lock();
        conn.execute_batch("BEGIN IMMEDIATE")?;
        let result = (|| {
            let stored: Option<i64> = conn
                .query_row(
                    "SELECT version FROM documents WHERE collection = ?1 AND key = ?2",
                    params![collection, key],
                    |row| row.get(0),
                )
                .optional()?;
            let next = match (stored, expected_version) {
                (None, None) => 1,
                (Some(current), Some(expected)) if current as u64 == expected => current + 1,
                _ => return Err(StoreError::conflict(collection, key)),
            };
            conn.execute(
                "INSERT INTO documents (collection, key, version, body, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (collection, key)
                 DO UPDATE SET version = ?3, body = ?4, updated_at = ?5",
                params![collection, key, next, body, Utc::now().to_rfc3339()],
            )?;
            Ok(next as u64)
        })();
        match result {
            Ok(version) => {
                conn.execute_batch("COMMIT")?;
                Ok(version)
            }
            Err(err) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(err)
            }
        }
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn list_user_ids(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT key FROM documents WHERE collection = ?1 ORDER BY key")?;
        let ids = stmt
            .query_map(params![COLLECTION_USERS], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    async fn put_user(&self, user: &UserRecord) -> Result<(), StoreError> {
        // User records are upserted without version checks; nothing in the
        // engine mutates them concurrently.
        let body = serde_json::to_string(user)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO documents (collection, key, version, body, updated_at)
             VALUES (?1, ?2, 1, ?3, ?4)
             ON CONFLICT (collection, key)
             DO UPDATE SET version = version + 1, body = ?3, updated_at = ?4",
            params![COLLECTION_USERS, user.id, body, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    async fn get_dreams(
        &self,
        user_id: &str,
    ) -> Result<Option<Versioned<DreamsDocument>>, StoreError> {
        self.read_doc(COLLECTION_DREAMS, user_id)
    }

    async fn put_dreams(
        &self,
        user_id: &str,
        doc: &DreamsDocument,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        self.write_doc(COLLECTION_DREAMS, user_id, doc, expected_version)
    }

    async fn get_current_week(
        &self,
        user_id: &str,
    ) -> Result<Option<Versioned<CurrentWeekDocument>>, StoreError> {
        self.read_doc(COLLECTION_CURRENT_WEEK, user_id)
    }

    async fn put_current_week(
        &self,
        user_id: &str,
        doc: &CurrentWeekDocument,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        self.write_doc(COLLECTION_CURRENT_WEEK, user_id, doc, expected_version)
    }

    async fn get_past_weeks(
        &self,
        user_id: &str,
    ) -> Result<Option<Versioned<PastWeeksDocument>>, StoreError> {
        self.read_doc(COLLECTION_PAST_WEEKS, user_id)
    }

    async fn put_past_weeks(
        &self,
        user_id: &str,
        doc: &PastWeeksDocument,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        self.write_doc(COLLECTION_PAST_WEEKS, user_id, doc, expected_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GoalTemplate;

    fn open_temp() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open_at(dir.path().join("momentum.db")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn absent_documents_read_as_none() {
        let (_dir, store) = open_temp();
        assert!(store.get_dreams("u1").await.unwrap().is_none());
        assert!(store.list_user_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_update_and_conflict() {
        let (_dir, store) = open_temp();
        let mut doc = DreamsDocument::empty("u1");

        let v1 = store.put_dreams("u1", &doc, None).await.unwrap();
        assert_eq!(v1, 1);

        doc.templates
            .push(GoalTemplate::new_weekly("d1", "run", 8, 2));
        let v2 = store.put_dreams("u1", &doc, Some(1)).await.unwrap();
        assert_eq!(v2, 2);

        let read = store.get_dreams("u1").await.unwrap().unwrap();
        assert_eq!(read.version, 2);
        assert_eq!(read.doc.templates.len(), 1);

        let err = store.put_dreams("u1", &doc, Some(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));
        let err = store.put_dreams("u1", &doc, None).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn documents_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("momentum.db");

        {
            let store = SqliteStore::open_at(path.clone()).unwrap();
            store
                .put_dreams("u1", &DreamsDocument::empty("u1"), None)
                .await
                .unwrap();
        }

        let store = SqliteStore::open_at(path).unwrap();
        let read = store.get_dreams("u1").await.unwrap().unwrap();
        assert_eq!(read.version, 1);
        assert_eq!(read.doc.user_id, "u1");
    }

    #[tokio::test]
    async fn user_upsert_and_sorted_listing() {
        let (_dir, store) = open_temp();
        for id in ["zoe", "ana", "zoe"] {
            store
                .put_user(&UserRecord {
                    id: id.to_string(),
                    display_name: None,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        assert_eq!(store.list_user_ids().await.unwrap(), vec!["ana", "zoe"]);
    }
}
