//! `SQLite`-backed storage handle.
//!
//! [`SecurityStore`] owns the single connection every repository query in
//! this crate runs through. Services hold a `&SecurityStore` and never see
//! SQL from other concerns; the store itself exposes only the registries
//! that do not belong to any one service (principals and the record tree).
//!
//! On-disk stores run in WAL mode for concurrent reads;
//! [`SecurityStore::in_memory`] backs the test suites.

// Mutex poisoning indicates a panic in another thread, which is unrecoverable.
#![allow(clippy::missing_panics_doc)]

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension, Transaction, params};

use crate::clock::fmt_ts;
use crate::error::EngineError;

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// A registered principal (user identity the engine can attribute
/// decisions and exports to).
#[derive(Debug, Clone)]
pub struct Principal {
    /// Row id; the `user_id` every service operation takes.
    pub id: i64,
    /// Unique login name, interpolated into watermark stamps.
    pub username: String,
    /// Contact address for expiry alerts.
    pub email: Option<String>,
}

/// A node of the record containment tree.
#[derive(Debug, Clone)]
pub struct ArchiveObject {
    /// Row id; the `object_id` every service operation takes.
    pub id: i64,
    /// Parent node, `None` for roots.
    pub parent_id: Option<i64>,
    /// Caller-supplied reference code.
    pub identifier: String,
    /// Caller-supplied display title.
    pub title: String,
}

/// The storage handle shared by every service in this crate.
pub struct SecurityStore {
    conn: Mutex<Connection>,
    #[allow(dead_code)]
    path: Option<PathBuf>,
}

impl SecurityStore {
    /// Opens or creates a store at the specified path.
    ///
    /// The schema is applied idempotently and WAL mode is enabled for
    /// concurrent reads.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(SCHEMA_SQL)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Creates an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be applied.
    pub fn in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Runs a read-only closure against the connection.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let conn = self.conn.lock().unwrap();
        f(&conn)
    }

    /// Runs a closure inside a transaction.
    ///
    /// The transaction commits when the closure returns `Ok` and rolls
    /// back on `Err`, so a failing mutation leaves no partial state.
    pub(crate) fn with_tx<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    // -------------------------------------------------------------------
    // Principal registry
    // -------------------------------------------------------------------

    /// Registers a principal and returns its id.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the username is already taken.
    pub fn register_principal(
        &self,
        username: &str,
        email: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<i64, EngineError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO principal (username, email, created_at) VALUES (?1, ?2, ?3)",
                params![username, email, fmt_ts(now)],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Looks up a principal by id.
    pub fn principal(&self, id: i64) -> Result<Option<Principal>, EngineError> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, username, email FROM principal WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok(Principal {
                            id: row.get(0)?,
                            username: row.get(1)?,
                            email: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }

    // -------------------------------------------------------------------
    // Record tree registry
    // -------------------------------------------------------------------

    /// Registers a record-tree node and returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] if `parent_id` does not resolve.
    pub fn register_object(
        &self,
        parent_id: Option<i64>,
        identifier: &str,
        title: &str,
        now: DateTime<Utc>,
    ) -> Result<i64, EngineError> {
        self.with_conn(|conn| {
            if let Some(parent) = parent_id {
                if !object_exists(conn, parent)? {
                    return Err(EngineError::NotFound {
                        entity: "archive object",
                        id: parent,
                    });
                }
            }
            conn.execute(
                "INSERT INTO archive_object (parent_id, identifier, title, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![parent_id, identifier, title, fmt_ts(now)],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Looks up a record-tree node by id.
    pub fn object(&self, id: i64) -> Result<Option<ArchiveObject>, EngineError> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, parent_id, identifier, title FROM archive_object WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok(ArchiveObject {
                            id: row.get(0)?,
                            parent_id: row.get(1)?,
                            identifier: row.get(2)?,
                            title: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Returns the parent of `object_id`, or `None` for a root.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] if the object itself is unknown.
    pub fn object_parent(&self, object_id: i64) -> Result<Option<i64>, EngineError> {
        self.with_conn(|conn| object_parent(conn, object_id))
    }
}

/// Connection-level parent lookup shared with in-transaction callers.
pub(crate) fn object_parent(conn: &Connection, object_id: i64) -> Result<Option<i64>, EngineError> {
    conn.query_row(
        "SELECT parent_id FROM archive_object WHERE id = ?1",
        params![object_id],
        |row| row.get::<_, Option<i64>>(0),
    )
    .optional()?
    .ok_or(EngineError::NotFound {
        entity: "archive object",
        id: object_id,
    })
}

/// Connection-level existence check shared with in-transaction callers.
pub(crate) fn object_exists(conn: &Connection, object_id: i64) -> Result<bool, EngineError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM archive_object WHERE id = ?1",
            params![object_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[test]
    fn registers_and_reads_principals() {
        let store = SecurityStore::in_memory().unwrap();
        let id = store
            .register_principal("jsmith", Some("jsmith@example.org"), Utc::now())
            .unwrap();

        let found = store.principal(id).unwrap().unwrap();
        assert_eq!(found.username, "jsmith");
        assert_eq!(found.email.as_deref(), Some("jsmith@example.org"));
        assert!(store.principal(id + 1).unwrap().is_none());
    }

    #[test]
    fn object_parent_distinguishes_root_from_unknown() {
        let store = SecurityStore::in_memory().unwrap();
        let now = Utc::now();
        let root = store.register_object(None, "F1", "Fonds", now).unwrap();
        let child = store
            .register_object(Some(root), "F1-S1", "Series", now)
            .unwrap();

        assert_eq!(store.object_parent(child).unwrap(), Some(root));
        assert_eq!(store.object_parent(root).unwrap(), None);
        assert!(matches!(
            store.object_parent(9999),
            Err(EngineError::NotFound { .. })
        ));
    }

    #[test]
    fn register_object_rejects_unknown_parent() {
        let store = SecurityStore::in_memory().unwrap();
        let err = store
            .register_object(Some(42), "X", "Orphan", Utc::now())
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let store = SecurityStore::in_memory().unwrap();
        let result: Result<(), EngineError> = store.with_tx(|tx| {
            tx.execute(
                "INSERT INTO principal (username, email, created_at) VALUES ('ghost', NULL, '2025-01-01T00:00:00Z')",
                [],
            )?;
            Err(EngineError::NotFound {
                entity: "principal",
                id: 0,
            })
        });
        assert!(result.is_err());

        let count: i64 = store
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM principal", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn opens_on_disk_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("security.db");
        let store = SecurityStore::open(&path).unwrap();
        store.register_principal("ops", None, Utc::now()).unwrap();
        drop(store);

        let reopened = SecurityStore::open(&path).unwrap();
        assert!(reopened.principal(1).unwrap().is_some());
    }
}
