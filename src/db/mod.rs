//! SQLite store for linked Gmail accounts and their raw and processed emails.
//!
//! `gmail_accounts` owns both email tables: every email row carries the
//! `(user_id, google_sub)` of its account, and deleting the account cascades
//! to all of its rows. The schema is brought up to date by
//! [`crate::migrations`] each time the store is opened.

use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};

use crate::config::Config;

pub mod types;
pub use types::*;

pub mod accounts;
pub mod categories;
pub mod emails;
pub mod processed;

pub struct MailDb {
    conn: Connection,
}

impl MailDb {
    /// Borrow the underlying connection for ad-hoc queries.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    /// Execute a closure within a SQLite transaction.
    /// Commits on Ok, rolls back on Err.
    ///
    /// Called while a transaction is already open, the closure runs in a
    /// savepoint instead, so store operations compose inside a caller's
    /// transaction and an inner failure only undoes its own writes.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Self) -> Result<T, DbError>,
    {
        if !self.conn.is_autocommit() {
            return self.with_savepoint(f);
        }

        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(self) {
            Ok(val) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(val)
            }
            Err(e) => {
                if let Err(rollback) = self.conn.execute_batch("ROLLBACK") {
                    log::warn!("Rollback failed after error ({e}): {rollback}");
                }
                Err(e)
            }
        }
    }

    fn with_savepoint<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Self) -> Result<T, DbError>,
    {
        self.conn.execute_batch("SAVEPOINT mail_db_nested")?;
        match f(self) {
            Ok(val) => {
                self.conn.execute_batch("RELEASE mail_db_nested")?;
                Ok(val)
            }
            Err(e) => {
                if let Err(rollback) = self
                    .conn
                    .execute_batch("ROLLBACK TO mail_db_nested; RELEASE mail_db_nested")
                {
                    log::warn!("Savepoint rollback failed after error ({e}): {rollback}");
                }
                Err(e)
            }
        }
    }

    /// Open the configured store and apply pending migrations.
    pub fn open(config: &Config) -> Result<Self, DbError> {
        config.validate()?;
        let conn = Self::connect(
            &config.database_path,
            config.access_key.as_deref(),
            config.busy_timeout_ms,
        )?;
        Self::prepare(
            conn,
            config.backup_before_migrate,
            config.access_key.as_deref(),
        )
    }

    /// Open a database at an explicit path. Useful for testing.
    pub fn open_at(path: &Path) -> Result<Self, DbError> {
        let conn = Self::connect(path, None, 5_000)?;
        Self::prepare(conn, false, None)
    }

    /// Open a private in-memory store with the full schema.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        Self::prepare(conn, false, None)
    }

    /// Open a connection without touching the schema. The migration CLI uses
    /// this so it can report state before deciding to migrate.
    pub fn connect(
        path: &Path,
        access_key: Option<&str>,
        busy_timeout_ms: u64,
    ) -> Result<Connection, DbError> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(path)?;

        // The key must be the first statement on an encrypted store.
        if let Some(key) = access_key {
            conn.pragma_update(None, "key", key)?;
        }

        conn.busy_timeout(Duration::from_millis(busy_timeout_ms))?;
        // Enable WAL mode for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Ok(conn)
    }

    /// Open an existing store read-only for inspection. Never creates the file
    /// or its directory, and leaves the schema alone.
    pub fn connect_existing(
        path: &Path,
        access_key: Option<&str>,
        busy_timeout_ms: u64,
    ) -> Result<Connection, DbError> {
        if !path.is_file() {
            return Err(DbError::NotFound(format!("database {}", path.display())));
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        if let Some(key) = access_key {
            conn.pragma_update(None, "key", key)?;
        }
        conn.busy_timeout(Duration::from_millis(busy_timeout_ms))?;
        Ok(conn)
    }

    /// `access_key` is reapplied to the pre-migration copy so it is encrypted
    /// like the store itself.
    fn prepare(
        conn: Connection,
        backup: bool,
        access_key: Option<&str>,
    ) -> Result<Self, DbError> {
        // FK enforcement is per connection and cannot change inside a
        // transaction, so it is set before any changeset runs.
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let applied = crate::migrations::run_migrations_keyed(&conn, backup, access_key)?;
        if applied > 0 {
            log::info!("Applied {applied} pending migration(s)");
        }

        Ok(Self { conn })
    }
}

/// `?1, ?2, ...` starting after `offset` already-bound parameters.
fn placeholders(offset: usize, count: usize) -> String {
    (offset + 1..=offset + count)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `user_id` followed by every id, matching `placeholders(1, ids.len())`.
fn user_and_ids<'a>(
    user_id: &'a str,
    ids: &'a [String],
) -> rusqlite::ParamsFromIter<impl Iterator<Item = &'a str>> {
    rusqlite::params_from_iter(std::iter::once(user_id).chain(ids.iter().map(String::as_str)))
}

// =============================================================================
// Shared test utilities
// =============================================================================


// =============================================================================
// Tests
// =============================================================================
