//! Schema migration framework.
//!
//! Changesets are embedded at compile time via `include_str!` and applied in
//! version order, each exactly once, tracked by the `schema_version` table.
//! Every changeset runs inside a single `BEGIN IMMEDIATE` transaction together
//! with its `schema_version` row, so a failure leaves the schema untouched and
//! halts the sequence. Schema changes take the database write lock for their
//! whole duration: run them in a maintenance window.
//!
//! For stores created before the framework existed, the bootstrap step detects
//! the tables and columns already present and records the matching versions
//! instead of re-running SQL against populated tables.

use rusqlite::{params, Connection, TransactionBehavior};
use thiserror::Error;

use crate::schema::{self, Precondition, Violation};

pub struct Migration {
    pub version: i32,
    pub name: &'static str,
    pub sql: &'static str,
    /// Checked before the SQL runs; the first violation aborts the changeset.
    pub requires: &'static [Precondition],
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "20240301_baseline",
        sql: include_str!("migrations/20240301_baseline.sql"),
        requires: &[],
    },
    Migration {
        version: 2,
        name: "20240305_add_email_to_gmail_accounts",
        sql: include_str!("migrations/20240305_add_email_to_gmail_accounts.sql"),
        requires: &[
            Precondition::TableExists("gmail_accounts"),
            Precondition::NoDependents("gmail_accounts"),
            Precondition::EmptyTable {
                table: "gmail_accounts",
                column: "email",
            },
        ],
    },
    Migration {
        version: 3,
        name: "20240305_add_google_sub_to_emails",
        sql: include_str!("migrations/20240305_add_google_sub_to_emails.sql"),
        requires: &[
            Precondition::TableExists("raw_emails"),
            Precondition::TableExists("processed_emails"),
            Precondition::UniqueKey {
                table: "gmail_accounts",
                columns: &["user_id", "google_sub"],
            },
            Precondition::NoDependents("raw_emails"),
            Precondition::NoDependents("processed_emails"),
            Precondition::EmptyTable {
                table: "raw_emails",
                column: "google_sub",
            },
            Precondition::EmptyTable {
                table: "processed_emails",
                column: "google_sub",
            },
        ],
    },
];

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Migration v{version} ({name}) cannot run: {violation}")]
    Precondition {
        version: i32,
        name: &'static str,
        violation: Violation,
    },

    #[error("Migration v{version} ({name}) failed: {source}")]
    Failed {
        version: i32,
        name: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error(
        "Database schema version ({current}) is newer than this build supports ({supported}). \
         Please update emailsort."
    )]
    NewerSchema { current: i32, supported: i32 },

    #[error("Migration v{version} is already applied")]
    AlreadyApplied { version: i32 },

    #[error("Migration v{version} is out of order (database is at v{current})")]
    OutOfOrder { version: i32, current: i32 },

    #[error("Migration v{version} ({name}) left {rows} row(s) violating a foreign key")]
    BrokenReferences {
        version: i32,
        name: &'static str,
        rows: usize,
    },

    #[error("Pre-migration backup failed: {0}")]
    Backup(String),
}

/// A row from `schema_version`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedMigration {
    pub version: i32,
    pub name: String,
    pub applied_at: String,
}

/// Create the `schema_version` table if it doesn't exist.
fn ensure_schema_version_table(conn: &Connection) -> Result<(), MigrationError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;
    Ok(())
}

/// Return the highest applied migration version, or 0 if none.
pub fn current_version(conn: &Connection) -> Result<i32, MigrationError> {
    if !schema::table_exists(conn, "schema_version")? {
        return Ok(0);
    }
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?)
}

/// All recorded migrations, oldest first.
pub fn applied_migrations(conn: &Connection) -> Result<Vec<AppliedMigration>, MigrationError> {
    if !schema::table_exists(conn, "schema_version")? {
        return Ok(Vec::new());
    }
    let mut stmt =
        conn.prepare("SELECT version, name, applied_at FROM schema_version ORDER BY version")?;
    let rows = stmt.query_map([], |row| {
        Ok(AppliedMigration {
            version: row.get(0)?,
            name: row.get(1)?,
            applied_at: row.get(2)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

/// Known migrations that a run would apply, in order: those newer than the
/// recorded version, minus any a pre-framework store would have adopted.
pub fn pending_migrations(conn: &Connection) -> Result<Vec<&'static Migration>, MigrationError> {
    let adopted = adoptable_versions(conn)?.last().copied().unwrap_or(0);
    let current = current_version(conn)?.max(adopted);
    Ok(MIGRATIONS.iter().filter(|m| m.version > current).collect())
}

fn migration(version: i32) -> Option<&'static Migration> {
    MIGRATIONS.iter().find(|m| m.version == version)
}

fn record_version(conn: &Connection, m: &Migration) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version, name) VALUES (?1, ?2)",
        params![m.version, m.name],
    )?;
    Ok(())
}

/// Versions a pre-framework store already has, judged from its tables alone.
///
/// Empty once anything is recorded in `schema_version`, or when there is no
/// `gmail_accounts` table. Otherwise the baseline, plus each later changeset
/// whose columns are all present. Reads only.
pub fn adoptable_versions(conn: &Connection) -> Result<Vec<i32>, MigrationError> {
    if current_version(conn)? > 0 || !schema::table_exists(conn, "gmail_accounts")? {
        return Ok(Vec::new());
    }

    let mut adopted = vec![1];
    if schema::has_column(conn, "gmail_accounts", "email")? {
        adopted.push(2);
        if schema::has_column(conn, "raw_emails", "google_sub")?
            && schema::has_column(conn, "processed_emails", "google_sub")?
        {
            adopted.push(3);
        }
    }
    Ok(adopted)
}

/// Detect a pre-framework database and record what it already has, so none
/// of the matching changesets is replayed against populated tables.
/// Returns the number of versions recorded.
fn bootstrap_existing_db(conn: &Connection) -> Result<usize, MigrationError> {
    let adopted = adoptable_versions(conn)?;

    for version in &adopted {
        if let Some(m) = migration(*version) {
            record_version(conn, m)?;
            log::info!(
                "Migration bootstrap: marked v{} ({}) as applied for existing database",
                m.version,
                m.name
            );
        }
    }

    Ok(adopted.len())
}

/// Back up the database before applying migrations.
///
/// Uses SQLite's online backup API to create a hot copy at
/// `<db_path>.pre-migration.bak`. Only called when there are pending migrations.
/// An encrypted store is copied under the same `access_key`; SQLCipher cannot
/// back up between differently keyed databases.
fn backup_before_migration(
    conn: &Connection,
    access_key: Option<&str>,
) -> Result<(), MigrationError> {
    let db_path: String = conn.query_row("PRAGMA database_list", [], |row| row.get(2))?;

    if db_path.is_empty() || db_path == ":memory:" {
        // In-memory or temp database, nothing to copy
        return Ok(());
    }

    let backup_path = format!("{}.pre-migration.bak", db_path);
    // A copy left by an earlier run may carry a different key.
    match std::fs::remove_file(&backup_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(MigrationError::Backup(format!(
                "failed to replace {backup_path}: {e}"
            )))
        }
    }
    let mut backup_conn = Connection::open(&backup_path)
        .map_err(|e| MigrationError::Backup(format!("failed to open {backup_path}: {e}")))?;
    if let Some(key) = access_key {
        backup_conn
            .pragma_update(None, "key", key)
            .map_err(|e| MigrationError::Backup(format!("failed to key {backup_path}: {e}")))?;
    }

    let backup = rusqlite::backup::Backup::new(conn, &mut backup_conn)
        .map_err(|e| MigrationError::Backup(format!("failed to initialize: {e}")))?;

    backup
        .step(-1)
        .map_err(|e| MigrationError::Backup(e.to_string()))?;

    log::info!("Pre-migration backup created at {}", backup_path);
    Ok(())
}

/// Check every precondition of `m`, returning the first violation as an error.
pub fn check_preconditions(conn: &Connection, m: &Migration) -> Result<(), MigrationError> {
    for precondition in m.requires {
        if let Some(violation) = precondition.violation(conn)? {
            return Err(MigrationError::Precondition {
                version: m.version,
                name: m.name,
                violation,
            });
        }
    }
    Ok(())
}

/// Apply a single changeset atomically.
///
/// Refuses a version that is already recorded, and once any version is
/// recorded, anything but the next one. Preconditions, SQL, and the
/// `schema_version` row share one transaction; any error rolls all of it back.
pub fn apply_migration(conn: &Connection, m: &Migration) -> Result<(), MigrationError> {
    ensure_schema_version_table(conn)?;

    let current = current_version(conn)?;
    if m.version <= current {
        return Err(MigrationError::AlreadyApplied { version: m.version });
    }
    if current > 0 && m.version != current + 1 {
        return Err(MigrationError::OutOfOrder {
            version: m.version,
            current,
        });
    }

    let tx = rusqlite::Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;

    check_preconditions(&tx, m)?;

    tx.execute_batch(m.sql).map_err(|source| MigrationError::Failed {
        version: m.version,
        name: m.name,
        source,
    })?;
    record_version(&tx, m)?;

    let broken = {
        let mut stmt = tx.prepare("PRAGMA foreign_key_check")?;
        let mut rows = stmt.query([])?;
        let mut n = 0;
        while rows.next()?.is_some() {
            n += 1;
        }
        n
    };
    if broken > 0 {
        return Err(MigrationError::BrokenReferences {
            version: m.version,
            name: m.name,
            rows: broken,
        });
    }

    tx.commit()?;
    log::info!("Applied migration v{} ({})", m.version, m.name);
    Ok(())
}

/// Run all pending migrations.
///
/// Returns the number of migrations applied (0 if already up-to-date).
///
/// Forward-compat guard: if the database has a higher version than the highest
/// known migration, returns an error telling the user to update.
pub fn run_migrations(conn: &Connection, backup: bool) -> Result<usize, MigrationError> {
    run_migrations_keyed(conn, backup, None)
}

/// [`run_migrations`] for an encrypted store: the pre-migration copy is keyed
/// with `access_key`.
pub fn run_migrations_keyed(
    conn: &Connection,
    backup: bool,
    access_key: Option<&str>,
) -> Result<usize, MigrationError> {
    ensure_schema_version_table(conn)?;
    bootstrap_existing_db(conn)?;

    let current = current_version(conn)?;
    let max_known = MIGRATIONS.last().map(|m| m.version).unwrap_or(0);

    // Forward-compat guard
    if current > max_known {
        return Err(MigrationError::NewerSchema {
            current,
            supported: max_known,
        });
    }

    let pending = pending_migrations(conn)?;
    if pending.is_empty() {
        return Ok(0);
    }

    if backup {
        backup_before_migration(conn, access_key)?;
    }

    // Fail fast: the first error halts the sequence with earlier changesets committed.
    for m in &pending {
        apply_migration(conn, m)?;
    }

    Ok(pending.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    /// Helper: in-memory database with FK enforcement, as `MailDb` opens it.
    fn mem_db() -> Connection {
        let conn = Connection::open_in_memory().expect("in-memory db");
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        conn
    }

    fn seed_account(conn: &Connection, user_id: &str, google_sub: &str, email: &str) {
        conn.execute(
            "INSERT INTO gmail_accounts (user_id, google_sub, access_token, refresh_token, expires_at, email)
             VALUES (?1, ?2, 'at', 'rt', '2024-03-05T00:00:00Z', ?3)",
            params![user_id, google_sub, email],
        )
        .expect("insert account");
    }

    fn seed_raw_email(conn: &Connection, user_id: &str, google_sub: &str, message_id: &str) {
        conn.execute(
            "INSERT INTO raw_emails (user_id, gmail_message_id, thread_id, received_at, google_sub)
             VALUES (?1, ?2, 't1', '2024-03-05T00:00:00Z', ?3)",
            params![user_id, message_id, google_sub],
        )
        .expect("insert raw email");
    }

    fn seed_processed_email(conn: &Connection, user_id: &str, google_sub: &str, message_id: &str) {
        conn.execute(
            "INSERT INTO processed_emails (user_id, gmail_message_id, thread_id, received_at, google_sub)
             VALUES (?1, ?2, 't1', '2024-03-05T00:00:00Z', ?3)",
            params![user_id, message_id, google_sub],
        )
        .expect("insert processed email");
    }

    fn count(conn: &Connection, sql: &str) -> i64 {
        conn.query_row(sql, [], |row| row.get(0)).unwrap()
    }

    #[test]
    fn test_migrations_are_ordered() {
        for (i, m) in MIGRATIONS.iter().enumerate() {
            assert_eq!(m.version, i as i32 + 1, "versions must be contiguous");
        }
        for pair in MIGRATIONS.windows(2) {
            assert!(
                pair[0].name < pair[1].name,
                "{} must sort before {}",
                pair[0].name,
                pair[1].name
            );
        }
    }

    #[test]
    fn test_fresh_db_applies_all() {
        let conn = mem_db();
        let applied = run_migrations(&conn, true).expect("migrations should succeed");
        assert_eq!(applied, MIGRATIONS.len());
        assert_eq!(current_version(&conn).unwrap(), 3);

        let checks = schema::verify_email_schema(&conn).unwrap();
        for check in &checks {
            assert!(check.passed, "failed: {}", check.description);
        }

        let names: Vec<String> = applied_migrations(&conn)
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(
            names,
            [
                "20240301_baseline",
                "20240305_add_email_to_gmail_accounts",
                "20240305_add_google_sub_to_emails",
            ]
        );
    }

    #[test]
    fn test_idempotency() {
        let conn = mem_db();

        let first = run_migrations(&conn, false).expect("first run");
        assert_eq!(first, 3);

        let second = run_migrations(&conn, false).expect("second run");
        assert_eq!(second, 0, "second run should apply no migrations");
        assert!(pending_migrations(&conn).unwrap().is_empty());
        assert_eq!(current_version(&conn).unwrap(), 3);
    }

    #[test]
    fn test_changeset_order_is_enforced() {
        let conn = mem_db();
        apply_migration(&conn, &MIGRATIONS[0]).expect("baseline");

        let err = apply_migration(&conn, &MIGRATIONS[2]).unwrap_err();
        assert!(
            matches!(err, MigrationError::OutOfOrder { version: 3, current: 1 }),
            "unexpected error: {err}"
        );

        let err = apply_migration(&conn, &MIGRATIONS[0]).unwrap_err();
        assert!(matches!(err, MigrationError::AlreadyApplied { version: 1 }));
    }

    #[test]
    fn test_google_sub_changeset_requires_unique_parent_key() {
        let conn = mem_db();
        // Hand-built store where nothing makes (user_id, google_sub) unique.
        conn.execute_batch(
            "CREATE TABLE gmail_accounts (user_id TEXT NOT NULL, google_sub TEXT NOT NULL, email TEXT NOT NULL);
             CREATE TABLE categories (user_id TEXT NOT NULL, category_id INTEGER NOT NULL, UNIQUE (user_id, category_id));
             CREATE TABLE raw_emails (user_id TEXT, gmail_message_id TEXT, thread_id TEXT, PRIMARY KEY (user_id, gmail_message_id, thread_id));
             CREATE TABLE processed_emails (user_id TEXT, gmail_message_id TEXT, thread_id TEXT, PRIMARY KEY (user_id, gmail_message_id, thread_id));",
        )
        .unwrap();

        let err = apply_migration(&conn, &MIGRATIONS[2]).unwrap_err();
        match err {
            MigrationError::Precondition {
                version: 3,
                violation: Violation::MissingUniqueKey { ref table, .. },
                ..
            } => assert_eq!(table, "gmail_accounts"),
            other => panic!("expected missing unique key, got {other}"),
        }

        // Rolled back: the email tables keep their old shape and nothing is recorded.
        assert!(!schema::has_column(&conn, "raw_emails", "google_sub").unwrap());
        assert_eq!(current_version(&conn).unwrap(), 0);
    }

    #[test]
    fn test_email_changeset_rejects_existing_accounts() {
        let conn = mem_db();
        apply_migration(&conn, &MIGRATIONS[0]).expect("baseline");
        conn.execute(
            "INSERT INTO gmail_accounts (user_id, google_sub, access_token, refresh_token, expires_at)
             VALUES ('u1', 'sub-1', 'at', 'rt', '2024-03-05T00:00:00Z')",
            [],
        )
        .unwrap();

        let err = run_migrations(&conn, false).unwrap_err();
        match err {
            MigrationError::Precondition {
                version: 2,
                violation: Violation::BackfillRequired { ref table, ref column, rows },
                ..
            } => {
                assert_eq!(table, "gmail_accounts");
                assert_eq!(column, "email");
                assert_eq!(rows, 1);
            }
            other => panic!("expected backfill error, got {other}"),
        }

        // Sequence halted after v1; the account row survived untouched.
        assert_eq!(current_version(&conn).unwrap(), 1);
        assert!(!schema::has_column(&conn, "gmail_accounts", "email").unwrap());
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM gmail_accounts"), 1);
    }

    #[test]
    fn test_email_changeset_sql_alone_rejects_existing_accounts() {
        let conn = mem_db();
        apply_migration(&conn, &MIGRATIONS[0]).expect("baseline");
        conn.execute(
            "INSERT INTO gmail_accounts (user_id, google_sub, access_token, refresh_token, expires_at)
             VALUES ('u1', 'sub-1', 'at', 'rt', '2024-03-05T00:00:00Z')",
            [],
        )
        .unwrap();

        // Without the precondition the NOT NULL column still refuses the old row.
        let err = conn.execute_batch(MIGRATIONS[1].sql).unwrap_err();
        assert!(
            err.to_string().contains("NOT NULL"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn test_rebuild_refused_when_table_is_referenced() {
        let conn = mem_db();
        apply_migration(&conn, &MIGRATIONS[0]).expect("baseline");
        conn.execute_batch(
            "CREATE TABLE account_audit (
                user_id TEXT NOT NULL,
                google_sub TEXT NOT NULL,
                FOREIGN KEY (user_id, google_sub) REFERENCES gmail_accounts (user_id, google_sub)
             );",
        )
        .unwrap();

        let err = apply_migration(&conn, &MIGRATIONS[1]).unwrap_err();
        assert!(matches!(
            err,
            MigrationError::Precondition {
                violation: Violation::HasDependents { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_cascade_delete_after_migration() {
        let conn = mem_db();
        run_migrations(&conn, false).unwrap();

        seed_account(&conn, "u1", "sub-a", "a@example.com");
        seed_account(&conn, "u1", "sub-b", "b@example.com");
        seed_raw_email(&conn, "u1", "sub-a", "m1");
        seed_raw_email(&conn, "u1", "sub-a", "m2");
        seed_raw_email(&conn, "u1", "sub-b", "m3");
        seed_processed_email(&conn, "u1", "sub-a", "m1");
        seed_processed_email(&conn, "u1", "sub-b", "m3");

        conn.execute(
            "DELETE FROM gmail_accounts WHERE user_id = 'u1' AND google_sub = 'sub-a'",
            [],
        )
        .unwrap();

        assert_eq!(count(&conn, "SELECT COUNT(*) FROM raw_emails WHERE google_sub = 'sub-a'"), 0);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM processed_emails WHERE google_sub = 'sub-a'"), 0);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM raw_emails WHERE google_sub = 'sub-b'"), 1);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM processed_emails WHERE google_sub = 'sub-b'"), 1);
    }

    #[test]
    fn test_email_rows_require_existing_account() {
        let conn = mem_db();
        run_migrations(&conn, false).unwrap();

        let err = conn
            .execute(
                "INSERT INTO raw_emails (user_id, gmail_message_id, thread_id, received_at, google_sub)
                 VALUES ('u1', 'm1', 't1', '2024-03-05T00:00:00Z', 'ghost')",
                [],
            )
            .unwrap_err();
        assert_eq!(
            err.sqlite_error_code(),
            Some(rusqlite::ErrorCode::ConstraintViolation)
        );
    }

    #[test]
    fn test_user_email_uniqueness() {
        let conn = mem_db();
        run_migrations(&conn, false).unwrap();

        seed_account(&conn, "u1", "sub-a", "same@example.com");
        let err = conn
            .execute(
                "INSERT INTO gmail_accounts (user_id, google_sub, access_token, refresh_token, expires_at, email)
                 VALUES ('u1', 'sub-b', 'at', 'rt', '2024-03-05T00:00:00Z', 'same@example.com')",
                [],
            )
            .unwrap_err();
        assert_eq!(
            err.sqlite_error_code(),
            Some(rusqlite::ErrorCode::ConstraintViolation)
        );

        // Another user may link the same address.
        seed_account(&conn, "u2", "sub-a", "same@example.com");
    }

    #[test]
    fn test_composite_primary_key_rejects_duplicates() {
        let conn = mem_db();
        run_migrations(&conn, false).unwrap();
        seed_account(&conn, "u1", "sub-a", "a@example.com");
        seed_account(&conn, "u1", "sub-b", "b@example.com");

        seed_raw_email(&conn, "u1", "sub-a", "m1");
        // Same message/thread under a different account is a distinct row.
        seed_raw_email(&conn, "u1", "sub-b", "m1");

        seed_processed_email(&conn, "u1", "sub-a", "m1");

        for table in ["raw_emails", "processed_emails"] {
            let err = conn
                .execute(
                    &format!(
                        "INSERT INTO {table} (user_id, gmail_message_id, thread_id, received_at, google_sub)
                         VALUES ('u1', 'm1', 't1', '2024-03-05T00:00:00Z', 'sub-a')"
                    ),
                    [],
                )
                .unwrap_err();
            assert_eq!(
                err.sqlite_error_code(),
                Some(rusqlite::ErrorCode::ConstraintViolation),
                "{table} should reject a duplicate key"
            );
        }
    }

    #[test]
    fn test_bootstrap_existing_db() {
        let conn = mem_db();

        // Pre-framework store already at the final shape, with data.
        conn.execute_batch(MIGRATIONS[0].sql).unwrap();
        conn.execute_batch(MIGRATIONS[1].sql).unwrap();
        conn.execute_batch(MIGRATIONS[2].sql).unwrap();
        seed_account(&conn, "u1", "sub-a", "a@example.com");

        let applied = run_migrations(&conn, false).expect("migrations should succeed");
        assert_eq!(applied, 0, "bootstrap should record versions, not run SQL");
        assert_eq!(current_version(&conn).unwrap(), 3);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM gmail_accounts"), 1);
    }

    #[test]
    fn test_bootstrap_partial_db_runs_remaining() {
        let conn = mem_db();
        conn.execute_batch(MIGRATIONS[0].sql).unwrap();
        conn.execute_batch(MIGRATIONS[1].sql).unwrap();

        let applied = run_migrations(&conn, false).expect("migrations should succeed");
        assert_eq!(applied, 1, "only the google_sub changeset is pending");
        assert_eq!(current_version(&conn).unwrap(), 3);
    }

    #[test]
    fn test_failed_changeset_leaves_no_half_rebuilt_table() {
        let conn = mem_db();
        apply_migration(&conn, &MIGRATIONS[0]).expect("baseline");
        apply_migration(&conn, &MIGRATIONS[1]).expect("email changeset");

        // raw_emails is rebuilt before processed_emails; make the second rebuild fail.
        conn.execute_batch("CREATE TABLE processed_emails_new (id INTEGER);")
            .unwrap();

        let err = apply_migration(&conn, &MIGRATIONS[2]).unwrap_err();
        match &err {
            MigrationError::Failed { version: 3, source, .. } => {
                assert!(source.to_string().contains("processed_emails_new"), "{source}")
            }
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(current_version(&conn).unwrap(), 2);
        for table in ["raw_emails", "processed_emails"] {
            assert!(!schema::has_column(&conn, table, "google_sub").unwrap());
            assert_eq!(
                schema::primary_key(&conn, table).unwrap(),
                ["user_id", "gmail_message_id", "thread_id"]
            );
            assert!(schema::foreign_keys(&conn, table)
                .unwrap()
                .iter()
                .all(|fk| fk.parent != "gmail_accounts"));
        }
        assert!(!schema::table_exists(&conn, "raw_emails_new").unwrap());
        assert!(schema::index_exists(&conn, "idx_raw_emails_user_received").unwrap());

        // Once the obstacle is gone the same changeset applies cleanly.
        conn.execute_batch("DROP TABLE processed_emails_new;").unwrap();
        apply_migration(&conn, &MIGRATIONS[2]).expect("google_sub changeset");
        assert_eq!(current_version(&conn).unwrap(), 3);
    }

    #[test]
    fn test_pending_accounts_for_adoption_without_writing() {
        let conn = mem_db();
        conn.execute_batch(MIGRATIONS[0].sql).unwrap();
        conn.execute_batch(MIGRATIONS[1].sql).unwrap();
        seed_account(&conn, "u1", "sub-a", "a@example.com");

        assert_eq!(adoptable_versions(&conn).unwrap(), [1, 2]);
        let pending: Vec<i32> = pending_migrations(&conn)
            .unwrap()
            .into_iter()
            .map(|m| m.version)
            .collect();
        assert_eq!(pending, [3]);
        assert!(!schema::table_exists(&conn, "schema_version").unwrap());

        run_migrations(&conn, false).expect("migrations should succeed");
        assert!(adoptable_versions(&conn).unwrap().is_empty());
        assert!(pending_migrations(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_half_migrated_store_is_not_adopted_as_final() {
        let conn = mem_db();
        conn.execute_batch(MIGRATIONS[0].sql).unwrap();
        conn.execute_batch(MIGRATIONS[1].sql).unwrap();
        // google_sub reached raw_emails only.
        conn.execute_batch("ALTER TABLE raw_emails ADD COLUMN google_sub TEXT;")
            .unwrap();

        assert_eq!(adoptable_versions(&conn).unwrap(), [1, 2]);

        let applied = run_migrations(&conn, false).expect("migrations should succeed");
        assert_eq!(applied, 1, "the google_sub changeset still runs");
        assert_eq!(current_version(&conn).unwrap(), 3);
        for check in schema::verify_email_schema(&conn).unwrap() {
            assert!(check.passed, "failed: {}", check.description);
        }
    }

    #[test]
    fn test_forward_compat_guard() {
        let conn = mem_db();

        ensure_schema_version_table(&conn).unwrap();
        conn.execute(
            "INSERT INTO schema_version (version, name) VALUES (999, 'future')",
            [],
        )
        .unwrap();

        let err = run_migrations(&conn, false).unwrap_err();
        assert!(
            err.to_string().contains("newer than this build"),
            "error should mention version mismatch: {}",
            err
        );
    }

    #[test]
    fn test_pre_migration_backup_created() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("test_backup.db");

        let conn = Connection::open(&db_path).expect("open db");
        conn.execute_batch("PRAGMA journal_mode=WAL;").unwrap();

        let applied = run_migrations(&conn, true).expect("migrations should succeed");
        assert_eq!(applied, 3);

        let backup_path = dir.path().join("test_backup.db.pre-migration.bak");
        assert!(
            backup_path.exists(),
            "pre-migration backup should be created at {}",
            backup_path.display()
        );
    }
}
