//! SQLite schema introspection and changeset preconditions.
//!
//! Changesets rebuild tables rather than altering them in place, so before one
//! runs we check what the SQL silently depends on: the parent key a foreign key
//! will reference, the emptiness of tables that gain a required column, and the
//! absence of other tables pointing at a table about to be dropped.

use std::collections::BTreeSet;

use rusqlite::{params, Connection};
use thiserror::Error;

/// A condition that must hold before a changeset's SQL is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    TableExists(&'static str),
    /// `columns` must be the primary key or a unique index of `table`.
    UniqueKey {
        table: &'static str,
        columns: &'static [&'static str],
    },
    /// `table` must be empty because `column` is added NOT NULL with no default.
    EmptyTable {
        table: &'static str,
        column: &'static str,
    },
    /// No other table may hold a foreign key referencing `table`.
    NoDependents(&'static str),
}

/// Why a precondition did not hold.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("table `{0}` does not exist")]
    MissingTable(String),

    #[error("`{table}({columns})` is neither a primary key nor a unique index, so no foreign key can reference it")]
    MissingUniqueKey { table: String, columns: String },

    #[error("`{table}` holds {rows} row(s) and `{column}` is added NOT NULL with no default; backfill required")]
    BackfillRequired {
        table: String,
        column: String,
        rows: i64,
    },

    #[error("`{table}` is referenced by foreign keys on {}", .referenced_by.join(", "))]
    HasDependents {
        table: String,
        referenced_by: Vec<String>,
    },
}

impl Precondition {
    /// Evaluate against the live schema. `Ok(None)` means the condition holds.
    pub fn violation(&self, conn: &Connection) -> rusqlite::Result<Option<Violation>> {
        match *self {
            Precondition::TableExists(table) => {
                if table_exists(conn, table)? {
                    Ok(None)
                } else {
                    Ok(Some(Violation::MissingTable(table.to_string())))
                }
            }
            Precondition::UniqueKey { table, columns } => {
                if !table_exists(conn, table)? {
                    return Ok(Some(Violation::MissingTable(table.to_string())));
                }
                if has_unique_key(conn, table, columns)? {
                    Ok(None)
                } else {
                    Ok(Some(Violation::MissingUniqueKey {
                        table: table.to_string(),
                        columns: columns.join(", "),
                    }))
                }
            }
            Precondition::EmptyTable { table, column } => {
                if !table_exists(conn, table)? {
                    return Ok(Some(Violation::MissingTable(table.to_string())));
                }
                let rows = row_count(conn, table)?;
                if rows == 0 {
                    Ok(None)
                } else {
                    Ok(Some(Violation::BackfillRequired {
                        table: table.to_string(),
                        column: column.to_string(),
                        rows,
                    }))
                }
            }
            Precondition::NoDependents(table) => {
                let referenced_by = dependents_of(conn, table)?;
                if referenced_by.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(Violation::HasDependents {
                        table: table.to_string(),
                        referenced_by,
                    }))
                }
            }
        }
    }
}

/// One foreign key declared on `table`, as reported by `PRAGMA foreign_key_list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub table: String,
    pub parent: String,
    pub from: Vec<String>,
    pub to: Vec<String>,
    pub on_delete: String,
}

/// Double-quote an identifier for interpolation into SQL.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    conn.prepare("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1")?
        .exists(params![table])
}

pub fn index_exists(conn: &Connection, index: &str) -> rusqlite::Result<bool> {
    conn.prepare("SELECT 1 FROM sqlite_master WHERE type = 'index' AND name = ?1")?
        .exists(params![index])
}

/// All user tables, excluding SQLite's internal ones.
pub fn user_tables(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
         ORDER BY name",
    )?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    rows.collect()
}

pub fn column_names(conn: &Connection, table: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")?;
    let rows = stmt.query_map(params![table], |row| row.get(0))?;
    rows.collect()
}

pub fn has_column(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    Ok(column_names(conn, table)?.iter().any(|c| c == column))
}

/// Whether `column` carries a NOT NULL constraint. `None` if the column is absent.
pub fn column_not_null(
    conn: &Connection,
    table: &str,
    column: &str,
) -> rusqlite::Result<Option<bool>> {
    let mut stmt = conn.prepare("SELECT \"notnull\" FROM pragma_table_info(?1) WHERE name = ?2")?;
    let mut rows = stmt.query(params![table, column])?;
    match rows.next()? {
        Some(row) => Ok(Some(row.get::<_, i64>(0)? != 0)),
        None => Ok(None),
    }
}

/// Primary key columns in key order. Empty when the table has no declared key.
pub fn primary_key(conn: &Connection, table: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT name FROM pragma_table_info(?1) WHERE pk > 0 ORDER BY pk")?;
    let rows = stmt.query_map(params![table], |row| row.get(0))?;
    rows.collect()
}

pub fn index_columns(conn: &Connection, index: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")?;
    let rows = stmt.query_map(params![index], |row| row.get(0))?;
    rows.collect()
}

/// Whether the named index is declared UNIQUE. `None` if it does not exist on `table`.
pub fn index_is_unique(
    conn: &Connection,
    table: &str,
    index: &str,
) -> rusqlite::Result<Option<bool>> {
    let mut stmt = conn.prepare("SELECT \"unique\" FROM pragma_index_list(?1) WHERE name = ?2")?;
    let mut rows = stmt.query(params![table, index])?;
    match rows.next()? {
        Some(row) => Ok(Some(row.get::<_, i64>(0)? != 0)),
        None => Ok(None),
    }
}

/// Every column set SQLite treats as unique on `table`: the primary key plus
/// each unique index (constraint-backed or explicit).
pub fn unique_keys(conn: &Connection, table: &str) -> rusqlite::Result<Vec<Vec<String>>> {
    let mut keys = Vec::new();

    let pk = primary_key(conn, table)?;
    if !pk.is_empty() {
        keys.push(pk);
    }

    let unique_indexes: Vec<String> = {
        let mut stmt =
            conn.prepare("SELECT name FROM pragma_index_list(?1) WHERE \"unique\" = 1")?;
        let rows = stmt.query_map(params![table], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<_>>()?
    };
    for index in unique_indexes {
        let columns = index_columns(conn, &index)?;
        if !columns.is_empty() && !keys.contains(&columns) {
            keys.push(columns);
        }
    }

    Ok(keys)
}

/// Order-insensitive match of `columns` against the table's unique keys.
pub fn has_unique_key(conn: &Connection, table: &str, columns: &[&str]) -> rusqlite::Result<bool> {
    let wanted: BTreeSet<&str> = columns.iter().copied().collect();
    Ok(unique_keys(conn, table)?.iter().any(|key| {
        key.len() == wanted.len() && key.iter().all(|c| wanted.contains(c.as_str()))
    }))
}

pub fn foreign_keys(conn: &Connection, table: &str) -> rusqlite::Result<Vec<ForeignKey>> {
    let mut stmt = conn.prepare(
        "SELECT id, \"table\", \"from\", \"to\", on_delete
         FROM pragma_foreign_key_list(?1)
         ORDER BY id, seq",
    )?;
    let rows = stmt.query_map(params![table], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, String>(4)?,
        ))
    })?;

    let mut keys: Vec<(i64, ForeignKey)> = Vec::new();
    for row in rows {
        let (id, parent, from, to, on_delete) = row?;
        // An omitted parent column list means "the parent's primary key"; report it empty.
        let to = to.unwrap_or_default();
        if keys.last().map(|(last_id, _)| *last_id) == Some(id) {
            if let Some((_, fk)) = keys.last_mut() {
                fk.from.push(from);
                if !to.is_empty() {
                    fk.to.push(to);
                }
            }
        } else {
            keys.push((
                id,
                ForeignKey {
                    table: table.to_string(),
                    parent,
                    from: vec![from],
                    to: if to.is_empty() { Vec::new() } else { vec![to] },
                    on_delete,
                },
            ));
        }
    }
    Ok(keys.into_iter().map(|(_, fk)| fk).collect())
}

/// Tables, other than `table` itself, whose foreign keys reference `table`.
pub fn dependents_of(conn: &Connection, table: &str) -> rusqlite::Result<Vec<String>> {
    let mut dependents = Vec::new();
    for other in user_tables(conn)? {
        if other.eq_ignore_ascii_case(table) {
            continue;
        }
        let references = foreign_keys(conn, &other)?
            .iter()
            .any(|fk| fk.parent.eq_ignore_ascii_case(table));
        if references {
            dependents.push(other);
        }
    }
    Ok(dependents)
}

pub fn row_count(conn: &Connection, table: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", quote_ident(table)),
        [],
        |row| row.get(0),
    )
}

// =============================================================================
// Post-migration verification
// =============================================================================

/// One invariant of the migrated email schema and whether it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaCheck {
    pub description: String,
    pub passed: bool,
}

impl SchemaCheck {
    fn new(description: impl Into<String>, passed: bool) -> Self {
        Self {
            description: description.into(),
            passed,
        }
    }
}

/// Re-check the shape both 20240305 changesets establish.
pub fn verify_email_schema(conn: &Connection) -> rusqlite::Result<Vec<SchemaCheck>> {
    let mut checks = Vec::new();

    checks.push(SchemaCheck::new(
        "gmail_accounts.email is NOT NULL",
        column_not_null(conn, "gmail_accounts", "email")? == Some(true),
    ));
    checks.push(SchemaCheck::new(
        "idx_gmail_accounts_email indexes gmail_accounts(email)",
        index_is_unique(conn, "gmail_accounts", "idx_gmail_accounts_email")? == Some(false)
            && index_columns(conn, "idx_gmail_accounts_email")? == ["email"],
    ));
    checks.push(SchemaCheck::new(
        "gmail_accounts_user_id_email_key makes gmail_accounts(user_id, email) unique",
        index_exists(conn, "gmail_accounts_user_id_email_key")?
            && index_is_unique(conn, "gmail_accounts", "gmail_accounts_user_id_email_key")?
                == Some(true)
            && index_columns(conn, "gmail_accounts_user_id_email_key")? == ["user_id", "email"],
    ));
    checks.push(SchemaCheck::new(
        "gmail_accounts(user_id, google_sub) is unique",
        has_unique_key(conn, "gmail_accounts", &["user_id", "google_sub"])?,
    ));

    for table in ["raw_emails", "processed_emails"] {
        checks.push(SchemaCheck::new(
            format!("{table}.google_sub is NOT NULL"),
            column_not_null(conn, table, "google_sub")? == Some(true),
        ));

        let cascades = foreign_keys(conn, table)?.iter().any(|fk| {
            fk.parent == "gmail_accounts"
                && fk.from == ["user_id", "google_sub"]
                && fk.to == ["user_id", "google_sub"]
                && fk.on_delete.eq_ignore_ascii_case("CASCADE")
        });
        checks.push(SchemaCheck::new(
            format!("{table}(user_id, google_sub) references gmail_accounts on delete cascade"),
            cascades,
        ));

        checks.push(SchemaCheck::new(
            format!("{table} primary key is (user_id, gmail_message_id, thread_id, google_sub)"),
            primary_key(conn, table)?
                == ["user_id", "gmail_message_id", "thread_id", "google_sub"],
        ));
    }

    Ok(checks)
}
