//! Shared type definitions for the database layer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::migrations::MigrationError;

/// Errors specific to database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Schema migration failed: {0}")]
    Migration(#[from] MigrationError),

    #[error("Unable to parse date format: {0}")]
    InvalidDate(String),

    #[error("No refresh token available for Gmail account {google_sub}")]
    MissingRefreshToken { google_sub: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("No rows deleted from {0}")]
    NothingDeleted(&'static str),
}

impl DbError {
    /// True when SQLite rejected the write because of a constraint
    /// (NOT NULL, UNIQUE, PRIMARY KEY, FOREIGN KEY).
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            DbError::Sqlite(e) if e.sqlite_error_code() == Some(rusqlite::ErrorCode::ConstraintViolation)
        )
    }
}

/// Refresh token stored for the user's sign-in account, whose tokens come
/// from the identity provider on each request rather than from this table.
pub const PRIMARY_ACCOUNT_REFRESH_TOKEN: &str = "primary_account";

/// A row from the `gmail_accounts` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DbGmailAccount {
    pub user_id: String,
    pub google_sub: String,
    pub email: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: String,
    pub created_at: String,
}

impl DbGmailAccount {
    pub fn is_primary(&self) -> bool {
        self.refresh_token == PRIMARY_ACCOUNT_REFRESH_TOKEN
    }
}

/// Input for linking (or re-linking) a Gmail account.
#[derive(Debug, Clone)]
pub struct GmailAccountUpsert<'a> {
    pub user_id: &'a str,
    pub google_sub: &'a str,
    pub email: &'a str,
    pub access_token: &'a str,
    /// Google omits the refresh token on repeat consent; the stored one is kept.
    pub refresh_token: Option<&'a str>,
    pub expires_at: &'a str,
}

/// A row from the `raw_emails` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DbRawEmail {
    pub user_id: String,
    pub gmail_message_id: String,
    pub thread_id: String,
    pub google_sub: String,
    pub subject: String,
    pub body: String,
    pub received_at: String,
    pub archived: bool,
    pub unsubscribe_link: Option<String>,
    pub created_at: String,
}

/// A fetched message ready to be stored in `raw_emails`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRawEmail {
    pub gmail_message_id: String,
    pub thread_id: String,
    pub google_sub: String,
    pub subject: String,
    pub body: String,
    /// RFC 2822 `Date:` header or an RFC 3339 timestamp.
    pub received_at: String,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub unsubscribe_link: Option<String>,
}

/// A row from the `processed_emails` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DbProcessedEmail {
    pub user_id: String,
    pub gmail_message_id: String,
    pub thread_id: String,
    pub google_sub: String,
    pub subject: String,
    pub ai_summary: Option<String>,
    pub category_id: Option<i64>,
    pub unsubscribed: bool,
    pub received_at: String,
    pub archived: bool,
    pub created_at: String,
}

/// Categorization result for one raw email.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Categorization {
    pub gmail_message_id: String,
    pub summary: String,
    pub category_id: i64,
}

/// A raw email joined with its processing result and category, if any.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EmailDetail {
    #[serde(flatten)]
    pub email: DbRawEmail,
    pub ai_summary: Option<String>,
    pub unsubscribed: Option<bool>,
    pub category_name: Option<String>,
    pub category_description: Option<String>,
}

/// A row from the `categories` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DbCategory {
    pub id: i64,
    pub user_id: String,
    pub category_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub created_at: String,
}
