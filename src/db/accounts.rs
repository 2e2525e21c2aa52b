use chrono::{Duration, Utc};
use rusqlite::{params, OptionalExtension};

use super::*;

const ACCOUNT_COLUMNS: &str =
    "user_id, google_sub, email, access_token, refresh_token, expires_at, created_at";

impl MailDb {
    // =========================================================================
    // Gmail accounts
    // =========================================================================

    /// Link or re-link a Gmail account, keyed by `(user_id, google_sub)`.
    ///
    /// Google only returns a refresh token on first consent, so an absent one
    /// keeps whatever is stored. With neither, the link is refused.
    pub fn upsert_gmail_account(
        &self,
        account: &GmailAccountUpsert<'_>,
    ) -> Result<DbGmailAccount, DbError> {
        let existing_refresh: Option<String> = self
            .conn
            .query_row(
                "SELECT refresh_token FROM gmail_accounts WHERE user_id = ?1 AND google_sub = ?2",
                params![account.user_id, account.google_sub],
                |row| row.get(0),
            )
            .optional()?;

        let refresh_token = match (account.refresh_token, existing_refresh.as_deref()) {
            (Some(new), _) => new.to_string(),
            (None, Some(stored)) => stored.to_string(),
            (None, None) => {
                log::error!(
                    "No refresh token for Gmail account {}: neither in response nor stored",
                    account.google_sub
                );
                return Err(DbError::MissingRefreshToken {
                    google_sub: account.google_sub.to_string(),
                });
            }
        };

        self.conn.execute(
            "INSERT INTO gmail_accounts (
                user_id, google_sub, email, access_token, refresh_token, expires_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(user_id, google_sub) DO UPDATE SET
                email = excluded.email,
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at",
            params![
                account.user_id,
                account.google_sub,
                account.email,
                account.access_token,
                refresh_token,
                account.expires_at,
            ],
        )?;
        log::info!("Stored Gmail account {} for user {}", account.google_sub, account.user_id);

        self.get_gmail_account(account.user_id, account.google_sub)?
            .ok_or_else(|| DbError::NotFound(format!("Gmail account {}", account.google_sub)))
    }

    /// Make sure the user's sign-in account is present in `gmail_accounts`.
    ///
    /// Matches on `(user_id, email)`. When absent, the account is stored with the
    /// provider token, the primary-account refresh sentinel, and a one-hour
    /// expiry. Returns `true` if a row was inserted.
    pub fn ensure_primary_account(
        &self,
        user_id: &str,
        google_sub: &str,
        email: &str,
        provider_token: &str,
    ) -> Result<bool, DbError> {
        if self.get_gmail_account_by_email(user_id, email)?.is_some() {
            return Ok(false);
        }

        let expires_at = (Utc::now() + Duration::hours(1)).to_rfc3339();
        self.conn.execute(
            "INSERT INTO gmail_accounts (
                user_id, google_sub, email, access_token, refresh_token, expires_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                user_id,
                google_sub,
                email,
                provider_token,
                PRIMARY_ACCOUNT_REFRESH_TOKEN,
                expires_at,
            ],
        )?;
        log::info!("Stored primary Gmail account {email} for user {user_id}");
        Ok(true)
    }

    pub fn get_gmail_account(
        &self,
        user_id: &str,
        google_sub: &str,
    ) -> Result<Option<DbGmailAccount>, DbError> {
        let account = self
            .conn
            .query_row(
                &format!(
                    "SELECT {ACCOUNT_COLUMNS} FROM gmail_accounts
                     WHERE user_id = ?1 AND google_sub = ?2"
                ),
                params![user_id, google_sub],
                map_account_row,
            )
            .optional()?;
        Ok(account)
    }

    /// Lookup through `idx_gmail_accounts_email`.
    pub fn get_gmail_account_by_email(
        &self,
        user_id: &str,
        email: &str,
    ) -> Result<Option<DbGmailAccount>, DbError> {
        let account = self
            .conn
            .query_row(
                &format!(
                    "SELECT {ACCOUNT_COLUMNS} FROM gmail_accounts
                     WHERE user_id = ?1 AND email = ?2"
                ),
                params![user_id, email],
                map_account_row,
            )
            .optional()?;
        Ok(account)
    }

    /// All accounts a user has linked, oldest link first.
    pub fn get_gmail_accounts(&self, user_id: &str) -> Result<Vec<DbGmailAccount>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM gmail_accounts
             WHERE user_id = ?1
             ORDER BY created_at, google_sub"
        ))?;
        let rows = stmt.query_map(params![user_id], map_account_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Unlink an account. Its raw and processed emails go with it (ON DELETE CASCADE).
    /// Returns `true` if the account existed.
    pub fn delete_gmail_account(&self, user_id: &str, google_sub: &str) -> Result<bool, DbError> {
        let rows = self.conn.execute(
            "DELETE FROM gmail_accounts WHERE user_id = ?1 AND google_sub = ?2",
            params![user_id, google_sub],
        )?;
        if rows > 0 {
            log::info!("Unlinked Gmail account {google_sub} for user {user_id}");
        }
        Ok(rows > 0)
    }
}

fn map_account_row(row: &rusqlite::Row) -> rusqlite::Result<DbGmailAccount> {
    Ok(DbGmailAccount {
        user_id: row.get(0)?,
        google_sub: row.get(1)?,
        email: row.get(2)?,
        access_token: row.get(3)?,
        refresh_token: row.get(4)?,
        expires_at: row.get(5)?,
        created_at: row.get(6)?,
    })
}
