use rusqlite::params;

use super::*;
use crate::util::parse_email_date;

const RAW_EMAIL_COLUMNS: &str = "user_id, gmail_message_id, thread_id, google_sub, subject, body,
     received_at, archived, unsubscribe_link, created_at";

impl MailDb {
    // =========================================================================
    // Raw emails
    // =========================================================================

    /// Insert fetched messages for a user, updating any that are already stored.
    ///
    /// Conflicts resolve on the full key `(user_id, gmail_message_id, thread_id,
    /// google_sub)`. `received_at` is normalised to RFC 3339 UTC first; one
    /// unparseable date rejects the whole batch. Returns the stored rows.
    pub fn insert_raw_emails(
        &self,
        user_id: &str,
        emails: &[NewRawEmail],
    ) -> Result<Vec<DbRawEmail>, DbError> {
        let mut normalised = Vec::with_capacity(emails.len());
        for email in emails {
            let received_at = parse_email_date(&email.received_at)
                .ok_or_else(|| DbError::InvalidDate(email.received_at.clone()))?;
            normalised.push((email, received_at.to_rfc3339()));
        }

        self.with_transaction(|db| {
            let mut stmt = db.conn.prepare(
                "INSERT INTO raw_emails (
                    user_id, gmail_message_id, thread_id, google_sub, subject, body,
                    received_at, archived, unsubscribe_link
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(user_id, gmail_message_id, thread_id, google_sub) DO UPDATE SET
                    subject = excluded.subject,
                    body = excluded.body,
                    received_at = excluded.received_at,
                    archived = excluded.archived,
                    unsubscribe_link = excluded.unsubscribe_link",
            )?;
            for (email, received_at) in &normalised {
                stmt.execute(params![
                    user_id,
                    email.gmail_message_id,
                    email.thread_id,
                    email.google_sub,
                    email.subject,
                    email.body,
                    received_at,
                    email.archived as i32,
                    email.unsubscribe_link,
                ])?;
            }
            Ok(())
        })?;

        let ids: Vec<String> = emails.iter().map(|e| e.gmail_message_id.clone()).collect();
        self.get_raw_emails_by_ids(user_id, &ids)
    }

    /// All raw emails for a user, newest first.
    pub fn get_raw_emails(&self, user_id: &str) -> Result<Vec<DbRawEmail>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RAW_EMAIL_COLUMNS} FROM raw_emails
             WHERE user_id = ?1
             ORDER BY received_at DESC"
        ))?;
        let rows = stmt.query_map(params![user_id], map_raw_email_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn get_raw_emails_by_ids(
        &self,
        user_id: &str,
        gmail_message_ids: &[String],
    ) -> Result<Vec<DbRawEmail>, DbError> {
        if gmail_message_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {RAW_EMAIL_COLUMNS} FROM raw_emails
             WHERE user_id = ?1 AND gmail_message_id IN ({})
             ORDER BY received_at DESC",
            placeholders(1, gmail_message_ids.len())
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(user_and_ids(user_id, gmail_message_ids), map_raw_email_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Delete raw emails by Gmail message ID. Fails if none matched.
    pub fn delete_raw_emails(
        &self,
        user_id: &str,
        gmail_message_ids: &[String],
    ) -> Result<usize, DbError> {
        if gmail_message_ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "DELETE FROM raw_emails WHERE user_id = ?1 AND gmail_message_id IN ({})",
            placeholders(1, gmail_message_ids.len())
        );
        let rows = self
            .conn
            .execute(&sql, user_and_ids(user_id, gmail_message_ids))?;
        if rows == 0 {
            return Err(DbError::NothingDeleted("raw_emails"));
        }
        Ok(rows)
    }

    /// Raw emails with no processed row of the same Gmail message ID, newest first.
    pub fn get_unprocessed_emails(&self, user_id: &str) -> Result<Vec<DbRawEmail>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RAW_EMAIL_COLUMNS} FROM raw_emails r
             WHERE r.user_id = ?1
               AND NOT EXISTS (
                   SELECT 1 FROM processed_emails p
                   WHERE p.user_id = r.user_id
                     AND p.gmail_message_id = r.gmail_message_id
               )
             ORDER BY r.received_at DESC"
        ))?;
        let rows = stmt.query_map(params![user_id], map_raw_email_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Flag an email archived in both tables. A miss in either table is only
    /// logged; the processed row may not exist yet.
    pub fn mark_as_archived(&self, user_id: &str, gmail_message_id: &str) -> Result<(), DbError> {
        for table in ["raw_emails", "processed_emails"] {
            let rows = self.conn.execute(
                &format!(
                    "UPDATE {table} SET archived = 1
                     WHERE user_id = ?1 AND gmail_message_id = ?2"
                ),
                params![user_id, gmail_message_id],
            )?;
            if rows == 0 {
                log::warn!(
                    "Could not update archived status in {table} for message {gmail_message_id}"
                );
            }
        }
        Ok(())
    }
}

pub(super) fn map_raw_email_row(row: &rusqlite::Row) -> rusqlite::Result<DbRawEmail> {
    Ok(DbRawEmail {
        user_id: row.get(0)?,
        gmail_message_id: row.get(1)?,
        thread_id: row.get(2)?,
        google_sub: row.get(3)?,
        subject: row.get(4)?,
        body: row.get(5)?,
        received_at: row.get(6)?,
        archived: row.get::<_, i32>(7)? != 0,
        unsubscribe_link: row.get(8)?,
        created_at: row.get(9)?,
    })
}
