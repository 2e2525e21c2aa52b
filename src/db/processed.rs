use rusqlite::{params, OptionalExtension};

use super::emails::map_raw_email_row;
use super::*;

const PROCESSED_COLUMNS: &str = "user_id, gmail_message_id, thread_id, google_sub, subject,
     ai_summary, category_id, unsubscribed, received_at, archived, created_at";

impl MailDb {
    // =========================================================================
    // Processed emails
    // =========================================================================

    /// Store the categorization of one raw email.
    ///
    /// Identity, subject, `received_at`, `archived` and `google_sub` are copied
    /// from the raw row; `unsubscribed` starts false on insert and is left
    /// alone on re-categorization.
    pub fn save_categorization(
        &self,
        user_id: &str,
        categorization: &Categorization,
    ) -> Result<DbProcessedEmail, DbError> {
        let raw = self
            .get_raw_emails_by_ids(user_id, std::slice::from_ref(&categorization.gmail_message_id))?
            .into_iter()
            .next()
            .ok_or_else(|| {
                DbError::NotFound(format!("raw email {}", categorization.gmail_message_id))
            })?;

        self.conn.execute(
            "INSERT INTO processed_emails (
                user_id, gmail_message_id, thread_id, google_sub, subject,
                ai_summary, category_id, unsubscribed, received_at, archived
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9)
             ON CONFLICT(user_id, gmail_message_id, thread_id, google_sub) DO UPDATE SET
                subject = excluded.subject,
                ai_summary = excluded.ai_summary,
                category_id = excluded.category_id,
                received_at = excluded.received_at,
                archived = excluded.archived",
            params![
                raw.user_id,
                raw.gmail_message_id,
                raw.thread_id,
                raw.google_sub,
                raw.subject,
                categorization.summary,
                categorization.category_id,
                raw.received_at,
                raw.archived as i32,
            ],
        )?;

        let stored = self
            .conn
            .query_row(
                &format!(
                    "SELECT {PROCESSED_COLUMNS} FROM processed_emails
                     WHERE user_id = ?1 AND gmail_message_id = ?2
                       AND thread_id = ?3 AND google_sub = ?4"
                ),
                params![raw.user_id, raw.gmail_message_id, raw.thread_id, raw.google_sub],
                map_processed_row,
            )
            .optional()?;
        stored.ok_or_else(|| DbError::NotFound(format!("processed email {}", raw.gmail_message_id)))
    }

    /// All processed emails for a user, newest first.
    pub fn get_processed_emails(&self, user_id: &str) -> Result<Vec<DbProcessedEmail>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PROCESSED_COLUMNS} FROM processed_emails
             WHERE user_id = ?1
             ORDER BY received_at DESC"
        ))?;
        let rows = stmt.query_map(params![user_id], map_processed_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// A raw email with its summary, unsubscribe state, and category, if processed.
    /// `None` when the user has no raw email with this ID.
    pub fn get_email_detail(
        &self,
        user_id: &str,
        gmail_message_id: &str,
    ) -> Result<Option<EmailDetail>, DbError> {
        let raw = self
            .conn
            .query_row(
                "SELECT user_id, gmail_message_id, thread_id, google_sub, subject, body,
                        received_at, archived, unsubscribe_link, created_at
                 FROM raw_emails
                 WHERE user_id = ?1 AND gmail_message_id = ?2
                 ORDER BY received_at DESC
                 LIMIT 1",
                params![user_id, gmail_message_id],
                map_raw_email_row,
            )
            .optional()?;
        let Some(email) = raw else {
            return Ok(None);
        };

        let processed = self
            .conn
            .query_row(
                "SELECT p.ai_summary, p.unsubscribed, c.name, c.description
                 FROM processed_emails p
                 LEFT JOIN categories c
                   ON c.user_id = p.user_id AND c.category_id = p.category_id
                 WHERE p.user_id = ?1 AND p.gmail_message_id = ?2
                   AND p.thread_id = ?3 AND p.google_sub = ?4",
                params![email.user_id, email.gmail_message_id, email.thread_id, email.google_sub],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, i32>(1)? != 0,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()?;

        Ok(Some(match processed {
            Some((ai_summary, unsubscribed, category_name, category_description)) => EmailDetail {
                email,
                ai_summary,
                unsubscribed: Some(unsubscribed),
                category_name,
                category_description,
            },
            None => EmailDetail {
                email,
                ai_summary: None,
                unsubscribed: None,
                category_name: None,
                category_description: None,
            },
        }))
    }

    /// Delete processed emails by Gmail message ID. Fails if none matched.
    pub fn delete_processed_emails(
        &self,
        user_id: &str,
        gmail_message_ids: &[String],
    ) -> Result<usize, DbError> {
        if gmail_message_ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "DELETE FROM processed_emails WHERE user_id = ?1 AND gmail_message_id IN ({})",
            placeholders(1, gmail_message_ids.len())
        );
        let rows = self
            .conn
            .execute(&sql, user_and_ids(user_id, gmail_message_ids))?;
        if rows == 0 {
            return Err(DbError::NothingDeleted("processed_emails"));
        }
        Ok(rows)
    }

    pub fn mark_as_unsubscribed(&self, user_id: &str, gmail_message_id: &str) -> Result<(), DbError> {
        let rows = self.conn.execute(
            "UPDATE processed_emails SET unsubscribed = 1
             WHERE user_id = ?1 AND gmail_message_id = ?2",
            params![user_id, gmail_message_id],
        )?;
        if rows == 0 {
            return Err(DbError::NotFound(format!("processed email {gmail_message_id}")));
        }
        Ok(())
    }
}

fn map_processed_row(row: &rusqlite::Row) -> rusqlite::Result<DbProcessedEmail> {
    Ok(DbProcessedEmail {
        user_id: row.get(0)?,
        gmail_message_id: row.get(1)?,
        thread_id: row.get(2)?,
        google_sub: row.get(3)?,
        subject: row.get(4)?,
        ai_summary: row.get(5)?,
        category_id: row.get(6)?,
        unsubscribed: row.get::<_, i32>(7)? != 0,
        received_at: row.get(8)?,
        archived: row.get::<_, i32>(9)? != 0,
        created_at: row.get(10)?,
    })
}
