use rusqlite::params;

use super::*;

impl MailDb {
    // =========================================================================
    // Categories
    // =========================================================================

    /// A user's categories, most recently created first.
    pub fn get_user_categories(&self, user_id: &str) -> Result<Vec<DbCategory>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, category_id, name, description, created_at
             FROM categories
             WHERE user_id = ?1
             ORDER BY created_at DESC, category_id DESC",
        )?;
        let rows = stmt.query_map(params![user_id], map_category_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Create a category with the next per-user `category_id` (1 for the first).
    pub fn create_category(
        &self,
        user_id: &str,
        name: &str,
        description: Option<&str>,
    ) -> Result<DbCategory, DbError> {
        self.with_transaction(|db| {
            let next: i64 = db.conn.query_row(
                "SELECT COALESCE(MAX(category_id), 0) + 1 FROM categories WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )?;
            db.conn.execute(
                "INSERT INTO categories (user_id, category_id, name, description)
                 VALUES (?1, ?2, ?3, ?4)",
                params![user_id, next, name, description],
            )?;
            let id = db.conn.last_insert_rowid();
            let category = db.conn.query_row(
                "SELECT id, user_id, category_id, name, description, created_at
                 FROM categories WHERE id = ?1",
                params![id],
                map_category_row,
            )?;
            Ok(category)
        })
    }
}

fn map_category_row(row: &rusqlite::Row) -> rusqlite::Result<DbCategory> {
    Ok(DbCategory {
        id: row.get(0)?,
        user_id: row.get(1)?,
        category_id: row.get(2)?,
        name: row.get(3)?,
        description: row.get(4)?,
        created_at: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::test_db;
    use super::*;

    #[test]
    fn test_category_ids_are_per_user() {
        let db = test_db();
        assert_eq!(db.create_category("u1", "Work", None).unwrap().category_id, 1);
        assert_eq!(db.create_category("u1", "News", None).unwrap().category_id, 2);
        assert_eq!(db.create_category("u2", "Bills", None).unwrap().category_id, 1);
    }

    #[test]
    fn test_get_user_categories_newest_first() {
        let db = test_db();
        db.create_category("u1", "Work", Some("Job things")).unwrap();
        db.create_category("u1", "News", None).unwrap();
        db.create_category("u2", "Bills", None).unwrap();

        let names: Vec<String> = db
            .get_user_categories("u1")
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, ["News", "Work"]);
        assert!(db.get_user_categories("u3").unwrap().is_empty());
    }
}
