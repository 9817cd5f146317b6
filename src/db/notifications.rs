use anyhow::{Context, Result};
use rusqlite::{Row, params, params_from_iter};

use super::{SchoolDb, now, placeholders};
use crate::models::{NewNotification, Notification};
use crate::pagination::{Page, Paginated};

const NOTIFICATION_SELECT: &str =
    "SELECT id, user_id, kind, body, link, read, created_at FROM notifications";

fn notification_from_row(row: &Row<'_>) -> rusqlite::Result<Notification> {
    Ok(Notification {
        id: row.get(0)?,
        user_id: row.get(1)?,
        kind: row.get(2)?,
        body: row.get(3)?,
        link: row.get(4)?,
        read: row.get(5)?,
        created_at: row.get(6)?,
    })
}

impl SchoolDb {
    /// Store a batch of notifications in one transaction.
    pub fn create_notifications(&self, batch: &[NewNotification]) -> Result<Vec<Notification>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let at = now();
        let mut stored = Vec::with_capacity(batch.len());
        for n in batch {
            tx.execute(
                "INSERT INTO notifications (user_id, kind, body, link, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![n.user_id, n.kind, n.body, n.link, at],
            )
            .context("Failed to insert notification")?;
            stored.push(Notification {
                id: tx.last_insert_rowid(),
                user_id: n.user_id,
                kind: n.kind,
                body: n.body.clone(),
                link: n.link.clone(),
                read: false,
                created_at: at,
            });
        }
        tx.commit().context("Failed to commit notifications")?;
        Ok(stored)
    }

    pub fn list_notifications(&self, user_id: i64, page: Page) -> Result<Paginated<Notification>> {
        let total: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM notifications WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .context("Failed to count notifications")?;
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{} WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2 OFFSET ?3",
                NOTIFICATION_SELECT
            ))
            .context("Failed to prepare list_notifications")?;
        let items = stmt
            .query_map(params![user_id, page.limit(), page.offset()], notification_from_row)
            .context("Failed to query notifications")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read notification row")?;
        Ok(Paginated::new(items, page, total))
    }

    pub fn unread_notifications(&self, user_id: i64, limit: i64) -> Result<Vec<Notification>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{} WHERE user_id = ?1 AND read = 0 ORDER BY id DESC LIMIT ?2",
                NOTIFICATION_SELECT
            ))
            .context("Failed to prepare unread_notifications")?;
        let rows = stmt
            .query_map(params![user_id, limit], notification_from_row)
            .context("Failed to query unread notifications")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read notification row")
    }

    pub fn unread_notification_count(&self, user_id: i64) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM notifications WHERE user_id = ?1 AND read = 0",
                params![user_id],
                |row| row.get(0),
            )
            .context("Failed to count unread notifications")
    }

    /// Mark the given notifications (or all, when `ids` is empty) as read.
    /// Only the owner's rows are touched.
    pub fn mark_notifications_read(&self, user_id: i64, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return self
                .conn
                .execute(
                    "UPDATE notifications SET read = 1 WHERE user_id = ?1 AND read = 0",
                    params![user_id],
                )
                .context("Failed to mark notifications read");
        }
        let sql = format!(
            "UPDATE notifications SET read = 1 WHERE user_id = ? AND read = 0 AND id IN ({})",
            placeholders(ids.len())
        );
        let values = std::iter::once(user_id).chain(ids.iter().copied());
        self.conn
            .execute(&sql, params_from_iter(values))
            .context("Failed to mark notifications read")
    }
}
