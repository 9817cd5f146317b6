use std::collections::BTreeSet;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params, params_from_iter};

use super::{SchoolDb, now, placeholders, required, user_at, user_columns};
use crate::errors::AppError;
use crate::models::{Message, Thread, ThreadSummary, UserSummary};

const THREAD_SELECT: &str =
    "SELECT t.id, t.title, t.created_by, t.created_at, t.last_message_at FROM threads t";

fn thread_from_row(row: &Row<'_>) -> rusqlite::Result<Thread> {
    Ok(Thread {
        id: row.get(0)?,
        title: row.get(1)?,
        created_by: row.get(2)?,
        created_at: row.get(3)?,
        last_message_at: row.get(4)?,
    })
}

fn message_select() -> String {
    format!(
        "SELECT m.id, m.thread_id, m.body, m.created_at, {}
         FROM messages m JOIN users u ON u.id = m.author_id",
        user_columns("u")
    )
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        body: row.get(2)?,
        created_at: row.get(3)?,
        author: user_at(row, 4)?,
    })
}

impl SchoolDb {
    // ── Threads ───────────────────────────────────────────────────────

    /// Start a thread between `creator_id` and `participant_ids` (the
    /// creator is always included), optionally with an opening message.
    pub fn create_thread(
        &self,
        creator_id: i64,
        title: Option<&str>,
        participant_ids: &[i64],
        first_message: Option<&str>,
    ) -> Result<(Thread, Option<Message>)> {
        let mut members: BTreeSet<i64> = participant_ids.iter().copied().collect();
        members.insert(creator_id);
        if members.len() < 2 {
            return Err(AppError::validation("Pick at least one person to talk to").into());
        }
        let title = title.map(str::trim).filter(|t| !t.is_empty());
        let first_message = first_message.map(str::trim).filter(|m| !m.is_empty());

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let active: i64 = tx
            .query_row(
                &format!(
                    "SELECT COUNT(*) FROM users WHERE active = 1 AND id IN ({})",
                    placeholders(members.len())
                ),
                params_from_iter(members.iter()),
                |row| row.get(0),
            )
            .context("Failed to check participants")?;
        if active as usize != members.len() {
            return Err(AppError::validation("Some selected people are unknown or inactive").into());
        }

        let at = now();
        tx.execute(
            "INSERT INTO threads (title, created_by, created_at, last_message_at) VALUES (?1, ?2, ?3, ?4)",
            params![title, creator_id, at, first_message.map(|_| at)],
        )
        .context("Failed to insert thread")?;
        let thread_id = tx.last_insert_rowid();
        for user_id in &members {
            let last_read = (*user_id == creator_id).then_some(at);
            tx.execute(
                "INSERT INTO thread_participants (thread_id, user_id, last_read_at) VALUES (?1, ?2, ?3)",
                params![thread_id, user_id, last_read],
            )
            .context("Failed to insert participant")?;
        }
        let message_id = match first_message {
            Some(body) => {
                tx.execute(
                    "INSERT INTO messages (thread_id, author_id, body, created_at) VALUES (?1, ?2, ?3, ?4)",
                    params![thread_id, creator_id, body, at],
                )
                .context("Failed to insert message")?;
                Some(tx.last_insert_rowid())
            }
            None => None,
        };
        tx.commit().context("Failed to commit thread")?;

        let thread = self.get_thread(thread_id)?.context("Thread not found after insert")?;
        let message = match message_id {
            Some(id) => Some(self.get_message(id)?.context("Message not found after insert")?),
            None => None,
        };
        Ok((thread, message))
    }

    pub fn get_thread(&self, id: i64) -> Result<Option<Thread>> {
        self.conn
            .query_row(&format!("{} WHERE t.id = ?1", THREAD_SELECT), params![id], thread_from_row)
            .optional()
            .context("Failed to query thread")
    }

    /// Threads the user takes part in, most recently active first.
    pub fn list_threads(&self, user_id: i64) -> Result<Vec<ThreadSummary>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT t.id, t.title, t.created_by, t.created_at, t.last_message_at,
                    (SELECT m.body FROM messages m WHERE m.thread_id = t.id ORDER BY m.id DESC LIMIT 1),
                    (SELECT COUNT(*) FROM messages m WHERE m.thread_id = t.id AND m.author_id != ?1
                        AND (p.last_read_at IS NULL OR m.created_at > p.last_read_at))
                 FROM threads t JOIN thread_participants p ON p.thread_id = t.id AND p.user_id = ?1
                 ORDER BY COALESCE(t.last_message_at, t.created_at) DESC, t.id DESC",
            )
            .context("Failed to prepare list_threads")?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok((thread_from_row(row)?, row.get::<_, Option<String>>(5)?, row.get::<_, i64>(6)?))
            })
            .context("Failed to query threads")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read thread row")?;

        let mut summaries = Vec::with_capacity(rows.len());
        for (thread, last_message, unread) in rows {
            let participants = self.thread_participants(thread.id)?;
            summaries.push(ThreadSummary {
                thread,
                participants,
                last_message,
                unread,
            });
        }
        Ok(summaries)
    }

    pub fn thread_participants(&self, thread_id: i64) -> Result<Vec<UserSummary>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM thread_participants p JOIN users u ON u.id = p.user_id
                 WHERE p.thread_id = ?1 ORDER BY u.display_name COLLATE NOCASE",
                user_columns("u")
            ))
            .context("Failed to prepare thread_participants")?;
        let rows = stmt
            .query_map(params![thread_id], |row| user_at(row, 0))
            .context("Failed to query participants")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read participant row")
    }

    pub fn participant_ids(&self, thread_id: i64) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT user_id FROM thread_participants WHERE thread_id = ?1 ORDER BY user_id")
            .context("Failed to prepare participant_ids")?;
        let rows = stmt
            .query_map(params![thread_id], |row| row.get(0))
            .context("Failed to query participant ids")?;
        rows.collect::<rusqlite::Result<Vec<i64>>>()
            .context("Failed to read participant id")
    }

    pub fn unread_thread_count(&self, user_id: i64) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM thread_participants p JOIN threads t ON t.id = p.thread_id
                 WHERE p.user_id = ?1 AND t.last_message_at IS NOT NULL
                   AND (p.last_read_at IS NULL OR t.last_message_at > p.last_read_at)",
                params![user_id],
                |row| row.get(0),
            )
            .context("Failed to count unread threads")
    }

    pub fn mark_thread_read(&self, thread_id: i64, user_id: i64, at: DateTime<Utc>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE thread_participants SET last_read_at = ?1 WHERE thread_id = ?2 AND user_id = ?3",
                params![at, thread_id, user_id],
            )
            .context("Failed to mark thread read")?;
        Ok(())
    }

    // ── Messages ──────────────────────────────────────────────────────

    /// Append a message and bump the thread's `last_message_at` in one
    /// transaction. Only participants may post.
    pub fn post_message(&self, thread_id: i64, author_id: i64, body: &str) -> Result<Message> {
        let body = required(body, "Message")?;
        if self.get_thread(thread_id)?.is_none() {
            return Err(AppError::not_found(format!("Thread {} not found", thread_id)).into());
        }
        if !self.participant_ids(thread_id)?.contains(&author_id) {
            return Err(AppError::not_authorized("You are not part of this conversation").into());
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let at = now();
        tx.execute(
            "INSERT INTO messages (thread_id, author_id, body, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![thread_id, author_id, body, at],
        )
        .context("Failed to insert message")?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE threads SET last_message_at = ?1 WHERE id = ?2",
            params![at, thread_id],
        )
        .context("Failed to update thread")?;
        tx.execute(
            "UPDATE thread_participants SET last_read_at = ?1 WHERE thread_id = ?2 AND user_id = ?3",
            params![at, thread_id, author_id],
        )
        .context("Failed to mark thread read")?;
        tx.commit().context("Failed to commit message")?;

        self.get_message(id)?.context("Message not found after insert")
    }

    pub fn get_message(&self, id: i64) -> Result<Option<Message>> {
        self.conn
            .query_row(&format!("{} WHERE m.id = ?1", message_select()), params![id], message_from_row)
            .optional()
            .context("Failed to query message")
    }

    /// The latest `limit` messages of a thread, oldest first.
    pub fn list_messages(&self, thread_id: i64, limit: i64) -> Result<Vec<Message>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT * FROM ({} WHERE m.thread_id = ?1 ORDER BY m.id DESC LIMIT ?2) ORDER BY 1",
                message_select()
            ))
            .context("Failed to prepare list_messages")?;
        let rows = stmt
            .query_map(params![thread_id, limit], message_from_row)
            .context("Failed to query messages")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read message row")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{db, user};
    use crate::models::Role;

    #[test]
    fn test_create_thread_with_first_message() -> Result<()> {
        let db = db();
        let amy = user(&db, "amy", Role::Staff);
        let ben = user(&db, "ben", Role::Staff);

        let (thread, message) = db.create_thread(amy.id, Some("  "), &[ben.id], Some("Hi Ben"))?;
        assert!(thread.title.is_none());
        assert!(thread.last_message_at.is_some());
        assert_eq!(message.expect("first message").author.id, amy.id);
        assert_eq!(db.participant_ids(thread.id)?, vec![amy.id, ben.id]);

        let bens = db.list_threads(ben.id)?;
        assert_eq!(bens.len(), 1);
        assert_eq!(bens[0].unread, 1);
        assert_eq!(bens[0].last_message.as_deref(), Some("Hi Ben"));
        assert_eq!(db.list_threads(amy.id)?[0].unread, 0);
        Ok(())
    }

    #[test]
    fn test_thread_needs_another_participant() {
        let db = db();
        let amy = user(&db, "amy", Role::Staff);
        let err: AppError = db.create_thread(amy.id, None, &[amy.id], None).unwrap_err().into();
        assert!(matches!(err, AppError::Validation(_)));
        let err: AppError = db.create_thread(amy.id, None, &[77], None).unwrap_err().into();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_post_message_updates_thread_atomically() -> Result<()> {
        let db = db();
        let amy = user(&db, "amy", Role::Staff);
        let ben = user(&db, "ben", Role::Staff);
        let (thread, _) = db.create_thread(amy.id, Some("Trip"), &[ben.id], None)?;
        assert!(thread.last_message_at.is_none());
        assert_eq!(db.unread_thread_count(ben.id)?, 0);

        let message = db.post_message(thread.id, ben.id, "  On my way ")?;
        assert_eq!(message.body, "On my way");
        let thread = db.get_thread(thread.id)?.expect("thread");
        assert_eq!(thread.last_message_at, Some(message.created_at));
        assert_eq!(db.unread_thread_count(amy.id)?, 1);
        assert_eq!(db.unread_thread_count(ben.id)?, 0);

        db.mark_thread_read(thread.id, amy.id, now())?;
        assert_eq!(db.unread_thread_count(amy.id)?, 0);
        Ok(())
    }

    #[test]
    fn test_outsider_cannot_post() -> Result<()> {
        let db = db();
        let amy = user(&db, "amy", Role::Staff);
        let ben = user(&db, "ben", Role::Staff);
        let cat = user(&db, "cat", Role::Admin);
        let (thread, _) = db.create_thread(amy.id, None, &[ben.id], None)?;

        let err: AppError = db.post_message(thread.id, cat.id, "hello").unwrap_err().into();
        assert!(matches!(err, AppError::NotAuthorized(_)));
        let err: AppError = db.post_message(thread.id, amy.id, "   ").unwrap_err().into();
        assert!(matches!(err, AppError::Validation(_)));
        let err: AppError = db.post_message(999, amy.id, "hi").unwrap_err().into();
        assert!(matches!(err, AppError::NotFound(_)));
        Ok(())
    }

    #[test]
    fn test_list_messages_returns_latest_oldest_first() -> Result<()> {
        let db = db();
        let amy = user(&db, "amy", Role::Staff);
        let ben = user(&db, "ben", Role::Staff);
        let (thread, _) = db.create_thread(amy.id, None, &[ben.id], None)?;
        for i in 0..5 {
            db.post_message(thread.id, amy.id, &format!("msg {}", i))?;
        }
        let bodies: Vec<String> = db
            .list_messages(thread.id, 3)?
            .into_iter()
            .map(|m| m.body)
            .collect();
        assert_eq!(bodies, vec!["msg 2", "msg 3", "msg 4"]);
        Ok(())
    }

    #[test]
    fn test_threads_ordered_by_activity() -> Result<()> {
        let db = db();
        let amy = user(&db, "amy", Role::Staff);
        let ben = user(&db, "ben", Role::Staff);
        let (first, _) = db.create_thread(amy.id, Some("First"), &[ben.id], None)?;
        let (second, _) = db.create_thread(amy.id, Some("Second"), &[ben.id], None)?;
        db.post_message(first.id, ben.id, "bump")?;

        let ids: Vec<i64> = db.list_threads(amy.id)?.iter().map(|s| s.thread.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
        Ok(())
    }
}
