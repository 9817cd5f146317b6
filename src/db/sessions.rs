use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{OptionalExtension, params};

use super::{SchoolDb, now};
use crate::models::{Session, User};

impl SchoolDb {
    pub fn create_session(&self, user_id: i64, ttl: Duration) -> Result<Session> {
        let created_at = now();
        let session = Session {
            token: uuid::Uuid::new_v4().to_string(),
            user_id,
            expires_at: created_at + ttl,
        };
        self.conn
            .execute(
                "INSERT INTO sessions (token, user_id, created_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
                params![session.token, user_id, created_at, session.expires_at],
            )
            .context("Failed to insert session")?;
        Ok(session)
    }

    /// The active user behind an unexpired session token.
    pub fn session_user(&self, token: &str, at: DateTime<Utc>) -> Result<Option<User>> {
        self.conn
            .query_row(
                "SELECT u.id, u.username, u.display_name, u.email, u.role, u.active, u.created_at
                 FROM sessions s JOIN users u ON u.id = s.user_id
                 WHERE s.token = ?1 AND s.expires_at > ?2 AND u.active = 1",
                params![token, at],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        display_name: row.get(2)?,
                        email: row.get(3)?,
                        role: row.get(4)?,
                        active: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                },
            )
            .optional()
            .context("Failed to look up session")
    }

    pub fn delete_session(&self, token: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM sessions WHERE token = ?1", params![token])
            .context("Failed to delete session")?;
        Ok(changed > 0)
    }

    pub fn purge_expired_sessions(&self, at: DateTime<Utc>) -> Result<usize> {
        self.conn
            .execute("DELETE FROM sessions WHERE expires_at <= ?1", params![at])
            .context("Failed to purge expired sessions")
    }
}
