use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, Row, params};

use super::{SchoolDb, now, required, user_at, user_columns};
use crate::errors::AppError;
use crate::models::{DiscussionComment, DiscussionPost, OwnerKind};
use crate::pagination::{Page, Paginated};

fn post_select() -> String {
    format!(
        "SELECT p.id, p.title, p.body, p.pinned, p.created_at, p.updated_at,
                (SELECT COUNT(*) FROM discussion_comments c WHERE c.post_id = p.id), {}
         FROM discussion_posts p JOIN users u ON u.id = p.author_id",
        user_columns("u")
    )
}

fn post_from_row(row: &Row<'_>) -> rusqlite::Result<DiscussionPost> {
    Ok(DiscussionPost {
        id: row.get(0)?,
        title: row.get(1)?,
        body: row.get(2)?,
        pinned: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
        comment_count: row.get(6)?,
        author: user_at(row, 7)?,
    })
}

fn comment_select() -> String {
    format!(
        "SELECT c.id, c.post_id, c.body, c.created_at, {}
         FROM discussion_comments c JOIN users u ON u.id = c.author_id",
        user_columns("u")
    )
}

fn comment_from_row(row: &Row<'_>) -> rusqlite::Result<DiscussionComment> {
    Ok(DiscussionComment {
        id: row.get(0)?,
        post_id: row.get(1)?,
        body: row.get(2)?,
        created_at: row.get(3)?,
        author: user_at(row, 4)?,
    })
}

impl SchoolDb {
    // ── Posts ─────────────────────────────────────────────────────────

    pub fn create_post(&self, author_id: i64, title: &str, body: &str) -> Result<DiscussionPost> {
        let title = required(title, "Title")?;
        let body = required(body, "Post")?;
        let at = now();
        self.conn
            .execute(
                "INSERT INTO discussion_posts (author_id, title, body, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![author_id, title, body, at],
            )
            .context("Failed to insert post")?;
        let id = self.conn.last_insert_rowid();
        self.get_post(id)?.context("Post not found after insert")
    }

    pub fn get_post(&self, id: i64) -> Result<Option<DiscussionPost>> {
        self.conn
            .query_row(&format!("{} WHERE p.id = ?1", post_select()), params![id], post_from_row)
            .optional()
            .context("Failed to query post")
    }

    /// Pinned posts first, then by latest activity.
    pub fn list_posts(&self, page: Page) -> Result<Paginated<DiscussionPost>> {
        let total: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM discussion_posts", [], |row| row.get(0))
            .context("Failed to count posts")?;
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{} ORDER BY p.pinned DESC, p.updated_at DESC, p.id DESC LIMIT ?1 OFFSET ?2",
                post_select()
            ))
            .context("Failed to prepare list_posts")?;
        let items = stmt
            .query_map(params![page.limit(), page.offset()], post_from_row)
            .context("Failed to query posts")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read post row")?;
        Ok(Paginated::new(items, page, total))
    }

    pub fn set_post_pinned(&self, id: i64, pinned: bool) -> Result<DiscussionPost> {
        let changed = self
            .conn
            .execute(
                "UPDATE discussion_posts SET pinned = ?1 WHERE id = ?2",
                params![pinned, id],
            )
            .context("Failed to pin post")?;
        if changed == 0 {
            return Err(AppError::not_found(format!("Post {} not found", id)).into());
        }
        self.get_post(id)?.context("Post not found after update")
    }

    /// Deletes the post and its comments.
    /// Delete a post with its comments and attachment rows. Returns the
    /// stored file names to remove from disk, or `None` when the post does
    /// not exist.
    pub fn delete_post(&self, id: i64) -> Result<Option<Vec<String>>> {
        if self.get_post(id)?.is_none() {
            return Ok(None);
        }
        let stored: Vec<String> = self
            .attachments_for(OwnerKind::Post, id)?
            .into_iter()
            .map(|a| a.stored_name)
            .collect();

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "DELETE FROM attachments WHERE owner_kind = ?1 AND owner_id = ?2",
            params![OwnerKind::Post, id],
        )
        .context("Failed to delete post attachments")?;
        tx.execute("DELETE FROM discussion_posts WHERE id = ?1", params![id])
            .context("Failed to delete post")?;
        tx.commit().context("Failed to commit post deletion")?;
        Ok(Some(stored))
    }

    // ── Comments ──────────────────────────────────────────────────────

    /// Adding a comment bumps the post's activity time.
    pub fn add_comment(&self, post_id: i64, author_id: i64, body: &str) -> Result<DiscussionComment> {
        let body = required(body, "Comment")?;
        if self.get_post(post_id)?.is_none() {
            return Err(AppError::not_found(format!("Post {} not found", post_id)).into());
        }
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let at = now();
        tx.execute(
            "INSERT INTO discussion_comments (post_id, author_id, body, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![post_id, author_id, body, at],
        )
        .context("Failed to insert comment")?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE discussion_posts SET updated_at = ?1 WHERE id = ?2",
            params![at, post_id],
        )
        .context("Failed to touch post")?;
        tx.commit().context("Failed to commit comment")?;
        self.get_comment(id)?.context("Comment not found after insert")
    }

    pub fn get_comment(&self, id: i64) -> Result<Option<DiscussionComment>> {
        self.conn
            .query_row(&format!("{} WHERE c.id = ?1", comment_select()), params![id], comment_from_row)
            .optional()
            .context("Failed to query comment")
    }

    pub fn list_comments(&self, post_id: i64) -> Result<Vec<DiscussionComment>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} WHERE c.post_id = ?1 ORDER BY c.id", comment_select()))
            .context("Failed to prepare list_comments")?;
        let rows = stmt
            .query_map(params![post_id], comment_from_row)
            .context("Failed to query comments")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read comment row")
    }

    pub fn delete_comment(&self, id: i64) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM discussion_comments WHERE id = ?1", params![id])
            .context("Failed to delete comment")?;
        Ok(changed > 0)
    }
}
