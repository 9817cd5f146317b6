use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, Row, params};

use super::{SchoolDb, now};
use crate::models::{Attachment, OwnerKind};

#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub owner_kind: OwnerKind,
    pub owner_id: i64,
    pub uploaded_by: i64,
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub sha256: String,
    /// Name of the file inside the uploads directory.
    pub stored_name: String,
}

const ATTACHMENT_SELECT: &str = "SELECT id, owner_kind, owner_id, uploaded_by, file_name,
            content_type, size_bytes, sha256, stored_name, created_at
     FROM attachments";

fn attachment_from_row(row: &Row<'_>) -> rusqlite::Result<Attachment> {
    Ok(Attachment {
        id: row.get(0)?,
        owner_kind: row.get(1)?,
        owner_id: row.get(2)?,
        uploaded_by: row.get(3)?,
        file_name: row.get(4)?,
        content_type: row.get(5)?,
        size_bytes: row.get(6)?,
        sha256: row.get(7)?,
        stored_name: row.get(8)?,
        created_at: row.get(9)?,
    })
}

impl SchoolDb {
    pub fn create_attachment(&self, new: &NewAttachment) -> Result<Attachment> {
        self.conn
            .execute(
                "INSERT INTO attachments
                    (owner_kind, owner_id, uploaded_by, file_name, content_type, size_bytes,
                     sha256, stored_name, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    new.owner_kind,
                    new.owner_id,
                    new.uploaded_by,
                    new.file_name,
                    new.content_type,
                    new.size_bytes,
                    new.sha256,
                    new.stored_name,
                    now()
                ],
            )
            .context("Failed to insert attachment")?;
        let id = self.conn.last_insert_rowid();
        self.get_attachment(id)?.context("Attachment not found after insert")
    }

    pub fn get_attachment(&self, id: i64) -> Result<Option<Attachment>> {
        self.conn
            .query_row(
                &format!("{} WHERE id = ?1", ATTACHMENT_SELECT),
                params![id],
                attachment_from_row,
            )
            .optional()
            .context("Failed to query attachment")
    }

    pub fn attachments_for(&self, owner_kind: OwnerKind, owner_id: i64) -> Result<Vec<Attachment>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{} WHERE owner_kind = ?1 AND owner_id = ?2 ORDER BY id",
                ATTACHMENT_SELECT
            ))
            .context("Failed to prepare attachments_for")?;
        let rows = stmt
            .query_map(params![owner_kind, owner_id], attachment_from_row)
            .context("Failed to query attachments")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read attachment row")
    }

    /// Files on a task itself plus those handed in with its submissions.
    pub fn task_attachments(&self, task_id: i64) -> Result<Vec<Attachment>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{} WHERE (owner_kind = 'task' AND owner_id = ?1)
                    OR (owner_kind = 'submission' AND owner_id IN (
                        SELECT s.id FROM submissions s JOIN task_assignees a ON a.id = s.assignee_id
                        WHERE a.task_id = ?1))
                 ORDER BY id",
                ATTACHMENT_SELECT
            ))
            .context("Failed to prepare task_attachments")?;
        let rows = stmt
            .query_map(params![task_id], attachment_from_row)
            .context("Failed to query task attachments")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read attachment row")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewTask;
    use crate::db::test_support::{db, user};
    use crate::models::Role;

    fn new_attachment(kind: OwnerKind, owner_id: i64, uploaded_by: i64, stored: &str) -> NewAttachment {
        NewAttachment {
            owner_kind: kind,
            owner_id,
            uploaded_by,
            file_name: "worksheet.pdf".to_string(),
            content_type: "application/pdf".to_string(),
            size_bytes: 1024,
            sha256: "ab".repeat(32),
            stored_name: stored.to_string(),
        }
    }

    #[test]
    fn test_task_attachments_include_submissions() -> Result<()> {
        let db = db();
        let boss = user(&db, "boss", Role::Manager);
        let amy = user(&db, "amy", Role::Staff);
        let (task, _) = db.create_task(&NewTask {
            title: "Upload plans".into(),
            description: String::new(),
            due_at: None,
            created_by: boss.id,
            assignee_ids: vec![amy.id],
            group_ids: vec![],
        })?;
        let (_, submission) = db.submit_work(task.id, amy.id, "")?;

        let brief = db.create_attachment(&new_attachment(OwnerKind::Task, task.id, boss.id, "a1"))?;
        assert_eq!(brief.owner_kind, OwnerKind::Task);
        db.create_attachment(&new_attachment(OwnerKind::Submission, submission.id, amy.id, "a2"))?;
        db.create_attachment(&new_attachment(OwnerKind::Post, 1, amy.id, "a3"))?;

        assert_eq!(db.task_attachments(task.id)?.len(), 2);

        let removed = db.delete_task(task.id)?.expect("task existed");
        assert_eq!(removed, vec!["a1".to_string(), "a2".to_string()]);
        assert!(db.get_attachment(brief.id)?.is_none());
        assert_eq!(db.attachments_for(OwnerKind::Post, 1)?.len(), 1);
        Ok(())
    }
}
