use std::collections::BTreeSet;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};

use super::{SchoolDb, now, placeholders, required, user_at, user_columns};
use crate::errors::AppError;
use crate::models::{
    AssigneeDetail, AssigneeStatus, Note, ReviewDecision, Submission, Task, TaskAssignee,
    TaskDetail, TaskListItem, TaskScope,
};
use crate::pagination::{Page, Paginated};

#[derive(Debug, Clone)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub due_at: Option<DateTime<Utc>>,
    pub created_by: i64,
    /// Users assigned directly.
    pub assignee_ids: Vec<i64>,
    /// Groups whose active members are assigned.
    pub group_ids: Vec<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    /// `Some(None)` clears the due date.
    pub due_at: Option<Option<DateTime<Utc>>>,
}

fn task_select() -> String {
    format!(
        "SELECT t.id, t.title, t.description, t.due_at, t.created_at, t.updated_at, {}
         FROM tasks t JOIN users c ON c.id = t.created_by",
        user_columns("c")
    )
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        due_at: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
        created_by: user_at(row, 6)?,
    })
}

fn task_item_from_row(row: &Row<'_>) -> rusqlite::Result<TaskListItem> {
    Ok(TaskListItem {
        task: task_from_row(row)?,
        assignee_count: row.get(10)?,
        done_count: row.get(11)?,
        my_status: row.get(12)?,
    })
}

fn assignee_select() -> String {
    format!(
        "SELECT a.id, a.task_id, a.status, a.updated_at, {}
         FROM task_assignees a JOIN users u ON u.id = a.user_id",
        user_columns("u")
    )
}

fn assignee_from_row(row: &Row<'_>) -> rusqlite::Result<TaskAssignee> {
    Ok(TaskAssignee {
        id: row.get(0)?,
        task_id: row.get(1)?,
        status: row.get(2)?,
        updated_at: row.get(3)?,
        user: user_at(row, 4)?,
    })
}

/// Select list shared by task list queries; `?1` is the viewing user.
fn task_item_select() -> String {
    format!(
        "SELECT t.id, t.title, t.description, t.due_at, t.created_at, t.updated_at, {},
            (SELECT COUNT(*) FROM task_assignees a WHERE a.task_id = t.id),
            (SELECT COUNT(*) FROM task_assignees a WHERE a.task_id = t.id AND a.status = 'done'),
            (SELECT a.status FROM task_assignees a WHERE a.task_id = t.id AND a.user_id = ?1)
         FROM tasks t JOIN users c ON c.id = t.created_by",
        user_columns("c")
    )
}

fn query_assignee(conn: &Connection, task_id: i64, assignee_id: i64) -> Result<Option<TaskAssignee>> {
    conn.query_row(
        &format!("{} WHERE a.task_id = ?1 AND a.id = ?2", assignee_select()),
        params![task_id, assignee_id],
        assignee_from_row,
    )
    .optional()
    .context("Failed to query assignee")
}

impl SchoolDb {
    // ── Task CRUD ─────────────────────────────────────────────────────

    /// Create a task and its assignees in one transaction. Group
    /// assignments expand to the groups' active members; a user reached
    /// twice is assigned once. Returns the task and the assigned user ids.
    pub fn create_task(&self, new: &NewTask) -> Result<(Task, Vec<i64>)> {
        let title = required(&new.title, "Title")?;

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let mut user_ids: BTreeSet<i64> = BTreeSet::new();
        if !new.assignee_ids.is_empty() {
            let requested: BTreeSet<i64> = new.assignee_ids.iter().copied().collect();
            let sql = format!(
                "SELECT id FROM users WHERE active = 1 AND id IN ({})",
                placeholders(requested.len())
            );
            let mut stmt = tx.prepare(&sql).context("Failed to prepare assignee lookup")?;
            let found = stmt
                .query_map(params_from_iter(requested.iter()), |row| row.get::<_, i64>(0))
                .context("Failed to look up assignees")?
                .collect::<rusqlite::Result<BTreeSet<i64>>>()
                .context("Failed to read assignee id")?;
            if found.len() != requested.len() {
                return Err(AppError::validation("Some selected people are unknown or inactive").into());
            }
            user_ids.extend(found);
        }
        for group_id in &new.group_ids {
            let members = self.group_member_ids(*group_id)?;
            if members.is_empty() && self.get_group(*group_id)?.is_none() {
                return Err(AppError::not_found(format!("Group {} not found", group_id)).into());
            }
            user_ids.extend(members);
        }
        if user_ids.is_empty() {
            return Err(AppError::validation("Assign the task to at least one person or group").into());
        }

        let created_at = now();
        tx.execute(
            "INSERT INTO tasks (title, description, due_at, created_by, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![title, new.description.trim(), new.due_at, new.created_by, created_at],
        )
        .context("Failed to insert task")?;
        let task_id = tx.last_insert_rowid();
        for user_id in &user_ids {
            tx.execute(
                "INSERT INTO task_assignees (task_id, user_id, status, updated_at) VALUES (?1, ?2, ?3, ?4)",
                params![task_id, user_id, AssigneeStatus::InProgress, created_at],
            )
            .context("Failed to insert assignee")?;
        }
        tx.commit().context("Failed to commit task")?;

        let task = self.get_task(task_id)?.context("Task not found after insert")?;
        Ok((task, user_ids.into_iter().collect()))
    }

    pub fn get_task(&self, id: i64) -> Result<Option<Task>> {
        self.conn
            .query_row(&format!("{} WHERE t.id = ?1", task_select()), params![id], task_from_row)
            .optional()
            .context("Failed to query task")
    }

    pub fn get_task_detail(&self, id: i64) -> Result<Option<TaskDetail>> {
        let Some(task) = self.get_task(id)? else {
            return Ok(None);
        };

        let mut stmt = self
            .conn
            .prepare(&format!(
                "{} WHERE a.task_id = ?1 ORDER BY u.display_name COLLATE NOCASE",
                assignee_select()
            ))
            .context("Failed to prepare assignees")?;
        let assignees = stmt
            .query_map(params![id], assignee_from_row)
            .context("Failed to query assignees")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read assignee row")?;

        let mut details = Vec::with_capacity(assignees.len());
        for assignee in assignees {
            let submissions = self.submissions_for(assignee.id)?;
            let notes = self.notes_for(assignee.id)?;
            details.push(AssigneeDetail {
                assignee,
                submissions,
                notes,
            });
        }

        Ok(Some(TaskDetail {
            task,
            assignees: details,
            attachments: self.task_attachments(id)?,
        }))
    }

    pub fn list_tasks(&self, viewer_id: i64, scope: TaskScope, page: Page) -> Result<Paginated<TaskListItem>> {
        let filter = match scope {
            TaskScope::Assigned => {
                "EXISTS (SELECT 1 FROM task_assignees x WHERE x.task_id = t.id AND x.user_id = ?1)"
            }
            TaskScope::Created => "t.created_by = ?1",
            TaskScope::All => "1 = 1",
        };
        let count_params: Vec<i64> = match scope {
            TaskScope::All => Vec::new(),
            _ => vec![viewer_id],
        };
        let total: i64 = self
            .conn
            .query_row(
                &format!("SELECT COUNT(*) FROM tasks t WHERE {}", filter),
                params_from_iter(count_params),
                |row| row.get(0),
            )
            .context("Failed to count tasks")?;

        let mut stmt = self
            .conn
            .prepare(&format!(
                "{} WHERE {} ORDER BY t.due_at IS NULL, t.due_at, t.id DESC LIMIT ?2 OFFSET ?3",
                task_item_select(),
                filter
            ))
            .context("Failed to prepare list_tasks")?;
        let items = stmt
            .query_map(params![viewer_id, page.limit(), page.offset()], task_item_from_row)
            .context("Failed to query tasks")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read task row")?;

        Ok(Paginated::new(items, page, total))
    }

    /// Tasks still waiting on the user: in progress or sent back.
    pub fn open_assignments(&self, user_id: i64, limit: i64) -> Result<Vec<TaskListItem>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{} WHERE EXISTS (SELECT 1 FROM task_assignees x
                    WHERE x.task_id = t.id AND x.user_id = ?1
                      AND x.status IN ('in_progress', 'rejected'))
                 ORDER BY t.due_at IS NULL, t.due_at, t.id DESC LIMIT ?2",
                task_item_select()
            ))
            .context("Failed to prepare open_assignments")?;
        let items = stmt
            .query_map(params![user_id, limit], task_item_from_row)
            .context("Failed to query open assignments")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read task row")?;
        Ok(items)
    }

    /// Submitted work the user can review. `all` covers every task
    /// (managers and admins), otherwise only tasks they created.
    pub fn awaiting_review_count(&self, reviewer_id: i64, all: bool) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM task_assignees a JOIN tasks t ON t.id = a.task_id
                 WHERE a.status = 'submitted' AND (?2 OR t.created_by = ?1)",
                params![reviewer_id, all],
                |row| row.get(0),
            )
            .context("Failed to count work awaiting review")
    }

    pub fn update_task(&self, id: i64, update: &TaskUpdate) -> Result<Task> {
        let current = self
            .get_task(id)?
            .ok_or_else(|| AppError::not_found(format!("Task {} not found", id)))?;
        let title = match &update.title {
            Some(title) => required(title, "Title")?,
            None => current.title,
        };
        let description = match &update.description {
            Some(d) => d.trim().to_string(),
            None => current.description,
        };
        let due_at = update.due_at.unwrap_or(current.due_at);

        self.conn
            .execute(
                "UPDATE tasks SET title = ?1, description = ?2, due_at = ?3, updated_at = ?4 WHERE id = ?5",
                params![title, description, due_at, now(), id],
            )
            .context("Failed to update task")?;
        self.get_task(id)?.context("Task not found after update")
    }

    /// Delete a task with its assignees, submissions, notes and attachment
    /// rows. Returns the stored file names to remove from disk, or `None`
    /// when the task does not exist.
    pub fn delete_task(&self, id: i64) -> Result<Option<Vec<String>>> {
        if self.get_task(id)?.is_none() {
            return Ok(None);
        }
        let stored: Vec<String> = self
            .task_attachments(id)?
            .into_iter()
            .map(|a| a.stored_name)
            .collect();

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "DELETE FROM attachments WHERE
                (owner_kind = 'task' AND owner_id = ?1)
             OR (owner_kind = 'submission' AND owner_id IN (
                    SELECT s.id FROM submissions s JOIN task_assignees a ON a.id = s.assignee_id
                    WHERE a.task_id = ?1))",
            params![id],
        )
        .context("Failed to delete task attachments")?;
        tx.execute("DELETE FROM tasks WHERE id = ?1", params![id])
            .context("Failed to delete task")?;
        tx.commit().context("Failed to commit task deletion")?;
        Ok(Some(stored))
    }

    // ── Assignee workflow ─────────────────────────────────────────────

    pub fn get_assignee(&self, task_id: i64, assignee_id: i64) -> Result<Option<TaskAssignee>> {
        query_assignee(&self.conn, task_id, assignee_id)
    }

    /// Record a submission by the assignee and move them to `submitted`.
    pub fn submit_work(&self, task_id: i64, user_id: i64, body: &str) -> Result<(TaskAssignee, Submission)> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let assignee = tx
            .query_row(
                &format!("{} WHERE a.task_id = ?1 AND a.user_id = ?2", assignee_select()),
                params![task_id, user_id],
                assignee_from_row,
            )
            .optional()
            .context("Failed to query assignee")?;
        let Some(assignee) = assignee else {
            if self.get_task(task_id)?.is_none() {
                return Err(AppError::not_found(format!("Task {} not found", task_id)).into());
            }
            return Err(AppError::not_authorized("Only people assigned to this task can submit work").into());
        };
        let status = assignee.status.submit().map_err(AppError::Validation)?;

        let at = now();
        tx.execute(
            "INSERT INTO submissions (assignee_id, body, created_at) VALUES (?1, ?2, ?3)",
            params![assignee.id, body.trim(), at],
        )
        .context("Failed to insert submission")?;
        let submission_id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE task_assignees SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status, at, assignee.id],
        )
        .context("Failed to update assignee status")?;
        tx.execute(
            "UPDATE tasks SET updated_at = ?1 WHERE id = ?2",
            params![at, task_id],
        )
        .context("Failed to touch task")?;
        tx.commit().context("Failed to commit submission")?;

        let submission = Submission {
            id: submission_id,
            assignee_id: assignee.id,
            body: body.trim().to_string(),
            created_at: at,
        };
        let assignee = TaskAssignee {
            status,
            updated_at: at,
            ..assignee
        };
        Ok((assignee, submission))
    }

    /// Approve or reject submitted work; a non-empty `note` is stored with
    /// the decision in the same transaction.
    pub fn review_assignee(
        &self,
        task_id: i64,
        assignee_id: i64,
        reviewer_id: i64,
        decision: ReviewDecision,
        note: &str,
    ) -> Result<(TaskAssignee, Option<Note>)> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let assignee = query_assignee(&tx, task_id, assignee_id)?
            .ok_or_else(|| AppError::not_found(format!("Assignee {} not found on task {}", assignee_id, task_id)))?;
        let status = assignee.status.review(decision).map_err(AppError::Validation)?;

        let at = now();
        tx.execute(
            "UPDATE task_assignees SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status, at, assignee.id],
        )
        .context("Failed to update assignee status")?;
        let note_id = if note.trim().is_empty() {
            None
        } else {
            tx.execute(
                "INSERT INTO notes (assignee_id, author_id, body, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![assignee.id, reviewer_id, note.trim(), at],
            )
            .context("Failed to insert review note")?;
            Some(tx.last_insert_rowid())
        };
        tx.execute(
            "UPDATE tasks SET updated_at = ?1 WHERE id = ?2",
            params![at, task_id],
        )
        .context("Failed to touch task")?;
        tx.commit().context("Failed to commit review")?;

        let note = match note_id {
            Some(id) => Some(self.get_note(id)?.context("Note not found after insert")?),
            None => None,
        };
        let assignee = TaskAssignee {
            status,
            updated_at: at,
            ..assignee
        };
        Ok((assignee, note))
    }

    pub fn add_note(&self, task_id: i64, assignee_id: i64, author_id: i64, body: &str) -> Result<Note> {
        let body = required(body, "Note")?;
        if self.get_assignee(task_id, assignee_id)?.is_none() {
            return Err(AppError::not_found(format!(
                "Assignee {} not found on task {}",
                assignee_id, task_id
            ))
            .into());
        }
        self.conn
            .execute(
                "INSERT INTO notes (assignee_id, author_id, body, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![assignee_id, author_id, body, now()],
            )
            .context("Failed to insert note")?;
        let id = self.conn.last_insert_rowid();
        self.get_note(id)?.context("Note not found after insert")
    }

    fn get_note(&self, id: i64) -> Result<Option<Note>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT n.id, n.assignee_id, n.body, n.created_at, {}
                     FROM notes n JOIN users u ON u.id = n.author_id WHERE n.id = ?1",
                    user_columns("u")
                ),
                params![id],
                note_from_row,
            )
            .optional()
            .context("Failed to query note")
    }

    fn notes_for(&self, assignee_id: i64) -> Result<Vec<Note>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT n.id, n.assignee_id, n.body, n.created_at, {}
                 FROM notes n JOIN users u ON u.id = n.author_id
                 WHERE n.assignee_id = ?1 ORDER BY n.id",
                user_columns("u")
            ))
            .context("Failed to prepare notes")?;
        let rows = stmt
            .query_map(params![assignee_id], note_from_row)
            .context("Failed to query notes")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read note row")
    }

    fn submissions_for(&self, assignee_id: i64) -> Result<Vec<Submission>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, assignee_id, body, created_at FROM submissions
                 WHERE assignee_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare submissions")?;
        let rows = stmt
            .query_map(params![assignee_id], |row| {
                Ok(Submission {
                    id: row.get(0)?,
                    assignee_id: row.get(1)?,
                    body: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })
            .context("Failed to query submissions")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read submission row")
    }

    /// Task id and assignee user id that a submission belongs to.
    pub fn submission_owner(&self, submission_id: i64) -> Result<Option<(i64, i64)>> {
        self.conn
            .query_row(
                "SELECT a.task_id, a.user_id FROM submissions s
                 JOIN task_assignees a ON a.id = s.assignee_id WHERE s.id = ?1",
                params![submission_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to query submission owner")
    }
}

fn note_from_row(row: &Row<'_>) -> rusqlite::Result<Note> {
    Ok(Note {
        id: row.get(0)?,
        assignee_id: row.get(1)?,
        body: row.get(2)?,
        created_at: row.get(3)?,
        author: user_at(row, 4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{db, user};
    use crate::models::{Role, User};

    fn new_task(creator: &User, assignees: &[i64], groups: &[i64]) -> NewTask {
        NewTask {
            title: "Write reports".to_string(),
            description: "Term 2".to_string(),
            due_at: None,
            created_by: creator.id,
            assignee_ids: assignees.to_vec(),
            group_ids: groups.to_vec(),
        }
    }

    #[test]
    fn test_create_task_expands_groups_and_dedupes() -> Result<()> {
        let db = db();
        let boss = user(&db, "boss", Role::Manager);
        let amy = user(&db, "amy", Role::Staff);
        let ben = user(&db, "ben", Role::Staff);
        let group = db.create_group("Year 7", "")?;
        db.add_group_member(group.id, amy.id)?;
        db.add_group_member(group.id, ben.id)?;

        let (task, assigned) = db.create_task(&new_task(&boss, &[amy.id], &[group.id]))?;
        assert_eq!(assigned, vec![amy.id, ben.id]);
        assert_eq!(task.created_by.id, boss.id);

        let detail = db.get_task_detail(task.id)?.expect("task exists");
        assert_eq!(detail.assignees.len(), 2);
        assert!(
            detail
                .assignees
                .iter()
                .all(|a| a.assignee.status == AssigneeStatus::InProgress)
        );
        Ok(())
    }

    #[test]
    fn test_create_task_requires_assignee_and_title() {
        let db = db();
        let boss = user(&db, "boss", Role::Manager);

        let err: AppError = db.create_task(&new_task(&boss, &[], &[])).unwrap_err().into();
        assert!(matches!(err, AppError::Validation(_)));

        let mut untitled = new_task(&boss, &[boss.id], &[]);
        untitled.title = "  ".into();
        let err: AppError = db.create_task(&untitled).unwrap_err().into();
        assert!(matches!(err, AppError::Validation(ref m) if m == "Title is required"));
    }

    #[test]
    fn test_create_task_rejects_unknown_user_atomically() -> Result<()> {
        let db = db();
        let boss = user(&db, "boss", Role::Manager);
        let err: AppError = db
            .create_task(&new_task(&boss, &[boss.id, 999], &[]))
            .unwrap_err()
            .into();
        assert!(matches!(err, AppError::Validation(_)));
        let listed = db.list_tasks(boss.id, TaskScope::All, Page::new(None, 10))?;
        assert_eq!(listed.total, 0);
        Ok(())
    }

    #[test]
    fn test_full_review_cycle() -> Result<()> {
        let db = db();
        let boss = user(&db, "boss", Role::Manager);
        let amy = user(&db, "amy", Role::Staff);
        let (task, _) = db.create_task(&new_task(&boss, &[amy.id], &[]))?;

        let (assignee, submission) = db.submit_work(task.id, amy.id, "Done, see attached")?;
        assert_eq!(assignee.status, AssigneeStatus::Submitted);
        assert_eq!(submission.body, "Done, see attached");
        assert_eq!(db.awaiting_review_count(boss.id, false)?, 1);

        // Resubmitting before review is rejected.
        let err: AppError = db.submit_work(task.id, amy.id, "again").unwrap_err().into();
        assert!(matches!(err, AppError::Validation(_)));

        let (rejected, note) =
            db.review_assignee(task.id, assignee.id, boss.id, ReviewDecision::Reject, "Missing page 2")?;
        assert_eq!(rejected.status, AssigneeStatus::Rejected);
        assert_eq!(note.expect("note stored").author.id, boss.id);

        db.submit_work(task.id, amy.id, "Fixed")?;
        let (done, note) = db.review_assignee(task.id, assignee.id, boss.id, ReviewDecision::Approve, "")?;
        assert_eq!(done.status, AssigneeStatus::Done);
        assert!(note.is_none());

        let err: AppError = db.submit_work(task.id, amy.id, "more").unwrap_err().into();
        assert!(matches!(err, AppError::Validation(_)));

        let detail = db.get_task_detail(task.id)?.expect("task exists");
        let mine = detail.assignee_for(amy.id).expect("assigned");
        assert_eq!(mine.submissions.len(), 2);
        assert_eq!(mine.notes.len(), 1);
        Ok(())
    }

    #[test]
    fn test_review_requires_submitted() -> Result<()> {
        let db = db();
        let boss = user(&db, "boss", Role::Manager);
        let amy = user(&db, "amy", Role::Staff);
        let (task, _) = db.create_task(&new_task(&boss, &[amy.id], &[]))?;
        let detail = db.get_task_detail(task.id)?.expect("task exists");
        let assignee_id = detail.assignees[0].assignee.id;

        let err: AppError = db
            .review_assignee(task.id, assignee_id, boss.id, ReviewDecision::Approve, "ok")
            .unwrap_err()
            .into();
        assert!(matches!(err, AppError::Validation(_)));
        // The note must not be stored when the transition fails.
        let detail = db.get_task_detail(task.id)?.expect("task exists");
        assert!(detail.assignees[0].notes.is_empty());
        Ok(())
    }

    #[test]
    fn test_non_assignee_cannot_submit() -> Result<()> {
        let db = db();
        let boss = user(&db, "boss", Role::Manager);
        let amy = user(&db, "amy", Role::Staff);
        let ben = user(&db, "ben", Role::Staff);
        let (task, _) = db.create_task(&new_task(&boss, &[amy.id], &[]))?;

        let err: AppError = db.submit_work(task.id, ben.id, "me too").unwrap_err().into();
        assert!(matches!(err, AppError::NotAuthorized(_)));
        let err: AppError = db.submit_work(4242, ben.id, "x").unwrap_err().into();
        assert!(matches!(err, AppError::NotFound(_)));
        Ok(())
    }

    #[test]
    fn test_list_scopes_and_pagination() -> Result<()> {
        let db = db();
        let boss = user(&db, "boss", Role::Manager);
        let amy = user(&db, "amy", Role::Staff);
        for _ in 0..3 {
            db.create_task(&new_task(&boss, &[amy.id], &[]))?;
        }
        db.create_task(&new_task(&boss, &[boss.id], &[]))?;

        let assigned = db.list_tasks(amy.id, TaskScope::Assigned, Page::new(Some(1), 2))?;
        assert_eq!(assigned.total, 3);
        assert_eq!(assigned.items.len(), 2);
        assert!(assigned.has_next());
        assert_eq!(assigned.items[0].my_status, Some(AssigneeStatus::InProgress));

        let created = db.list_tasks(boss.id, TaskScope::Created, Page::new(None, 10))?;
        assert_eq!(created.total, 4);
        let all = db.list_tasks(amy.id, TaskScope::All, Page::new(None, 10))?;
        assert_eq!(all.total, 4);
        assert_eq!(all.items.iter().filter(|i| i.my_status.is_none()).count(), 1);

        assert_eq!(db.open_assignments(amy.id, 10)?.len(), 3);
        Ok(())
    }

    #[test]
    fn test_update_and_delete_task() -> Result<()> {
        let db = db();
        let boss = user(&db, "boss", Role::Manager);
        let (task, _) = db.create_task(&new_task(&boss, &[boss.id], &[]))?;

        let due = Utc::now();
        let updated = db.update_task(
            task.id,
            &TaskUpdate {
                title: Some("Renamed".into()),
                due_at: Some(Some(due)),
                ..Default::default()
            },
        )?;
        assert_eq!(updated.title, "Renamed");
        assert_eq!(updated.description, "Term 2");
        assert!(updated.due_at.is_some());

        assert_eq!(db.delete_task(task.id)?, Some(vec![]));
        assert!(db.get_task(task.id)?.is_none());
        assert_eq!(db.delete_task(task.id)?, None);
        Ok(())
    }

    #[test]
    fn test_delete_task_cascades_to_workflow_rows() -> Result<()> {
        let db = db();
        let boss = user(&db, "boss", Role::Manager);
        let amy = user(&db, "amy", Role::Staff);
        let (task, _) = db.create_task(&new_task(&boss, &[amy.id], &[]))?;
        let (assignee, _) = db.submit_work(task.id, amy.id, "work")?;
        db.add_note(task.id, assignee.id, boss.id, "thanks")?;

        db.delete_task(task.id)?;
        let remaining: i64 = db.conn.query_row(
            "SELECT (SELECT COUNT(*) FROM task_assignees) + (SELECT COUNT(*) FROM submissions)
                  + (SELECT COUNT(*) FROM notes)",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(remaining, 0);
        Ok(())
    }

    #[test]
    fn test_add_note_requires_body_and_assignee() -> Result<()> {
        let db = db();
        let boss = user(&db, "boss", Role::Manager);
        let (task, _) = db.create_task(&new_task(&boss, &[boss.id], &[]))?;

        let err: AppError = db.add_note(task.id, 999, boss.id, "hi").unwrap_err().into();
        assert!(matches!(err, AppError::NotFound(_)));
        let err: AppError = db.add_note(task.id, 1, boss.id, " ").unwrap_err().into();
        assert!(matches!(err, AppError::Validation(_)));
        Ok(())
    }
}
