use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, Row, params};

use super::{SchoolDb, now, required, user_at, user_columns};
use crate::errors::AppError;
use crate::models::{RequestKind, RequestStatus, StaffRequest};

fn request_select() -> String {
    format!(
        "SELECT r.id, r.kind, r.subject, r.body, r.status, r.decision_note, r.created_at, r.decided_at,
                {}, d.id, d.username, d.display_name, d.role
         FROM requests r
         JOIN users q ON q.id = r.requester_id
         LEFT JOIN users d ON d.id = r.decided_by",
        user_columns("q")
    )
}

fn request_from_row(row: &Row<'_>) -> rusqlite::Result<StaffRequest> {
    let decider_id: Option<i64> = row.get(12)?;
    let decided_by = match decider_id {
        Some(_) => Some(user_at(row, 12)?),
        None => None,
    };
    Ok(StaffRequest {
        id: row.get(0)?,
        kind: row.get(1)?,
        subject: row.get(2)?,
        body: row.get(3)?,
        status: row.get(4)?,
        decision_note: row.get(5)?,
        created_at: row.get(6)?,
        decided_at: row.get(7)?,
        requester: user_at(row, 8)?,
        decided_by,
    })
}

impl SchoolDb {
    pub fn create_request(
        &self,
        requester_id: i64,
        kind: RequestKind,
        subject: &str,
        body: &str,
    ) -> Result<StaffRequest> {
        let subject = required(subject, "Subject")?;
        self.conn
            .execute(
                "INSERT INTO requests (requester_id, kind, subject, body, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![requester_id, kind, subject, body.trim(), RequestStatus::Pending, now()],
            )
            .context("Failed to insert request")?;
        let id = self.conn.last_insert_rowid();
        self.get_request(id)?.context("Request not found after insert")
    }

    pub fn get_request(&self, id: i64) -> Result<Option<StaffRequest>> {
        self.conn
            .query_row(&format!("{} WHERE r.id = ?1", request_select()), params![id], request_from_row)
            .optional()
            .context("Failed to query request")
    }

    /// Pending requests first, then newest. `requester_id` limits the list
    /// to one person's requests.
    pub fn list_requests(&self, requester_id: Option<i64>) -> Result<Vec<StaffRequest>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{} WHERE (?1 IS NULL OR r.requester_id = ?1)
                 ORDER BY r.status = 'pending' DESC, r.id DESC",
                request_select()
            ))
            .context("Failed to prepare list_requests")?;
        let rows = stmt
            .query_map(params![requester_id], request_from_row)
            .context("Failed to query requests")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read request row")
    }

    /// Approve or reject a pending request. Decided requests are final.
    pub fn decide_request(
        &self,
        id: i64,
        decider_id: i64,
        status: RequestStatus,
        note: &str,
    ) -> Result<StaffRequest> {
        if status == RequestStatus::Pending {
            return Err(AppError::validation("A decision must approve or reject").into());
        }
        let current = self
            .get_request(id)?
            .ok_or_else(|| AppError::not_found(format!("Request {} not found", id)))?;
        if current.status != RequestStatus::Pending {
            return Err(AppError::validation(format!(
                "This request was already {}",
                current.status
            ))
            .into());
        }
        let note = Some(note.trim()).filter(|n| !n.is_empty());
        self.conn
            .execute(
                "UPDATE requests SET status = ?1, decided_by = ?2, decision_note = ?3, decided_at = ?4
                 WHERE id = ?5 AND status = 'pending'",
                params![status, decider_id, note, now(), id],
            )
            .context("Failed to record decision")?;
        self.get_request(id)?.context("Request not found after decision")
    }

    pub fn pending_request_count(&self) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM requests WHERE status = 'pending'",
                [],
                |row| row.get(0),
            )
            .context("Failed to count pending requests")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{db, user};
    use crate::models::Role;

    #[test]
    fn test_request_lifecycle() -> Result<()> {
        let db = db();
        let amy = user(&db, "amy", Role::Staff);
        let boss = user(&db, "boss", Role::Manager);

        let request = db.create_request(amy.id, RequestKind::Leave, "Friday off", "Dentist")?;
        assert_eq!(request.status, RequestStatus::Pending);
        assert!(request.decided_by.is_none());
        assert_eq!(db.pending_request_count()?, 1);

        let decided = db.decide_request(request.id, boss.id, RequestStatus::Approved, " Enjoy ")?;
        assert_eq!(decided.status, RequestStatus::Approved);
        assert_eq!(decided.decided_by.as_ref().map(|u| u.id), Some(boss.id));
        assert_eq!(decided.decision_note.as_deref(), Some("Enjoy"));
        assert!(decided.decided_at.is_some());
        assert_eq!(db.pending_request_count()?, 0);

        let err: AppError = db
            .decide_request(request.id, boss.id, RequestStatus::Rejected, "")
            .unwrap_err()
            .into();
        assert!(matches!(err, AppError::Validation(_)));
        Ok(())
    }

    #[test]
    fn test_list_requests_filters_by_requester() -> Result<()> {
        let db = db();
        let amy = user(&db, "amy", Role::Staff);
        let ben = user(&db, "ben", Role::Staff);
        let boss = user(&db, "boss", Role::Manager);
        let first = db.create_request(amy.id, RequestKind::Purchase, "Glue sticks", "")?;
        db.create_request(ben.id, RequestKind::Maintenance, "Broken projector", "Room 4")?;
        db.decide_request(first.id, boss.id, RequestStatus::Rejected, "")?;
        db.create_request(amy.id, RequestKind::Other, "Parking", "")?;

        assert_eq!(db.list_requests(Some(amy.id))?.len(), 2);
        let all = db.list_requests(None)?;
        assert_eq!(all.len(), 3);
        assert_eq!(all[2].id, first.id, "decided requests sort last");
        Ok(())
    }

    #[test]
    fn test_decide_requires_real_decision() -> Result<()> {
        let db = db();
        let amy = user(&db, "amy", Role::Staff);
        let request = db.create_request(amy.id, RequestKind::Leave, "Off", "")?;
        let err: AppError = db
            .decide_request(request.id, amy.id, RequestStatus::Pending, "")
            .unwrap_err()
            .into();
        assert!(matches!(err, AppError::Validation(_)));
        let err: AppError = db
            .decide_request(999, amy.id, RequestStatus::Approved, "")
            .unwrap_err()
            .into();
        assert!(matches!(err, AppError::NotFound(_)));
        Ok(())
    }

    #[test]
    fn test_subject_required() {
        let db = db();
        let amy = user(&db, "amy", Role::Staff);
        let err: AppError = db
            .create_request(amy.id, RequestKind::Leave, "", "")
            .unwrap_err()
            .into();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
