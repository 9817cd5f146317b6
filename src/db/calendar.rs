use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};

use super::{SchoolDb, now, required};
use crate::errors::AppError;
use crate::models::CalendarEvent;

#[derive(Debug, Clone)]
pub struct NewEvent {
    pub title: String,
    pub description: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub all_day: bool,
    /// `None` for school-wide events.
    pub group_id: Option<i64>,
    pub created_by: i64,
}

const EVENT_SELECT: &str = "SELECT e.id, e.title, e.description, e.starts_at, e.ends_at, e.all_day,
            e.group_id, g.name, e.created_by, e.created_at
     FROM calendar_events e LEFT JOIN staff_groups g ON g.id = e.group_id";

/// Visibility filter; `?1` is the viewer, `?2` whether they see everything.
const VISIBLE_TO: &str = "(e.group_id IS NULL OR ?2
        OR e.group_id IN (SELECT group_id FROM group_members WHERE user_id = ?1))";

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<CalendarEvent> {
    Ok(CalendarEvent {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        starts_at: row.get(3)?,
        ends_at: row.get(4)?,
        all_day: row.get(5)?,
        group_id: row.get(6)?,
        group_name: row.get(7)?,
        created_by: row.get(8)?,
        created_at: row.get(9)?,
    })
}

impl SchoolDb {
    pub fn create_event(&self, new: &NewEvent) -> Result<CalendarEvent> {
        let title = required(&new.title, "Title")?;
        if new.ends_at < new.starts_at {
            return Err(AppError::validation("The event cannot end before it starts").into());
        }
        if let Some(group_id) = new.group_id
            && self.get_group(group_id)?.is_none()
        {
            return Err(AppError::not_found(format!("Group {} not found", group_id)).into());
        }
        self.conn
            .execute(
                "INSERT INTO calendar_events
                    (title, description, starts_at, ends_at, all_day, group_id, created_by, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    title,
                    new.description.trim(),
                    new.starts_at,
                    new.ends_at,
                    new.all_day,
                    new.group_id,
                    new.created_by,
                    now()
                ],
            )
            .context("Failed to insert event")?;
        let id = self.conn.last_insert_rowid();
        self.get_event(id)?.context("Event not found after insert")
    }

    pub fn get_event(&self, id: i64) -> Result<Option<CalendarEvent>> {
        self.conn
            .query_row(&format!("{} WHERE e.id = ?1", EVENT_SELECT), params![id], event_from_row)
            .optional()
            .context("Failed to query event")
    }

    /// Events overlapping `[start, end)` that the viewer may see.
    /// `see_all` is true for managers and admins.
    pub fn events_between(
        &self,
        viewer_id: i64,
        see_all: bool,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{} WHERE {} AND e.starts_at < ?4 AND e.ends_at >= ?3
                 ORDER BY e.starts_at, e.id",
                EVENT_SELECT, VISIBLE_TO
            ))
            .context("Failed to prepare events_between")?;
        let rows = stmt
            .query_map(params![viewer_id, see_all, start, end], event_from_row)
            .context("Failed to query events")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read event row")
    }

    /// The next `limit` visible events that have not yet ended.
    pub fn upcoming_events(
        &self,
        viewer_id: i64,
        see_all: bool,
        from: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<CalendarEvent>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{} WHERE {} AND e.ends_at >= ?3 ORDER BY e.starts_at, e.id LIMIT ?4",
                EVENT_SELECT, VISIBLE_TO
            ))
            .context("Failed to prepare upcoming_events")?;
        let rows = stmt
            .query_map(params![viewer_id, see_all, from, limit], event_from_row)
            .context("Failed to query upcoming events")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read event row")
    }

    pub fn delete_event(&self, id: i64) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM calendar_events WHERE id = ?1", params![id])
            .context("Failed to delete event")?;
        Ok(changed > 0)
    }

    /// Users who can see an event: everyone active for school-wide events,
    /// otherwise the group's members plus managers and admins.
    pub fn event_audience(&self, event: &CalendarEvent) -> Result<Vec<i64>> {
        let Some(group_id) = event.group_id else {
            return self.active_user_ids();
        };
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id FROM users WHERE active = 1 AND (role IN ('admin', 'manager')
                    OR id IN (SELECT user_id FROM group_members WHERE group_id = ?1))
                 ORDER BY id",
            )
            .context("Failed to prepare event_audience")?;
        let rows = stmt
            .query_map(params![group_id], |row| row.get(0))
            .context("Failed to query event audience")?;
        rows.collect::<rusqlite::Result<Vec<i64>>>()
            .context("Failed to read audience id")
    }
}
