use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, Row, params};

use super::{SchoolDb, now, required, user_at, user_columns};
use crate::errors::AppError;
use crate::models::{Group, GroupDetail};

const GROUP_SELECT: &str = "SELECT g.id, g.name, g.description, g.created_at,
            (SELECT COUNT(*) FROM group_members m WHERE m.group_id = g.id)
     FROM staff_groups g";

fn group_from_row(row: &Row<'_>) -> rusqlite::Result<Group> {
    Ok(Group {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        created_at: row.get(3)?,
        member_count: row.get(4)?,
    })
}

impl SchoolDb {
    pub fn create_group(&self, name: &str, description: &str) -> Result<Group> {
        let name = required(name, "Group name")?;
        self.conn
            .execute(
                "INSERT INTO staff_groups (name, description, created_at) VALUES (?1, ?2, ?3)",
                params![name, description.trim(), now()],
            )
            .context("Failed to insert group")?;
        let id = self.conn.last_insert_rowid();
        self.get_group(id)?.context("Group not found after insert")
    }

    pub fn get_group(&self, id: i64) -> Result<Option<Group>> {
        self.conn
            .query_row(&format!("{} WHERE g.id = ?1", GROUP_SELECT), params![id], group_from_row)
            .optional()
            .context("Failed to query group")
    }

    pub fn list_groups(&self) -> Result<Vec<Group>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} ORDER BY g.name COLLATE NOCASE", GROUP_SELECT))
            .context("Failed to prepare list_groups")?;
        let rows = stmt
            .query_map([], group_from_row)
            .context("Failed to query groups")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read group row")
    }

    pub fn get_group_detail(&self, id: i64) -> Result<Option<GroupDetail>> {
        let Some(group) = self.get_group(id)? else {
            return Ok(None);
        };
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM group_members m JOIN users u ON u.id = m.user_id
                 WHERE m.group_id = ?1 ORDER BY u.display_name COLLATE NOCASE",
                user_columns("u")
            ))
            .context("Failed to prepare group members")?;
        let members = stmt
            .query_map(params![id], |row| user_at(row, 0))
            .context("Failed to query group members")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read group member row")?;
        Ok(Some(GroupDetail { group, members }))
    }

    /// Adding an existing member is a no-op.
    pub fn add_group_member(&self, group_id: i64, user_id: i64) -> Result<()> {
        if self.get_group(group_id)?.is_none() {
            return Err(AppError::not_found(format!("Group {} not found", group_id)).into());
        }
        self.conn
            .execute(
                "INSERT OR IGNORE INTO group_members (group_id, user_id) VALUES (?1, ?2)",
                params![group_id, user_id],
            )
            .context("Failed to add group member")?;
        Ok(())
    }

    pub fn remove_group_member(&self, group_id: i64, user_id: i64) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "DELETE FROM group_members WHERE group_id = ?1 AND user_id = ?2",
                params![group_id, user_id],
            )
            .context("Failed to remove group member")?;
        Ok(changed > 0)
    }

    pub fn group_ids_for_user(&self, user_id: i64) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT group_id FROM group_members WHERE user_id = ?1 ORDER BY group_id")
            .context("Failed to prepare group_ids_for_user")?;
        let rows = stmt
            .query_map(params![user_id], |row| row.get(0))
            .context("Failed to query user groups")?;
        rows.collect::<rusqlite::Result<Vec<i64>>>()
            .context("Failed to read group id")
    }

    /// Active members of a group.
    pub fn group_member_ids(&self, group_id: i64) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT m.user_id FROM group_members m JOIN users u ON u.id = m.user_id
                 WHERE m.group_id = ?1 AND u.active = 1 ORDER BY m.user_id",
            )
            .context("Failed to prepare group_member_ids")?;
        let rows = stmt
            .query_map(params![group_id], |row| row.get(0))
            .context("Failed to query group members")?;
        rows.collect::<rusqlite::Result<Vec<i64>>>()
            .context("Failed to read member id")
    }
}
