use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, Row, params, params_from_iter};

use super::{SchoolDb, now, placeholders, required};
use crate::errors::{AppError, AppResult};
use crate::models::{Role, User, UserSummary};

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub display_name: String,
    pub email: Option<String>,
    pub role: Role,
    /// bcrypt hash; the database never sees a plain password.
    pub password_hash: String,
}

#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub display_name: Option<String>,
    /// `Some(None)` clears the address.
    pub email: Option<Option<String>>,
    pub role: Option<Role>,
    pub active: Option<bool>,
}

/// Usernames are 2–32 characters of letters, digits, `_`, `.` and `-`,
/// starting with a letter or digit, so they can be `@mentioned`.
pub fn validate_username(username: &str) -> AppResult<()> {
    let len = username.chars().count();
    if !(2..=32).contains(&len) {
        return Err(AppError::validation(
            "Username must be between 2 and 32 characters",
        ));
    }
    let mut chars = username.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !first_ok || !rest_ok {
        return Err(AppError::validation(
            "Username may only contain letters, digits, '_', '.' and '-' and must start with a letter or digit",
        ));
    }
    if username.ends_with(['.', '-']) {
        return Err(AppError::validation(
            "Username must not end with '.' or '-'",
        ));
    }
    Ok(())
}

fn clean_email(email: Option<&str>) -> Result<Option<String>> {
    match email.map(str::trim).filter(|e| !e.is_empty()) {
        None => Ok(None),
        Some(e) if e.contains('@') && !e.contains(char::is_whitespace) => Ok(Some(e.to_string())),
        Some(_) => Err(AppError::validation("That does not look like an email address").into()),
    }
}

const USER_SELECT: &str =
    "SELECT id, username, display_name, email, role, active, created_at FROM users";

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        display_name: row.get(2)?,
        email: row.get(3)?,
        role: row.get(4)?,
        active: row.get(5)?,
        created_at: row.get(6)?,
    })
}

impl SchoolDb {
    // ── User CRUD ─────────────────────────────────────────────────────

    pub fn create_user(&self, new: &NewUser) -> Result<User> {
        let username = new.username.trim().to_lowercase();
        validate_username(&username)?;
        let display_name = required(&new.display_name, "Display name")?;
        let email = clean_email(new.email.as_deref())?;

        self.conn
            .execute(
                "INSERT INTO users (username, display_name, email, role, password_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![username, display_name, email, new.role, new.password_hash, now()],
            )
            .context("Failed to insert user")?;
        let id = self.conn.last_insert_rowid();
        self.get_user(id)?.context("User not found after insert")
    }

    pub fn get_user(&self, id: i64) -> Result<Option<User>> {
        self.conn
            .query_row(&format!("{} WHERE id = ?1", USER_SELECT), params![id], user_from_row)
            .optional()
            .context("Failed to query user")
    }

    pub fn find_user_by_username(&self, username: &str) -> Result<Option<User>> {
        self.conn
            .query_row(
                &format!("{} WHERE username = ?1", USER_SELECT),
                params![username.trim()],
                user_from_row,
            )
            .optional()
            .context("Failed to query user by username")
    }

    /// The user and their password hash, for sign-in.
    pub fn user_credentials(&self, username: &str) -> Result<Option<(User, String)>> {
        self.conn
            .query_row(
                "SELECT id, username, display_name, email, role, active, created_at, password_hash
                 FROM users WHERE username = ?1",
                params![username.trim()],
                |row| Ok((user_from_row(row)?, row.get::<_, String>(7)?)),
            )
            .optional()
            .context("Failed to query user credentials")
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{} ORDER BY active DESC, display_name COLLATE NOCASE",
                USER_SELECT
            ))
            .context("Failed to prepare list_users")?;
        let rows = stmt
            .query_map([], user_from_row)
            .context("Failed to query users")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read user row")
    }

    /// Everyone who can be assigned, mentioned or messaged.
    pub fn list_active_users(&self) -> Result<Vec<UserSummary>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, username, display_name, role FROM users
                 WHERE active = 1 ORDER BY display_name COLLATE NOCASE",
            )
            .context("Failed to prepare list_active_users")?;
        let rows = stmt
            .query_map([], |row| super::user_at(row, 0))
            .context("Failed to query active users")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read user row")
    }

    pub fn active_user_ids(&self) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM users WHERE active = 1 ORDER BY id")
            .context("Failed to prepare active_user_ids")?;
        let rows = stmt
            .query_map([], |row| row.get(0))
            .context("Failed to query active user ids")?;
        rows.collect::<rusqlite::Result<Vec<i64>>>()
            .context("Failed to read user id")
    }

    /// Active users among `usernames` (case-insensitive). Unknown names are
    /// skipped.
    pub fn active_users_by_username(&self, usernames: &[String]) -> Result<Vec<UserSummary>> {
        if usernames.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT id, username, display_name, role FROM users
             WHERE active = 1 AND username IN ({}) ORDER BY id",
            placeholders(usernames.len())
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare active_users_by_username")?;
        let rows = stmt
            .query_map(params_from_iter(usernames.iter()), |row| super::user_at(row, 0))
            .context("Failed to query users by username")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read user row")
    }

    pub fn update_user(&self, id: i64, update: &UserUpdate) -> Result<User> {
        let current = self
            .get_user(id)?
            .ok_or_else(|| AppError::not_found(format!("User {} not found", id)))?;

        let display_name = match &update.display_name {
            Some(name) => required(name, "Display name")?,
            None => current.display_name,
        };
        let email = match &update.email {
            Some(email) => clean_email(email.as_deref())?,
            None => current.email,
        };
        let role = update.role.unwrap_or(current.role);
        let active = update.active.unwrap_or(current.active);

        if current.role == Role::Admin
            && (role != Role::Admin || !active)
            && current.active
            && self.count_active_admins()? <= 1
        {
            return Err(AppError::validation("The last active admin cannot be demoted or deactivated").into());
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "UPDATE users SET display_name = ?1, email = ?2, role = ?3, active = ?4 WHERE id = ?5",
            params![display_name, email, role, active, id],
        )
        .context("Failed to update user")?;
        if !active {
            tx.execute("DELETE FROM sessions WHERE user_id = ?1", params![id])
                .context("Failed to end sessions of deactivated user")?;
        }
        tx.commit().context("Failed to commit user update")?;

        self.get_user(id)?.context("User not found after update")
    }

    pub fn set_password_hash(&self, id: i64, password_hash: &str) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE users SET password_hash = ?1 WHERE id = ?2",
                params![password_hash, id],
            )
            .context("Failed to update password")?;
        if changed == 0 {
            return Err(AppError::not_found(format!("User {} not found", id)).into());
        }
        Ok(())
    }

    pub fn count_users(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .context("Failed to count users")
    }

    pub fn count_active_admins(&self) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM users WHERE role = 'admin' AND active = 1",
                [],
                |row| row.get(0),
            )
            .context("Failed to count admins")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{db, user};

    fn new_user(username: &str) -> NewUser {
        NewUser {
            username: username.to_string(),
            display_name: "Ada Lovelace".to_string(),
            email: Some("ada@school.test".to_string()),
            role: Role::Staff,
            password_hash: "hash".to_string(),
        }
    }

    #[test]
    fn test_create_and_fetch_user() -> Result<()> {
        let db = db();
        let created = db.create_user(&new_user("  Ada "))?;
        assert_eq!(created.username, "ada");
        assert_eq!(created.email.as_deref(), Some("ada@school.test"));
        assert!(created.active);

        let fetched = db.find_user_by_username("ADA")?.expect("case-insensitive lookup");
        assert_eq!(fetched.id, created.id);

        let (_, hash) = db.user_credentials("ada")?.expect("credentials");
        assert_eq!(hash, "hash");
        Ok(())
    }

    #[test]
    fn test_duplicate_username_is_constraint() -> Result<()> {
        let db = db();
        db.create_user(&new_user("ada"))?;
        let mut dup = new_user("ADA");
        dup.email = None;
        let err: AppError = db.create_user(&dup).unwrap_err().into();
        assert!(matches!(err, AppError::Constraint(ref m) if m.contains("username")));
        Ok(())
    }

    #[test]
    fn test_duplicate_email_is_constraint() -> Result<()> {
        let db = db();
        db.create_user(&new_user("ada"))?;
        let err: AppError = db.create_user(&new_user("grace")).unwrap_err().into();
        assert!(matches!(err, AppError::Constraint(ref m) if m.contains("email")));
        Ok(())
    }

    #[test]
    fn test_username_validation() {
        assert!(validate_username("ms.jones").is_ok());
        assert!(validate_username("j").is_err());
        assert!(validate_username("_admin").is_err());
        assert!(validate_username("has space").is_err());
        assert!(validate_username("trailing.").is_err());
    }

    #[test]
    fn test_invalid_email_rejected() {
        let db = db();
        let mut u = new_user("ada");
        u.email = Some("not-an-email".into());
        let err: AppError = db.create_user(&u).unwrap_err().into();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_update_user_fields() -> Result<()> {
        let db = db();
        let _admin = user(&db, "boss", Role::Admin);
        let staff = user(&db, "sam", Role::Staff);

        let updated = db.update_user(
            staff.id,
            &UserUpdate {
                display_name: Some("Sam Smith".into()),
                email: Some(None),
                role: Some(Role::Manager),
                active: None,
            },
        )?;
        assert_eq!(updated.display_name, "Sam Smith");
        assert_eq!(updated.role, Role::Manager);
        assert!(updated.email.is_none());
        Ok(())
    }

    #[test]
    fn test_last_admin_cannot_be_demoted() -> Result<()> {
        let db = db();
        let admin = user(&db, "boss", Role::Admin);
        let err: AppError = db
            .update_user(
                admin.id,
                &UserUpdate {
                    role: Some(Role::Staff),
                    ..Default::default()
                },
            )
            .unwrap_err()
            .into();
        assert!(matches!(err, AppError::Validation(_)));

        user(&db, "deputy", Role::Admin);
        db.update_user(
            admin.id,
            &UserUpdate {
                active: Some(false),
                ..Default::default()
            },
        )?;
        assert_eq!(db.count_active_admins()?, 1);
        Ok(())
    }

    #[test]
    fn test_deactivation_ends_sessions() -> Result<()> {
        let db = db();
        let staff = user(&db, "sam", Role::Staff);
        let session = db.create_session(staff.id, chrono::Duration::hours(1))?;
        db.update_user(
            staff.id,
            &UserUpdate {
                active: Some(false),
                ..Default::default()
            },
        )?;
        assert!(db.session_user(&session.token, now())?.is_none());
        Ok(())
    }

    #[test]
    fn test_active_users_by_username() -> Result<()> {
        let db = db();
        let a = user(&db, "amy", Role::Staff);
        let b = user(&db, "ben", Role::Staff);
        db.update_user(
            b.id,
            &UserUpdate {
                active: Some(false),
                ..Default::default()
            },
        )?;
        let found = db.active_users_by_username(&[
            "amy".to_string(),
            "ben".to_string(),
            "nobody".to_string(),
        ])?;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, a.id);
        assert_eq!(db.list_active_users()?.len(), 1);
        assert_eq!(db.list_users()?.len(), 2);
        Ok(())
    }

    #[test]
    fn test_set_password_unknown_user() {
        let db = db();
        let err: AppError = db.set_password_hash(99, "h").unwrap_err().into();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
