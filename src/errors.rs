//! Typed error hierarchy for schoolhub.
//!
//! `AppError` is what every server action, page handler and API route
//! returns. The user-facing kinds (`Validation`, `NotAuthorized`,
//! `NotFound`, `Constraint`) carry a message that is safe to show; the
//! infrastructure kinds are logged and rendered as a generic message.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotAuthorized(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Constraint(String),

    #[error("Please sign in to continue")]
    Unauthenticated,

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(anyhow::Error),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_authorized(msg: impl Into<String>) -> Self {
        Self::NotAuthorized(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// True for the kinds whose message is shown to the user verbatim.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::NotAuthorized(_)
                | Self::NotFound(_)
                | Self::Constraint(_)
                | Self::Unauthenticated
        )
    }

    /// Message suitable for a `?error=` redirect or a JSON body.
    pub fn public_message(&self) -> String {
        if self.is_user_facing() {
            self.to_string()
        } else {
            "Something went wrong, please try again".to_string()
        }
    }
}

/// Errors coming out of the database layer are `anyhow` chains. Typed
/// `AppError`s raised inside a `DbHandle::call` closure pass through
/// unchanged; SQLite constraint failures become `Constraint`; everything
/// else is a `Database` error.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        let err = match err.downcast::<AppError>() {
            Ok(app) => return app,
            Err(err) => err,
        };
        if let Some(msg) = constraint_message(&err) {
            return Self::Constraint(msg);
        }
        Self::Database(err)
    }
}

/// Map a SQLite constraint failure anywhere in the chain to a friendly
/// message.
fn constraint_message(err: &anyhow::Error) -> Option<String> {
    let sqlite = err
        .chain()
        .find_map(|e| e.downcast_ref::<rusqlite::Error>())?;
    let rusqlite::Error::SqliteFailure(code, detail) = sqlite else {
        return None;
    };
    if code.code != rusqlite::ErrorCode::ConstraintViolation {
        return None;
    }
    let detail = detail.as_deref().unwrap_or_default();
    let msg = if detail.contains("users.username") {
        "That username is already taken"
    } else if detail.contains("users.email") {
        "That email address is already in use"
    } else if detail.contains("groups.name") {
        "A group with that name already exists"
    } else if detail.contains("task_assignees") {
        "That person is already assigned to this task"
    } else if detail.contains("FOREIGN KEY") {
        "A referenced record does not exist"
    } else {
        "The change conflicts with existing data"
    };
    Some(msg.to_string())
}
