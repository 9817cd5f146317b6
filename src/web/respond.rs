//! Turning `AppError`s into browser responses.
//!
//! Page handlers (GET) return [`PageError`], which renders an error page
//! or bounces to the sign-in form. Server actions (POST) return
//! [`ActionError`], which redirects back to the page the form came from
//! with `?error=<message>`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use tracing::error;

use super::html;
use crate::errors::AppError;

// ── Redirect helpers ──────────────────────────────────────────────────

/// Append `key=value` to `path`, keeping any `#fragment` last.
pub fn with_query(path: &str, key: &str, value: &str) -> String {
    let (base, fragment) = match path.split_once('#') {
        Some((base, fragment)) => (base, Some(fragment)),
        None => (path, None),
    };
    let pair = serde_urlencoded::to_string([(key, value)]).unwrap_or_default();
    let sep = if base.contains('?') { '&' } else { '?' };
    match fragment {
        Some(fragment) => format!("{}{}{}#{}", base, sep, pair, fragment),
        None => format!("{}{}{}", base, sep, pair),
    }
}

pub fn redirect_notice(path: &str, notice: &str) -> Redirect {
    Redirect::to(&with_query(path, "notice", notice))
}

pub fn redirect_error(path: &str, message: &str) -> Redirect {
    Redirect::to(&with_query(path, "error", message))
}

fn log_internal(err: &AppError) {
    if !err.is_user_facing() {
        error!(error = %err, "Request failed");
    }
}

// ── Page errors ───────────────────────────────────────────────────────

#[derive(Debug)]
pub struct PageError(pub AppError);

impl From<AppError> for PageError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

impl From<anyhow::Error> for PageError {
    fn from(err: anyhow::Error) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for PageError {
    fn into_response(self) -> Response {
        let err = self.0;
        log_internal(&err);
        let status = match &err {
            AppError::Unauthenticated => return Redirect::to("/login").into_response(),
            AppError::NotAuthorized(msg) => return redirect_error("/", msg).into_response(),
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) | AppError::Constraint(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, html::error_page(status, &err.public_message())).into_response()
    }
}

// ── Action errors ─────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ActionError {
    back: String,
    error: AppError,
}

impl ActionError {
    pub fn new(back: impl Into<String>, error: impl Into<AppError>) -> Self {
        Self {
            back: back.into(),
            error: error.into(),
        }
    }
}

impl IntoResponse for ActionError {
    fn into_response(self) -> Response {
        log_internal(&self.error);
        match &self.error {
            AppError::Unauthenticated => Redirect::to("/login").into_response(),
            AppError::NotAuthorized(msg) => redirect_error("/", msg).into_response(),
            err => redirect_error(&self.back, &err.public_message()).into_response(),
        }
    }
}

/// `result.or_back("/tasks/new")?` inside a server action.
pub trait OrBack<T> {
    fn or_back(self, back: &str) -> Result<T, ActionError>;
}

impl<T, E: Into<AppError>> OrBack<T> for Result<T, E> {
    fn or_back(self, back: &str) -> Result<T, ActionError> {
        self.map_err(|e| ActionError::new(back, e))
    }
}
