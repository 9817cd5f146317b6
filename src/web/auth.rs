//! Cookie sessions: the `CurrentUser` extractor and the sign-in /
//! sign-out handlers.

use axum::extract::{Form, FromRequestParts, Query, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{AppendHeaders, Html, IntoResponse, Redirect, Response};
use axum::Json;
use chrono::{Duration, Utc};
use serde::Deserialize;
use tracing::{error, info, warn};

use super::html::{self, Flash};
use super::respond::{ActionError, OrBack, redirect_notice};
use super::state::{AppState, SharedState};
use crate::config::SessionSection;
use crate::errors::AppError;
use crate::models::User;
use crate::passwords;

/// The signed-in user. Pages without a valid session redirect to
/// `/login`; `/api/*` routes get a 401 JSON body instead.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub User);

pub enum AuthRejection {
    SignIn,
    Api,
    Failed,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        match self {
            Self::SignIn => Redirect::to("/login").into_response(),
            Self::Api => (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "error": AppError::Unauthenticated.to_string() })),
            )
                .into_response(),
            Self::Failed => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        }
    }
}

impl FromRequestParts<SharedState> for CurrentUser {
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let missing = if parts.uri.path().starts_with("/api/") {
            AuthRejection::Api
        } else {
            AuthRejection::SignIn
        };
        let Some(token) = read_cookie(&parts.headers, &state.config.session.cookie_name) else {
            return Err(missing);
        };
        let user = state
            .db
            .call(move |db| db.session_user(&token, Utc::now()))
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to look up session");
                AuthRejection::Failed
            })?;
        user.map(CurrentUser).ok_or(missing)
    }
}

// ── Cookies ───────────────────────────────────────────────────────────

/// Value of cookie `name` from the request's `Cookie` headers.
pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim_matches('"').to_string())
        .filter(|value| !value.is_empty())
}

pub fn session_cookie(config: &SessionSection, token: &str) -> String {
    let mut cookie = format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        config.cookie_name,
        token,
        config.ttl_hours.max(1) * 3600
    );
    if config.secure {
        cookie.push_str("; Secure");
    }
    cookie
}

fn clear_cookie(config: &SessionSection) -> String {
    format!(
        "{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0",
        config.cookie_name
    )
}

// ── Handlers ──────────────────────────────────────────────────────────

pub async fn login_page(Query(flash): Query<Flash>) -> Html<String> {
    html::layout(
        "Sign in",
        None,
        &flash,
        "<form class=\"card narrow\" method=\"post\" action=\"/login\">\
         <label>Username <input name=\"username\" autocomplete=\"username\" required autofocus></label>\
         <label>Password <input type=\"password\" name=\"password\" autocomplete=\"current-password\" required></label>\
         <button type=\"submit\">Sign in</button></form>",
    )
}

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
}

pub async fn login(
    State(state): State<SharedState>,
    Form(form): Form<LoginForm>,
) -> Result<Response, ActionError> {
    let back = "/login";
    let username = form.username.trim().to_lowercase();
    let lookup = username.clone();
    let credentials = state
        .db
        .call(move |db| db.user_credentials(&lookup))
        .await
        .or_back(back)?;

    let invalid = || ActionError::new(back, AppError::validation("Invalid username or password"));
    let Some((user, hash)) = credentials.filter(|(user, _)| user.active) else {
        warn!(username = %username, "Sign-in for unknown or inactive user");
        return Err(invalid());
    };
    let password = form.password;
    let verified = tokio::task::spawn_blocking(move || passwords::verify_password(&password, &hash))
        .await
        .unwrap_or(false);
    if !verified {
        warn!(username = %username, "Sign-in with wrong password");
        return Err(invalid());
    }

    let session = start_session(&state, user.id).await.or_back(back)?;
    info!(user_id = user.id, username = %user.username, "Signed in");
    Ok((
        AppendHeaders([(header::SET_COOKIE, session_cookie(&state.config.session, &session))]),
        Redirect::to("/"),
    )
        .into_response())
}

/// Create a session for `user_id`, returning its token.
pub async fn start_session(state: &AppState, user_id: i64) -> Result<String, AppError> {
    let ttl = Duration::hours(state.config.session.ttl_hours.max(1));
    let session = state
        .db
        .call(move |db| db.create_session(user_id, ttl))
        .await?;
    Ok(session.token)
}

pub async fn logout(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    if let Some(token) = read_cookie(&headers, &state.config.session.cookie_name)
        && let Err(e) = state.db.call(move |db| db.delete_session(&token)).await
    {
        error!(error = %e, "Failed to delete session");
    }
    (
        AppendHeaders([(header::SET_COOKIE, clear_cookie(&state.config.session))]),
        redirect_notice("/login", "Signed out"),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use crate::web::test_support::{TestApp, form_request, get_request, location};
    use axum::http::HeaderValue;
    use tower::ServiceExt;

    #[test]
    fn test_read_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; schoolhub_session=abc-123; other=1"),
        );
        assert_eq!(read_cookie(&headers, "schoolhub_session").as_deref(), Some("abc-123"));
        assert_eq!(read_cookie(&headers, "missing"), None);
    }

    #[test]
    fn test_session_cookie_flags() {
        let mut config = SessionSection::default();
        let cookie = session_cookie(&config, "tok");
        assert!(cookie.starts_with(&format!("{}=tok;", config.cookie_name)));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Lax"));
        assert!(!cookie.contains("Secure"));
        config.secure = true;
        assert!(session_cookie(&config, "tok").ends_with("; Secure"));
    }

    #[tokio::test]
    async fn test_pages_redirect_to_login_without_session() {
        let app = TestApp::new();
        let resp = app.router().oneshot(get_request("/tasks", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&resp), "/login");
    }

    #[tokio::test]
    async fn test_login_flow() {
        let app = TestApp::new();
        app.user_with_password("amy", Role::Staff, "correct horse");

        let resp = app
            .router()
            .oneshot(form_request("/login", None, "username=AMY&password=correct+horse"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&resp), "/");
        let set_cookie = resp
            .headers()
            .get(header::SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let cookie = set_cookie.split(';').next().unwrap_or_default().to_string();
        assert!(cookie.starts_with("schoolhub_session="));

        let resp = app.router().oneshot(get_request("/", Some(&cookie))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .router()
            .oneshot(form_request("/logout", Some(&cookie), ""))
            .await
            .unwrap();
        assert_eq!(location(&resp), "/login?notice=Signed+out");
        let resp = app.router().oneshot(get_request("/", Some(&cookie))).await.unwrap();
        assert_eq!(location(&resp), "/login");
    }

    #[tokio::test]
    async fn test_wrong_password_redirects_with_error() {
        let app = TestApp::new();
        app.user_with_password("amy", Role::Staff, "correct horse");
        let resp = app
            .router()
            .oneshot(form_request("/login", None, "username=amy&password=nope"))
            .await
            .unwrap();
        assert_eq!(location(&resp), "/login?error=Invalid+username+or+password");
        assert!(resp.headers().get(header::SET_COOKIE).is_none());
    }

    #[tokio::test]
    async fn test_api_without_session_is_401() {
        let app = TestApp::new();
        let resp = app.router().oneshot(get_request("/api/tasks", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
