//! Router test helpers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, header};
use axum::response::Response;
use http_body_util::BodyExt;
use tempfile::TempDir;

use super::server::build_router;
use super::state::{AppState, SharedState};
use crate::config::AppConfig;
use crate::db::{DbHandle, NewUser, SchoolDb};
use crate::models::{Role, User};
use crate::passwords;

pub struct TestApp {
    pub state: SharedState,
    _uploads: TempDir,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_uploads(|dir| dir.to_path_buf())
    }

    /// Uploads directory beneath a regular file, so every file write fails.
    pub fn with_unwritable_uploads() -> Self {
        Self::with_uploads(|dir| {
            let blocker = dir.join("blocker");
            std::fs::write(&blocker, b"").expect("blocker file");
            blocker.join("uploads")
        })
    }

    fn with_uploads(uploads_dir: impl FnOnce(&Path) -> PathBuf) -> Self {
        let uploads = TempDir::new().expect("temp dir");
        let mut config = AppConfig::default();
        config.uploads.dir = uploads_dir(uploads.path());
        config.uploads.max_bytes = 64 * 1024;
        config.display.page_size = 5;
        let db = DbHandle::new(SchoolDb::new_in_memory().expect("in-memory db"));
        Self {
            state: Arc::new(AppState::new(db, config)),
            _uploads: uploads,
        }
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    pub fn user(&self, username: &str, role: Role) -> User {
        self.insert_user(username, role, "x".to_string())
    }

    pub fn user_with_password(&self, username: &str, role: Role, password: &str) -> User {
        let hash = passwords::hash_password(password).expect("hash");
        self.insert_user(username, role, hash)
    }

    fn insert_user(&self, username: &str, role: Role, password_hash: String) -> User {
        let db = self.state.db.lock_sync().expect("db lock");
        db.create_user(&NewUser {
            username: username.to_string(),
            display_name: format!("{} Example", username),
            email: None,
            role,
            password_hash,
        })
        .expect("create user")
    }

    /// `Cookie` header value for a fresh session of `user`.
    pub fn cookie(&self, user: &User) -> String {
        let db = self.state.db.lock_sync().expect("db lock");
        let session = db
            .create_session(user.id, chrono::Duration::hours(1))
            .expect("session");
        format!("{}={}", self.state.config.session.cookie_name, session.token)
    }

    pub fn db(&self) -> std::sync::MutexGuard<'_, SchoolDb> {
        self.state.db.lock_sync().expect("db lock")
    }
}

pub fn get_request(uri: &str, cookie: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(cookie) = cookie {
        builder = builder.header(header::COOKIE, cookie);
    }
    builder.body(Body::empty()).unwrap()
}

pub fn form_request(uri: &str, cookie: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
    if let Some(cookie) = cookie {
        builder = builder.header(header::COOKIE, cookie);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub fn json_request(method: &str, uri: &str, cookie: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::COOKIE, cookie)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub const BOUNDARY: &str = "schoolhubtestboundary";

/// A `multipart/form-data` body with text fields and an optional file.
pub fn multipart_request(
    uri: &str,
    cookie: &str,
    fields: &[(&str, &str)],
    file: Option<(&str, &str, &[u8])>,
) -> Request<Body> {
    let mut body: Vec<u8> = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                BOUNDARY, name, value
            )
            .as_bytes(),
        );
    }
    if let Some((file_name, content_type, bytes)) = file {
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
                BOUNDARY, file_name, content_type
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::COOKIE, cookie)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap()
}

pub fn location(resp: &Response) -> String {
    resp.headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

pub async fn body_text(resp: Response) -> String {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8_lossy(&bytes).to_string()
}

pub async fn body_json(resp: Response) -> serde_json::Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
