//! File uploads and downloads.
//!
//! Files live in `uploads.dir` under a generated name; the database keeps
//! the original name, type, size and SHA-256. An attachment is visible to
//! whoever can see its owner.

use std::collections::HashMap;

use axum::body::{Body, Bytes};
use axum::extract::{Multipart, Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Redirect, Response};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use super::auth::CurrentUser;
use super::respond::{ActionError, OrBack, PageError};
use super::state::{AppState, SharedState};
use crate::db::NewAttachment;
use crate::errors::{AppError, AppResult};
use crate::models::{Attachment, OwnerKind, User};
use crate::permissions;

// ── Multipart ─────────────────────────────────────────────────────────

pub struct Upload {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Bytes,
}

/// Text fields plus at most one file from a multipart body.
#[derive(Default)]
pub struct MultipartForm {
    pub fields: HashMap<String, String>,
    pub file: Option<Upload>,
}

impl MultipartForm {
    pub fn text(&self, key: &str) -> &str {
        self.fields.get(key).map(String::as_str).unwrap_or_default()
    }
}

pub async fn read_multipart(mut multipart: Multipart, max_bytes: usize) -> AppResult<MultipartForm> {
    let mut form = MultipartForm::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::validation(format!("Upload failed: {}", e.body_text())))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let Some(file_name) = field.file_name().map(str::to_string) else {
            let value = field
                .text()
                .await
                .map_err(|e| AppError::validation(format!("Upload failed: {}", e.body_text())))?;
            form.fields.insert(name, value);
            continue;
        };
        let declared_type = field.content_type().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| AppError::validation(format!("Upload failed: {}", e.body_text())))?;
        // Browsers send an empty part when no file was chosen.
        if file_name.is_empty() && bytes.is_empty() {
            continue;
        }
        if bytes.len() > max_bytes {
            return Err(AppError::validation(format!(
                "Files may be at most {}",
                super::html::human_size(max_bytes as i64)
            )));
        }
        let content_type = declared_type
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| {
                mime_guess::from_path(&file_name)
                    .first_or_octet_stream()
                    .to_string()
            });
        form.file = Some(Upload {
            file_name: sanitize_file_name(&file_name),
            content_type,
            bytes,
        });
    }
    Ok(form)
}

/// Last path component, without control characters or quotes.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control() && *c != '"')
        .take(120)
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}

// ── Storage ───────────────────────────────────────────────────────────

/// Write the file and record it against its owner.
pub async fn store(
    state: &AppState,
    owner_kind: OwnerKind,
    owner_id: i64,
    uploaded_by: i64,
    upload: Upload,
) -> AppResult<Attachment> {
    let sha256 = hex::encode(Sha256::digest(&upload.bytes));
    let stored_name = uuid::Uuid::new_v4().simple().to_string();
    tokio::fs::create_dir_all(&state.config.uploads.dir).await?;
    let path = state.upload_path(&stored_name);
    tokio::fs::write(&path, &upload.bytes).await?;

    let new = NewAttachment {
        owner_kind,
        owner_id,
        uploaded_by,
        file_name: upload.file_name,
        content_type: upload.content_type,
        size_bytes: upload.bytes.len() as i64,
        sha256,
        stored_name,
    };
    match state.db.call(move |db| db.create_attachment(&new)).await {
        Ok(attachment) => {
            info!(
                attachment_id = attachment.id,
                owner = %format!("{}:{}", owner_kind, owner_id),
                size = attachment.size_bytes,
                "Attachment stored"
            );
            Ok(attachment)
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&path).await;
            Err(e.into())
        }
    }
}

/// Store the optional upload of an owner that is already committed. A
/// failure is logged and leaves the owner in place; returns whether the
/// file, if any, was saved.
pub async fn store_after_commit(
    state: &AppState,
    owner_kind: OwnerKind,
    owner_id: i64,
    uploaded_by: i64,
    upload: Option<Upload>,
) -> bool {
    let Some(upload) = upload else {
        return true;
    };
    match store(state, owner_kind, owner_id, uploaded_by, upload).await {
        Ok(_) => true,
        Err(e) => {
            warn!(error = %e, owner = %format!("{}:{}", owner_kind, owner_id), "Failed to store attachment");
            false
        }
    }
}

/// Delete stored files whose rows are gone.
pub async fn remove_files(state: &AppState, stored_names: Vec<String>) {
    for name in stored_names {
        if let Err(e) = tokio::fs::remove_file(state.upload_path(&name)).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(error = %e, stored_name = %name, "Failed to remove attachment file");
        }
    }
}

// ── Access ────────────────────────────────────────────────────────────

/// What a user may do with an owner's attachments, and the page showing
/// the owner.
pub struct OwnerAccess {
    pub link: String,
    pub can_view: bool,
    pub can_upload: bool,
}

pub async fn owner_access(
    state: &AppState,
    user: &User,
    owner_kind: OwnerKind,
    owner_id: i64,
) -> AppResult<OwnerAccess> {
    let missing = || AppError::not_found("That item no longer exists");
    match owner_kind {
        OwnerKind::Task => {
            let detail = state
                .db
                .call(move |db| db.get_task_detail(owner_id))
                .await?
                .ok_or_else(missing)?;
            Ok(OwnerAccess {
                link: format!("/tasks/{}", owner_id),
                can_view: permissions::can_view_task(user, &detail),
                can_upload: permissions::can_review_task(user, &detail.task),
            })
        }
        OwnerKind::Submission => {
            let (task_id, submitter_id) = state
                .db
                .call(move |db| db.submission_owner(owner_id))
                .await?
                .ok_or_else(missing)?;
            let task = state
                .db
                .call(move |db| db.get_task(task_id))
                .await?
                .ok_or_else(missing)?;
            let is_submitter = user.id == submitter_id;
            Ok(OwnerAccess {
                link: format!("/tasks/{}", task_id),
                can_view: is_submitter || permissions::can_review_task(user, &task),
                can_upload: is_submitter,
            })
        }
        OwnerKind::Message => {
            let message = state
                .db
                .call(move |db| db.get_message(owner_id))
                .await?
                .ok_or_else(missing)?;
            let thread_id = message.thread_id;
            let participants = state
                .db
                .call(move |db| db.participant_ids(thread_id))
                .await?;
            Ok(OwnerAccess {
                link: format!("/chat/{}", thread_id),
                can_view: permissions::can_open_thread(user, &participants),
                can_upload: message.author.id == user.id,
            })
        }
        OwnerKind::Post => {
            let post = state
                .db
                .call(move |db| db.get_post(owner_id))
                .await?
                .ok_or_else(missing)?;
            Ok(OwnerAccess {
                link: format!("/board/{}", owner_id),
                can_view: true,
                can_upload: post.author.id == user.id,
            })
        }
    }
}

// ── Handlers ──────────────────────────────────────────────────────────

pub async fn upload(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    multipart: Multipart,
) -> Result<Redirect, ActionError> {
    let back = "/";
    let form = read_multipart(multipart, state.config.uploads.max_bytes)
        .await
        .or_back(back)?;
    let owner_kind: OwnerKind = form
        .text("owner_kind")
        .parse()
        .map_err(AppError::Validation)
        .or_back(back)?;
    let owner_id: i64 = form
        .text("owner_id")
        .trim()
        .parse()
        .map_err(|_| AppError::validation("Missing attachment owner"))
        .or_back(back)?;

    let access = owner_access(&state, &user, owner_kind, owner_id)
        .await
        .or_back(back)?;
    let back = access.link.as_str();
    permissions::require(access.can_upload, "You cannot attach files here").or_back(back)?;
    let Some(file) = form.file else {
        return Err(ActionError::new(back, AppError::validation("Choose a file to attach")));
    };
    store(&state, owner_kind, owner_id, user.id, file)
        .await
        .or_back(back)?;
    Ok(super::respond::redirect_notice(back, "File attached"))
}

pub async fn download(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> Result<Response, PageError> {
    let attachment = state
        .db
        .call(move |db| db.get_attachment(id))
        .await?
        .ok_or_else(|| AppError::not_found(format!("Attachment {} not found", id)))?;
    let access = owner_access(&state, &user, attachment.owner_kind, attachment.owner_id).await?;
    permissions::require(access.can_view, "You cannot open this file")?;

    let bytes = tokio::fs::read(state.upload_path(&attachment.stored_name))
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => AppError::not_found("The file is missing from storage"),
            _ => AppError::Io(e),
        })?;
    let disposition = format!(
        "attachment; filename=\"{}\"",
        sanitize_file_name(&attachment.file_name)
    );
    Ok((
        [
            (header::CONTENT_TYPE, attachment.content_type),
            (header::CONTENT_DISPOSITION, disposition),
            (header::X_CONTENT_TYPE_OPTIONS, "nosniff".to_string()),
        ],
        Body::from(bytes),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewTask;
    use crate::models::Role;
    use crate::web::test_support::{TestApp, body_text, get_request, location, multipart_request};
    use axum::http::StatusCode;
    use tower::ServiceExt;

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("C:\\Users\\amy\\plan.pdf"), "plan.pdf");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("a\"b\n.txt"), "ab.txt");
        assert_eq!(sanitize_file_name(""), "file");
        assert_eq!(sanitize_file_name(".hidden"), "hidden");
    }

    fn task_for(app: &TestApp, creator: i64, assignee: i64) -> i64 {
        let (task, _) = app
            .db()
            .create_task(&NewTask {
                title: "Lesson plan".into(),
                description: String::new(),
                due_at: None,
                created_by: creator,
                assignee_ids: vec![assignee],
                group_ids: vec![],
            })
            .unwrap();
        task.id
    }

    #[tokio::test]
    async fn test_upload_and_download_task_file() {
        let app = TestApp::new();
        let boss = app.user("boss", Role::Manager);
        let amy = app.user("amy", Role::Staff);
        let ben = app.user("ben", Role::Staff);
        let task_id = task_for(&app, boss.id, amy.id);
        let owner_id = task_id.to_string();

        let resp = app
            .router()
            .oneshot(multipart_request(
                "/attachments",
                &app.cookie(&boss),
                &[("owner_kind", "task"), ("owner_id", &owner_id)],
                Some(("brief.txt", "text/plain", b"read me")),
            ))
            .await
            .unwrap();
        assert_eq!(location(&resp), format!("/tasks/{}?notice=File+attached", task_id));

        let attachment = app.db().task_attachments(task_id).unwrap().remove(0);
        assert_eq!(attachment.file_name, "brief.txt");
        assert_eq!(attachment.size_bytes, 7);
        assert_eq!(attachment.sha256.len(), 64);

        let uri = format!("/attachments/{}", attachment.id);
        let resp = app
            .router()
            .oneshot(get_request(&uri, Some(&app.cookie(&amy))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/plain");
        assert_eq!(body_text(resp).await, "read me");

        // Not on the task: bounced home.
        let resp = app
            .router()
            .oneshot(get_request(&uri, Some(&app.cookie(&ben))))
            .await
            .unwrap();
        assert!(location(&resp).starts_with("/?error="));
    }

    #[tokio::test]
    async fn test_assignee_cannot_attach_to_task_brief() {
        let app = TestApp::new();
        let boss = app.user("boss", Role::Manager);
        let amy = app.user("amy", Role::Staff);
        let task_id = task_for(&app, boss.id, amy.id).to_string();

        let resp = app
            .router()
            .oneshot(multipart_request(
                "/attachments",
                &app.cookie(&amy),
                &[("owner_kind", "task"), ("owner_id", &task_id)],
                Some(("x.txt", "text/plain", b"x")),
            ))
            .await
            .unwrap();
        assert!(location(&resp).starts_with("/?error="));
    }

    #[tokio::test]
    async fn test_oversized_upload_rejected() {
        let app = TestApp::new();
        let amy = app.user("amy", Role::Staff);
        let post = app.db().create_post(amy.id, "Photos", "From the trip").unwrap();
        let big = vec![b'x'; 70 * 1024];

        let resp = app
            .router()
            .oneshot(multipart_request(
                "/attachments",
                &app.cookie(&amy),
                &[("owner_kind", "post"), ("owner_id", &post.id.to_string())],
                Some(("big.bin", "application/octet-stream", &big)),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert!(location(&resp).contains("error="));
        assert!(app.db().attachments_for(OwnerKind::Post, post.id).unwrap().is_empty());
    }
}
