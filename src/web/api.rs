//! JSON API: task CRUD and mention suggestions.

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{error, info};

use super::attachments::remove_files;
use super::auth::CurrentUser;
use super::state::SharedState;
use super::tasks::announce_assignment;
use crate::db::{NewTask, TaskUpdate};
use crate::errors::AppError;
use crate::mentions;
use crate::models::{Role, TaskDetail, TaskScope, UserSummary};
use crate::permissions::{self, require};

const SUGGEST_LIMIT: usize = 8;

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self(err.into())
    }
}

/// Malformed bodies, queries and ids are client errors with the usual
/// `{"error"}` body.
macro_rules! rejection_into_api_error {
    ($($rejection:ty),+) => {
        $(
            impl From<$rejection> for ApiError {
                fn from(rejection: $rejection) -> Self {
                    Self(AppError::Validation(rejection.body_text()))
                }
            }
        )+
    };
}

rejection_into_api_error!(JsonRejection, QueryRejection, PathRejection);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthenticated => StatusCode::UNAUTHORIZED,
            AppError::NotAuthorized(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Constraint(_) => StatusCode::CONFLICT,
            err => {
                error!(error = %err, "API request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(serde_json::json!({"error": self.0.public_message()}))).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route(
            "/api/tasks/{id}",
            get(get_task).patch(update_task).delete(delete_task),
        )
        .route("/api/users/suggest", get(suggest_users))
        .route("/health", get(health_check))
}

async fn health_check() -> &'static str {
    "ok"
}

// ── Requests ──────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct TaskListQuery {
    pub scope: Option<String>,
    pub page: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub due_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub assignee_ids: Vec<i64>,
    #[serde(default)]
    pub group_ids: Vec<i64>,
}

/// Absent fields stay unchanged; `"due_at": null` clears the due date.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateTaskRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub due_at: Option<Option<DateTime<Utc>>>,
}

fn double_option<'de, T, D>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}

#[derive(Debug, Deserialize)]
pub struct SuggestQuery {
    #[serde(default)]
    pub q: String,
}

#[derive(Debug, Serialize)]
pub struct Suggestion {
    pub username: String,
    pub display_name: String,
}

impl From<&UserSummary> for Suggestion {
    fn from(user: &UserSummary) -> Self {
        Self {
            username: user.username.clone(),
            display_name: user.display_name.clone(),
        }
    }
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn load_detail(state: &SharedState, task_id: i64) -> Result<TaskDetail, ApiError> {
    state
        .db
        .call(move |db| db.get_task_detail(task_id))
        .await?
        .ok_or_else(|| AppError::not_found(format!("Task {} not found", task_id)).into())
}

async fn list_tasks(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    query: Result<Query<TaskListQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(query) = query?;
    let scope = match query.scope.as_deref() {
        Some(s) => s.parse::<TaskScope>().map_err(AppError::Validation)?,
        None => TaskScope::Assigned,
    };
    require(
        scope != TaskScope::All || user.role.at_least(Role::Manager),
        "Only managers can list every task",
    )?;
    let page = state.page(query.page);
    let viewer = user.id;
    let tasks = state
        .db
        .call(move |db| db.list_tasks(viewer, scope, page))
        .await?;
    Ok(Json(tasks))
}

async fn create_task(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    req: Result<Json<CreateTaskRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = req?;
    require(
        permissions::can_create_tasks(&user),
        "Only managers can create tasks",
    )?;
    let new = NewTask {
        title: req.title,
        description: req.description,
        due_at: req.due_at,
        created_by: user.id,
        assignee_ids: req.assignee_ids,
        group_ids: req.group_ids,
    };
    let (task, assigned) = state.db.call(move |db| db.create_task(&new)).await?;
    info!(task_id = task.id, assignees = assigned.len(), "Task created via API");
    announce_assignment(&state, &task, &user, &assigned).await;
    let detail = load_detail(&state, task.id).await?;
    Ok((StatusCode::CREATED, Json(detail)))
}

async fn get_task(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    id: Result<Path<i64>, PathRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Path(id) = id?;
    let mut detail = load_detail(&state, id).await?;
    require(
        permissions::can_view_task(&user, &detail),
        "You do not have access to this task",
    )?;
    if !permissions::can_review_task(&user, &detail.task) {
        detail.redact_for(user.id);
    }
    Ok(Json(detail))
}

async fn update_task(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    id: Result<Path<i64>, PathRejection>,
    req: Result<Json<UpdateTaskRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Path(id) = id?;
    let Json(req) = req?;
    let detail = load_detail(&state, id).await?;
    require(
        permissions::can_review_task(&user, &detail.task),
        "Only the task's creator or a manager can edit it",
    )?;
    let update = TaskUpdate {
        title: req.title,
        description: req.description,
        due_at: req.due_at,
    };
    let task = state.db.call(move |db| db.update_task(id, &update)).await?;
    info!(task_id = id, user_id = user.id, "Task updated via API");
    Ok(Json(task))
}

async fn delete_task(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    id: Result<Path<i64>, PathRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Path(id) = id?;
    let detail = load_detail(&state, id).await?;
    require(
        permissions::can_delete_task(&user, &detail.task),
        "Only the task's creator or an admin can delete it",
    )?;
    let stored = state
        .db
        .call(move |db| db.delete_task(id))
        .await?
        .ok_or_else(|| AppError::not_found(format!("Task {} not found", id)))?;
    remove_files(&state, stored).await;
    info!(task_id = id, user_id = user.id, "Task deleted via API");
    Ok(StatusCode::NO_CONTENT)
}

async fn suggest_users(
    State(state): State<SharedState>,
    CurrentUser(_user): CurrentUser,
    query: Result<Query<SuggestQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(query) = query?;
    let users = state.db.call(|db| db.list_active_users()).await?;
    let matches: Vec<Suggestion> = mentions::suggest(&query.q, &users, SUGGEST_LIMIT)
        .into_iter()
        .map(Suggestion::from)
        .collect();
    Ok(Json(matches))
}

#[cfg(test)]
mod tests {
    use crate::db::{NewAttachment, NewTask};
    use crate::models::{OwnerKind, Role};
    use crate::web::test_support::{TestApp, body_json, body_text, get_request, json_request};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::json;
    use tower::ServiceExt;

    fn seed_task(app: &TestApp, creator: i64, assignee: i64) -> i64 {
        app.db()
            .create_task(&NewTask {
                title: "Mark essays".into(),
                description: String::new(),
                due_at: None,
                created_by: creator,
                assignee_ids: vec![assignee],
                group_ids: vec![],
            })
            .unwrap()
            .0
            .id
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = TestApp::new();
        let resp = app.router().oneshot(get_request("/health", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp).await, "ok");
    }

    #[tokio::test]
    async fn test_requires_session() {
        let app = TestApp::new();
        let resp = app.router().oneshot(get_request("/api/tasks", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(body_json(resp).await["error"].is_string());
    }

    #[tokio::test]
    async fn test_create_and_fetch_task() {
        let app = TestApp::new();
        let boss = app.user("boss", Role::Manager);
        let amy = app.user("amy", Role::Staff);
        let cookie = app.cookie(&boss);

        let resp = app
            .router()
            .oneshot(json_request(
                "POST",
                "/api/tasks",
                &cookie,
                json!({"title": "Plan trip", "due_at": "2026-05-01T09:00:00Z", "assignee_ids": [amy.id]}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let detail = body_json(resp).await;
        assert_eq!(detail["task"]["title"], "Plan trip");
        assert_eq!(detail["assignees"].as_array().unwrap().len(), 1);
        assert_eq!(app.db().unread_notification_count(amy.id).unwrap(), 1);

        let uri = format!("/api/tasks/{}", detail["task"]["id"]);
        let resp = app
            .router()
            .oneshot(get_request(&uri, Some(&app.cookie(&amy))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .router()
            .oneshot(get_request("/api/tasks", Some(&app.cookie(&amy))))
            .await
            .unwrap();
        let list = body_json(resp).await;
        assert_eq!(list["total"], 1);
        assert_eq!(list["items"][0]["my_status"], "in_progress");
    }

    #[tokio::test]
    async fn test_status_codes() {
        let app = TestApp::new();
        let boss = app.user("boss", Role::Manager);
        let amy = app.user("amy", Role::Staff);
        let eve = app.user("eve", Role::Staff);
        let id = seed_task(&app, boss.id, amy.id);

        // Validation.
        let resp = app
            .router()
            .oneshot(json_request("POST", "/api/tasks", &app.cookie(&boss), json!({"title": " "})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        // Staff cannot create.
        let resp = app
            .router()
            .oneshot(json_request("POST", "/api/tasks", &app.cookie(&amy), json!({"title": "x"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        // Not visible to someone uninvolved.
        let uri = format!("/api/tasks/{}", id);
        let resp = app
            .router()
            .oneshot(get_request(&uri, Some(&app.cookie(&eve))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = app
            .router()
            .oneshot(get_request("/api/tasks/9999", Some(&app.cookie(&boss))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app
            .router()
            .oneshot(get_request("/api/tasks?scope=all", Some(&app.cookie(&amy))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_malformed_input_is_json_bad_request() {
        let app = TestApp::new();
        let boss = app.user("boss", Role::Manager);
        let cookie = app.cookie(&boss);

        let resp = app
            .router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/tasks")
                    .header("cookie", &cookie)
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"title": 5"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(resp.headers()["content-type"], "application/json");
        assert!(body_json(resp).await["error"].is_string());

        let resp = app
            .router()
            .oneshot(get_request("/api/tasks/abc", Some(&cookie)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(resp).await["error"].is_string());

        let resp = app
            .router()
            .oneshot(get_request("/api/tasks?page=many", Some(&cookie)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(resp).await["error"].is_string());
    }

    #[tokio::test]
    async fn test_task_hides_other_assignees_work() {
        let app = TestApp::new();
        let boss = app.user("boss", Role::Manager);
        let amy = app.user("amy", Role::Staff);
        let ben = app.user("ben", Role::Staff);
        let (task, _) = app
            .db()
            .create_task(&NewTask {
                title: "Essays".into(),
                description: String::new(),
                due_at: None,
                created_by: boss.id,
                assignee_ids: vec![amy.id, ben.id],
                group_ids: vec![],
            })
            .unwrap();
        let (amy_entry, submission) = app.db().submit_work(task.id, amy.id, "AMY PRIVATE WORK").unwrap();
        app.db()
            .add_note(task.id, amy_entry.id, boss.id, "Nice start")
            .unwrap();
        app.db()
            .create_attachment(&NewAttachment {
                owner_kind: OwnerKind::Submission,
                owner_id: submission.id,
                uploaded_by: amy.id,
                file_name: "essay.txt".into(),
                content_type: "text/plain".into(),
                size_bytes: 5,
                sha256: "00".into(),
                stored_name: "essay".into(),
            })
            .unwrap();
        let uri = format!("/api/tasks/{}", task.id);

        let resp = app
            .router()
            .oneshot(get_request(&uri, Some(&app.cookie(&ben))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = body_text(resp).await;
        assert!(!text.contains("AMY PRIVATE WORK"));
        assert!(!text.contains("Nice start"));
        assert!(!text.contains("essay.txt"));

        let resp = app
            .router()
            .oneshot(get_request(&uri, Some(&app.cookie(&amy))))
            .await
            .unwrap();
        let text = body_text(resp).await;
        assert!(text.contains("AMY PRIVATE WORK"));
        assert!(text.contains("essay.txt"));

        let resp = app
            .router()
            .oneshot(get_request(&uri, Some(&app.cookie(&boss))))
            .await
            .unwrap();
        let text = body_text(resp).await;
        assert!(text.contains("AMY PRIVATE WORK"));
        assert!(text.contains("Nice start"));
    }

    #[tokio::test]
    async fn test_patch_and_delete() {
        let app = TestApp::new();
        let boss = app.user("boss", Role::Manager);
        let amy = app.user("amy", Role::Staff);
        let id = seed_task(&app, boss.id, amy.id);
        let uri = format!("/api/tasks/{}", id);

        let resp = app
            .router()
            .oneshot(json_request(
                "PATCH",
                &uri,
                &app.cookie(&boss),
                json!({"title": "Mark essays by Friday", "due_at": "2026-05-01T09:00:00Z"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let task = body_json(resp).await;
        assert_eq!(task["title"], "Mark essays by Friday");
        assert!(task["due_at"].is_string());

        // Explicit null clears the due date, omitted title stays.
        let resp = app
            .router()
            .oneshot(json_request("PATCH", &uri, &app.cookie(&boss), json!({"due_at": null})))
            .await
            .unwrap();
        let task = body_json(resp).await;
        assert!(task["due_at"].is_null());
        assert_eq!(task["title"], "Mark essays by Friday");

        let resp = app
            .router()
            .oneshot(json_request("PATCH", &uri, &app.cookie(&amy), json!({"title": "Mine now"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let delete = |cookie: String| {
            Request::builder()
                .method("DELETE")
                .uri(&uri)
                .header("cookie", cookie)
                .body(Body::empty())
                .unwrap()
        };
        let resp = app.router().oneshot(delete(app.cookie(&boss))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        let resp = app.router().oneshot(delete(app.cookie(&boss))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_suggest_users() {
        let app = TestApp::new();
        let amy = app.user("amy", Role::Staff);
        app.user("amos", Role::Staff);
        app.user("ben", Role::Staff);
        let resp = app
            .router()
            .oneshot(get_request("/api/users/suggest?q=am", Some(&app.cookie(&amy))))
            .await
            .unwrap();
        let names: Vec<String> = body_json(resp)
            .await
            .as_array()
            .unwrap()
            .iter()
            .map(|u| u["username"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"amy".to_string()));
        assert!(!names.contains(&"ben".to_string()));
    }
}
