use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use chrono::Utc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::state::{AppState, SharedState};
use super::{
    admin, api, assets, attachments, auth, board, calendar, chat, dashboard, html, notifications,
    requests, stream, tasks,
};
use crate::config::AppConfig;
use crate::db::{DbHandle, SchoolDb};

/// Room for the non-file multipart fields on top of the upload limit.
const FORM_OVERHEAD_BYTES: usize = 64 * 1024;

const SESSION_PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Build the full application router: pages, server actions, feeds, JSON
/// API and embedded assets.
pub fn build_router(state: SharedState) -> Router {
    let body_limit = state.config.uploads.max_bytes + FORM_OVERHEAD_BYTES;
    let dev_mode = state.config.server.dev_mode;

    let pages = Router::new()
        .route("/login", get(auth::login_page).post(auth::login))
        .route("/logout", post(auth::logout))
        .route("/", get(dashboard::dashboard_page))
        // Tasks
        .route("/tasks", get(tasks::list_tasks).post(tasks::create_task))
        .route("/tasks/new", get(tasks::new_task_page))
        .route("/tasks/{id}", get(tasks::task_page))
        .route("/tasks/{id}/submit", post(tasks::submit_work))
        .route("/tasks/{id}/assignees/{assignee_id}/review", post(tasks::review))
        .route("/tasks/{id}/assignees/{assignee_id}/notes", post(tasks::add_note))
        .route("/tasks/{id}/delete", post(tasks::delete_task))
        // Chat
        .route("/chat", get(chat::chat_page).post(chat::start_thread))
        .route("/chat/{id}", get(chat::thread_page))
        .route("/chat/{id}/messages", post(chat::post_message))
        .route("/chat/{id}/events", get(stream::thread_feed))
        // Discussion board
        .route("/board", get(board::board_page).post(board::create_post))
        .route("/board/new", get(board::new_post_page))
        .route("/board/{id}", get(board::post_page))
        .route("/board/{id}/comments", post(board::add_comment))
        .route("/board/{id}/comments/{comment_id}/delete", post(board::delete_comment))
        .route("/board/{id}/delete", post(board::delete_post))
        .route("/board/{id}/pin", post(board::toggle_pin))
        // Calendar
        .route("/calendar", get(calendar::calendar_page).post(calendar::create_event))
        .route("/calendar/{id}/delete", post(calendar::delete_event))
        // Requests
        .route("/requests", get(requests::requests_page).post(requests::create_request))
        .route("/requests/{id}/decide", post(requests::decide_request))
        // Notifications
        .route("/notifications", get(notifications::notifications_page))
        .route("/notifications/read", post(notifications::mark_read))
        // Administration
        .route("/admin/users", get(admin::users_page).post(admin::create_user))
        .route("/admin/users/{id}", post(admin::update_user))
        .route("/admin/groups", get(admin::groups_page).post(admin::create_group))
        .route("/admin/groups/{id}/members", post(admin::add_member))
        .route(
            "/admin/groups/{id}/members/{user_id}/remove",
            post(admin::remove_member),
        )
        // Attachments
        .route("/attachments", post(attachments::upload))
        .route("/attachments/{id}", get(attachments::download))
        // Live feed and assets
        .route("/events", get(stream::user_feed))
        .route("/static/{*path}", get(assets::static_file));

    let mut app = pages
        .merge(api::api_router())
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        html::error_page(StatusCode::NOT_FOUND, "That page does not exist."),
    )
}

/// Open the database, prepare the upload directory and serve until
/// Ctrl+C.
pub async fn start_server(config: AppConfig, open_browser: bool) -> Result<()> {
    for warning in config.validate() {
        warn!("{}", warning);
    }
    let db = SchoolDb::new(&config.database.path).context("Failed to initialize database")?;
    tokio::fs::create_dir_all(&config.uploads.dir)
        .await
        .with_context(|| format!("Failed to create {}", config.uploads.dir.display()))?;

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = Arc::new(AppState::new(DbHandle::new(db), config));
    tokio::spawn(purge_sessions(state.clone()));

    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    let url = format!("http://{}", local_addr);
    info!(
        url = %url,
        db = %state.config.database.path.display(),
        timezone = %state.tz.label(),
        "Schoolhub running"
    );
    if open_browser && let Err(e) = open::that(&url) {
        warn!(error = %e, "Failed to open browser");
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shut down gracefully");
    Ok(())
}

async fn purge_sessions(state: SharedState) {
    let mut ticker = tokio::time::interval(SESSION_PURGE_INTERVAL);
    loop {
        ticker.tick().await;
        let now = Utc::now();
        match state.db.call(move |db| db.purge_expired_sessions(now)).await {
            Ok(0) => {}
            Ok(purged) => info!(purged, "Expired sessions removed"),
            Err(e) => warn!(error = %e, "Failed to purge expired sessions"),
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

#[cfg(test)]
mod tests {
    use crate::models::Role;
    use crate::web::test_support::{TestApp, body_text, get_request};
    use axum::http::{StatusCode, header};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health_via_full_router() {
        let app = TestApp::new();
        let resp = app.router().oneshot(get_request("/health", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_static_css_is_served() {
        let app = TestApp::new();
        let resp = app
            .router()
            .oneshot(get_request("/static/style.css", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let ctype = resp.headers().get(header::CONTENT_TYPE).unwrap().to_str().unwrap();
        assert!(ctype.starts_with("text/css"));

        let resp = app
            .router()
            .oneshot(get_request("/static/nope.js", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404_page() {
        let app = TestApp::new();
        let amy = app.user("amy", Role::Staff);
        let resp = app
            .router()
            .oneshot(get_request("/no/such/page", Some(&app.cookie(&amy))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(body_text(resp).await.contains("That page does not exist."));
    }

    #[tokio::test]
    async fn test_pages_need_sign_in() {
        let app = TestApp::new();
        for uri in ["/", "/tasks", "/chat", "/board", "/calendar", "/requests", "/admin/users"] {
            let resp = app.router().oneshot(get_request(uri, None)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::SEE_OTHER, "{}", uri);
        }
    }
}
