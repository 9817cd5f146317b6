use std::fmt::Write as _;

use axum::extract::{Form, Query, State};
use axum::response::{Html, Redirect};
use chrono::Utc;
use serde::Deserialize;
use tracing::debug;

use super::auth::CurrentUser;
use super::forms::FormFields;
use super::html::{self, Flash, escape};
use super::respond::{ActionError, OrBack, PageError};
use super::state::SharedState;
use crate::timefmt::format_relative;

#[derive(Debug, Default, Deserialize)]
pub struct NotificationsQuery {
    pub page: Option<u32>,
}

pub async fn notifications_page(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Query(query): Query<NotificationsQuery>,
    Query(flash): Query<Flash>,
) -> Result<Html<String>, PageError> {
    let page = state.page(query.page);
    let user_id = user.id;
    let list = state
        .db
        .call(move |db| db.list_notifications(user_id, page))
        .await?;

    let now = Utc::now();
    let mut body = html::button_form("/notifications/read", "Mark all as read", "");
    if list.items.is_empty() {
        body.push_str("<p class=\"empty\">You have no notifications.</p>");
    }
    body.push_str("<ul class=\"notifications\">");
    for n in &list.items {
        let mark = if n.read {
            String::new()
        } else {
            format!(
                "<form class=\"inline\" method=\"post\" action=\"/notifications/read\">\
                 <input type=\"hidden\" name=\"id\" value=\"{}\"><button type=\"submit\" class=\"link\">Mark read</button></form>",
                n.id
            )
        };
        let _ = write!(
            body,
            "<li class=\"{}\"><a href=\"{}\">{}</a> <small>{}</small> {}</li>",
            if n.read { "read" } else { "unread" },
            escape(&n.link),
            escape(&n.body),
            format_relative(&state.tz, n.created_at, now),
            mark
        );
    }
    body.push_str("</ul>");
    body.push_str(&html::pager("/notifications", &list));
    Ok(html::layout("Notifications", Some(&user), &flash, &body))
}

/// Mark the posted `id`s read, or everything when none are given.
pub async fn mark_read(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Form(fields): Form<Vec<(String, String)>>,
) -> Result<Redirect, ActionError> {
    let back = "/notifications";
    let ids = FormFields::new(fields).ids("id");
    let user_id = user.id;
    let changed = state
        .db
        .call(move |db| db.mark_notifications_read(user_id, &ids))
        .await
        .or_back(back)?;
    debug!(user_id, changed, "Notifications marked read");
    Ok(Redirect::to(back))
}
