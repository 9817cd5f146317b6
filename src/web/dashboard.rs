use std::fmt::Write as _;

use axum::extract::{Query, State};
use axum::response::Html;
use chrono::Utc;

use super::auth::CurrentUser;
use super::html::{self, Flash, escape, status_badge};
use super::respond::PageError;
use super::state::SharedState;
use crate::models::{Dashboard, Role};
use crate::permissions;
use crate::timefmt::format_relative;

const DASHBOARD_ITEMS: i64 = 5;

pub async fn dashboard_page(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Query(flash): Query<Flash>,
) -> Result<Html<String>, PageError> {
    let user_id = user.id;
    let sees_all = user.role.at_least(Role::Manager);
    let decides = permissions::can_decide_requests(&user);
    let now = Utc::now();
    let (dash, unread_threads) = state
        .db
        .call(move |db| {
            let dash = Dashboard {
                open_assignments: db.open_assignments(user_id, DASHBOARD_ITEMS)?,
                awaiting_review: db.awaiting_review_count(user_id, sees_all)?,
                unread_notifications: db.unread_notifications(user_id, DASHBOARD_ITEMS)?,
                upcoming_events: db.upcoming_events(user_id, sees_all, now, DASHBOARD_ITEMS)?,
                pending_requests: if decides { db.pending_request_count()? } else { 0 },
            };
            Ok((dash, db.unread_thread_count(user_id)?))
        })
        .await?;

    let mut body = String::from("<div class=\"grid\">");

    body.push_str("<section class=\"card\"><h2>My open tasks</h2>");
    if dash.open_assignments.is_empty() {
        body.push_str("<p class=\"empty\">Nothing waiting on you.</p>");
    } else {
        body.push_str("<ul>");
        for item in &dash.open_assignments {
            let due = item
                .task
                .due_at
                .map(|due| format!(" <small>{}</small>", state.tz.format_due(due, now)))
                .unwrap_or_default();
            let _ = write!(
                body,
                "<li><a href=\"/tasks/{}\">{}</a> {}{}</li>",
                item.task.id,
                escape(&item.task.title),
                item.my_status.map(status_badge).unwrap_or_default(),
                due
            );
        }
        body.push_str("</ul>");
    }
    body.push_str("</section>");

    body.push_str("<section class=\"card\"><h2>At a glance</h2><ul>");
    if permissions::can_create_tasks(&user) || dash.awaiting_review > 0 {
        let _ = write!(
            body,
            "<li><a href=\"/tasks?scope={}\">{} submissions awaiting review</a></li>",
            if sees_all { "all" } else { "created" },
            dash.awaiting_review
        );
    }
    let _ = write!(
        body,
        "<li><a href=\"/chat\">{} conversations with unread messages</a></li>",
        unread_threads
    );
    if decides {
        let _ = write!(
            body,
            "<li><a href=\"/requests\">{} pending requests</a></li>",
            dash.pending_requests
        );
    }
    body.push_str("</ul></section>");

    body.push_str("<section class=\"card\"><h2>Notifications</h2>");
    if dash.unread_notifications.is_empty() {
        body.push_str("<p class=\"empty\">You're all caught up.</p>");
    } else {
        body.push_str("<ul>");
        for n in &dash.unread_notifications {
            let _ = write!(
                body,
                "<li><a href=\"{}\">{}</a> <small>{}</small></li>",
                escape(&n.link),
                escape(&n.body),
                format_relative(&state.tz, n.created_at, now)
            );
        }
        body.push_str("</ul>");
    }
    body.push_str("<p><a href=\"/notifications\">All notifications</a></p></section>");

    body.push_str("<section class=\"card\"><h2>Coming up</h2>");
    if dash.upcoming_events.is_empty() {
        body.push_str("<p class=\"empty\">No upcoming events.</p>");
    } else {
        body.push_str("<ul>");
        for e in &dash.upcoming_events {
            let when = if e.all_day {
                state.tz.format_date(e.starts_at)
            } else {
                state.tz.format_datetime(e.starts_at)
            };
            let (year, month) = state.tz.year_month(e.starts_at);
            let _ = write!(
                body,
                "<li><a href=\"/calendar?year={}&amp;month={}\">{}</a> <small>{}</small></li>",
                year,
                month,
                escape(&e.title),
                when
            );
        }
        body.push_str("</ul>");
    }
    body.push_str("</section></div>");

    let title = format!("Welcome, {}", user.display_name);
    Ok(html::layout(&title, Some(&user), &flash, &body))
}
