//! Staff requests (leave, purchases, maintenance) and their decisions.

use std::fmt::Write as _;

use axum::extract::{Form, Path, Query, State};
use axum::response::{Html, Redirect};
use serde::Deserialize;
use tracing::info;

use super::auth::CurrentUser;
use super::html::{self, Flash, escape, text_block, user_name};
use super::notify;
use super::respond::{ActionError, OrBack, PageError, redirect_notice};
use super::state::SharedState;
use crate::broker::{LiveEvent, Topic};
use crate::errors::AppError;
use crate::models::{NotificationKind, RequestKind, RequestStatus, StaffRequest};
use crate::permissions::{self, require};

fn kind_label(kind: RequestKind) -> &'static str {
    match kind {
        RequestKind::Leave => "Leave",
        RequestKind::Purchase => "Purchase",
        RequestKind::Maintenance => "Maintenance",
        RequestKind::Other => "Other",
    }
}

fn request_row(request: &StaffRequest, tz: &crate::timefmt::SchoolTz, can_decide: bool) -> String {
    let mut out = format!(
        "<li class=\"request status-{}\"><strong>{}</strong> <span class=\"badge\">{}</span> \
         <span class=\"badge\">{}</span><br><small>{} &middot; {}</small><p>{}</p>",
        request.status,
        escape(&request.subject),
        kind_label(request.kind),
        request.status,
        user_name(&request.requester),
        tz.format_datetime(request.created_at),
        text_block(&request.body)
    );
    if let Some(decider) = &request.decided_by {
        let _ = write!(
            out,
            "<p class=\"decision\">Decided by {}{}</p>",
            user_name(decider),
            request
                .decision_note
                .as_deref()
                .map(|n| format!(": {}", escape(n)))
                .unwrap_or_default()
        );
    }
    if can_decide && request.status == RequestStatus::Pending {
        let _ = write!(
            out,
            "<form method=\"post\" action=\"/requests/{}/decide\">\
             <input name=\"note\" placeholder=\"Note (optional)\"> \
             <button type=\"submit\" name=\"decision\" value=\"approved\">Approve</button> \
             <button type=\"submit\" name=\"decision\" value=\"rejected\" class=\"danger\">Reject</button></form>",
            request.id
        );
    }
    out.push_str("</li>");
    out
}

pub async fn requests_page(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Query(flash): Query<Flash>,
) -> Result<Html<String>, PageError> {
    let can_decide = permissions::can_decide_requests(&user);
    let filter = if can_decide { None } else { Some(user.id) };
    let requests = state.db.call(move |db| db.list_requests(filter)).await?;

    let kinds: Vec<(&str, &str)> = RequestKind::ALL
        .iter()
        .map(|k| (k.as_str(), kind_label(*k)))
        .collect();
    let mut body = format!(
        "<form class=\"card\" method=\"post\" action=\"/requests\">\
         <label>Type <select name=\"kind\">{}</select></label>\
         <label>Subject <input name=\"subject\" required></label>\
         <label>Details <textarea name=\"body\" rows=\"3\"></textarea></label>\
         <button type=\"submit\">Send request</button></form><h2>{}</h2>",
        html::options(kinds, "leave"),
        if can_decide { "All requests" } else { "My requests" }
    );
    if requests.is_empty() {
        body.push_str("<p class=\"empty\">No requests.</p>");
    }
    body.push_str("<ul class=\"requests\">");
    for request in &requests {
        body.push_str(&request_row(request, &state.tz, can_decide));
    }
    body.push_str("</ul>");
    Ok(html::layout("Requests", Some(&user), &flash, &body))
}

#[derive(Debug, Deserialize)]
pub struct RequestForm {
    pub kind: String,
    pub subject: String,
    #[serde(default)]
    pub body: String,
}

pub async fn create_request(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Form(form): Form<RequestForm>,
) -> Result<Redirect, ActionError> {
    let back = "/requests";
    let kind: RequestKind = form.kind.parse().map_err(AppError::Validation).or_back(back)?;
    let requester = user.id;
    let request = state
        .db
        .call(move |db| db.create_request(requester, kind, &form.subject, &form.body))
        .await
        .or_back(back)?;
    info!(request_id = request.id, kind = %kind, "Request submitted");
    Ok(redirect_notice(back, "Request sent"))
}

#[derive(Debug, Deserialize)]
pub struct DecisionForm {
    pub decision: String,
    #[serde(default)]
    pub note: String,
}

pub async fn decide_request(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(request_id): Path<i64>,
    Form(form): Form<DecisionForm>,
) -> Result<Redirect, ActionError> {
    let back = "/requests";
    require(
        permissions::can_decide_requests(&user),
        "Only managers can decide requests",
    )
    .or_back(back)?;
    let status: RequestStatus = form
        .decision
        .parse()
        .map_err(AppError::Validation)
        .or_back(back)?;
    let decider = user.id;
    let request = state
        .db
        .call(move |db| db.decide_request(request_id, decider, status, &form.note))
        .await
        .or_back(back)?;
    info!(request_id, status = %request.status, "Request decided");

    let requester = request.requester.id;
    state.broker.publish(
        Topic::User(requester),
        LiveEvent::RequestDecided {
            request_id,
            status: request.status,
        },
    );
    if requester != user.id {
        notify::notify_users(
            &state,
            &[requester],
            NotificationKind::RequestDecided,
            &format!(
                "Your request \"{}\" was {} by {}",
                request.subject, request.status, user.display_name
            ),
            "/requests",
        )
        .await;
    }
    Ok(redirect_notice(back, "Decision recorded"))
}
