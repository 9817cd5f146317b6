//! Task pages and server actions: create, hand in work, review, notes.

use std::fmt::Write as _;

use axum::extract::{Form, Multipart, Path, Query, State};
use axum::response::{Html, Redirect};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::info;

use super::attachments::{read_multipart, remove_files, store_after_commit};
use super::auth::CurrentUser;
use super::forms::FormFields;
use super::html::{self, Flash, escape, status_badge, text_block, user_name};
use super::notify;
use super::respond::{ActionError, OrBack, PageError, redirect_error, redirect_notice};
use super::state::{AppState, SharedState};
use crate::broker::{LiveEvent, Topic};
use crate::db::NewTask;
use crate::errors::{AppError, AppResult};
use crate::models::{
    AssigneeDetail, AssigneeStatus, Attachment, NotificationKind, OwnerKind, ReviewDecision, Role, Task,
    TaskDetail, TaskScope, User,
};
use crate::permissions::{self, require};
use crate::timefmt::SchoolTz;

/// Blank means no due date.
pub fn parse_due(tz: &SchoolTz, input: &str) -> AppResult<Option<DateTime<Utc>>> {
    if input.trim().is_empty() {
        return Ok(None);
    }
    tz.parse_local_datetime(input)
        .map(Some)
        .ok_or_else(|| AppError::validation("The due date is not a valid date and time"))
}

/// Tell newly assigned users about a task, on their feed and in their
/// notifications.
pub async fn announce_assignment(state: &AppState, task: &Task, by: &User, user_ids: &[i64]) {
    let recipients: Vec<i64> = user_ids.iter().copied().filter(|&id| id != by.id).collect();
    state.broker.publish_to_users(
        &recipients,
        &LiveEvent::TaskAssigned {
            task_id: task.id,
            title: task.title.clone(),
            assigned_by: by.display_name.clone(),
        },
    );
    notify::notify_users(
        state,
        &recipients,
        NotificationKind::TaskAssigned,
        &format!("{} assigned you \"{}\"", by.display_name, task.title),
        &format!("/tasks/{}", task.id),
    )
    .await;
}

async fn load_task(state: &AppState, task_id: i64) -> AppResult<Task> {
    state
        .db
        .call(move |db| db.get_task(task_id))
        .await?
        .ok_or_else(|| AppError::not_found(format!("Task {} not found", task_id)))
}

// ── List ──────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub scope: Option<String>,
    pub page: Option<u32>,
}

pub async fn list_tasks(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Query(query): Query<ListQuery>,
    Query(flash): Query<Flash>,
) -> Result<Html<String>, PageError> {
    let mut scope = query
        .scope
        .as_deref()
        .and_then(|s| s.parse::<TaskScope>().ok())
        .unwrap_or(TaskScope::Assigned);
    if scope == TaskScope::All && !user.role.at_least(Role::Manager) {
        scope = TaskScope::Assigned;
    }
    let page = state.page(query.page);
    let viewer = user.id;
    let tasks = state
        .db
        .call(move |db| db.list_tasks(viewer, scope, page))
        .await?;

    let mut body = String::from("<p class=\"tabs\">");
    let mut tabs = vec![
        (TaskScope::Assigned, "Assigned to me"),
        (TaskScope::Created, "Created by me"),
    ];
    if user.role.at_least(Role::Manager) {
        tabs.push((TaskScope::All, "All tasks"));
    }
    for (tab, label) in tabs {
        let class = if tab == scope { " class=\"active\"" } else { "" };
        let _ = write!(body, "<a{} href=\"/tasks?scope={}\">{}</a> ", class, tab, label);
    }
    if permissions::can_create_tasks(&user) {
        body.push_str("<a class=\"button\" href=\"/tasks/new\">New task</a>");
    }
    body.push_str("</p>");

    if tasks.items.is_empty() {
        body.push_str("<p class=\"empty\">No tasks here.</p>");
    } else {
        body.push_str(
            "<table><thead><tr><th>Task</th><th>From</th><th>Due</th><th>Done</th><th>My status</th></tr></thead><tbody>",
        );
        let now = Utc::now();
        for item in &tasks.items {
            let _ = write!(
                body,
                "<tr><td><a href=\"/tasks/{}\">{}</a></td><td>{}</td><td>{}</td><td>{}/{}</td><td>{}</td></tr>",
                item.task.id,
                escape(&item.task.title),
                user_name(&item.task.created_by),
                item.task
                    .due_at
                    .map(|due| state.tz.format_due(due, now))
                    .unwrap_or_default(),
                item.done_count,
                item.assignee_count,
                item.my_status.map(status_badge).unwrap_or_default(),
            );
        }
        body.push_str("</tbody></table>");
    }
    body.push_str(&html::pager(&format!("/tasks?scope={}", scope), &tasks));
    Ok(html::layout("Tasks", Some(&user), &flash, &body))
}

// ── Create ────────────────────────────────────────────────────────────

pub async fn new_task_page(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Query(flash): Query<Flash>,
) -> Result<Html<String>, PageError> {
    require(
        permissions::can_create_tasks(&user),
        "Only managers can create tasks",
    )?;
    let (users, groups) = state
        .db
        .call(|db| Ok((db.list_active_users()?, db.list_groups()?)))
        .await?;

    let mut group_boxes = String::from("<div class=\"checklist\">");
    for group in &groups {
        let _ = write!(
            group_boxes,
            "<label><input type=\"checkbox\" name=\"group\" value=\"{}\"> {} <small>{} members</small></label>",
            group.id,
            escape(&group.name),
            group.member_count
        );
    }
    group_boxes.push_str("</div>");

    let body = format!(
        "<form class=\"card\" method=\"post\" action=\"/tasks\">\
         <label>Title <input name=\"title\" required maxlength=\"200\"></label>\
         <label>Description <textarea name=\"description\" rows=\"5\"></textarea></label>\
         <label>Due <input type=\"datetime-local\" name=\"due_at\"> <small>{tz}</small></label>\
         <fieldset><legend>Assign people</legend>{users}</fieldset>\
         <fieldset><legend>Assign groups</legend>{groups}</fieldset>\
         <button type=\"submit\">Create task</button></form>",
        tz = state.tz.label(),
        users = html::user_checkboxes("assignee", &users, &[]),
        groups = group_boxes,
    );
    Ok(html::layout("New task", Some(&user), &flash, &body))
}

pub async fn create_task(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Form(fields): Form<Vec<(String, String)>>,
) -> Result<Redirect, ActionError> {
    let back = "/tasks/new";
    require(
        permissions::can_create_tasks(&user),
        "Only managers can create tasks",
    )
    .or_back(back)?;
    let fields = FormFields::new(fields);
    let due_at = parse_due(&state.tz, &fields.text("due_at")).or_back(back)?;
    let new = NewTask {
        title: fields.text("title"),
        description: fields.text("description"),
        due_at,
        created_by: user.id,
        assignee_ids: fields.ids("assignee"),
        group_ids: fields.ids("group"),
    };
    let (task, assigned) = state
        .db
        .call(move |db| db.create_task(&new))
        .await
        .or_back(back)?;
    info!(task_id = task.id, assignees = assigned.len(), "Task created");
    announce_assignment(&state, &task, &user, &assigned).await;
    Ok(redirect_notice(&format!("/tasks/{}", task.id), "Task created"))
}

// ── Detail ────────────────────────────────────────────────────────────

fn owned_by(attachments: &[Attachment], kind: OwnerKind, owner_id: i64) -> Vec<Attachment> {
    attachments
        .iter()
        .filter(|a| a.owner_kind == kind && a.owner_id == owner_id)
        .cloned()
        .collect()
}

fn assignee_card(
    tz: &SchoolTz,
    detail: &TaskDetail,
    entry: &AssigneeDetail,
    viewer: &User,
    is_reviewer: bool,
) -> String {
    let a = &entry.assignee;
    let task_id = detail.task.id;
    let is_self = a.user.id == viewer.id;
    let mut out = format!(
        "<section class=\"card assignee\" id=\"a{}\"><h3>{} {}</h3>",
        a.id,
        user_name(&a.user),
        status_badge(a.status)
    );
    if !(is_self || is_reviewer) {
        out.push_str("</section>");
        return out;
    }

    for s in &entry.submissions {
        let _ = write!(
            out,
            "<div class=\"submission\"><small>Submitted {}</small><p>{}</p>{}</div>",
            tz.format_datetime(s.created_at),
            text_block(&s.body),
            html::attachment_list(&owned_by(&detail.attachments, OwnerKind::Submission, s.id))
        );
    }
    for n in &entry.notes {
        let _ = write!(
            out,
            "<div class=\"note\"><small>{} &middot; {}</small><p>{}</p></div>",
            user_name(&n.author),
            tz.format_datetime(n.created_at),
            text_block(&n.body)
        );
    }

    if is_self && a.status.is_open() {
        let _ = write!(
            out,
            "<form method=\"post\" action=\"/tasks/{}/submit\" enctype=\"multipart/form-data\">\
             <label>Your work <textarea name=\"body\" rows=\"4\"></textarea></label>\
             <input type=\"file\" name=\"file\"> <button type=\"submit\">Submit work</button></form>",
            task_id
        );
    }
    if is_reviewer && a.status == AssigneeStatus::Submitted {
        let _ = write!(
            out,
            "<form method=\"post\" action=\"/tasks/{}/assignees/{}/review\">\
             <label>Feedback <textarea name=\"note\" rows=\"2\"></textarea></label>\
             <button type=\"submit\" name=\"decision\" value=\"approve\">Approve</button> \
             <button type=\"submit\" name=\"decision\" value=\"reject\" class=\"danger\">Return</button></form>",
            task_id, a.id
        );
    }
    let _ = write!(
        out,
        "<form method=\"post\" action=\"/tasks/{}/assignees/{}/notes\">\
         <input name=\"body\" placeholder=\"Add a note\" required> <button type=\"submit\">Note</button></form></section>",
        task_id, a.id
    );
    out
}

pub async fn task_page(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(task_id): Path<i64>,
    Query(flash): Query<Flash>,
) -> Result<Html<String>, PageError> {
    let detail = state
        .db
        .call(move |db| db.get_task_detail(task_id))
        .await?
        .ok_or_else(|| AppError::not_found(format!("Task {} not found", task_id)))?;
    require(
        permissions::can_view_task(&user, &detail),
        "You are not assigned to this task",
    )?;
    let task = &detail.task;
    let is_reviewer = permissions::can_review_task(&user, task);

    let mut body = format!(
        "<p class=\"meta\">From {} &middot; created {}{}</p><div class=\"description\">{}</div>",
        user_name(&task.created_by),
        state.tz.format_datetime(task.created_at),
        task.due_at
            .map(|due| format!(" &middot; <strong>{}</strong>", state.tz.format_due(due, Utc::now())))
            .unwrap_or_default(),
        text_block(&task.description)
    );
    body.push_str(&html::attachment_list(&owned_by(
        &detail.attachments,
        OwnerKind::Task,
        task.id,
    )));
    if is_reviewer {
        body.push_str(&html::upload_form(OwnerKind::Task, task.id));
    }
    if permissions::can_delete_task(&user, task) {
        body.push_str(&html::button_form(
            &format!("/tasks/{}/delete", task.id),
            "Delete task",
            "danger",
        ));
    }
    body.push_str("<h2>Assignees</h2>");
    for entry in &detail.assignees {
        body.push_str(&assignee_card(&state.tz, &detail, entry, &user, is_reviewer));
    }
    Ok(html::layout(&task.title, Some(&user), &flash, &body))
}

// ── Actions ───────────────────────────────────────────────────────────

pub async fn submit_work(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(task_id): Path<i64>,
    multipart: Multipart,
) -> Result<Redirect, ActionError> {
    let back = format!("/tasks/{}", task_id);
    let form = read_multipart(multipart, state.config.uploads.max_bytes)
        .await
        .or_back(&back)?;
    let body = form.text("body").to_string();
    let user_id = user.id;
    let (assignee, submission) = state
        .db
        .call(move |db| db.submit_work(task_id, user_id, &body))
        .await
        .or_back(&back)?;
    let file_saved =
        store_after_commit(&state, OwnerKind::Submission, submission.id, user.id, form.file).await;
    info!(task_id, assignee_id = assignee.id, "Work submitted");

    let task = load_task(&state, task_id).await.or_back(&back)?;
    let reviewer = task.created_by.id;
    if reviewer != user.id {
        state.broker.publish(
            Topic::User(reviewer),
            LiveEvent::TaskStatusChanged {
                task_id,
                assignee_id: assignee.id,
                user_id: user.id,
                status: assignee.status,
            },
        );
        notify::notify_users(
            &state,
            &[reviewer],
            NotificationKind::TaskSubmitted,
            &format!("{} submitted work for \"{}\"", user.display_name, task.title),
            &format!("{}#a{}", back, assignee.id),
        )
        .await;
    }
    if !file_saved {
        return Ok(redirect_error(&back, "Work submitted, but the file could not be saved"));
    }
    Ok(redirect_notice(&back, "Work submitted"))
}

#[derive(Debug, Deserialize)]
pub struct ReviewForm {
    pub decision: String,
    #[serde(default)]
    pub note: String,
}

pub async fn review(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path((task_id, assignee_id)): Path<(i64, i64)>,
    Form(form): Form<ReviewForm>,
) -> Result<Redirect, ActionError> {
    let back = format!("/tasks/{}#a{}", task_id, assignee_id);
    let decision: ReviewDecision = form
        .decision
        .parse()
        .map_err(AppError::Validation)
        .or_back(&back)?;
    let task = load_task(&state, task_id).await.or_back(&back)?;
    require(
        permissions::can_review_task(&user, &task),
        "Only the task's creator or a manager can review work",
    )
    .or_back(&back)?;

    let reviewer_id = user.id;
    let note = form.note;
    let (assignee, _note) = state
        .db
        .call(move |db| db.review_assignee(task_id, assignee_id, reviewer_id, decision, &note))
        .await
        .or_back(&back)?;
    info!(task_id, assignee_id, decision = %decision, "Work reviewed");

    state.broker.publish(
        Topic::User(assignee.user.id),
        LiveEvent::TaskStatusChanged {
            task_id,
            assignee_id,
            user_id: assignee.user.id,
            status: assignee.status,
        },
    );
    let (verb, notice) = match decision {
        ReviewDecision::Approve => ("approved", "Work approved"),
        ReviewDecision::Reject => ("returned", "Work returned"),
    };
    if assignee.user.id != user.id {
        notify::notify_users(
            &state,
            &[assignee.user.id],
            NotificationKind::TaskReviewed,
            &format!("{} {} your work on \"{}\"", user.display_name, verb, task.title),
            &format!("/tasks/{}", task_id),
        )
        .await;
    }
    Ok(redirect_notice(&back, notice))
}

#[derive(Debug, Deserialize)]
pub struct NoteForm {
    pub body: String,
}

pub async fn add_note(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path((task_id, assignee_id)): Path<(i64, i64)>,
    Form(form): Form<NoteForm>,
) -> Result<Redirect, ActionError> {
    let back = format!("/tasks/{}#a{}", task_id, assignee_id);
    let task = load_task(&state, task_id).await.or_back(&back)?;
    let assignee = state
        .db
        .call(move |db| db.get_assignee(task_id, assignee_id))
        .await
        .or_back(&back)?
        .ok_or_else(|| AppError::not_found("That assignee is not on this task"))
        .or_back(&back)?;
    let is_self = assignee.user.id == user.id;
    require(
        is_self || permissions::can_review_task(&user, &task),
        "You cannot add notes to this assignment",
    )
    .or_back(&back)?;

    let author_id = user.id;
    let body = form.body;
    let note = state
        .db
        .call(move |db| db.add_note(task_id, assignee_id, author_id, &body))
        .await
        .or_back(&back)?;

    let other_side = if is_self { task.created_by.id } else { assignee.user.id };
    if other_side != user.id {
        state.broker.publish(
            Topic::User(other_side),
            LiveEvent::NoteAdded {
                task_id,
                assignee_id,
                author_name: user.display_name.clone(),
                body: note.body,
            },
        );
    }
    Ok(Redirect::to(&back))
}

pub async fn delete_task(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(task_id): Path<i64>,
) -> Result<Redirect, ActionError> {
    let back = format!("/tasks/{}", task_id);
    let task = load_task(&state, task_id).await.or_back(&back)?;
    require(
        permissions::can_delete_task(&user, &task),
        "Only the task's creator or an admin can delete it",
    )
    .or_back(&back)?;
    let stored = state
        .db
        .call(move |db| db.delete_task(task_id))
        .await
        .or_back(&back)?
        .unwrap_or_default();
    remove_files(&state, stored).await;
    info!(task_id, user_id = user.id, "Task deleted");
    Ok(redirect_notice("/tasks", "Task deleted"))
}
