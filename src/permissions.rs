//! Role gating. Every check is a pure function of the acting user and the
//! record in question; handlers turn a `false` into
//! [`AppError::NotAuthorized`] via [`require`].

use crate::errors::{AppError, AppResult};
use crate::models::{CalendarEvent, Role, StaffRequest, Task, TaskDetail, User};

pub fn require(allowed: bool, msg: &str) -> AppResult<()> {
    if allowed {
        Ok(())
    } else {
        Err(AppError::not_authorized(msg))
    }
}

pub fn can_manage_users(user: &User) -> bool {
    user.role == Role::Admin
}

pub fn can_create_tasks(user: &User) -> bool {
    user.role.at_least(Role::Manager)
}

pub fn can_view_task(user: &User, task: &TaskDetail) -> bool {
    user.role.at_least(Role::Manager)
        || task.task.created_by.id == user.id
        || task.assignee_for(user.id).is_some()
}

/// Reviewers: the task's creator, managers and admins.
pub fn can_review_task(user: &User, task: &Task) -> bool {
    user.role.at_least(Role::Manager) || task.created_by.id == user.id
}

pub fn can_delete_task(user: &User, task: &Task) -> bool {
    user.role == Role::Admin || task.created_by.id == user.id
}

pub fn can_decide_requests(user: &User) -> bool {
    user.role.at_least(Role::Manager)
}

pub fn can_view_request(user: &User, request: &StaffRequest) -> bool {
    can_decide_requests(user) || request.requester.id == user.id
}

/// Posts and comments alike: the author or an admin.
pub fn can_delete_discussion(user: &User, author_id: i64) -> bool {
    user.role == Role::Admin || author_id == user.id
}

pub fn can_pin_posts(user: &User) -> bool {
    user.role.at_least(Role::Manager)
}

pub fn can_manage_calendar(user: &User) -> bool {
    user.role.at_least(Role::Manager)
}

pub fn can_delete_event(user: &User, event: &CalendarEvent) -> bool {
    user.role == Role::Admin || event.created_by == user.id
}

/// School-wide events are visible to everyone; group events to the group's
/// members plus managers and admins.
pub fn can_see_event(user: &User, event: &CalendarEvent, member_of: &[i64]) -> bool {
    match event.group_id {
        None => true,
        Some(group_id) => user.role.at_least(Role::Manager) || member_of.contains(&group_id),
    }
}

pub fn can_open_thread(user: &User, participant_ids: &[i64]) -> bool {
    participant_ids.contains(&user.id)
}
