use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Declares a string-backed enum with `as_str`, `FromStr`, `Display`, serde
/// (snake_case) and SQLite conversions.
macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $($variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    _ => Err(format!("Invalid {}: {}", stringify!($name), s)),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: String| FromSqlError::Other(e.into()))
            }
        }
    };
}

// ── Users & groups ────────────────────────────────────────────────────

string_enum! {
    /// Roles nest: an admin can do everything a manager can, a manager
    /// everything staff can.
    pub enum Role {
        Admin => "admin",
        Manager => "manager",
        Staff => "staff",
    }
}

impl Role {
    fn rank(&self) -> u8 {
        match self {
            Self::Admin => 2,
            Self::Manager => 1,
            Self::Staff => 0,
        }
    }

    /// True when this role carries at least the privileges of `other`.
    pub fn at_least(&self, other: Role) -> bool {
        self.rank() >= other.rank()
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Admin => "Administrator",
            Self::Manager => "Manager",
            Self::Staff => "Staff",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub display_name: String,
    pub email: Option<String>,
    pub role: Role,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id,
            username: self.username.clone(),
            display_name: self.display_name.clone(),
            role: self.role,
        }
    }
}

/// The slice of a user that other records embed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: i64,
    pub username: String,
    pub display_name: String,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub member_count: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupDetail {
    pub group: Group,
    pub members: Vec<UserSummary>,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub user_id: i64,
    pub expires_at: DateTime<Utc>,
}

// ── Tasks ─────────────────────────────────────────────────────────────

string_enum! {
    pub enum AssigneeStatus {
        InProgress => "in_progress",
        Submitted => "submitted",
        Done => "done",
        Rejected => "rejected",
    }
}

string_enum! {
    pub enum ReviewDecision {
        Approve => "approve",
        Reject => "reject",
    }
}

impl AssigneeStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::InProgress => "In progress",
            Self::Submitted => "Submitted",
            Self::Done => "Done",
            Self::Rejected => "Rejected",
        }
    }

    /// Status after the assignee hands in work.
    pub fn submit(self) -> Result<Self, String> {
        match self {
            Self::InProgress | Self::Rejected => Ok(Self::Submitted),
            Self::Submitted => Err("This work has already been submitted".to_string()),
            Self::Done => Err("This task is already done".to_string()),
        }
    }

    /// Status after a reviewer decides on submitted work.
    pub fn review(self, decision: ReviewDecision) -> Result<Self, String> {
        match (self, decision) {
            (Self::Submitted, ReviewDecision::Approve) => Ok(Self::Done),
            (Self::Submitted, ReviewDecision::Reject) => Ok(Self::Rejected),
            (other, _) => Err(format!(
                "Only submitted work can be reviewed (current status: {})",
                other.label()
            )),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::InProgress | Self::Rejected)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub due_at: Option<DateTime<Utc>>,
    pub created_by: UserSummary,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignee {
    pub id: i64,
    pub task_id: i64,
    pub user: UserSummary,
    pub status: AssigneeStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: i64,
    pub assignee_id: i64,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    pub id: i64,
    pub assignee_id: i64,
    pub author: UserSummary,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// Row of the task list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskListItem {
    #[serde(flatten)]
    pub task: Task,
    pub assignee_count: i64,
    pub done_count: i64,
    /// Status of the viewing user's own assignment, if any.
    pub my_status: Option<AssigneeStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssigneeDetail {
    #[serde(flatten)]
    pub assignee: TaskAssignee,
    pub submissions: Vec<Submission>,
    pub notes: Vec<Note>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDetail {
    pub task: Task,
    pub assignees: Vec<AssigneeDetail>,
    pub attachments: Vec<Attachment>,
}

impl TaskDetail {
    pub fn assignee_for(&self, user_id: i64) -> Option<&AssigneeDetail> {
        self.assignees.iter().find(|a| a.assignee.user.id == user_id)
    }

    /// Drop other assignees' submissions, notes and submission files.
    /// Reviewers see everything and should not call this.
    pub fn redact_for(&mut self, viewer_id: i64) {
        let mut hidden = Vec::new();
        for entry in &mut self.assignees {
            if entry.assignee.user.id == viewer_id {
                continue;
            }
            hidden.extend(entry.submissions.iter().map(|s| s.id));
            entry.submissions.clear();
            entry.notes.clear();
        }
        self.attachments
            .retain(|a| !(a.owner_kind == OwnerKind::Submission && hidden.contains(&a.owner_id)));
    }
}

string_enum! {
    /// Which tasks a list shows.
    pub enum TaskScope {
        Assigned => "assigned",
        Created => "created",
        All => "all",
    }
}

// ── Chat ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: i64,
    pub title: Option<String>,
    pub created_by: i64,
    pub created_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadSummary {
    pub thread: Thread,
    pub participants: Vec<UserSummary>,
    pub last_message: Option<String>,
    pub unread: i64,
}

impl ThreadSummary {
    /// Title if set, otherwise the other participants' names.
    pub fn display_title(&self, viewer_id: i64) -> String {
        if let Some(title) = self.thread.title.as_deref().filter(|t| !t.is_empty()) {
            return title.to_string();
        }
        let others: Vec<&str> = self
            .participants
            .iter()
            .filter(|p| p.id != viewer_id)
            .map(|p| p.display_name.as_str())
            .collect();
        if others.is_empty() {
            "Notes to self".to_string()
        } else {
            others.join(", ")
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub thread_id: i64,
    pub author: UserSummary,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

// ── Requests ──────────────────────────────────────────────────────────

string_enum! {
    pub enum RequestKind {
        Leave => "leave",
        Purchase => "purchase",
        Maintenance => "maintenance",
        Other => "other",
    }
}

string_enum! {
    pub enum RequestStatus {
        Pending => "pending",
        Approved => "approved",
        Rejected => "rejected",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaffRequest {
    pub id: i64,
    pub requester: UserSummary,
    pub kind: RequestKind,
    pub subject: String,
    pub body: String,
    pub status: RequestStatus,
    pub decided_by: Option<UserSummary>,
    pub decision_note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

// ── Discussion board ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscussionPost {
    pub id: i64,
    pub author: UserSummary,
    pub title: String,
    pub body: String,
    pub pinned: bool,
    pub comment_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscussionComment {
    pub id: i64,
    pub post_id: i64,
    pub author: UserSummary,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

// ── Calendar ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub all_day: bool,
    pub group_id: Option<i64>,
    pub group_name: Option<String>,
    pub created_by: i64,
    pub created_at: DateTime<Utc>,
}

// ── Attachments ───────────────────────────────────────────────────────

string_enum! {
    pub enum OwnerKind {
        Task => "task",
        Submission => "submission",
        Message => "message",
        Post => "post",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: i64,
    pub owner_kind: OwnerKind,
    pub owner_id: i64,
    pub uploaded_by: i64,
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub sha256: String,
    pub stored_name: String,
    pub created_at: DateTime<Utc>,
}

// ── Notifications ─────────────────────────────────────────────────────

string_enum! {
    pub enum NotificationKind {
        Mention => "mention",
        TaskAssigned => "task_assigned",
        TaskSubmitted => "task_submitted",
        TaskReviewed => "task_reviewed",
        RequestDecided => "request_decided",
        Message => "message",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub user_id: i64,
    pub kind: NotificationKind,
    pub body: String,
    pub link: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

/// A notification about to be stored.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub user_id: i64,
    pub kind: NotificationKind,
    pub body: String,
    pub link: String,
}

// ── Dashboard ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dashboard {
    pub open_assignments: Vec<TaskListItem>,
    pub awaiting_review: i64,
    pub unread_notifications: Vec<Notification>,
    pub upcoming_events: Vec<CalendarEvent>,
    pub pending_requests: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_ordering() {
        assert!(Role::Admin.at_least(Role::Manager));
        assert!(Role::Manager.at_least(Role::Manager));
        assert!(Role::Manager.at_least(Role::Staff));
        assert!(!Role::Staff.at_least(Role::Manager));
        assert!(!Role::Manager.at_least(Role::Admin));
    }

    #[test]
    fn test_string_enum_round_trip() {
        for status in AssigneeStatus::ALL {
            assert_eq!(status.as_str().parse::<AssigneeStatus>().unwrap(), *status);
        }
        assert_eq!("in_progress".parse::<AssigneeStatus>(), Ok(AssigneeStatus::InProgress));
        assert!("finished".parse::<AssigneeStatus>().is_err());
        assert_eq!(Role::Manager.to_string(), "manager");
    }

    #[test]
    fn test_string_enum_serde_matches_as_str() {
        let json = serde_json::to_string(&NotificationKind::TaskAssigned).unwrap();
        assert_eq!(json, "\"task_assigned\"");
        let back: RequestKind = serde_json::from_str("\"maintenance\"").unwrap();
        assert_eq!(back, RequestKind::Maintenance);
    }

    #[test]
    fn test_submit_transitions() {
        assert_eq!(AssigneeStatus::InProgress.submit(), Ok(AssigneeStatus::Submitted));
        assert_eq!(AssigneeStatus::Rejected.submit(), Ok(AssigneeStatus::Submitted));
        assert!(AssigneeStatus::Submitted.submit().is_err());
        assert!(AssigneeStatus::Done.submit().is_err());
    }

    #[test]
    fn test_review_transitions() {
        assert_eq!(
            AssigneeStatus::Submitted.review(ReviewDecision::Approve),
            Ok(AssigneeStatus::Done)
        );
        assert_eq!(
            AssigneeStatus::Submitted.review(ReviewDecision::Reject),
            Ok(AssigneeStatus::Rejected)
        );
        for status in [
            AssigneeStatus::InProgress,
            AssigneeStatus::Done,
            AssigneeStatus::Rejected,
        ] {
            assert!(status.review(ReviewDecision::Approve).is_err());
            assert!(status.review(ReviewDecision::Reject).is_err());
        }
    }

    #[test]
    fn test_thread_display_title() {
        let alice = UserSummary {
            id: 1,
            username: "alice".into(),
            display_name: "Alice".into(),
            role: Role::Staff,
        };
        let bob = UserSummary {
            id: 2,
            username: "bob".into(),
            display_name: "Bob".into(),
            role: Role::Staff,
        };
        let mut summary = ThreadSummary {
            thread: Thread {
                id: 1,
                title: None,
                created_by: 1,
                created_at: Utc::now(),
                last_message_at: None,
            },
            participants: vec![alice.clone(), bob],
            last_message: None,
            unread: 0,
        };
        assert_eq!(summary.display_title(1), "Bob");
        summary.participants = vec![alice];
        assert_eq!(summary.display_title(1), "Notes to self");
        summary.thread.title = Some("Year 9 trip".into());
        assert_eq!(summary.display_title(1), "Year 9 trip");
    }
}
