//! Shared calendar: month view, create and delete events.

use std::fmt::Write as _;

use axum::extract::{Form, Path, Query, State};
use axum::response::{Html, Redirect};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::Deserialize;
use tracing::info;

use super::auth::CurrentUser;
use super::forms::FormFields;
use super::html::{self, Flash, escape};
use super::respond::{ActionError, OrBack, PageError, redirect_notice};
use super::state::{AppState, SharedState};
use crate::broker::LiveEvent;
use crate::db::NewEvent;
use crate::errors::{AppError, AppResult};
use crate::models::{CalendarEvent, Role};
use crate::permissions::{self, require};
use crate::timefmt::SchoolTz;

const MONTH_NAMES: [&str; 12] = [
    "January", "February", "March", "April", "May", "June", "July", "August", "September",
    "October", "November", "December",
];

/// Whether `event` should be listed on the day `[start, end)`. Events with
/// no duration appear on the day they start.
fn occurs_on(event: &CalendarEvent, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
    event.starts_at < end && (event.ends_at > start || event.starts_at >= start)
}

fn shift_month(year: i32, month: u32, delta: i32) -> (i32, u32) {
    let index = year * 12 + month as i32 - 1 + delta;
    (index.div_euclid(12), index.rem_euclid(12) as u32 + 1)
}

fn calendar_link(year: i32, month: u32) -> String {
    format!("/calendar?year={}&month={}", year, month)
}

/// Start and end of an event from the create form, in UTC.
pub fn event_times(tz: &SchoolTz, fields: &FormFields) -> AppResult<(DateTime<Utc>, DateTime<Utc>, bool)> {
    let invalid = |what: &str| AppError::validation(format!("The {} is not valid", what));
    let date = tz
        .parse_local_date(&fields.text("date"))
        .ok_or_else(|| AppError::validation("Pick a date for the event"))?;
    let end_date = match fields.optional("end_date") {
        Some(s) => tz.parse_local_date(&s).ok_or_else(|| invalid("end date"))?,
        None => date,
    };
    let all_day = fields.checked("all_day");
    if all_day {
        let starts = tz.start_of_day(date).ok_or_else(|| invalid("date"))?;
        let ends = end_date
            .succ_opt()
            .and_then(|next| tz.start_of_day(next))
            .ok_or_else(|| invalid("end date"))?;
        return Ok((starts, ends, true));
    }
    let start_time = fields
        .optional("start_time")
        .ok_or_else(|| AppError::validation("Pick a start time or mark the event as all day"))?;
    let starts = tz
        .parse_local_datetime(&format!("{}T{}", date, start_time))
        .ok_or_else(|| invalid("start time"))?;
    let ends = match fields.optional("end_time") {
        Some(end_time) => tz
            .parse_local_datetime(&format!("{}T{}", end_date, end_time))
            .ok_or_else(|| invalid("end time"))?,
        None => starts + Duration::hours(1),
    };
    Ok((starts, ends, false))
}

fn publish_change(state: &AppState, audience: &[i64], event: &CalendarEvent, removed: bool) -> usize {
    state.broker.publish_to_users(
        audience,
        &LiveEvent::CalendarChanged {
            event_id: event.id,
            title: event.title.clone(),
            removed,
        },
    )
}

// ── Month view ────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct MonthQuery {
    pub year: Option<i32>,
    pub month: Option<u32>,
}

pub async fn calendar_page(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Query(query): Query<MonthQuery>,
    Query(flash): Query<Flash>,
) -> Result<Html<String>, PageError> {
    let tz = state.tz;
    let (this_year, this_month) = tz.year_month(Utc::now());
    let year = query.year.unwrap_or(this_year);
    let month = query.month.filter(|m| (1..=12).contains(m)).unwrap_or(this_month);
    let (start, end) = tz
        .month_bounds(year, month)
        .ok_or_else(|| AppError::validation("That month is out of range"))?;

    let viewer = user.id;
    let see_all = user.role.at_least(Role::Manager);
    let can_create = permissions::can_manage_calendar(&user);
    let (events, groups) = state
        .db
        .call(move |db| {
            let groups = if can_create { db.list_groups()? } else { Vec::new() };
            Ok((db.events_between(viewer, see_all, start, end)?, groups))
        })
        .await?;

    let (prev_year, prev_month) = shift_month(year, month, -1);
    let (next_year, next_month) = shift_month(year, month, 1);
    let title = format!("{} {}", MONTH_NAMES[(month - 1) as usize], year);
    let mut body = format!(
        "<p class=\"pager\"><a href=\"{}\">&larr; Previous</a> <a href=\"/calendar\">Today</a> <a href=\"{}\">Next &rarr;</a> <small>Times in {}</small></p>",
        calendar_link(prev_year, prev_month),
        calendar_link(next_year, next_month),
        tz.label()
    );

    body.push_str(
        "<table class=\"month\"><thead><tr><th>Mon</th><th>Tue</th><th>Wed</th><th>Thu</th><th>Fri</th><th>Sat</th><th>Sun</th></tr></thead><tbody><tr>",
    );
    let first = tz.local_date(start);
    let last = tz.local_date(end - Duration::seconds(1));
    let lead = first.weekday().num_days_from_monday();
    for _ in 0..lead {
        body.push_str("<td class=\"blank\"></td>");
    }
    let today = tz.local_date(Utc::now());
    let mut day: NaiveDate = first;
    let mut column = lead;
    while day <= last {
        if column == 7 {
            body.push_str("</tr><tr>");
            column = 0;
        }
        let day_start = tz.start_of_day(day).unwrap_or(start);
        let day_end = day
            .succ_opt()
            .and_then(|d| tz.start_of_day(d))
            .unwrap_or(end);
        let _ = write!(
            body,
            "<td{}><span class=\"day\">{}</span>",
            if day == today { " class=\"today\"" } else { "" },
            day.day()
        );
        for event in events.iter().filter(|e| occurs_on(e, day_start, day_end)) {
            let when = if event.all_day {
                String::new()
            } else {
                format!("{} ", tz.format_time(event.starts_at))
            };
            let group = event
                .group_name
                .as_deref()
                .map(|g| format!(" <small>({})</small>", escape(g)))
                .unwrap_or_default();
            let delete = if permissions::can_delete_event(&user, event) {
                html::button_form(&format!("/calendar/{}/delete", event.id), "&times;", "link")
            } else {
                String::new()
            };
            let _ = write!(
                body,
                "<div class=\"event\" title=\"{}\">{}{}{}{}</div>",
                escape(&event.description),
                when,
                escape(&event.title),
                group,
                delete
            );
        }
        body.push_str("</td>");
        column += 1;
        let Some(next) = day.succ_opt() else { break };
        day = next;
    }
    for _ in column..7 {
        body.push_str("<td class=\"blank\"></td>");
    }
    body.push_str("</tr></tbody></table>");

    if can_create {
        let group_options: Vec<(String, String)> = groups
            .iter()
            .map(|g| (g.id.to_string(), g.name.clone()))
            .collect();
        let _ = write!(
            body,
            "<h2>Add an event</h2><form class=\"card\" method=\"post\" action=\"/calendar\">\
             <label>Title <input name=\"title\" required></label>\
             <label>Description <textarea name=\"description\" rows=\"2\"></textarea></label>\
             <label>Date <input type=\"date\" name=\"date\" required></label>\
             <label>Until <input type=\"date\" name=\"end_date\"></label>\
             <label>Starts <input type=\"time\" name=\"start_time\"></label>\
             <label>Ends <input type=\"time\" name=\"end_time\"></label>\
             <label><input type=\"checkbox\" name=\"all_day\"> All day</label>\
             <label>For <select name=\"group_id\"><option value=\"\">Whole school</option>{}</select></label>\
             <button type=\"submit\">Add event</button></form>",
            html::options(
                group_options.iter().map(|(v, l)| (v.as_str(), l.as_str())),
                ""
            )
        );
    }
    Ok(html::layout(&title, Some(&user), &flash, &body))
}

// ── Actions ───────────────────────────────────────────────────────────

pub async fn create_event(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Form(fields): Form<Vec<(String, String)>>,
) -> Result<Redirect, ActionError> {
    let back = "/calendar";
    require(
        permissions::can_manage_calendar(&user),
        "Only managers can add calendar events",
    )
    .or_back(back)?;
    let fields = FormFields::new(fields);
    let (starts_at, ends_at, all_day) = event_times(&state.tz, &fields).or_back(back)?;
    let group_id = fields
        .optional("group_id")
        .map(|g| {
            g.parse::<i64>()
                .map_err(|_| AppError::validation("Pick a group from the list"))
        })
        .transpose()
        .or_back(back)?;
    let new = NewEvent {
        title: fields.text("title"),
        description: fields.text("description"),
        starts_at,
        ends_at,
        all_day,
        group_id,
        created_by: user.id,
    };
    let (event, audience) = state
        .db
        .call(move |db| {
            let event = db.create_event(&new)?;
            let audience = db.event_audience(&event)?;
            Ok((event, audience))
        })
        .await
        .or_back(back)?;
    let delivered = publish_change(&state, &audience, &event, false);
    info!(event_id = event.id, delivered, "Calendar event created");

    let (year, month) = state.tz.year_month(event.starts_at);
    Ok(redirect_notice(&calendar_link(year, month), "Event added"))
}

pub async fn delete_event(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(event_id): Path<i64>,
) -> Result<Redirect, ActionError> {
    let back = "/calendar";
    let event = state
        .db
        .call(move |db| db.get_event(event_id))
        .await
        .or_back(back)?
        .ok_or_else(|| AppError::not_found(format!("Event {} not found", event_id)))
        .or_back(back)?;
    require(
        permissions::can_delete_event(&user, &event),
        "Only the event's creator or an admin can remove it",
    )
    .or_back(back)?;
    let audience = {
        let event = event.clone();
        state
            .db
            .call(move |db| {
                let audience = db.event_audience(&event)?;
                db.delete_event(event.id)?;
                Ok(audience)
            })
            .await
            .or_back(back)?
    };
    publish_change(&state, &audience, &event, true);
    info!(event_id, user_id = user.id, "Calendar event removed");

    let (year, month) = state.tz.year_month(event.starts_at);
    Ok(redirect_notice(&calendar_link(year, month), "Event removed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Topic;
    use crate::web::test_support::{TestApp, body_text, form_request, get_request, location};
    use tower::ServiceExt;

    fn fields(query: &str) -> FormFields {
        FormFields::new(serde_urlencoded::from_str(query).unwrap())
    }

    #[test]
    fn test_shift_month_wraps_years() {
        assert_eq!(shift_month(2025, 1, -1), (2024, 12));
        assert_eq!(shift_month(2025, 12, 1), (2026, 1));
        assert_eq!(shift_month(2025, 6, 0), (2025, 6));
    }

    #[test]
    fn test_event_times() {
        let tz = SchoolTz::parse("+01:00").unwrap();
        let (s, e, all_day) =
            event_times(&tz, &fields("date=2025-03-10&start_time=09:00&end_time=10:30")).unwrap();
        assert!(!all_day);
        assert_eq!(s.to_rfc3339(), "2025-03-10T08:00:00+00:00");
        assert_eq!(e.to_rfc3339(), "2025-03-10T09:30:00+00:00");

        let (s, e, all_day) =
            event_times(&tz, &fields("date=2025-03-10&end_date=2025-03-11&all_day=on")).unwrap();
        assert!(all_day);
        assert_eq!(s.to_rfc3339(), "2025-03-09T23:00:00+00:00");
        assert_eq!(e.to_rfc3339(), "2025-03-11T23:00:00+00:00");

        let (s, e, _) = event_times(&tz, &fields("date=2025-03-10&start_time=14:00")).unwrap();
        assert_eq!(e - s, Duration::hours(1));

        assert!(event_times(&tz, &fields("date=2025-03-10")).is_err());
        assert!(event_times(&tz, &fields("start_time=09:00")).is_err());
    }

    #[test]
    fn test_all_day_event_stays_on_its_day() {
        let tz = SchoolTz::default();
        let (starts_at, ends_at, _) =
            event_times(&tz, &fields("date=2025-03-10&all_day=on")).unwrap();
        let event = CalendarEvent {
            id: 1,
            title: "INSET".into(),
            description: String::new(),
            starts_at,
            ends_at,
            all_day: true,
            group_id: None,
            group_name: None,
            created_by: 1,
            created_at: Utc::now(),
        };
        let day = |d: u32| {
            let date = NaiveDate::from_ymd_opt(2025, 3, d).unwrap();
            (
                tz.start_of_day(date).unwrap(),
                tz.start_of_day(date.succ_opt().unwrap()).unwrap(),
            )
        };
        let (s, e) = day(10);
        assert!(occurs_on(&event, s, e));
        let (s, e) = day(11);
        assert!(!occurs_on(&event, s, e));
    }

    #[tokio::test]
    async fn test_create_event_publishes_to_audience() {
        let app = TestApp::new();
        let boss = app.user("boss", Role::Manager);
        let amy = app.user("amy", Role::Staff);
        let mut feed = app.state.broker.subscribe(Topic::User(amy.id));

        let resp = app
            .router()
            .oneshot(form_request(
                "/calendar",
                Some(&app.cookie(&boss)),
                "title=Sports+day&date=2025-06-20&all_day=on&group_id=",
            ))
            .await
            .unwrap();
        assert_eq!(location(&resp), "/calendar?year=2025&month=6&notice=Event+added");
        assert!(matches!(
            feed.try_recv(),
            Some(LiveEvent::CalendarChanged { removed: false, .. })
        ));

        let resp = app
            .router()
            .oneshot(get_request("/calendar?year=2025&month=6", Some(&app.cookie(&amy))))
            .await
            .unwrap();
        let page = body_text(resp).await;
        assert!(page.contains("June 2025"));
        assert!(page.contains("Sports day"));
        assert!(!page.contains("Add an event"));
    }

    #[tokio::test]
    async fn test_create_event_rejects_unknown_group_value() {
        let app = TestApp::new();
        let boss = app.user("boss", Role::Manager);
        let resp = app
            .router()
            .oneshot(form_request(
                "/calendar",
                Some(&app.cookie(&boss)),
                "title=Sports+day&date=2025-06-20&all_day=on&group_id=year-9",
            ))
            .await
            .unwrap();
        assert_eq!(location(&resp), "/calendar?error=Pick+a+group+from+the+list");
        let june = app
            .db()
            .events_between(
                boss.id,
                true,
                "2025-06-01T00:00:00Z".parse().unwrap(),
                "2025-07-01T00:00:00Z".parse().unwrap(),
            )
            .unwrap();
        assert!(june.is_empty());
    }

    #[tokio::test]
    async fn test_staff_cannot_create_events() {
        let app = TestApp::new();
        let amy = app.user("amy", Role::Staff);
        let resp = app
            .router()
            .oneshot(form_request(
                "/calendar",
                Some(&app.cookie(&amy)),
                "title=Party&date=2025-06-20&all_day=on",
            ))
            .await
            .unwrap();
        assert!(location(&resp).starts_with("/?error="));
    }

    #[tokio::test]
    async fn test_delete_event() {
        let app = TestApp::new();
        let boss = app.user("boss", Role::Manager);
        let (starts_at, ends_at, _) =
            event_times(&SchoolTz::default(), &fields("date=2025-05-01&start_time=10:00")).unwrap();
        let event = app
            .db()
            .create_event(&NewEvent {
                title: "Fire drill".into(),
                description: String::new(),
                starts_at,
                ends_at,
                all_day: false,
                group_id: None,
                created_by: boss.id,
            })
            .unwrap();
        let resp = app
            .router()
            .oneshot(form_request(
                &format!("/calendar/{}/delete", event.id),
                Some(&app.cookie(&boss)),
                "",
            ))
            .await
            .unwrap();
        assert_eq!(location(&resp), "/calendar?year=2025&month=5&notice=Event+removed");
        assert!(app.db().get_event(event.id).unwrap().is_none());
    }
}
