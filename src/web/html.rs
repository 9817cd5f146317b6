//! Server-rendered HTML: escaping, the page layout and small shared
//! fragments.

use std::fmt::Write as _;

use axum::http::StatusCode;
use axum::response::Html;
use serde::Deserialize;

use crate::models::{Attachment, AssigneeStatus, OwnerKind, Role, User, UserSummary};
use crate::pagination::Paginated;

/// `?error=` / `?notice=` carried by a redirect.
#[derive(Debug, Default, Deserialize)]
pub struct Flash {
    pub error: Option<String>,
    pub notice: Option<String>,
}

pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Escaped user text with line breaks kept.
pub fn text_block(s: &str) -> String {
    escape(s.trim()).replace("\r\n", "\n").replace('\n', "<br>")
}

// ── Layout ────────────────────────────────────────────────────────────

fn nav(user: &User) -> String {
    let mut links = vec![
        ("/", "Dashboard"),
        ("/tasks", "Tasks"),
        ("/chat", "Chat"),
        ("/board", "Board"),
        ("/calendar", "Calendar"),
        ("/requests", "Requests"),
    ];
    if user.role == Role::Admin {
        links.push(("/admin/users", "Users"));
        links.push(("/admin/groups", "Groups"));
    }
    let mut out = String::from("<nav><a class=\"brand\" href=\"/\">schoolhub</a><ul>");
    for (href, label) in links {
        let _ = write!(out, "<li><a href=\"{}\">{}</a></li>", href, label);
    }
    let _ = write!(
        out,
        "<li><a href=\"/notifications\">Notifications <span class=\"badge\" id=\"live-count\" hidden></span></a></li>\
         </ul><form class=\"signout\" method=\"post\" action=\"/logout\">\
         <span>{} &middot; {}</span> <button type=\"submit\">Sign out</button></form></nav>",
        escape(&user.display_name),
        user.role.label()
    );
    out
}

fn flash_html(flash: &Flash) -> String {
    let mut out = String::new();
    if let Some(error) = flash.error.as_deref().filter(|e| !e.is_empty()) {
        let _ = write!(out, "<p class=\"flash error\">{}</p>", escape(error));
    }
    if let Some(notice) = flash.notice.as_deref().filter(|n| !n.is_empty()) {
        let _ = write!(out, "<p class=\"flash notice\">{}</p>", escape(notice));
    }
    out
}

/// Full page. Signed-in pages subscribe to the user's live feed.
pub fn layout(title: &str, user: Option<&User>, flash: &Flash, content: &str) -> Html<String> {
    let (nav_html, body_attrs) = match user {
        Some(user) => (
            nav(user),
            format!(" data-feed=\"/events\" data-user-id=\"{}\"", user.id),
        ),
        None => (String::new(), String::new()),
    };
    Html(format!(
        "<!doctype html>\n<html lang=\"en\"><head><meta charset=\"utf-8\">\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\
         <title>{title} · schoolhub</title>\
         <link rel=\"stylesheet\" href=\"/static/style.css\">\
         <script src=\"/static/live.js\" defer></script></head>\
         <body{body_attrs}>{nav_html}<main><h1>{title}</h1>{flash}{content}</main></body></html>",
        title = escape(title),
        body_attrs = body_attrs,
        nav_html = nav_html,
        flash = flash_html(flash),
        content = content,
    ))
}

pub fn error_page(status: StatusCode, message: &str) -> Html<String> {
    let title = status.canonical_reason().unwrap_or("Error");
    layout(
        title,
        None,
        &Flash::default(),
        &format!(
            "<p>{}</p><p><a href=\"/\">Back to the dashboard</a></p>",
            escape(message)
        ),
    )
}

// ── Fragments ─────────────────────────────────────────────────────────

pub fn status_badge(status: AssigneeStatus) -> String {
    format!(
        "<span class=\"badge status-{}\">{}</span>",
        status.as_str(),
        status.label()
    )
}

pub fn user_name(user: &UserSummary) -> String {
    format!(
        "<span class=\"user\" title=\"@{}\">{}</span>",
        escape(&user.username),
        escape(&user.display_name)
    )
}

/// A checkbox per user; `checked` ids start ticked.
pub fn user_checkboxes(name: &str, users: &[UserSummary], checked: &[i64]) -> String {
    let mut out = String::from("<div class=\"checklist\">");
    for user in users {
        let _ = write!(
            out,
            "<label><input type=\"checkbox\" name=\"{}\" value=\"{}\"{}> {} <small>@{}</small></label>",
            name,
            user.id,
            if checked.contains(&user.id) { " checked" } else { "" },
            escape(&user.display_name),
            escape(&user.username)
        );
    }
    out.push_str("</div>");
    out
}

/// `<option>`s from `(value, label)` pairs.
pub fn options<'a, I>(items: I, selected: &str) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut out = String::new();
    for (value, label) in items {
        let _ = write!(
            out,
            "<option value=\"{}\"{}>{}</option>",
            escape(value),
            if value == selected { " selected" } else { "" },
            escape(label)
        );
    }
    out
}

pub fn human_size(bytes: i64) -> String {
    const KB: f64 = 1024.0;
    let b = bytes as f64;
    if b < KB {
        format!("{} B", bytes)
    } else if b < KB * KB {
        format!("{:.1} KB", b / KB)
    } else {
        format!("{:.1} MB", b / (KB * KB))
    }
}

pub fn attachment_list(attachments: &[Attachment]) -> String {
    if attachments.is_empty() {
        return String::new();
    }
    let mut out = String::from("<ul class=\"attachments\">");
    for a in attachments {
        let _ = write!(
            out,
            "<li><a href=\"/attachments/{}\">{}</a> <small>{}</small></li>",
            a.id,
            escape(&a.file_name),
            human_size(a.size_bytes)
        );
    }
    out.push_str("</ul>");
    out
}

/// Multipart form posting one file to `/attachments`.
pub fn upload_form(owner_kind: OwnerKind, owner_id: i64) -> String {
    format!(
        "<form class=\"upload\" method=\"post\" action=\"/attachments\" enctype=\"multipart/form-data\">\
         <input type=\"hidden\" name=\"owner_kind\" value=\"{}\">\
         <input type=\"hidden\" name=\"owner_id\" value=\"{}\">\
         <input type=\"file\" name=\"file\" required> <button type=\"submit\">Attach</button></form>",
        owner_kind, owner_id
    )
}

/// Previous / next links; `base` may already carry a query string.
pub fn pager<T>(base: &str, page: &Paginated<T>) -> String {
    if page.total_pages() <= 1 {
        return String::new();
    }
    let sep = if base.contains('?') { '&' } else { '?' };
    let mut out = String::from("<p class=\"pager\">");
    if page.has_prev() {
        let _ = write!(out, "<a href=\"{}{}page={}\">&larr; Newer</a> ", base, sep, page.page - 1);
    }
    let _ = write!(out, "Page {} of {}", page.page, page.total_pages());
    if page.has_next() {
        let _ = write!(out, " <a href=\"{}{}page={}\">Older &rarr;</a>", base, sep, page.page + 1);
    }
    out.push_str("</p>");
    out
}

/// A one-button POST form.
pub fn button_form(action: &str, label: &str, class: &str) -> String {
    format!(
        "<form class=\"inline\" method=\"post\" action=\"{}\"><button type=\"submit\" class=\"{}\">{}</button></form>",
        action, class, label
    )
}
