//! Chat threads: list, start, read and post.

use std::fmt::Write as _;

use axum::extract::{Form, Multipart, Path, Query, State};
use axum::response::{Html, Redirect};
use chrono::Utc;
use tracing::info;

use super::attachments::{read_multipart, store_after_commit};
use super::auth::CurrentUser;
use super::forms::FormFields;
use super::html::{self, Flash, escape, text_block, user_name};
use super::notify;
use super::respond::{ActionError, OrBack, PageError, redirect_error};
use super::state::{AppState, SharedState};
use crate::broker::{LiveEvent, Topic};
use crate::errors::AppError;
use crate::models::{Message, OwnerKind, User};
use crate::permissions::{self, require};
use crate::timefmt::format_relative;

/// Messages shown when a thread is opened.
const THREAD_HISTORY: i64 = 100;

/// Push a new message to everyone watching the thread and to the other
/// participants' personal feeds.
fn publish_message(state: &AppState, message: &Message, participants: &[i64]) -> usize {
    let event = LiveEvent::MessagePosted {
        thread_id: message.thread_id,
        message_id: message.id,
        author_id: message.author.id,
        author_name: message.author.display_name.clone(),
        body: message.body.clone(),
        created_at: message.created_at,
        time_label: state.tz.format_time(message.created_at),
    };
    let others: Vec<i64> = participants
        .iter()
        .copied()
        .filter(|&id| id != message.author.id)
        .collect();
    state.broker.publish_to_users(&others, &event)
        + state.broker.publish(Topic::Thread(message.thread_id), event)
}

// ── Thread list ───────────────────────────────────────────────────────

pub async fn chat_page(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Query(flash): Query<Flash>,
) -> Result<Html<String>, PageError> {
    let user_id = user.id;
    let (threads, people) = state
        .db
        .call(move |db| Ok((db.list_threads(user_id)?, db.list_active_users()?)))
        .await?;
    let people: Vec<_> = people.into_iter().filter(|p| p.id != user.id).collect();

    let now = Utc::now();
    let mut body = String::from("<div class=\"columns\"><section><h2>Conversations</h2>");
    if threads.is_empty() {
        body.push_str("<p class=\"empty\">No conversations yet.</p>");
    } else {
        body.push_str("<ul class=\"threads\">");
        for t in &threads {
            let unread = if t.unread > 0 {
                format!(" <span class=\"badge\">{}</span>", t.unread)
            } else {
                String::new()
            };
            let activity = t.thread.last_message_at.unwrap_or(t.thread.created_at);
            let _ = write!(
                body,
                "<li><a href=\"/chat/{}\">{}</a>{}<br><small>{} &middot; {}</small></li>",
                t.thread.id,
                escape(&t.display_title(user.id)),
                unread,
                escape(t.last_message.as_deref().unwrap_or("No messages yet")),
                format_relative(&state.tz, activity, now)
            );
        }
        body.push_str("</ul>");
    }
    let _ = write!(
        body,
        "</section><section><h2>Start a conversation</h2>\
         <form class=\"card\" method=\"post\" action=\"/chat\">\
         <fieldset><legend>With</legend>{}</fieldset>\
         <label>Title <input name=\"title\" placeholder=\"Optional\"></label>\
         <label>Message <textarea name=\"body\" rows=\"3\" data-mentions></textarea></label>\
         <button type=\"submit\">Start</button></form></section></div>",
        html::user_checkboxes("participant", &people, &[])
    );
    Ok(html::layout("Chat", Some(&user), &flash, &body))
}

pub async fn start_thread(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Form(fields): Form<Vec<(String, String)>>,
) -> Result<Redirect, ActionError> {
    let back = "/chat";
    let fields = FormFields::new(fields);
    let participants = fields.ids("participant");
    let title = fields.optional("title");
    let first = fields.optional("body");
    let creator = user.id;
    let (thread, message) = state
        .db
        .call(move |db| {
            db.create_thread(creator, title.as_deref(), &participants, first.as_deref())
        })
        .await
        .or_back(back)?;
    let thread_id = thread.id;
    let members = state
        .db
        .call(move |db| db.participant_ids(thread_id))
        .await
        .or_back(back)?;
    info!(thread_id, participants = members.len(), "Thread started");

    let others: Vec<i64> = members.iter().copied().filter(|&id| id != user.id).collect();
    state.broker.publish_to_users(
        &others,
        &LiveEvent::ThreadCreated {
            thread_id,
            title: thread
                .title
                .clone()
                .unwrap_or_else(|| format!("Conversation with {}", user.display_name)),
        },
    );
    let link = format!("/chat/{}", thread_id);
    if let Some(message) = message {
        notify::mentions(&state, &user, &message.body, &link, "a chat", Some(&members)).await;
    }
    Ok(Redirect::to(&link))
}

// ── Thread ────────────────────────────────────────────────────────────

fn message_item(state: &AppState, message: &Message, files: &str, viewer: &User) -> String {
    let mine = if message.author.id == viewer.id { " mine" } else { "" };
    format!(
        "<li class=\"message{}\" id=\"m{}\"><strong>{}</strong> <time>{}</time><p>{}</p>{}</li>",
        mine,
        message.id,
        user_name(&message.author),
        state.tz.format_datetime(message.created_at),
        text_block(&message.body),
        files
    )
}

pub async fn thread_page(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(thread_id): Path<i64>,
    Query(flash): Query<Flash>,
) -> Result<Html<String>, PageError> {
    let thread = state
        .db
        .call(move |db| db.get_thread(thread_id))
        .await?
        .ok_or_else(|| AppError::not_found(format!("Conversation {} not found", thread_id)))?;
    let participants = state
        .db
        .call(move |db| db.thread_participants(thread_id))
        .await?;
    let ids: Vec<i64> = participants.iter().map(|p| p.id).collect();
    require(
        permissions::can_open_thread(&user, &ids),
        "You are not part of this conversation",
    )?;

    let viewer = user.id;
    let messages = state
        .db
        .call(move |db| {
            let messages = db.list_messages(thread_id, THREAD_HISTORY)?;
            let mut with_files = Vec::with_capacity(messages.len());
            for m in messages {
                let files = db.attachments_for(OwnerKind::Message, m.id)?;
                with_files.push((m, files));
            }
            db.mark_thread_read(thread_id, viewer, Utc::now())?;
            Ok(with_files)
        })
        .await?;

    let title = thread.title.clone().unwrap_or_else(|| {
        participants
            .iter()
            .filter(|p| p.id != user.id)
            .map(|p| p.display_name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    });
    let mut body = format!(
        "<p class=\"meta\">With {}</p><ol class=\"messages\" id=\"messages\" data-thread-feed=\"/chat/{}/events\">",
        participants
            .iter()
            .map(user_name)
            .collect::<Vec<_>>()
            .join(", "),
        thread_id
    );
    for (message, files) in &messages {
        body.push_str(&message_item(&state, message, &html::attachment_list(files), &user));
    }
    let _ = write!(
        body,
        "</ol><form class=\"composer\" method=\"post\" action=\"/chat/{}/messages\" enctype=\"multipart/form-data\">\
         <textarea name=\"body\" rows=\"2\" data-mentions placeholder=\"Write a message\"></textarea>\
         <input type=\"file\" name=\"file\"> <button type=\"submit\">Send</button></form>",
        thread_id
    );
    let title = if title.is_empty() { "Notes to self".to_string() } else { title };
    Ok(html::layout(&title, Some(&user), &flash, &body))
}

pub async fn post_message(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(thread_id): Path<i64>,
    multipart: Multipart,
) -> Result<Redirect, ActionError> {
    let back = format!("/chat/{}", thread_id);
    let form = read_multipart(multipart, state.config.uploads.max_bytes)
        .await
        .or_back(&back)?;
    let mut body = form.text("body").trim().to_string();
    if body.is_empty()
        && let Some(file) = &form.file
    {
        body = format!("Shared a file: {}", file.file_name);
    }

    let author = user.id;
    let message = state
        .db
        .call(move |db| db.post_message(thread_id, author, &body))
        .await
        .or_back(&back)?;
    let file_saved =
        store_after_commit(&state, OwnerKind::Message, message.id, user.id, form.file).await;
    let participants = state
        .db
        .call(move |db| db.participant_ids(thread_id))
        .await
        .or_back(&back)?;
    let delivered = publish_message(&state, &message, &participants);
    info!(thread_id, message_id = message.id, delivered, "Message posted");

    notify::mentions(&state, &user, &message.body, &back, "a chat", Some(&participants)).await;
    let target = format!("{}#m{}", back, message.id);
    if !file_saved {
        return Ok(redirect_error(&target, "Message sent, but the file could not be saved"));
    }
    Ok(Redirect::to(&target))
}
