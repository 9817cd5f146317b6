//! Server-sent event feeds backed by broker subscriptions.
//!
//! Each open connection owns one [`Subscription`]. When the client goes
//! away axum drops the stream, the subscription with it, and the broker
//! forgets the subscriber.

use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream;
use tracing::debug;

use super::auth::CurrentUser;
use super::respond::PageError;
use super::state::SharedState;
use crate::broker::{Subscription, Topic};
use crate::permissions::{self, require};

fn feed(
    sub: Subscription,
    heartbeat_secs: u64,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, axum::Error>>> {
    debug!(topic = %sub.topic(), "Feed opened");
    let events = stream::unfold(sub, |mut sub| async move {
        let event = sub.recv().await?;
        let frame = Event::default().event(event.kind()).json_data(&event);
        Some((frame, sub))
    });
    Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(heartbeat_secs.max(1)))
            .text("heartbeat"),
    )
}

/// `GET /events`: everything addressed to the signed-in user.
pub async fn user_feed(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, axum::Error>>> {
    let sub = state.broker.subscribe(Topic::User(user.id));
    feed(sub, state.config.live.heartbeat_secs)
}

/// `GET /chat/{id}/events`: messages posted to one thread.
pub async fn thread_feed(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(thread_id): Path<i64>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, axum::Error>>>, PageError> {
    let participants = state
        .db
        .call(move |db| db.participant_ids(thread_id))
        .await?;
    require(
        permissions::can_open_thread(&user, &participants),
        "You are not part of this conversation",
    )?;
    let sub = state.broker.subscribe(Topic::Thread(thread_id));
    Ok(feed(sub, state.config.live.heartbeat_secs))
}
