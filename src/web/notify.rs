//! Fan-out after a successful write: stored notifications plus live events
//! on the recipients' feeds.
//!
//! These run after the main change has committed, so failures are logged
//! and never turn a completed action into an error.

use tracing::{debug, warn};

use super::state::AppState;
use crate::broker::{LiveEvent, Topic};
use crate::mentions::parse_mentions;
use crate::models::{NewNotification, NotificationKind, User};

/// Store notifications and push each onto its recipient's feed.
pub async fn deliver(state: &AppState, batch: Vec<NewNotification>) {
    if batch.is_empty() {
        return;
    }
    let stored = match state.db.call(move |db| db.create_notifications(&batch)).await {
        Ok(stored) => stored,
        Err(e) => {
            warn!(error = %e, "Failed to store notifications");
            return;
        }
    };
    for n in stored {
        let delivered = state.broker.publish(
            Topic::User(n.user_id),
            LiveEvent::Notification {
                id: n.id,
                kind: n.kind,
                body: n.body,
                link: n.link,
            },
        );
        debug!(user_id = n.user_id, delivered, "Notification pushed");
    }
}

/// Notify everyone `@mentioned` in `text` except the author. When
/// `audience` is given, only those users are considered.
pub async fn mentions(
    state: &AppState,
    author: &User,
    text: &str,
    link: &str,
    place: &str,
    audience: Option<&[i64]>,
) {
    let names = parse_mentions(text);
    if names.is_empty() {
        return;
    }
    let users = match state
        .db
        .call(move |db| db.active_users_by_username(&names))
        .await
    {
        Ok(users) => users,
        Err(e) => {
            warn!(error = %e, "Failed to resolve mentions");
            return;
        }
    };
    let batch = users
        .into_iter()
        .filter(|u| u.id != author.id)
        .filter(|u| audience.is_none_or(|ids| ids.contains(&u.id)))
        .map(|u| NewNotification {
            user_id: u.id,
            kind: NotificationKind::Mention,
            body: format!("{} mentioned you in {}", author.display_name, place),
            link: link.to_string(),
        })
        .collect();
    deliver(state, batch).await;
}

/// One notification of `kind` per recipient, all with the same text.
pub async fn notify_users(
    state: &AppState,
    user_ids: &[i64],
    kind: NotificationKind,
    body: &str,
    link: &str,
) {
    let batch = user_ids
        .iter()
        .map(|&user_id| NewNotification {
            user_id,
            kind,
            body: body.to_string(),
            link: link.to_string(),
        })
        .collect();
    deliver(state, batch).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use crate::web::test_support::TestApp;

    #[tokio::test]
    async fn test_mentions_notify_and_push() {
        let app = TestApp::new();
        let amy = app.user("amy", Role::Staff);
        let ben = app.user("ben", Role::Staff);
        let mut feed = app.state.broker.subscribe(Topic::User(ben.id));

        mentions(&app.state, &amy, "@ben @amy @ghost look", "/board/1", "a post", None).await;

        assert_eq!(app.db().unread_notification_count(ben.id).unwrap(), 1);
        assert_eq!(app.db().unread_notification_count(amy.id).unwrap(), 0);
        match feed.try_recv() {
            Some(LiveEvent::Notification { kind, link, .. }) => {
                assert_eq!(kind, NotificationKind::Mention);
                assert_eq!(link, "/board/1");
            }
            other => panic!("Expected notification, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mentions_respect_audience() {
        let app = TestApp::new();
        let amy = app.user("amy", Role::Staff);
        let ben = app.user("ben", Role::Staff);
        let cat = app.user("cat", Role::Staff);

        mentions(&app.state, &amy, "@ben @cat", "/chat/1", "a chat", Some(&[amy.id, ben.id])).await;

        assert_eq!(app.db().unread_notification_count(ben.id).unwrap(), 1);
        assert_eq!(app.db().unread_notification_count(cat.id).unwrap(), 0);
    }
}
