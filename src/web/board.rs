//! Discussion board: posts, comments, pinning.

use std::fmt::Write as _;

use axum::extract::{Form, Path, Query, State};
use axum::response::{Html, Redirect};
use chrono::Utc;
use serde::Deserialize;
use tracing::info;

use super::attachments::remove_files;
use super::auth::CurrentUser;
use super::html::{self, Flash, escape, text_block, user_name};
use super::notify;
use super::respond::{ActionError, OrBack, PageError, redirect_notice};
use super::state::SharedState;
use crate::errors::AppError;
use crate::models::OwnerKind;
use crate::permissions::{self, require};
use crate::timefmt::format_relative;

#[derive(Debug, Default, Deserialize)]
pub struct BoardQuery {
    pub page: Option<u32>,
}

pub async fn board_page(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Query(query): Query<BoardQuery>,
    Query(flash): Query<Flash>,
) -> Result<Html<String>, PageError> {
    let page = state.page(query.page);
    let posts = state.db.call(move |db| db.list_posts(page)).await?;

    let now = Utc::now();
    let mut body = String::from("<p><a class=\"button\" href=\"/board/new\">New post</a></p>");
    if posts.items.is_empty() {
        body.push_str("<p class=\"empty\">Nothing has been posted yet.</p>");
    }
    body.push_str("<ul class=\"posts\">");
    for post in &posts.items {
        let _ = write!(
            body,
            "<li{}><a href=\"/board/{}\">{}</a>{}<br><small>{} &middot; {} comments &middot; {}</small></li>",
            if post.pinned { " class=\"pinned\"" } else { "" },
            post.id,
            escape(&post.title),
            if post.pinned { " <span class=\"badge\">Pinned</span>" } else { "" },
            user_name(&post.author),
            post.comment_count,
            format_relative(&state.tz, post.updated_at, now)
        );
    }
    body.push_str("</ul>");
    body.push_str(&html::pager("/board", &posts));
    Ok(html::layout("Discussion board", Some(&user), &flash, &body))
}

pub async fn new_post_page(
    CurrentUser(user): CurrentUser,
    Query(flash): Query<Flash>,
) -> Html<String> {
    html::layout(
        "New post",
        Some(&user),
        &flash,
        "<form class=\"card\" method=\"post\" action=\"/board\">\
         <label>Title <input name=\"title\" required maxlength=\"200\"></label>\
         <label>Post <textarea name=\"body\" rows=\"8\" required data-mentions></textarea></label>\
         <button type=\"submit\">Publish</button></form>",
    )
}

#[derive(Debug, Deserialize)]
pub struct PostForm {
    pub title: String,
    pub body: String,
}

pub async fn create_post(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Form(form): Form<PostForm>,
) -> Result<Redirect, ActionError> {
    let back = "/board/new";
    let author = user.id;
    let post = state
        .db
        .call(move |db| db.create_post(author, &form.title, &form.body))
        .await
        .or_back(back)?;
    info!(post_id = post.id, "Post published");
    let link = format!("/board/{}", post.id);
    notify::mentions(&state, &user, &post.body, &link, "a board post", None).await;
    Ok(redirect_notice(&link, "Post published"))
}

pub async fn post_page(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(post_id): Path<i64>,
    Query(flash): Query<Flash>,
) -> Result<Html<String>, PageError> {
    let (post, comments, files) = state
        .db
        .call(move |db| {
            let post = db
                .get_post(post_id)?
                .ok_or_else(|| AppError::not_found(format!("Post {} not found", post_id)))?;
            Ok((
                post,
                db.list_comments(post_id)?,
                db.attachments_for(OwnerKind::Post, post_id)?,
            ))
        })
        .await?;

    let mut body = format!(
        "<p class=\"meta\">{} &middot; {}</p><div class=\"post\">{}</div>{}",
        user_name(&post.author),
        state.tz.format_datetime(post.created_at),
        text_block(&post.body),
        html::attachment_list(&files)
    );
    body.push_str("<p class=\"actions\">");
    if post.author.id == user.id {
        body.push_str(&html::upload_form(OwnerKind::Post, post.id));
    }
    if permissions::can_pin_posts(&user) {
        body.push_str(&html::button_form(
            &format!("/board/{}/pin", post.id),
            if post.pinned { "Unpin" } else { "Pin" },
            "",
        ));
    }
    if permissions::can_delete_discussion(&user, post.author.id) {
        body.push_str(&html::button_form(
            &format!("/board/{}/delete", post.id),
            "Delete post",
            "danger",
        ));
    }
    body.push_str("</p>");

    let _ = write!(body, "<h2>Comments ({})</h2><ul class=\"comments\">", comments.len());
    for c in &comments {
        let delete = if permissions::can_delete_discussion(&user, c.author.id) {
            html::button_form(
                &format!("/board/{}/comments/{}/delete", post.id, c.id),
                "Delete",
                "link",
            )
        } else {
            String::new()
        };
        let _ = write!(
            body,
            "<li id=\"c{}\"><small>{} &middot; {}</small> {}<p>{}</p></li>",
            c.id,
            user_name(&c.author),
            state.tz.format_datetime(c.created_at),
            delete,
            text_block(&c.body)
        );
    }
    let _ = write!(
        body,
        "</ul><form method=\"post\" action=\"/board/{}/comments\">\
         <textarea name=\"body\" rows=\"3\" required data-mentions></textarea>\
         <button type=\"submit\">Comment</button></form>",
        post.id
    );
    Ok(html::layout(&post.title, Some(&user), &flash, &body))
}

#[derive(Debug, Deserialize)]
pub struct CommentForm {
    pub body: String,
}

pub async fn add_comment(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(post_id): Path<i64>,
    Form(form): Form<CommentForm>,
) -> Result<Redirect, ActionError> {
    let back = format!("/board/{}", post_id);
    let author = user.id;
    let comment = state
        .db
        .call(move |db| db.add_comment(post_id, author, &form.body))
        .await
        .or_back(&back)?;
    notify::mentions(&state, &user, &comment.body, &back, "a comment", None).await;
    Ok(Redirect::to(&format!("{}#c{}", back, comment.id)))
}

pub async fn delete_post(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(post_id): Path<i64>,
) -> Result<Redirect, ActionError> {
    let back = format!("/board/{}", post_id);
    let post = state
        .db
        .call(move |db| db.get_post(post_id))
        .await
        .or_back(&back)?
        .ok_or_else(|| AppError::not_found(format!("Post {} not found", post_id)))
        .or_back("/board")?;
    require(
        permissions::can_delete_discussion(&user, post.author.id),
        "Only the author or an admin can delete this post",
    )
    .or_back(&back)?;
    let stored = state
        .db
        .call(move |db| db.delete_post(post_id))
        .await
        .or_back(&back)?
        .ok_or_else(|| AppError::not_found(format!("Post {} not found", post_id)))
        .or_back("/board")?;
    remove_files(&state, stored).await;
    info!(post_id, user_id = user.id, "Post deleted");
    Ok(redirect_notice("/board", "Post deleted"))
}

pub async fn delete_comment(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path((post_id, comment_id)): Path<(i64, i64)>,
) -> Result<Redirect, ActionError> {
    let back = format!("/board/{}", post_id);
    let comment = state
        .db
        .call(move |db| db.get_comment(comment_id))
        .await
        .or_back(&back)?
        .filter(|c| c.post_id == post_id)
        .ok_or_else(|| AppError::not_found("That comment no longer exists"))
        .or_back(&back)?;
    require(
        permissions::can_delete_discussion(&user, comment.author.id),
        "Only the author or an admin can delete this comment",
    )
    .or_back(&back)?;
    state
        .db
        .call(move |db| db.delete_comment(comment_id))
        .await
        .or_back(&back)?;
    Ok(redirect_notice(&back, "Comment deleted"))
}

pub async fn toggle_pin(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(post_id): Path<i64>,
) -> Result<Redirect, ActionError> {
    let back = format!("/board/{}", post_id);
    require(
        permissions::can_pin_posts(&user),
        "Only managers can pin posts",
    )
    .or_back(&back)?;
    let post = state
        .db
        .call(move |db| {
            let post = db
                .get_post(post_id)?
                .ok_or_else(|| AppError::not_found(format!("Post {} not found", post_id)))?;
            db.set_post_pinned(post_id, !post.pinned)
        })
        .await
        .or_back(&back)?;
    let notice = if post.pinned { "Post pinned" } else { "Post unpinned" };
    Ok(redirect_notice(&back, notice))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use crate::web::test_support::{TestApp, body_text, form_request, get_request, location};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_publish_comment_and_mention() {
        let app = TestApp::new();
        let amy = app.user("amy", Role::Staff);
        let ben = app.user("ben", Role::Staff);

        let resp = app
            .router()
            .oneshot(form_request(
                "/board",
                Some(&app.cookie(&amy)),
                "title=Book+club&body=Anyone%3F+%40ben",
            ))
            .await
            .unwrap();
        let post_uri = location(&resp);
        assert!(post_uri.ends_with("?notice=Post+published"));
        assert_eq!(app.db().unread_notification_count(ben.id).unwrap(), 1);

        let post_path = post_uri.split('?').next().unwrap().to_string();
        let resp = app
            .router()
            .oneshot(form_request(
                &format!("{}/comments", post_path),
                Some(&app.cookie(&ben)),
                "body=Count+me+in",
            ))
            .await
            .unwrap();
        assert!(location(&resp).contains("#c"));

        let resp = app
            .router()
            .oneshot(get_request(&post_path, Some(&app.cookie(&amy))))
            .await
            .unwrap();
        let page = body_text(resp).await;
        assert!(page.contains("Count me in"));
        assert!(page.contains("Comments (1)"));
    }

    #[tokio::test]
    async fn test_only_author_or_admin_deletes() {
        let app = TestApp::new();
        let amy = app.user("amy", Role::Staff);
        let ben = app.user("ben", Role::Manager);
        let root = app.user("root", Role::Admin);
        let post = app.db().create_post(amy.id, "Lost", "Umbrella").unwrap();
        let uri = format!("/board/{}/delete", post.id);

        let resp = app.router().oneshot(form_request(&uri, Some(&app.cookie(&ben)), "")).await.unwrap();
        assert!(location(&resp).starts_with("/?error="));
        assert!(app.db().get_post(post.id).unwrap().is_some());

        let resp = app.router().oneshot(form_request(&uri, Some(&app.cookie(&root)), "")).await.unwrap();
        assert_eq!(location(&resp), "/board?notice=Post+deleted");
        assert!(app.db().get_post(post.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pin_requires_manager() {
        let app = TestApp::new();
        let amy = app.user("amy", Role::Staff);
        let boss = app.user("boss", Role::Manager);
        let post = app.db().create_post(amy.id, "Rota", "See attached").unwrap();
        let uri = format!("/board/{}/pin", post.id);

        let resp = app.router().oneshot(form_request(&uri, Some(&app.cookie(&amy)), "")).await.unwrap();
        assert!(location(&resp).starts_with("/?error="));

        let resp = app.router().oneshot(form_request(&uri, Some(&app.cookie(&boss)), "")).await.unwrap();
        assert!(location(&resp).ends_with("notice=Post+pinned"));
        assert!(app.db().get_post(post.id).unwrap().unwrap().pinned);
    }

    #[tokio::test]
    async fn test_comment_delete_by_author() {
        let app = TestApp::new();
        let amy = app.user("amy", Role::Staff);
        let ben = app.user("ben", Role::Staff);
        let post = app.db().create_post(amy.id, "Q", "?").unwrap();
        let comment = app.db().add_comment(post.id, ben.id, "A").unwrap();
        let uri = format!("/board/{}/comments/{}/delete", post.id, comment.id);

        let resp = app.router().oneshot(form_request(&uri, Some(&app.cookie(&amy)), "")).await.unwrap();
        assert!(location(&resp).starts_with("/?error="));

        let resp = app.router().oneshot(form_request(&uri, Some(&app.cookie(&ben)), "")).await.unwrap();
        assert!(location(&resp).ends_with("notice=Comment+deleted"));
        assert!(app.db().list_comments(post.id).unwrap().is_empty());
    }
}
