//! User and group administration. Admins only.

use std::fmt::Write as _;

use axum::extract::{Form, Path, Query, State};
use axum::response::{Html, Redirect};
use tracing::info;

use super::auth::CurrentUser;
use super::forms::FormFields;
use super::html::{self, Flash, escape, user_name};
use super::respond::{ActionError, OrBack, PageError, redirect_notice};
use super::state::SharedState;
use crate::db::{NewUser, UserUpdate};
use crate::errors::{AppError, AppResult};
use crate::models::{Role, User};
use crate::passwords;
use crate::permissions::{self, require};

fn require_admin(user: &User) -> AppResult<()> {
    require(permissions::can_manage_users(user), "Admins only")
}

fn parse_role(value: &str) -> AppResult<Role> {
    value.parse().map_err(AppError::Validation)
}

async fn hash_in_background(password: String) -> AppResult<String> {
    tokio::task::spawn_blocking(move || passwords::hash_password(&password))
        .await
        .map_err(|e| AppError::Other(anyhow::anyhow!("Password hashing task failed: {}", e)))?
}

fn role_options(selected: Role) -> String {
    html::options(
        Role::ALL.iter().map(|r| (r.as_str(), r.label())),
        selected.as_str(),
    )
}

fn user_row(user: &User) -> String {
    format!(
        "<tr id=\"u{id}\" class=\"{class}\"><td>{username}</td><td colspan=\"2\">\
         <form method=\"post\" action=\"/admin/users/{id}\" class=\"inline\">\
         <input name=\"display_name\" value=\"{display}\" required> \
         <input name=\"email\" type=\"email\" value=\"{email}\" placeholder=\"Email\"> \
         <select name=\"role\">{roles}</select> \
         <label><input type=\"checkbox\" name=\"active\"{active}> Active</label> \
         <input name=\"password\" type=\"password\" placeholder=\"New password\" autocomplete=\"new-password\"> \
         <button type=\"submit\">Save</button></form></td></tr>",
        id = user.id,
        class = if user.active { "active" } else { "inactive" },
        username = escape(&user.username),
        display = escape(&user.display_name),
        email = escape(user.email.as_deref().unwrap_or_default()),
        roles = role_options(user.role),
        active = if user.active { " checked" } else { "" },
    )
}

pub async fn users_page(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Query(flash): Query<Flash>,
) -> Result<Html<String>, PageError> {
    require_admin(&user)?;
    let users = state.db.call(|db| db.list_users()).await?;

    let mut body = format!(
        "<form class=\"card\" method=\"post\" action=\"/admin/users\"><h2>Add a user</h2>\
         <label>Username <input name=\"username\" required></label>\
         <label>Display name <input name=\"display_name\" required></label>\
         <label>Email <input name=\"email\" type=\"email\"></label>\
         <label>Role <select name=\"role\">{}</select></label>\
         <label>Password <input name=\"password\" type=\"password\" minlength=\"{}\" required></label>\
         <button type=\"submit\">Create user</button></form>",
        role_options(Role::Staff),
        passwords::MIN_PASSWORD_LEN
    );
    body.push_str("<table class=\"users\"><thead><tr><th>Username</th><th colspan=\"2\">Details</th></tr></thead><tbody>");
    for u in &users {
        body.push_str(&user_row(u));
    }
    body.push_str("</tbody></table>");
    Ok(html::layout("Users", Some(&user), &flash, &body))
}

pub async fn create_user(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Form(fields): Form<Vec<(String, String)>>,
) -> Result<Redirect, ActionError> {
    let back = "/admin/users";
    require_admin(&user).or_back(back)?;
    let fields = FormFields::new(fields);
    let role = parse_role(&fields.text("role")).or_back(back)?;
    let password_hash = hash_in_background(fields.text("password")).await.or_back(back)?;
    let new = NewUser {
        username: fields.text("username"),
        display_name: fields.text("display_name"),
        email: fields.optional("email"),
        role,
        password_hash,
    };
    let created = state
        .db
        .call(move |db| db.create_user(&new))
        .await
        .or_back(back)?;
    info!(user_id = created.id, username = %created.username, role = %created.role, by = user.id, "User created");
    Ok(redirect_notice(back, &format!("Created {}", created.username)))
}

pub async fn update_user(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(user_id): Path<i64>,
    Form(fields): Form<Vec<(String, String)>>,
) -> Result<Redirect, ActionError> {
    let back = format!("/admin/users#u{}", user_id);
    require_admin(&user).or_back(&back)?;
    let fields = FormFields::new(fields);
    let role = parse_role(&fields.text("role")).or_back(&back)?;
    let password_hash = match fields.optional("password") {
        Some(password) => Some(hash_in_background(password).await.or_back(&back)?),
        None => None,
    };
    let update = UserUpdate {
        display_name: Some(fields.text("display_name")),
        email: Some(fields.optional("email")),
        role: Some(role),
        active: Some(fields.checked("active")),
    };
    let updated = state
        .db
        .call(move |db| {
            let updated = db.update_user(user_id, &update)?;
            if let Some(hash) = &password_hash {
                db.set_password_hash(user_id, hash)?;
            }
            Ok(updated)
        })
        .await
        .or_back(&back)?;
    info!(user_id, role = %updated.role, active = updated.active, by = user.id, "User updated");
    Ok(redirect_notice(&back, "User saved"))
}

pub async fn groups_page(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Query(flash): Query<Flash>,
) -> Result<Html<String>, PageError> {
    require_admin(&user)?;
    let (groups, users) = state
        .db
        .call(|db| {
            let mut details = Vec::new();
            for group in db.list_groups()? {
                if let Some(detail) = db.get_group_detail(group.id)? {
                    details.push(detail);
                }
            }
            Ok((details, db.list_active_users()?))
        })
        .await?;

    let user_options = html::options(
        users
            .iter()
            .map(|u| (u.username.as_str(), u.display_name.as_str()))
            .collect::<Vec<_>>(),
        "",
    );
    let mut body = String::from(
        "<form class=\"card\" method=\"post\" action=\"/admin/groups\"><h2>New group</h2>\
         <label>Name <input name=\"name\" required></label>\
         <label>Description <input name=\"description\"></label>\
         <button type=\"submit\">Create group</button></form>",
    );
    if groups.is_empty() {
        body.push_str("<p class=\"empty\">No groups yet.</p>");
    }
    for detail in &groups {
        let g = &detail.group;
        let _ = write!(
            body,
            "<section class=\"card\" id=\"g{}\"><h2>{} <small>{} members</small></h2><p>{}</p><ul>",
            g.id,
            escape(&g.name),
            g.member_count,
            escape(&g.description)
        );
        for member in &detail.members {
            let _ = write!(
                body,
                "<li>{} {}</li>",
                user_name(member),
                html::button_form(
                    &format!("/admin/groups/{}/members/{}/remove", g.id, member.id),
                    "Remove",
                    "link"
                )
            );
        }
        let _ = write!(
            body,
            "</ul><form method=\"post\" action=\"/admin/groups/{}/members\" class=\"inline\">\
             <select name=\"username\">{}</select> <button type=\"submit\">Add member</button></form></section>",
            g.id, user_options
        );
    }
    Ok(html::layout("Groups", Some(&user), &flash, &body))
}

pub async fn create_group(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Form(fields): Form<Vec<(String, String)>>,
) -> Result<Redirect, ActionError> {
    let back = "/admin/groups";
    require_admin(&user).or_back(back)?;
    let fields = FormFields::new(fields);
    let (name, description) = (fields.text("name"), fields.text("description"));
    let group = state
        .db
        .call(move |db| db.create_group(&name, &description))
        .await
        .or_back(back)?;
    info!(group_id = group.id, name = %group.name, "Group created");
    Ok(redirect_notice(&format!("{}#g{}", back, group.id), "Group created"))
}

/// Add a member by `user_id` or `username`.
pub async fn add_member(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(group_id): Path<i64>,
    Form(fields): Form<Vec<(String, String)>>,
) -> Result<Redirect, ActionError> {
    let back = format!("/admin/groups#g{}", group_id);
    require_admin(&user).or_back(&back)?;
    let fields = FormFields::new(fields);
    let by_id = fields.ids("user_id").first().copied();
    let username = fields.optional("username");
    let member_id = state
        .db
        .call(move |db| {
            let member = match (by_id, username) {
                (Some(id), _) => db.get_user(id)?,
                (None, Some(name)) => db.find_user_by_username(&name.to_lowercase())?,
                (None, None) => return Err(AppError::validation("Pick a user to add").into()),
            };
            let member = member
                .filter(|m| m.active)
                .ok_or_else(|| AppError::not_found("No such active user"))?;
            db.add_group_member(group_id, member.id)?;
            Ok(member.id)
        })
        .await
        .or_back(&back)?;
    info!(group_id, user_id = member_id, "Group member added");
    Ok(redirect_notice(&back, "Member added"))
}

pub async fn remove_member(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path((group_id, member_id)): Path<(i64, i64)>,
) -> Result<Redirect, ActionError> {
    let back = format!("/admin/groups#g{}", group_id);
    require_admin(&user).or_back(&back)?;
    let removed = state
        .db
        .call(move |db| db.remove_group_member(group_id, member_id))
        .await
        .or_back(&back)?;
    if !removed {
        return Err(ActionError::new(
            back,
            AppError::not_found("That user is not in the group"),
        ));
    }
    info!(group_id, user_id = member_id, "Group member removed");
    Ok(redirect_notice(&back, "Member removed"))
}
