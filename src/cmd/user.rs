//! Account bootstrap — `schoolhub user`.

use anyhow::{Context, Result, anyhow};

use schoolhub::config::AppConfig;
use schoolhub::db::{NewUser, SchoolDb};
use schoolhub::models::Role;
use schoolhub::passwords;

use super::super::UserCommands;

pub async fn cmd_user(config: &AppConfig, command: UserCommands) -> Result<()> {
    let db = SchoolDb::new(&config.database.path).context("Failed to open database")?;

    match command {
        UserCommands::Add {
            username,
            role,
            display_name,
            email,
            password,
        } => {
            let role: Role = role.parse().map_err(|e: String| anyhow!(e))?;
            let password_hash = hash(password).await?;
            let user = db.create_user(&NewUser {
                display_name: display_name.unwrap_or_else(|| username.clone()),
                username,
                email,
                role,
                password_hash,
            })?;
            tracing::info!(user_id = user.id, username = %user.username, role = %user.role, "User created from CLI");
            println!("Created {} ({}) with id {}", user.username, user.role.label(), user.id);
        }
        UserCommands::Passwd { username, password } => {
            let user = db
                .find_user_by_username(&username.to_lowercase())?
                .ok_or_else(|| anyhow!("No user named '{}'", username))?;
            let password_hash = hash(password).await?;
            db.set_password_hash(user.id, &password_hash)?;
            println!("Password updated for {}", user.username);
        }
    }

    Ok(())
}

async fn hash(password: String) -> Result<String> {
    let hashed = tokio::task::spawn_blocking(move || passwords::hash_password(&password))
        .await
        .context("Password hashing task failed")?;
    Ok(hashed?)
}
