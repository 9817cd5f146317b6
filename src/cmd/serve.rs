//! Web server and database bootstrap — `schoolhub serve`, `schoolhub init`.

use anyhow::{Context, Result};

use schoolhub::config::AppConfig;
use schoolhub::db::SchoolDb;

pub async fn cmd_serve(config: AppConfig, open: bool) -> Result<()> {
    schoolhub::web::start_server(config, open).await
}

pub fn cmd_init(config: &AppConfig) -> Result<()> {
    let db = SchoolDb::new(&config.database.path).context("Failed to initialize database")?;
    std::fs::create_dir_all(&config.uploads.dir)
        .with_context(|| format!("Failed to create {}", config.uploads.dir.display()))?;
    let users = db.count_users()?;

    println!("Database ready at {}", config.database.path.display());
    println!("Uploads stored in {}", config.uploads.dir.display());
    if users == 0 {
        println!();
        println!("No accounts yet. Create the first administrator with:");
        println!("  schoolhub user add <username> --role admin --password <password>");
    }
    Ok(())
}
