//! Configuration view and scaffolding — `schoolhub config`.

use std::path::Path;

use anyhow::Result;

use schoolhub::config::AppConfig;

use super::super::ConfigCommands;

pub fn cmd_config(config_path: &Path, config: &AppConfig, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No config file at {}; using defaults.", config_path.display());
            }
            println!("Effective values (with env overrides):");
            println!();
            print!("{}", config.to_toml()?);

            let warnings = config.validate();
            if !warnings.is_empty() {
                println!();
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("{} already exists.", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }
            AppConfig::default().save(config_path)?;
            println!("Created {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [server] host, port");
            println!("  - [database] path and [uploads] dir, max_bytes");
            println!("  - [display] timezone (e.g. \"+01:00\"), page_size");
            println!();
        }
    }

    Ok(())
}
