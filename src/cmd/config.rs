//! Configuration view and validation commands: `recyconnect config`.

use anyhow::{Context, Result};

use super::super::ConfigCommands;
use recyconnect::config::AppConfig;

pub fn cmd_config(
    config_path: &std::path::Path,
    config: &AppConfig,
    command: Option<ConfigCommands>,
) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("RecyConnect Configuration");
            println!("=========================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No {} found; showing defaults.", config_path.display());
            }
            println!("Effective values (with env overrides):");
            println!();
            print!("{}", config.to_toml()?);
            println!();
            let superuser = if config.accounts.superuser_password.is_some() {
                "set"
            } else {
                "not set"
            };
            println!("Superuser password: {}", superuser);
        }
        Some(ConfigCommands::Validate) => {
            let problems = config.validate();
            if problems.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for problem in problems {
                    println!("  - {}", problem);
                }
            }
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("{} already exists.", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }
            let rendered = AppConfig::default().to_toml()?;
            std::fs::write(config_path, rendered)
                .with_context(|| format!("Failed to write {}", config_path.display()))?;
            println!("Created {}", config_path.display());
        }
    }
    Ok(())
}
