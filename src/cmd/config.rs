//! Configuration commands for `dealflow init` and `dealflow config`.

use anyhow::{Context, Result};
use dialoguer::Confirm;
use std::path::Path;

use dealflow::config::{CONFIG_DIR, CONFIG_FILE, DealflowToml};

use super::super::{Cli, ConfigCommands};
use super::{load_config, open_database};

/// Write a default dealflow.toml. Returns false when the user declined to
/// overwrite an existing file.
fn write_default_config(config_path: &Path, force: bool) -> Result<bool> {
    if config_path.exists() && !force {
        let confirm = Confirm::new()
            .with_prompt(format!("{} already exists. Overwrite?", config_path.display()))
            .default(false)
            .interact()
            .unwrap_or(false);

        if !confirm {
            println!("Kept existing {}", config_path.display());
            return Ok(false);
        }
    }

    DealflowToml::default().save(config_path)?;
    println!("Created {}", config_path.display());
    Ok(true)
}

pub fn cmd_init(project_dir: &Path, force: bool) -> Result<()> {
    let config_path = project_dir.join(CONFIG_DIR).join(CONFIG_FILE);
    write_default_config(&config_path, force)?;

    let config = load_config(project_dir)?;
    open_database(project_dir, &config)?;
    println!(
        "Database ready at {}",
        super::resolve_db_path(project_dir, &config.server.db_path).display()
    );
    println!();
    println!("Next steps:");
    println!("  dealflow stages seed --team <id>");
    println!("  dealflow serve");
    Ok(())
}

pub fn cmd_config(project_dir: &Path, cli: &Cli, command: Option<ConfigCommands>) -> Result<()> {
    let config_dir = project_dir.join(CONFIG_DIR);
    let config_path = config_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Dealflow Configuration");
            println!("======================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No dealflow.toml found at {}; using defaults.", config_path.display());
            }
            println!();

            let effective = load_config(project_dir)?;
            let rendered = toml::to_string_pretty(&effective.redacted())
                .context("Failed to render configuration")?;
            println!("Effective values (with env overrides):");
            println!();
            println!("{}", rendered);
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let config = load_config(project_dir)?;
            let warnings = config.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init { force }) => {
            if write_default_config(&config_path, force || cli.yes)? {
                println!();
                println!("You can now customize:");
                println!("  - [server] port, db_path, dev_mode");
                println!("  - [calendar] token, user_uri");
                println!("  - [copilot] endpoint, api_key, model");
                println!("  - [logging] level, json, file");
                println!();
            }
        }
    }

    Ok(())
}
