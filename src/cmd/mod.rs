//! CLI command implementations.
//!
//! | Module    | Commands handled          |
//! |-----------|---------------------------|
//! | `serve`   | `Serve`                   |
//! | `config`  | `Init`, `Config`          |
//! | `stages`  | `Stages`                  |
//! | `stats`   | `Stats`                   |

pub mod config;
pub mod serve;
pub mod stages;
pub mod stats;

pub use config::{cmd_config, cmd_init};
pub use serve::cmd_serve;
pub use stages::cmd_stages;
pub use stats::cmd_stats;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use dealflow::config::{CONFIG_DIR, DealflowToml};
use dealflow::db::Database;

/// File config with `DEALFLOW_*` environment overrides applied.
pub fn load_config(project_dir: &Path) -> Result<DealflowToml> {
    let mut config = DealflowToml::load_or_default(&project_dir.join(CONFIG_DIR))?;
    config.apply_process_env(project_dir)?;
    Ok(config)
}

/// Database path, relative paths resolved against the project directory.
pub fn resolve_db_path(project_dir: &Path, db_path: &Path) -> PathBuf {
    if db_path.is_absolute() {
        db_path.to_path_buf()
    } else {
        project_dir.join(db_path)
    }
}

pub fn open_database(project_dir: &Path, config: &DealflowToml) -> Result<Database> {
    let path = resolve_db_path(project_dir, &config.server.db_path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    Database::new(&path).with_context(|| format!("Failed to open database {}", path.display()))
}
