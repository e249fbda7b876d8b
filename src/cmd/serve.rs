//! HTTP server command for `dealflow serve`.

use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::warn;

use super::super::Cli;
use super::{load_config, resolve_db_path};

pub async fn cmd_serve(
    project_dir: &Path,
    cli: &Cli,
    port: Option<u16>,
    db_path: Option<PathBuf>,
    dev: bool,
) -> Result<()> {
    let config = load_config(project_dir)?;
    let _log_guard = dealflow::logging::init(&config.logging, cli.verbose)?;

    for warning in config.validate() {
        warn!("{}", warning);
    }

    let mut server = config.server_config();
    if let Some(port) = port {
        server.port = port;
    }
    if let Some(path) = db_path {
        server.db_path = path;
    }
    server.db_path = resolve_db_path(project_dir, &server.db_path);
    server.dev_mode |= dev;

    dealflow::server::start_server(server).await
}
