//! Configuration for dealflow, read from `.dealflow/dealflow.toml`.
//!
//! Layered: file → environment (`DEALFLOW_*`, with `.env` loaded first) →
//! CLI flags. Every section is optional and falls back to defaults.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! port = 3150
//! db_path = ".dealflow/dealflow.db"
//! dev_mode = false
//!
//! [calendar]
//! base_url = "https://api.calendly.com"
//! token = "..."
//! user_uri = "https://api.calendly.com/users/AAAA"
//!
//! [copilot]
//! endpoint = "https://example.com/functions/v1/funnel-copilot"
//! api_key = "..."
//! model = "gpt-4o-mini"
//!
//! [logging]
//! level = "dealflow=info,tower_http=info"
//! json = false
//! file = true
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::crm::calendar::DEFAULT_CALENDAR_BASE_URL;
use crate::server::ServerConfig;

pub const CONFIG_DIR: &str = ".dealflow";
pub const CONFIG_FILE: &str = "dealflow.toml";

const REDACTED: &str = "********";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_port() -> u16 {
    3150
}

fn default_db_path() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("dealflow.db")
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            db_path: default_db_path(),
            dev_mode: false,
        }
    }
}

/// Scheduling service used for reschedule links and event types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarConfig {
    #[serde(default = "default_calendar_base_url")]
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Account URI used to scope event type listings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_uri: Option<String>,
}

fn default_calendar_base_url() -> String {
    DEFAULT_CALENDAR_BASE_URL.to_string()
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            base_url: default_calendar_base_url(),
            token: None,
            user_uri: None,
        }
    }
}

/// Generation endpoint for the funnel copilot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CopilotConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence when set.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Also write a daily-rotated log file.
    #[serde(default)]
    pub file: bool,
    /// Log file directory; defaults to the platform data dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

pub fn default_log_level() -> String {
    "dealflow=info,tower_http=info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            file: false,
            dir: None,
        }
    }
}

/// The complete dealflow.toml configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DealflowToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub calendar: CalendarConfig,
    #[serde(default)]
    pub copilot: CopilotConfig,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl DealflowToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse dealflow.toml")
    }

    /// Load `dealflow.toml` from `config_dir`, or defaults if it doesn't exist.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize dealflow.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Overlay `DEALFLOW_*` variables from the process environment, after
    /// loading `<project_dir>/.env` if present. Variables already set in
    /// the environment win over the file.
    pub fn apply_process_env(&mut self, project_dir: &Path) -> Result<()> {
        let env_file = project_dir.join(".env");
        if env_file.is_file() {
            dotenvy::from_path(&env_file)
                .with_context(|| format!("Failed to load {}", env_file.display()))?;
        }
        self.apply_env(|key| std::env::var(key).ok())
    }

    /// Overlay `DEALFLOW_*` variables from `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("DEALFLOW_PORT") {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("DEALFLOW_PORT must be a port number, got '{}'", port))?;
        }
        if let Some(path) = lookup("DEALFLOW_DB_PATH") {
            self.server.db_path = PathBuf::from(path);
        }
        if let Some(dev) = lookup("DEALFLOW_DEV_MODE") {
            self.server.dev_mode = is_truthy(&dev);
        }
        if let Some(url) = lookup("DEALFLOW_CALENDAR_BASE_URL") {
            self.calendar.base_url = url;
        }
        if let Some(token) = lookup("DEALFLOW_CALENDAR_TOKEN") {
            self.calendar.token = Some(token);
        }
        if let Some(uri) = lookup("DEALFLOW_CALENDAR_USER_URI") {
            self.calendar.user_uri = Some(uri);
        }
        if let Some(endpoint) = lookup("DEALFLOW_COPILOT_ENDPOINT") {
            self.copilot.endpoint = Some(endpoint);
        }
        if let Some(key) = lookup("DEALFLOW_COPILOT_API_KEY") {
            self.copilot.api_key = Some(key);
        }
        if let Some(model) = lookup("DEALFLOW_COPILOT_MODEL") {
            self.copilot.model = Some(model);
        }
        if let Some(level) = lookup("DEALFLOW_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(json) = lookup("DEALFLOW_LOG_JSON") {
            self.logging.json = is_truthy(&json);
        }
        Ok(())
    }

    /// Server settings for `start_server`.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            port: self.server.port,
            db_path: self.server.db_path.clone(),
            dev_mode: self.server.dev_mode,
            calendar: self.calendar.clone(),
            copilot: self.copilot.clone(),
        }
    }

    /// Copy with secrets masked, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.calendar.token.is_some() {
            copy.calendar.token = Some(REDACTED.to_string());
        }
        if copy.copilot.api_key.is_some() {
            copy.copilot.api_key = Some(REDACTED.to_string());
        }
        copy
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.server.port == 0 {
            warnings.push("server.port is 0; the OS will pick a random port".to_string());
        }

        if !is_http_url(&self.calendar.base_url) {
            warnings.push(format!(
                "Invalid calendar.base_url '{}': should start with http:// or https://",
                self.calendar.base_url
            ));
        }
        if self.calendar.token.as_deref().is_none_or(str::is_empty) {
            warnings.push(
                "calendar.token is not set; reschedule links and event types are unavailable"
                    .to_string(),
            );
        }

        match self.copilot.endpoint.as_deref() {
            None => warnings.push("copilot.endpoint is not set; the funnel copilot is disabled".to_string()),
            Some(endpoint) if !is_http_url(endpoint) => warnings.push(format!(
                "Invalid copilot.endpoint '{}': should start with http:// or https://",
                endpoint
            )),
            Some(_) => {}
        }

        if tracing_subscriber::EnvFilter::try_new(&self.logging.level).is_err() {
            warnings.push(format!(
                "Invalid logging.level '{}': should be a tracing filter such as 'dealflow=debug'",
                self.logging.level
            ));
        }

        warnings
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}
