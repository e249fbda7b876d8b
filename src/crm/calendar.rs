use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::CalendarConfig;

pub const DEFAULT_CALENDAR_BASE_URL: &str = "https://api.calendly.com";

/// A bookable event type on the scheduling account (subset of fields).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventType {
    pub uri: String,
    pub name: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub scheduling_url: Option<String>,
    #[serde(default)]
    pub duration: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct InviteeEnvelope {
    resource: Invitee,
}

#[derive(Debug, Deserialize)]
struct Invitee {
    reschedule_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventTypePage {
    collection: Vec<EventType>,
}

/// External scheduling service used for on-demand reschedule links.
#[async_trait]
pub trait CalendarClient: Send + Sync {
    /// Look up the invitee and return its reschedule link.
    async fn fetch_reschedule_url(&self, invitee_ref: &str) -> Result<String>;

    async fn list_event_types(&self) -> Result<Vec<EventType>>;
}

/// Bearer-token client for the scheduling REST API.
pub struct HttpCalendarClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    user_uri: Option<String>,
}

impl HttpCalendarClient {
    pub fn new(base_url: &str, token: Option<String>, user_uri: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            user_uri,
        }
    }

    pub fn from_config(config: &CalendarConfig) -> Self {
        Self::new(
            &config.base_url,
            config.token.clone(),
            config.user_uri.clone(),
        )
    }

    fn token(&self) -> Result<&str> {
        self.token
            .as_deref()
            .filter(|t| !t.is_empty())
            .context("Calendar API token is not configured (set [calendar].token or DEALFLOW_CALENDAR_TOKEN)")
    }

    /// Invitee references are stored either as absolute API URIs or as paths
    /// relative to the API base.
    fn resolve(&self, reference: &str) -> String {
        let reference = reference.trim();
        if reference.starts_with("http://") || reference.starts_with("https://") {
            reference.to_string()
        } else {
            format!("{}/{}", self.base_url, reference.trim_start_matches('/'))
        }
    }
}

#[async_trait]
impl CalendarClient for HttpCalendarClient {
    async fn fetch_reschedule_url(&self, invitee_ref: &str) -> Result<String> {
        let token = self.token()?;
        let url = self.resolve(invitee_ref);
        debug!(%url, "Fetching invitee for reschedule link");

        let resp = self
            .http
            .get(&url)
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/json")
            .send()
            .await
            .context("Failed to reach calendar API")?
            .error_for_status()
            .context("Calendar API returned error status for invitee lookup")?;

        let envelope: InviteeEnvelope = resp
            .json()
            .await
            .context("Failed to parse invitee response from calendar API")?;

        envelope
            .resource
            .reschedule_url
            .filter(|u| !u.is_empty())
            .context("Calendar invitee has no reschedule link")
    }

    async fn list_event_types(&self) -> Result<Vec<EventType>> {
        let token = self.token()?;
        let user = self
            .user_uri
            .as_deref()
            .context("Calendar user URI is not configured (set [calendar].user_uri)")?;

        let resp = self
            .http
            .get(format!("{}/event_types", self.base_url))
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/json")
            .query(&[("user", user)])
            .send()
            .await
            .context("Failed to reach calendar API")?
            .error_for_status()
            .context("Calendar API returned error status for event types")?;

        let page: EventTypePage = resp
            .json()
            .await
            .context("Failed to parse event types from calendar API")?;
        Ok(page.collection)
    }
}
