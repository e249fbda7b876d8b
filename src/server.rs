use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::{CalendarConfig, CopilotConfig};
use crate::crm::api::crm_router;
use crate::crm::calendar::{CalendarClient, HttpCalendarClient};
use crate::crm::workflow::StageWorkflow;
use crate::crm::ws::{self, Broadcast, WsNotifier};
use crate::db::{Database, DbHandle};
use crate::errors::{BuilderError, WorkflowError};
use crate::funnel::api::funnel_router;
use crate::funnel::copilot::{CopilotBackend, HttpCopilotClient};

// ── Shared state ──────────────────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub ws_tx: broadcast::Sender<Broadcast>,
    pub workflow: StageWorkflow,
    pub calendar: Arc<dyn CalendarClient>,
    pub copilot: Arc<dyn CopilotBackend>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Wire the stage workflow to the database, the calendar client and a
    /// change-feed notifier sharing one broadcast channel.
    pub fn new(
        db: DbHandle,
        calendar: Arc<dyn CalendarClient>,
        copilot: Arc<dyn CopilotBackend>,
    ) -> Self {
        let (ws_tx, _rx) = broadcast::channel::<Broadcast>(256);
        let workflow = StageWorkflow::new(
            Arc::new(db.clone()),
            calendar.clone(),
            Arc::new(WsNotifier::new(ws_tx.clone())),
        );
        Self {
            db,
            ws_tx,
            workflow,
            calendar,
            copilot,
        }
    }
}

// ── Error type ────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unprocessable(String),
    BadGateway(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Internal(msg) => {
                error!(error = %msg, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<WorkflowError> for ApiError {
    fn from(e: WorkflowError) -> Self {
        let msg = e.to_string();
        match e {
            WorkflowError::AppointmentNotFound { .. } | WorkflowError::TaskNotFound { .. } => {
                ApiError::NotFound(msg)
            }
            WorkflowError::StageNotFound { .. } | WorkflowError::InvalidInput(_) => {
                ApiError::BadRequest(msg)
            }
            WorkflowError::MissingRescheduleReference { .. } => ApiError::Unprocessable(msg),
            WorkflowError::Calendar(_) => ApiError::BadGateway(msg),
            WorkflowError::Remote { .. } => ApiError::Internal(msg),
        }
    }
}

impl From<BuilderError> for ApiError {
    fn from(e: BuilderError) -> Self {
        let msg = e.to_string();
        match e {
            BuilderError::EmptyFunnel => ApiError::Unprocessable(msg),
            BuilderError::StepNotFound(_)
            | BuilderError::StackNotFound(_)
            | BuilderError::BlockNotFound(_)
            | BuilderError::ElementNotFound(_) => ApiError::NotFound(msg),
        }
    }
}

/// Map a store error to a response by its message.
pub(crate) fn db_error(e: anyhow::Error) -> ApiError {
    let msg = format!("{:#}", e);
    if msg.contains("not found") {
        ApiError::NotFound(msg)
    } else if msg.contains("already exists") {
        ApiError::BadRequest(msg)
    } else {
        ApiError::Internal(msg)
    }
}

// ── Server ────────────────────────────────────────────────────────────

/// Configuration for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub dev_mode: bool,
    pub calendar: CalendarConfig,
    pub copilot: CopilotConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3150,
            db_path: PathBuf::from(".dealflow/dealflow.db"),
            dev_mode: false,
            calendar: CalendarConfig::default(),
            copilot: CopilotConfig::default(),
        }
    }
}

async fn health_check() -> &'static str {
    "ok"
}

/// Build the full application router: CRM and funnel APIs plus the change feed.
pub fn build_router(state: SharedState, dev_mode: bool) -> Router {
    let mut app = crm_router()
        .merge(funnel_router())
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// Open the database, build shared state and serve until Ctrl+C.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    if let Some(parent) = config.db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let db = Database::new(&config.db_path).context("Failed to initialize dealflow database")?;
    let calendar: Arc<dyn CalendarClient> = Arc::new(HttpCalendarClient::from_config(&config.calendar));
    let copilot: Arc<dyn CopilotBackend> = Arc::new(HttpCopilotClient::from_config(&config.copilot));
    let state = Arc::new(AppState::new(DbHandle::new(db), calendar, copilot));

    let app = build_router(state, config.dev_mode);

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(%local_addr, db = %config.db_path.display(), "dealflow server listening");
    println!("Dealflow running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutting down"),
        Err(e) => {
            // Without a signal handler the server runs until killed
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    }
}

/// In-memory state with unconfigured external services.
#[cfg(test)]
pub(crate) fn test_state() -> SharedState {
    let db = Database::new_in_memory().unwrap();
    // Nothing listens on the discard port, so calendar calls fail fast
    let calendar: Arc<dyn CalendarClient> =
        Arc::new(HttpCalendarClient::new("http://127.0.0.1:9", None, None));
    let copilot: Arc<dyn CopilotBackend> = Arc::new(HttpCopilotClient::new(None, None, None));
    Arc::new(AppState::new(DbHandle::new(db), calendar, copilot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_router() -> Router {
        let state = test_state();
        state.db.lock_sync().unwrap().seed_default_stages(1).unwrap();
        build_router(state, false)
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let app = test_router();
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"ok");
    }

    #[tokio::test]
    async fn test_crm_and_funnel_routes_mounted() {
        let app = test_router();
        for uri in ["/api/teams/1/stages", "/api/funnels", "/api/teams/1/board"] {
            let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
            let resp = app.clone().oneshot(req).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK, "{uri}");
        }
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let app = test_router();
        let req = Request::builder().uri("/nope").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_ws_route_requires_upgrade() {
        let app = test_router();
        let req = Request::builder().uri("/ws?team_id=1").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn test_dev_mode_adds_cors_headers() {
        let state = test_state();
        let app = build_router(state, true);
        let req = Request::builder()
            .uri("/health")
            .header("origin", "http://localhost:5173")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert!(resp.headers().contains_key("access-control-allow-origin"));
    }

    #[test]
    fn test_workflow_error_status_mapping() {
        let cases = [
            (WorkflowError::AppointmentNotFound { id: 1 }, StatusCode::NOT_FOUND),
            (WorkflowError::TaskNotFound { id: 1 }, StatusCode::NOT_FOUND),
            (WorkflowError::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (
                WorkflowError::MissingRescheduleReference { appointment_id: 1 },
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                WorkflowError::Calendar(anyhow::anyhow!("down")),
                StatusCode::BAD_GATEWAY,
            ),
            (
                WorkflowError::Remote {
                    action: "move appointment".into(),
                    source: anyhow::anyhow!("locked"),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), status);
        }
    }

    #[test]
    fn test_builder_error_status_mapping() {
        assert_eq!(
            ApiError::from(BuilderError::EmptyFunnel).into_response().status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ApiError::from(BuilderError::StackNotFound("s".into()))
                .into_response()
                .status(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_db_error_classification() {
        assert!(matches!(
            db_error(anyhow::anyhow!("Funnel 3 not found")),
            ApiError::NotFound(_)
        ));
        assert!(matches!(
            db_error(anyhow::anyhow!("Stage 'won' already exists for team 1")),
            ApiError::BadRequest(_)
        ));
        assert!(matches!(
            db_error(anyhow::anyhow!("disk I/O error")),
            ApiError::Internal(_)
        ));
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 3150);
        assert_eq!(config.db_path, PathBuf::from(".dealflow/dealflow.db"));
        assert!(!config.dev_mode);
    }
}
