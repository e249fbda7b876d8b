use std::str::FromStr;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch, post},
};
use serde::Deserialize;

use super::aggregation::{board_columns, closer_view};
use super::models::{NewAppointment, StageKind};
use super::ws::{WsMessage, broadcast_message};
use crate::server::{ApiError, SharedState, db_error};

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateStageRequest {
    pub stage_key: String,
    pub label: String,
    pub color: Option<String>,
    pub kind: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateStageRequest {
    pub label: Option<String>,
    pub color: Option<String>,
    pub kind: Option<String>,
    pub position: Option<i32>,
}

#[derive(Deserialize)]
pub struct CreateAppointmentRequest {
    pub lead_name: String,
    pub lead_email: String,
    pub start_time: String,
    pub setter: Option<String>,
    pub closer: Option<String>,
    pub pipeline_stage: Option<String>,
    pub calendar_invitee_ref: Option<String>,
    pub original_appointment_id: Option<i64>,
}

#[derive(Deserialize)]
pub struct MoveRequest {
    pub stage: String,
}

#[derive(Deserialize)]
pub struct FollowUpRequest {
    pub stage: String,
    pub reason: String,
    pub follow_up_at: Option<String>,
}

#[derive(Deserialize)]
pub struct DepositRequest {
    pub stage: String,
    pub amount: f64,
}

#[derive(Deserialize)]
pub struct CloseDealRequest {
    pub cash_collected: f64,
    #[serde(default)]
    pub mrr_amount: f64,
    #[serde(default)]
    pub mrr_months: i32,
}

#[derive(Deserialize)]
pub struct DoubleBookRequest {
    pub keep_id: i64,
    pub discard_id: i64,
}

#[derive(Deserialize)]
pub struct NoAnswerRequest {
    pub note: String,
    pub retry_at: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct UndoRequest {
    #[serde(default)]
    pub confirmed: bool,
}

// ── Router ────────────────────────────────────────────────────────────

pub fn crm_router() -> Router<SharedState> {
    Router::new()
        .route(
            "/api/teams/{team_id}/stages",
            get(list_stages).post(create_stage),
        )
        .route("/api/stages/{id}", patch(update_stage))
        .route(
            "/api/teams/{team_id}/appointments",
            get(list_appointments).post(create_appointment),
        )
        .route("/api/teams/{team_id}/board", get(get_board))
        .route("/api/teams/{team_id}/closers/{closer}", get(get_closer_view))
        .route("/api/teams/{team_id}/undo", post(undo_last_move))
        .route("/api/appointments/double-book", post(resolve_double_book))
        .route("/api/appointments/{id}", get(get_appointment))
        .route("/api/appointments/{id}/move", post(move_appointment))
        .route("/api/appointments/{id}/reschedule", post(confirm_reschedule))
        .route("/api/appointments/{id}/follow-up", post(confirm_follow_up))
        .route("/api/appointments/{id}/follow-up/skip", post(skip_follow_up))
        .route("/api/appointments/{id}/deposit", post(confirm_deposit))
        .route("/api/appointments/{id}/close", post(close_deal))
        .route("/api/appointments/{id}/tasks", get(list_tasks))
        .route("/api/appointments/{id}/activity", get(list_activity))
        .route("/api/tasks/{id}/no-answer", post(record_no_answer))
        .route("/api/calendar/event-types", get(list_event_types))
}

// ── Helpers ───────────────────────────────────────────────────────────

fn parse_kind(kind: Option<&str>) -> Result<Option<StageKind>, ApiError> {
    kind.map(StageKind::from_str)
        .transpose()
        .map_err(ApiError::BadRequest)
}

fn validate_timestamp(field: &str, value: &str) -> Result<(), ApiError> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|_| ())
        .map_err(|e| ApiError::BadRequest(format!("{} must be an RFC 3339 timestamp: {}", field, e)))
}

// ── Stage handlers ────────────────────────────────────────────────────

async fn list_stages(
    State(state): State<SharedState>,
    Path(team_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let stages = state
        .db
        .call(move |db| db.list_stages(team_id))
        .await
        .map_err(db_error)?;
    Ok(Json(stages))
}

async fn create_stage(
    State(state): State<SharedState>,
    Path(team_id): Path<i64>,
    Json(req): Json<CreateStageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let stage_key = req.stage_key.trim().to_string();
    if stage_key.is_empty() || req.label.trim().is_empty() {
        return Err(ApiError::BadRequest("stage_key and label are required".into()));
    }
    let kind = parse_kind(req.kind.as_deref())?;
    let color = req.color.unwrap_or_else(|| "#64748b".to_string());
    let label = req.label;

    let stage = state
        .db
        .call(move |db| {
            if db.list_stages(team_id)?.iter().any(|s| s.stage_key == stage_key) {
                anyhow::bail!("Stage '{}' already exists for team {}", stage_key, team_id);
            }
            db.create_stage(team_id, &stage_key, &label, &color, kind)
        })
        .await
        .map_err(db_error)?;

    broadcast_message(&state.ws_tx, &WsMessage::StagesChanged { team_id });
    Ok((StatusCode::CREATED, Json(stage)))
}

async fn update_stage(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateStageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let kind = parse_kind(req.kind.as_deref())?;
    let stage = state
        .db
        .call(move |db| {
            if db.get_stage(id)?.is_none() {
                anyhow::bail!("Stage {} not found", id);
            }
            db.update_stage(
                id,
                req.label.as_deref(),
                req.color.as_deref(),
                kind,
                req.position,
            )
        })
        .await
        .map_err(db_error)?;

    broadcast_message(
        &state.ws_tx,
        &WsMessage::StagesChanged {
            team_id: stage.team_id,
        },
    );
    Ok(Json(stage))
}

// ── Appointment handlers ──────────────────────────────────────────────

async fn list_appointments(
    State(state): State<SharedState>,
    Path(team_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let appointments = state
        .db
        .call(move |db| db.list_appointments(team_id))
        .await
        .map_err(db_error)?;
    Ok(Json(appointments))
}

async fn create_appointment(
    State(state): State<SharedState>,
    Path(team_id): Path<i64>,
    Json(req): Json<CreateAppointmentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.lead_name.trim().is_empty() {
        return Err(ApiError::BadRequest("lead_name is required".into()));
    }
    validate_timestamp("start_time", &req.start_time)?;

    let new = NewAppointment {
        team_id,
        lead_name: req.lead_name,
        lead_email: req.lead_email.trim().to_lowercase(),
        start_time: req.start_time,
        setter: req.setter,
        closer: req.closer,
        pipeline_stage: req.pipeline_stage,
        calendar_invitee_ref: req.calendar_invitee_ref,
        original_appointment_id: req.original_appointment_id,
    };
    let appointment = state
        .db
        .call(move |db| db.create_appointment(&new))
        .await
        .map_err(db_error)?;

    broadcast_message(
        &state.ws_tx,
        &WsMessage::AppointmentCreated {
            appointment: appointment.clone(),
        },
    );
    Ok((StatusCode::CREATED, Json(appointment)))
}

async fn get_appointment(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let appointment = state.workflow.load(id).await?;
    Ok(Json(appointment))
}

async fn get_board(
    State(state): State<SharedState>,
    Path(team_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let (stages, appointments) = state
        .db
        .call(move |db| Ok((db.list_stages(team_id)?, db.list_appointments(team_id)?)))
        .await
        .map_err(db_error)?;
    Ok(Json(board_columns(&stages, &appointments)))
}

async fn get_closer_view(
    State(state): State<SharedState>,
    Path((team_id, closer)): Path<(i64, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let (stages, appointments) = state
        .db
        .call(move |db| Ok((db.list_stages(team_id)?, db.list_appointments(team_id)?)))
        .await
        .map_err(db_error)?;
    Ok(Json(closer_view(&stages, &appointments, &closer)))
}

// ── Stage transitions ─────────────────────────────────────────────────

async fn move_appointment(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<MoveRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let appointment = state.workflow.load(id).await?;
    let outcome = state.workflow.move_card(&appointment, &req.stage).await?;
    Ok(Json(outcome))
}

async fn confirm_reschedule(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<MoveRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let appointment = state.workflow.resolve_reschedule(id, &req.stage).await?;
    Ok(Json(appointment))
}

async fn confirm_follow_up(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<FollowUpRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(at) = req.follow_up_at.as_deref() {
        validate_timestamp("follow_up_at", at)?;
    }
    let resolution = state
        .workflow
        .resolve_follow_up(id, &req.stage, &req.reason, req.follow_up_at.as_deref())
        .await?;
    Ok(Json(resolution))
}

async fn skip_follow_up(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<MoveRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let appointment = state.workflow.skip_follow_up(id, &req.stage).await?;
    Ok(Json(appointment))
}

async fn confirm_deposit(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<DepositRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let appointment = state
        .workflow
        .resolve_deposit(id, &req.stage, req.amount)
        .await?;
    Ok(Json(appointment))
}

async fn close_deal(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<CloseDealRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let result = state
        .workflow
        .close_deal(id, req.cash_collected, req.mrr_amount, req.mrr_months)
        .await?;
    Ok(Json(result))
}

async fn resolve_double_book(
    State(state): State<SharedState>,
    Json(req): Json<DoubleBookRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let resolution = state
        .workflow
        .resolve_double_book(req.keep_id, req.discard_id)
        .await?;
    Ok(Json(resolution))
}

async fn undo_last_move(
    State(state): State<SharedState>,
    Path(team_id): Path<i64>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    // An empty body means an unconfirmed undo.
    let req: UndoRequest = if body.is_empty() {
        UndoRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid undo request: {}", e)))?
    };
    let outcome = state.workflow.undo(team_id, req.confirmed).await?;
    Ok(Json(outcome))
}

// ── Tasks and activity ────────────────────────────────────────────────

async fn list_tasks(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let tasks = state
        .db
        .call(move |db| db.list_tasks(id))
        .await
        .map_err(db_error)?;
    Ok(Json(tasks))
}

async fn list_activity(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let logs = state
        .db
        .call(move |db| db.list_activity(id))
        .await
        .map_err(db_error)?;
    Ok(Json(logs))
}

async fn record_no_answer(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<NoAnswerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(at) = req.retry_at.as_deref() {
        validate_timestamp("retry_at", at)?;
    }
    let task = state
        .workflow
        .record_no_answer(id, &req.note, req.retry_at.as_deref())
        .await?;
    broadcast_message(
        &state.ws_tx,
        &WsMessage::TaskUpdated {
            team_id: task.team_id,
            appointment_id: task.appointment_id,
            task_id: task.id,
        },
    );
    Ok(Json(task))
}

// ── Calendar ──────────────────────────────────────────────────────────

async fn list_event_types(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let types = state
        .calendar
        .list_event_types()
        .await
        .map_err(|e| ApiError::BadGateway(format!("{:#}", e)))?;
    Ok(Json(types))
}

// ── Tests ─────────────────────────────────────────────────────────────
