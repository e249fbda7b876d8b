use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, patch, post},
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::builder;
use super::copilot::{
    AppliedChange, ApplyTarget, CopilotIntent, CopilotRequest, CopilotResult, PageContext,
    classify_intent, parse_response,
};
use super::models::{Block, Funnel, Props, Step};
use crate::crm::ws::{WsMessage, broadcast_message};
use crate::errors::BuilderError;
use crate::server::{ApiError, SharedState, db_error};

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateFunnelRequest {
    pub name: String,
    /// Names of the initial steps; one "Home" step when omitted.
    #[serde(default)]
    pub steps: Vec<String>,
}

#[derive(Deserialize)]
pub struct UpdateFunnelRequest {
    pub name: Option<String>,
    pub steps: Option<Vec<Step>>,
}

#[derive(Deserialize)]
pub struct AddStepRequest {
    pub name: String,
}

#[derive(Deserialize)]
pub struct InsertBlockRequest {
    pub stack_id: String,
    pub index: Option<usize>,
    pub block: Block,
}

#[derive(Deserialize)]
pub struct MoveBlockRequest {
    pub stack_id: String,
    pub index: usize,
}

#[derive(Deserialize)]
pub struct CopilotPromptRequest {
    pub prompt: String,
    pub step_id: Option<String>,
    pub block_id: Option<String>,
}

#[derive(Deserialize)]
pub struct CopilotApplyRequest {
    pub result: CopilotResult,
    #[serde(flatten)]
    pub target: ApplyTarget,
}

/// A copilot reply. When parsing failed `result` is empty and `error`
/// explains why; nothing has been applied either way.
#[derive(Serialize)]
pub struct CopilotPreview {
    pub intent: CopilotIntent,
    pub result: Option<CopilotResult>,
    pub error: Option<String>,
    pub raw: String,
}

#[derive(Serialize)]
pub struct EditResponse<T> {
    pub funnel: Funnel,
    #[serde(flatten)]
    pub change: T,
}

#[derive(Serialize)]
struct CreatedId {
    id: String,
}

// ── Router ────────────────────────────────────────────────────────────

pub fn funnel_router() -> Router<SharedState> {
    Router::new()
        .route("/api/funnels", get(list_funnels).post(create_funnel))
        .route("/api/funnels/{id}", get(get_funnel).put(update_funnel))
        .route("/api/funnels/{id}/steps", post(add_step))
        .route(
            "/api/funnels/{id}/steps/{step_id}/settings",
            patch(patch_step_settings),
        )
        .route("/api/funnels/{id}/blocks", post(insert_block))
        .route("/api/funnels/{id}/blocks/{block_id}", delete(remove_block))
        .route("/api/funnels/{id}/blocks/{block_id}/move", post(move_block))
        .route(
            "/api/funnels/{id}/blocks/{block_id}/duplicate",
            post(duplicate_block),
        )
        .route(
            "/api/funnels/{id}/elements/{element_id}",
            patch(patch_element),
        )
        .route("/api/funnels/{id}/copilot", post(copilot_prompt))
        .route("/api/funnels/{id}/copilot/apply", post(copilot_apply))
}

// ── Helpers ───────────────────────────────────────────────────────────

async fn load_funnel(state: &SharedState, id: i64) -> Result<Funnel, ApiError> {
    state
        .db
        .call(move |db| {
            db.get_funnel(id)?
                .with_context(|| format!("Funnel {} not found", id))
        })
        .await
        .map_err(db_error)
}

/// Load, edit and save a funnel under one database lock, then notify
/// change feed clients.
async fn edit_funnel<T, F>(state: &SharedState, id: i64, edit: F) -> Result<(Funnel, T), ApiError>
where
    F: FnOnce(&mut Funnel) -> Result<T, BuilderError> + Send + 'static,
    T: Send + 'static,
{
    let outcome = state
        .db
        .call(move |db| {
            let mut funnel = db
                .get_funnel(id)?
                .with_context(|| format!("Funnel {} not found", id))?;
            match edit(&mut funnel) {
                Ok(value) => Ok(Ok((db.save_funnel(&funnel)?, value))),
                Err(e) => Ok(Err(e)),
            }
        })
        .await
        .map_err(db_error)?;
    let (funnel, value) = outcome?;
    broadcast_message(&state.ws_tx, &WsMessage::FunnelUpdated { funnel_id: id });
    Ok((funnel, value))
}

// ── Funnel handlers ───────────────────────────────────────────────────

async fn list_funnels(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let funnels = state
        .db
        .call(|db| db.list_funnels())
        .await
        .map_err(db_error)?;
    Ok(Json(funnels))
}

async fn create_funnel(
    State(state): State<SharedState>,
    Json(req): Json<CreateFunnelRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = req.name.trim().to_string();
    if name.is_empty() {
        return Err(ApiError::BadRequest("name is required".into()));
    }
    let steps: Vec<Step> = if req.steps.is_empty() {
        vec![Step::new("Home")]
    } else {
        req.steps.iter().map(|n| Step::new(n)).collect()
    };
    let funnel = state
        .db
        .call(move |db| db.create_funnel(&name, &steps))
        .await
        .map_err(db_error)?;
    info!(funnel_id = funnel.id, name = %funnel.name, "Funnel created");
    Ok((StatusCode::CREATED, Json(funnel)))
}

async fn get_funnel(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(load_funnel(&state, id).await?))
}

async fn update_funnel(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateFunnelRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
        return Err(ApiError::BadRequest("name must not be empty".into()));
    }
    if let Some(steps) = &req.steps
        && let Some(id) = builder::duplicate_id(steps)
    {
        return Err(ApiError::BadRequest(format!("Duplicate id '{}' in page tree", id)));
    }
    let (funnel, ()) = edit_funnel(&state, id, move |funnel| {
        if let Some(name) = req.name {
            funnel.name = name.trim().to_string();
        }
        if let Some(steps) = req.steps {
            funnel.steps = steps;
        }
        Ok(())
    })
    .await?;
    Ok(Json(funnel))
}

async fn add_step(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<AddStepRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name is required".into()));
    }
    let (funnel, step_id) =
        edit_funnel(&state, id, move |funnel| Ok(builder::add_step(funnel, req.name.trim()))).await?;
    Ok((
        StatusCode::CREATED,
        Json(EditResponse {
            funnel,
            change: CreatedId { id: step_id },
        }),
    ))
}

async fn patch_step_settings(
    State(state): State<SharedState>,
    Path((id, step_id)): Path<(i64, String)>,
    Json(patch): Json<Props>,
) -> Result<impl IntoResponse, ApiError> {
    let (_, settings) = edit_funnel(&state, id, move |funnel| {
        builder::apply_settings_patch(funnel, &step_id, &patch)
    })
    .await?;
    Ok(Json(settings))
}

// ── Block handlers ────────────────────────────────────────────────────

async fn insert_block(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<InsertBlockRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (funnel, block_id) = edit_funnel(&state, id, move |funnel| {
        builder::insert_block(funnel, &req.stack_id, req.index, req.block)
    })
    .await?;
    Ok((
        StatusCode::CREATED,
        Json(EditResponse {
            funnel,
            change: CreatedId { id: block_id },
        }),
    ))
}

async fn move_block(
    State(state): State<SharedState>,
    Path((id, block_id)): Path<(i64, String)>,
    Json(req): Json<MoveBlockRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (funnel, ()) = edit_funnel(&state, id, move |funnel| {
        builder::move_block(funnel, &block_id, &req.stack_id, req.index)
    })
    .await?;
    Ok(Json(funnel))
}

async fn duplicate_block(
    State(state): State<SharedState>,
    Path((id, block_id)): Path<(i64, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let (funnel, copy_id) =
        edit_funnel(&state, id, move |funnel| builder::duplicate_block(funnel, &block_id)).await?;
    Ok((
        StatusCode::CREATED,
        Json(EditResponse {
            funnel,
            change: CreatedId { id: copy_id },
        }),
    ))
}

async fn remove_block(
    State(state): State<SharedState>,
    Path((id, block_id)): Path<(i64, String)>,
) -> Result<impl IntoResponse, ApiError> {
    edit_funnel(&state, id, move |funnel| builder::remove_block(funnel, &block_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn patch_element(
    State(state): State<SharedState>,
    Path((id, element_id)): Path<(i64, String)>,
    Json(patch): Json<Props>,
) -> Result<impl IntoResponse, ApiError> {
    let (_, element) = edit_funnel(&state, id, move |funnel| {
        builder::update_element_props(funnel, &element_id, &patch)
    })
    .await?;
    Ok(Json(element))
}

// ── Copilot handlers ──────────────────────────────────────────────────

async fn copilot_prompt(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<CopilotPromptRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let prompt = req.prompt.trim().to_string();
    if prompt.is_empty() {
        return Err(ApiError::BadRequest("prompt is required".into()));
    }
    let funnel = load_funnel(&state, id).await?;
    let intent = classify_intent(&prompt);
    let request = CopilotRequest {
        prompt,
        intent,
        context: PageContext::from_funnel(&funnel, req.step_id.as_deref(), req.block_id.as_deref()),
        model: None,
    };

    let raw = state
        .copilot
        .generate(&request)
        .await
        .map_err(|e| ApiError::BadGateway(format!("{:#}", e)))?;

    let preview = match parse_response(intent, &raw) {
        Ok(result) => CopilotPreview {
            intent,
            result: Some(result),
            error: None,
            raw,
        },
        Err(e) => {
            warn!(funnel_id = id, ?intent, error = %e, "Copilot reply could not be parsed");
            CopilotPreview {
                intent,
                result: None,
                error: Some(e.to_string()),
                raw,
            }
        }
    };
    Ok(Json(preview))
}

async fn copilot_apply(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<CopilotApplyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (funnel, change): (Funnel, AppliedChange) = edit_funnel(&state, id, move |funnel| {
        super::copilot::apply(&req.result, funnel, &req.target)
    })
    .await?;
    info!(funnel_id = id, kind = ?change.kind, created = change.ids.len(), "Copilot result applied");
    Ok(Json(EditResponse { funnel, change }))
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funnel::copilot::CopilotBackend;
    use crate::server::{AppState, test_state};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use tower::ServiceExt;

    struct CannedCopilot(&'static str);

    #[async_trait]
    impl CopilotBackend for CannedCopilot {
        async fn generate(&self, _request: &CopilotRequest) -> anyhow::Result<String> {
            Ok(self.0.to_string())
        }
    }

    fn app_with(state: SharedState) -> Router {
        funnel_router().with_state(state)
    }

    fn canned_app(reply: &'static str) -> Router {
        let base = test_state();
        let state = Arc::new(AppState::new(
            base.db.clone(),
            base.calendar.clone(),
            Arc::new(CannedCopilot(reply)),
        ));
        app_with(state)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn create(app: &Router) -> Value {
        let (status, funnel) = send(
            app,
            "POST",
            "/api/funnels",
            Some(json!({"name": "Webinar", "steps": ["Register", "Thank You"]})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        funnel
    }

    fn first_stack(funnel: &Value, step: usize) -> String {
        funnel["steps"][step]["frames"][0]["stacks"][0]["id"]
            .as_str()
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn test_create_and_fetch_funnel() {
        let app = app_with(test_state());
        let funnel = create(&app).await;
        assert_eq!(funnel["steps"][1]["slug"], "thank-you");

        let (status, fetched) = send(&app, "GET", "/api/funnels/1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["name"], "Webinar");

        let (status, _) = send(&app, "GET", "/api/funnels/99", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, "POST", "/api/funnels", Some(json!({"name": " "}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_block_lifecycle_over_http() {
        let app = app_with(test_state());
        let funnel = create(&app).await;
        let (s0, s1) = (first_stack(&funnel, 0), first_stack(&funnel, 1));

        let (status, body) = send(
            &app,
            "POST",
            "/api/funnels/1/blocks",
            Some(json!({
                "stack_id": s0,
                "block": {"type": "hero", "elements": [{"type": "button", "props": {"label": "Join"}}]}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let block_id = body["id"].as_str().unwrap().to_string();
        let element_id = body["funnel"]["steps"][0]["frames"][0]["stacks"][0]["blocks"][0]["elements"][0]
            ["id"]
            .as_str()
            .unwrap()
            .to_string();

        let (status, element) = send(
            &app,
            "PATCH",
            &format!("/api/funnels/1/elements/{element_id}"),
            Some(json!({"label": null, "color": "#f00"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(element["props"], json!({"color": "#f00"}));

        let (status, body) = send(
            &app,
            "POST",
            &format!("/api/funnels/1/blocks/{block_id}/duplicate"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let copy_id = body["id"].as_str().unwrap().to_string();
        assert_ne!(copy_id, block_id);

        let (status, moved) = send(
            &app,
            "POST",
            &format!("/api/funnels/1/blocks/{copy_id}/move"),
            Some(json!({"stack_id": s1, "index": 0})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            moved["steps"][1]["frames"][0]["stacks"][0]["blocks"][0]["id"],
            json!(copy_id)
        );

        let (status, _) = send(&app, "DELETE", &format!("/api/funnels/1/blocks/{block_id}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, "DELETE", &format!("/api/funnels/1/blocks/{block_id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_insert_into_unknown_stack_is_404() {
        let app = app_with(test_state());
        create(&app).await;
        let (status, body) = send(
            &app,
            "POST",
            "/api/funnels/1/blocks",
            Some(json!({"stack_id": "nope", "block": {"type": "cta"}})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn test_step_and_settings_endpoints() {
        let app = app_with(test_state());
        create(&app).await;
        let (status, body) = send(&app, "POST", "/api/funnels/1/steps", Some(json!({"name": "Upsell"}))).await;
        assert_eq!(status, StatusCode::CREATED);
        let step_id = body["id"].as_str().unwrap().to_string();
        assert_eq!(body["funnel"]["steps"].as_array().unwrap().len(), 3);

        let (status, settings) = send(
            &app,
            "PATCH",
            &format!("/api/funnels/1/steps/{step_id}/settings"),
            Some(json!({"font": "Inter"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(settings, json!({"font": "Inter"}));
    }

    #[tokio::test]
    async fn test_update_funnel_renames() {
        let app = app_with(test_state());
        create(&app).await;
        let (status, funnel) = send(&app, "PUT", "/api/funnels/1", Some(json!({"name": "Evergreen"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(funnel["name"], "Evergreen");
        assert_eq!(funnel["steps"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_update_funnel_rejects_duplicate_ids() {
        let app = app_with(test_state());
        let funnel = create(&app).await;

        let (status, _) = send(
            &app,
            "PUT",
            "/api/funnels/1",
            Some(json!({"steps": funnel["steps"].clone()})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let mut steps = funnel["steps"].clone();
        steps[1]["frames"][0]["stacks"][0]["id"] = json!(first_stack(&funnel, 0));
        let (status, body) = send(&app, "PUT", "/api/funnels/1", Some(json!({"steps": steps}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("Duplicate id"));

        let (_, stored) = send(&app, "GET", "/api/funnels/1", None).await;
        assert_ne!(first_stack(&stored, 0), first_stack(&stored, 1));
    }

    #[tokio::test]
    async fn test_copilot_preview_does_not_modify_funnel() {
        let app = canned_app("```json\n{\"type\":\"testimonial\",\"props\":{\"quote\":\"Great\"}}\n```");
        create(&app).await;

        let (status, preview) = send(
            &app,
            "POST",
            "/api/funnels/1/copilot",
            Some(json!({"prompt": "Add a testimonial"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(preview["intent"], "block");
        assert_eq!(preview["result"]["kind"], "block");
        assert_eq!(preview["result"]["value"]["type"], "testimonial");

        let (_, funnel) = send(&app, "GET", "/api/funnels/1", None).await;
        assert_eq!(
            funnel["steps"][0]["frames"][0]["stacks"][0]["blocks"],
            json!([])
        );

        let (status, applied) = send(
            &app,
            "POST",
            "/api/funnels/1/copilot/apply",
            Some(json!({"result": preview["result"]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(applied["kind"], "block");
        assert_eq!(
            applied["funnel"]["steps"][0]["frames"][0]["stacks"][0]["blocks"][0]["type"],
            "testimonial"
        );
    }

    #[tokio::test]
    async fn test_copilot_unparseable_reply_reports_error() {
        let app = canned_app("I'm not sure what you mean.");
        create(&app).await;
        let (status, preview) = send(
            &app,
            "POST",
            "/api/funnels/1/copilot",
            Some(json!({"prompt": "Make it pop"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(preview["result"].is_null());
        assert!(preview["error"].as_str().unwrap().contains("JSON"));
        assert_eq!(preview["raw"], "I'm not sure what you mean.");
    }

    #[tokio::test]
    async fn test_copilot_without_endpoint_is_502() {
        let app = app_with(test_state());
        create(&app).await;
        let (status, _) = send(
            &app,
            "POST",
            "/api/funnels/1/copilot",
            Some(json!({"prompt": "Add a CTA"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_copilot_apply_to_empty_funnel_is_422() {
        let app = app_with(test_state());
        create(&app).await;
        send(&app, "PUT", "/api/funnels/1", Some(json!({"steps": []}))).await;
        let (status, _) = send(
            &app,
            "POST",
            "/api/funnels/1/copilot/apply",
            Some(json!({"result": {"kind": "block", "value": {"type": "hero"}}})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }
}
