//! AI copilot for the funnel builder.
//!
//! A prompt is classified into one of three intents, sent with a snapshot of
//! the current page to the generation endpoint, and the streamed reply is
//! parsed leniently into a block, a funnel draft or a settings patch. Parsing
//! never touches the funnel; [`apply`] is a separate, explicit step.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::builder;
use super::models::{Block, Funnel, Props, Step};
use crate::errors::{BuilderError, CopilotParseError};

static FUNNEL_WORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(funnels?|full[- ]page|whole page|entire page|landing page|sales page|pages|multi[- ]step)\b",
    )
    .unwrap()
});

static SETTINGS_WORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(styles?|styling|colou?rs?|fonts?|typography|settings|themes?|palette|background)\b",
    )
    .unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopilotIntent {
    Block,
    Funnel,
    Settings,
}

impl CopilotIntent {
    fn shape(self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Funnel => "funnel",
            Self::Settings => "settings",
        }
    }
}

/// Guess what the user is asking for from the wording of the prompt.
/// Funnel wording wins over settings wording.
pub fn classify_intent(prompt: &str) -> CopilotIntent {
    if FUNNEL_WORDS.is_match(prompt) {
        CopilotIntent::Funnel
    } else if SETTINGS_WORDS.is_match(prompt) {
        CopilotIntent::Settings
    } else {
        CopilotIntent::Block
    }
}

// ── Stream accumulation ──────────────────────────────────────────────

/// Collects a streamed reply into one string.
///
/// The first non-blank bytes decide the framing: a body starting with an
/// event field or comment is read as server-sent events, anything else as
/// raw text. A leading fragment that could still become `data:` or `event:`
/// is held until it either does or a line ends.
/// Multi-byte characters split across chunks are held back until complete.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    text: String,
    pending: Vec<u8>,
    line: String,
    sse: Option<bool>,
    event_lines: usize,
}

const SSE_FIELDS: [&str; 2] = ["data:", "event:"];

/// `Some(true)` for event-stream framing, `Some(false)` for raw text,
/// `None` while the leading bytes are still ambiguous.
fn detect_framing(head: &str) -> Option<bool> {
    let trimmed = head.trim_start();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with(':') || SSE_FIELDS.iter().any(|f| trimmed.starts_with(f)) {
        return Some(true);
    }
    if !trimmed.contains('\n') && SSE_FIELDS.iter().any(|f| f.starts_with(trimmed)) {
        return None;
    }
    Some(false)
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
        let valid = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            // Invalid sequence: decode lossily rather than stall
            Err(_) => {
                let decoded = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                self.push_str(&decoded);
                return;
            }
        };
        let rest = self.pending.split_off(valid);
        let complete = std::mem::replace(&mut self.pending, rest);
        if let Ok(s) = String::from_utf8(complete) {
            self.push_str(&s);
        }
    }

    pub fn push_str(&mut self, chunk: &str) {
        if self.sse.is_none() {
            self.line.push_str(chunk);
            let Some(sse) = detect_framing(&self.line) else {
                return;
            };
            self.sse = Some(sse);
            let held = std::mem::take(&mut self.line);
            if sse {
                self.push_sse(held.trim_start());
            } else {
                self.text.push_str(&held);
            }
            return;
        }

        if self.sse == Some(true) {
            self.push_sse(chunk);
        } else {
            self.text.push_str(chunk);
        }
    }

    fn push_sse(&mut self, chunk: &str) {
        self.line.push_str(chunk);
        while let Some(pos) = self.line.find('\n') {
            let line: String = self.line.drain(..=pos).collect();
            self.handle_sse_line(line.trim_end_matches(['\n', '\r']));
        }
    }

    fn handle_sse_line(&mut self, line: &str) {
        if line.is_empty() {
            self.event_lines = 0;
            return;
        }
        let Some(payload) = line.strip_prefix("data:") else {
            // event:, id:, retry: and comments carry no text
            return;
        };
        let payload = payload.strip_prefix(' ').unwrap_or(payload);
        if payload.trim() == "[DONE]" {
            return;
        }
        let Some(text) = event_text(payload) else {
            return;
        };
        if self.event_lines > 0 {
            self.text.push('\n');
        }
        self.text.push_str(&text);
        self.event_lines += 1;
    }

    /// Text received so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn finish(mut self) -> String {
        if !self.pending.is_empty() {
            let rest = String::from_utf8_lossy(&self.pending).into_owned();
            self.pending.clear();
            self.push_str(&rest);
        }
        if self.sse == Some(true) {
            let last = std::mem::take(&mut self.line);
            self.handle_sse_line(last.trim_end_matches('\r'));
        } else {
            let held = std::mem::take(&mut self.line);
            self.text.push_str(&held);
        }
        self.text
    }
}

/// Event types of the Anthropic messages stream.
const PROVIDER_EVENT_TYPES: &[&str] = &[
    "message_start",
    "message_delta",
    "message_stop",
    "content_block_start",
    "content_block_delta",
    "content_block_stop",
    "ping",
    "error",
];

/// Text carried by one `data:` payload.
///
/// Provider envelopes (`choices` arrays or known event types) yield their
/// text delta, or nothing for role, stop and bookkeeping events. Any other
/// payload is content and is kept verbatim.
fn event_text(payload: &str) -> Option<String> {
    let Ok(Value::Object(event)) = serde_json::from_str::<Value>(payload) else {
        return Some(payload.to_string());
    };
    let is_envelope = event.contains_key("choices")
        || event
            .get("type")
            .and_then(Value::as_str)
            .is_some_and(|t| PROVIDER_EVENT_TYPES.contains(&t));
    let value = Value::Object(event);
    let delta = value
        .pointer("/choices/0/delta/content")
        .or_else(|| value.pointer("/choices/0/text"))
        .or_else(|| value.pointer("/delta/text"))
        .and_then(Value::as_str);
    match delta {
        Some(text) => Some(text.to_string()),
        None if is_envelope => None,
        None => Some(payload.to_string()),
    }
}

// ── Response parsing ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftStep {
    pub name: String,
    #[serde(default)]
    pub blocks: Vec<Block>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelDraft {
    #[serde(default)]
    pub name: Option<String>,
    pub steps: Vec<DraftStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsPatch {
    pub settings: Props,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CopilotResult {
    Block(Block),
    Funnel(FunnelDraft),
    Settings(SettingsPatch),
}

/// Drop a surrounding markdown code fence, if any.
fn strip_fences(text: &str) -> &str {
    let Some(open) = text.find("```") else {
        return text;
    };
    let after = &text[open + 3..];
    // Skip the language tag line
    let body = match after.find('\n') {
        Some(nl) => &after[nl + 1..],
        None => after,
    };
    match body.find("```") {
        Some(close) => &body[..close],
        None => body,
    }
}

/// The outermost JSON object or array in `text`.
fn extract_json(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let close = if text[start..].starts_with('{') { '}' } else { ']' };
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

fn unwrap_envelope(value: Value, key: &str) -> Value {
    match value {
        Value::Object(mut map) if map.len() == 1 && map.contains_key(key) => {
            map.remove(key).unwrap_or(Value::Null)
        }
        other => other,
    }
}

fn shape_error(intent: CopilotIntent, source: serde_json::Error) -> CopilotParseError {
    CopilotParseError::Shape {
        expected: intent.shape(),
        source,
    }
}

/// Parse a model reply for the given intent.
pub fn parse_response(intent: CopilotIntent, text: &str) -> Result<CopilotResult, CopilotParseError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(CopilotParseError::Empty);
    }
    let json = extract_json(strip_fences(text)).ok_or(CopilotParseError::NoJson)?;
    let value: Value = serde_json::from_str(json).map_err(|e| shape_error(intent, e))?;

    match intent {
        CopilotIntent::Block => {
            let value = unwrap_envelope(value, "block");
            let block: Block = serde_json::from_value(value).map_err(|e| shape_error(intent, e))?;
            if block.kind.trim().is_empty() {
                return Err(CopilotParseError::Incomplete("block has no type".into()));
            }
            Ok(CopilotResult::Block(block))
        }
        CopilotIntent::Funnel => {
            let value = match unwrap_envelope(value, "funnel") {
                steps @ Value::Array(_) => serde_json::json!({ "steps": steps }),
                other => other,
            };
            let draft: FunnelDraft =
                serde_json::from_value(value).map_err(|e| shape_error(intent, e))?;
            if draft.steps.is_empty() {
                return Err(CopilotParseError::Incomplete("funnel has no steps".into()));
            }
            if draft.steps.iter().all(|s| s.blocks.is_empty()) {
                return Err(CopilotParseError::Incomplete("funnel steps have no blocks".into()));
            }
            Ok(CopilotResult::Funnel(draft))
        }
        CopilotIntent::Settings => {
            let settings = match value {
                Value::Object(mut map) if map.len() == 1 && map.contains_key("settings") => {
                    match map.remove("settings") {
                        Some(Value::Object(inner)) => inner,
                        Some(_) => {
                            return Err(CopilotParseError::Incomplete(
                                "settings is not an object".into(),
                            ));
                        }
                        None => Props::new(),
                    }
                }
                Value::Object(map) => map,
                _ => return Err(CopilotParseError::Incomplete("settings is not an object".into())),
            };
            if settings.is_empty() {
                return Err(CopilotParseError::Incomplete("settings patch is empty".into()));
            }
            Ok(CopilotResult::Settings(SettingsPatch { settings }))
        }
    }
}

// ── Applying results ─────────────────────────────────────────────────

/// Where a parsed result lands. Unset fields fall back to the first step
/// and its first stack.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplyTarget {
    #[serde(default)]
    pub step_id: Option<String>,
    #[serde(default)]
    pub stack_id: Option<String>,
    #[serde(default)]
    pub index: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedChange {
    pub kind: CopilotIntent,
    /// Ids of the blocks or steps created, or the step whose settings changed.
    pub ids: Vec<String>,
}

/// Apply a parsed result to the funnel. Funnel drafts append new steps.
pub fn apply(
    result: &CopilotResult,
    funnel: &mut Funnel,
    target: &ApplyTarget,
) -> Result<AppliedChange, BuilderError> {
    match result {
        CopilotResult::Block(block) => {
            let stack_id = match &target.stack_id {
                Some(id) => id.clone(),
                None => builder::default_stack_id(funnel, target.step_id.as_deref())?,
            };
            let id = builder::insert_block(funnel, &stack_id, target.index, block.clone())?;
            Ok(AppliedChange {
                kind: CopilotIntent::Block,
                ids: vec![id],
            })
        }
        CopilotResult::Funnel(draft) => {
            let mut ids = Vec::with_capacity(draft.steps.len());
            for draft_step in &draft.steps {
                let mut step = Step::new(&draft_step.name);
                if let Some(stack) = step.frames.first_mut().and_then(|f| f.stacks.first_mut()) {
                    for block in &draft_step.blocks {
                        let mut block = block.clone();
                        block.reissue_ids();
                        stack.blocks.push(block);
                    }
                }
                ids.push(step.id.clone());
                funnel.steps.push(step);
            }
            Ok(AppliedChange {
                kind: CopilotIntent::Funnel,
                ids,
            })
        }
        CopilotResult::Settings(patch) => {
            let step_id = match &target.step_id {
                Some(id) => id.clone(),
                None => funnel
                    .steps
                    .first()
                    .map(|s| s.id.clone())
                    .ok_or(BuilderError::EmptyFunnel)?,
            };
            builder::apply_settings_patch(funnel, &step_id, &patch.settings)?;
            Ok(AppliedChange {
                kind: CopilotIntent::Settings,
                ids: vec![step_id],
            })
        }
    }
}

// ── Request context ──────────────────────────────────────────────────

/// Snapshot of the page the user is editing, sent with the prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageContext {
    pub funnel_name: String,
    pub step_names: Vec<String>,
    pub step_id: Option<String>,
    pub step_name: Option<String>,
    pub block_types: Vec<String>,
    pub settings: Props,
    pub selected_block: Option<Block>,
}

impl PageContext {
    /// Build from the funnel, focused on `step_id` (or the first step).
    pub fn from_funnel(funnel: &Funnel, step_id: Option<&str>, selected_block: Option<&str>) -> Self {
        let step = match step_id {
            Some(id) => funnel.steps.iter().find(|s| s.id == id),
            None => funnel.steps.first(),
        };
        Self {
            funnel_name: funnel.name.clone(),
            step_names: funnel.steps.iter().map(|s| s.name.clone()).collect(),
            step_id: step.map(|s| s.id.clone()),
            step_name: step.map(|s| s.name.clone()),
            block_types: step
                .map(|s| s.blocks().map(|b| b.kind.clone()).collect())
                .unwrap_or_default(),
            settings: step.map(|s| s.settings.clone()).unwrap_or_default(),
            selected_block: selected_block.and_then(|id| builder::find_block(funnel, id).cloned()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CopilotRequest {
    pub prompt: String,
    pub intent: CopilotIntent,
    pub context: PageContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

// ── Generation backend ───────────────────────────────────────────────

#[async_trait]
pub trait CopilotBackend: Send + Sync {
    /// Full reply text for a request.
    async fn generate(&self, request: &CopilotRequest) -> Result<String>;
}

/// Generation endpoint reached over HTTP, reply read as a byte stream.
pub struct HttpCopilotClient {
    http: reqwest::Client,
    endpoint: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
}

impl HttpCopilotClient {
    pub fn new(endpoint: Option<String>, api_key: Option<String>, model: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
            api_key,
            model,
        }
    }

    pub fn from_config(config: &crate::config::CopilotConfig) -> Self {
        Self::new(
            config.endpoint.clone(),
            config.api_key.clone(),
            config.model.clone(),
        )
    }
}

#[async_trait]
impl CopilotBackend for HttpCopilotClient {
    async fn generate(&self, request: &CopilotRequest) -> Result<String> {
        let endpoint = self
            .endpoint
            .as_deref()
            .context("Copilot endpoint is not configured")?;

        let mut body = request.clone();
        if body.model.is_none() {
            body.model = self.model.clone();
        }

        let mut req = self.http.post(endpoint).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        info!(intent = ?request.intent, "Requesting copilot generation");
        let response = req
            .send()
            .await
            .context("Failed to reach copilot endpoint")?
            .error_for_status()
            .context("Copilot endpoint returned an error")?;

        let mut stream = response.bytes_stream();
        let mut acc = StreamAccumulator::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Copilot stream interrupted")?;
            acc.push_bytes(&chunk);
        }
        let text = acc.finish();
        debug!(chars = text.len(), "Copilot stream complete");
        Ok(text)
    }
}
