//! HTTP surface for the lead agent.
//!
//! `/agent/*` routes require a bearer token (unless auth is disabled);
//! `/health` and `/webhook/message` stay open for the messaging integration.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::embeddings::spawn_embedding_writeback;
use crate::model::{
    ChatMessage, ConversationState, LeadProfile, MessageDraft, Role, Source, Stage,
    HISTORY_TRANSPORT_WINDOW,
};
use crate::orchestrator::{TurnOrchestrator, TurnOutcome};
use crate::store::ConversationStore;

const HISTORY_LOOKUP_LIMIT: usize = 40;
const SYSTEM_INSTRUCTION_PLACEHOLDER: &str =
    "[System instruction: generate a message based on context and lead profile]";

#[derive(Clone)]
pub struct ServerState {
    pub orchestrator: Arc<TurnOrchestrator>,
    pub store: Arc<ConversationStore>,
    pub auth: AuthConfig,
    pub embedder: Arc<dyn crate::embeddings::Embedder>,
    pub embedding_version: String,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    mode: AuthMode,
    token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Required,
    Disabled,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// One inbound turn, from either the webhook or the reply endpoint.
#[derive(Debug, Deserialize)]
struct TurnRequest {
    thread_id: Option<String>,
    #[serde(default)]
    text: String,
    #[serde(default)]
    role: Option<String>,
    chat_history: Option<Vec<ChatMessage>>,
    stage: Option<Stage>,
    lead_profile: Option<LeadProfile>,
    state: Option<ConversationState>,
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    thread_id: Option<String>,
    chat_history: Option<Vec<ChatMessage>>,
    lead_profile: Option<LeadProfile>,
}

#[derive(Debug, Serialize)]
struct StartResponse {
    status: &'static str,
    state: ConversationState,
}

#[derive(Debug, Deserialize)]
struct SystemMessageRequest {
    thread_id: Option<String>,
    #[serde(default)]
    message: String,
    escalation_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct SystemMessageResponse {
    status: &'static str,
    message_id: i64,
    escalation_resolved: bool,
}

pub async fn serve(state: ServerState) -> Result<()> {
    let bind_addr = std::env::var("LEADLINE_BIND")
        .unwrap_or_else(|_| "127.0.0.1:8790".to_string())
        .parse::<SocketAddr>()
        .context("Invalid LEADLINE_BIND (expected host:port)")?;

    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind server to {}", bind_addr))?;
    tracing::info!("Lead agent listening on http://{}", bind_addr);
    axum::serve(listener, app).await.context("Server failed")?;
    Ok(())
}

fn build_router(state: ServerState) -> Router {
    let state = Arc::new(state);

    let protected = Router::new()
        .route("/agent/start", post(start_conversation))
        .route("/agent/reply", post(generate_reply))
        .route("/agent/system_message", post(send_system_message))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/webhook/message", post(webhook_message))
        .with_state(state)
        .merge(protected)
}

pub fn load_auth_config() -> Result<AuthConfig> {
    let mode = parse_auth_mode(std::env::var("LEADLINE_AUTH_MODE").ok())?;
    let token = std::env::var("LEADLINE_TOKEN")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    if mode == AuthMode::Required && token.is_none() {
        return Err(anyhow!(
            "LEADLINE_TOKEN is required when auth mode is 'required'"
        ));
    }
    if mode == AuthMode::Disabled {
        tracing::warn!("Auth mode is disabled; agent routes are unauthenticated");
    }

    Ok(AuthConfig { mode, token })
}

fn parse_auth_mode(raw: Option<String>) -> Result<AuthMode> {
    let normalized = raw
        .unwrap_or_else(|| "required".to_string())
        .trim()
        .to_ascii_lowercase();
    match normalized.as_str() {
        "" | "required" | "on" | "enabled" | "true" => Ok(AuthMode::Required),
        "disabled" | "off" | "false" => Ok(AuthMode::Disabled),
        other => Err(anyhow!(
            "Invalid LEADLINE_AUTH_MODE '{}'. Expected 'required' or 'disabled'",
            other
        )),
    }
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    authorize(&headers, &state.auth)?;
    Ok(next.run(request).await)
}

fn authorize(headers: &HeaderMap, auth: &AuthConfig) -> Result<(), StatusCode> {
    if auth.mode == AuthMode::Disabled {
        return Ok(());
    }
    let Some(token) = auth.token.as_deref() else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    let Some(raw_header) = headers.get(header::AUTHORIZATION) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Ok(auth_value) = raw_header.to_str() else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let expected = format!("Bearer {}", token);
    if auth_value.trim() != expected {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Non-persisting turn used by the messaging integration. Also carries the
/// system-instruction mode: an inbound `role = "system"` payload treats the
/// text as an instruction and generates a proactive message.
async fn webhook_message(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<TurnRequest>,
) -> Json<TurnOutcome> {
    let outcome = run_turn(&state, body, false).await;
    Json(outcome)
}

/// Persisting turn: the lead utterance and any sent reply are written to the
/// store with atomically assigned turn indexes.
async fn generate_reply(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<TurnRequest>,
) -> Json<TurnOutcome> {
    let outcome = run_turn(&state, body, true).await;
    Json(outcome)
}

/// Shared turn driver for the webhook and reply endpoints. A payload `state`
/// takes precedence over the locally built history, so a system instruction
/// sent alongside an explicit `state` is dropped with that history.
async fn run_turn(state: &ServerState, body: TurnRequest, persist: bool) -> TurnOutcome {
    let thread_id = body.thread_id.clone().unwrap_or_default();
    let mut chat_history = build_chat_history(
        &state.store,
        &thread_id,
        body.chat_history.as_deref(),
    );

    let is_system_instruction = body
        .role
        .as_deref()
        .is_some_and(|r| r.eq_ignore_ascii_case("system"));
    let mut text = body.text.clone();
    if is_system_instruction && !text.trim().is_empty() {
        chat_history.insert(0, ChatMessage::system(text));
        text = SYSTEM_INSTRUCTION_PLACEHOLDER.to_string();
    }

    let conversation = match body.state {
        Some(mut existing) => {
            if existing.thread_id.is_empty() {
                existing.thread_id = thread_id;
            }
            existing
        }
        None => ConversationState {
            thread_id,
            stage: body.stage.unwrap_or_default(),
            chat_history,
            lead_profile: body.lead_profile.unwrap_or_default(),
            ..Default::default()
        },
    };

    state.orchestrator.run_turn(conversation, &text, persist).await
}

async fn start_conversation(
    State(_state): State<Arc<ServerState>>,
    Json(body): Json<StartRequest>,
) -> Json<StartResponse> {
    let state = ConversationState {
        thread_id: body.thread_id.unwrap_or_default(),
        stage: Stage::Qualifying,
        chat_history: body.chat_history.unwrap_or_default(),
        lead_profile: body.lead_profile.unwrap_or_default(),
        ..Default::default()
    };
    Json(StartResponse {
        status: "started",
        state,
    })
}

/// Persist a human/system reply into the thread and resolve the linked
/// escalation when one is given.
async fn send_system_message(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<SystemMessageRequest>,
) -> Result<Json<SystemMessageResponse>, (StatusCode, String)> {
    let thread_id = body.thread_id.unwrap_or_default();
    let message = body.message.trim().to_string();
    if thread_id.is_empty() || message.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "thread_id and message are required".to_string(),
        ));
    }

    let mut draft = MessageDraft::new(
        &thread_id,
        Role::System,
        message.clone(),
        Stage::Qualifying,
        Source::SystemAgent,
    );
    draft.stage = current_thread_stage(&state.store, &thread_id);

    let (message_id, _) = state.store.insert_message(&draft).map_err(internal_error)?;
    spawn_embedding_writeback(
        state.store.clone(),
        state.embedder.clone(),
        message_id,
        message.clone(),
        state.embedding_version.clone(),
    );

    let mut escalation_resolved = false;
    if let Some(escalation_id) = body.escalation_id.as_deref() {
        let snippet: String = message.chars().take(100).collect();
        let notes = format!("System message sent: {snippet}");
        match state
            .store
            .resolve_escalation(escalation_id, &notes, "system_agent")
        {
            Ok(resolved) => escalation_resolved = resolved,
            Err(e) => {
                tracing::warn!("Failed to resolve escalation {}: {:#}", escalation_id, e);
            }
        }
    }

    Ok(Json(SystemMessageResponse {
        status: "sent",
        message_id,
        escalation_resolved,
    }))
}

/// Transport history for the turn: the payload's history when it carries one,
/// otherwise the stored thread, both bounded to the transport window.
fn build_chat_history(
    store: &ConversationStore,
    thread_id: &str,
    payload_history: Option<&[ChatMessage]>,
) -> Vec<ChatMessage> {
    if let Some(history) = payload_history {
        if !history.is_empty() {
            let start = history.len().saturating_sub(HISTORY_TRANSPORT_WINDOW);
            return history[start..].to_vec();
        }
    }

    if thread_id.is_empty() {
        return Vec::new();
    }

    match store.thread_history(thread_id, HISTORY_LOOKUP_LIMIT) {
        Ok(rows) => {
            let mut mapped: Vec<ChatMessage> = rows
                .into_iter()
                .map(|(role, content)| ChatMessage {
                    role: role.chat_role().to_string(),
                    content,
                })
                .collect();
            let start = mapped.len().saturating_sub(HISTORY_TRANSPORT_WINDOW);
            mapped.drain(..start);
            mapped
        }
        Err(e) => {
            tracing::warn!("History lookup failed for thread {}: {:#}", thread_id, e);
            Vec::new()
        }
    }
}

fn current_thread_stage(store: &ConversationStore, thread_id: &str) -> String {
    match store.get_thread(thread_id) {
        Ok(Some(thread)) => thread.stage,
        _ => "unknown".to_string(),
    }
}

fn internal_error(error: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetrievalWeights;
    use crate::embeddings::testing::StubEmbedder;
    use crate::llm::testing::StubGenerator;
    use crate::retrieval::RetrievalEngine;
    use axum::http::HeaderValue;

    fn server_state(store: Arc<ConversationStore>, generator: StubGenerator) -> ServerState {
        let embedder: Arc<dyn crate::embeddings::Embedder> =
            Arc::new(StubEmbedder { available: false });
        let retrieval = Arc::new(RetrievalEngine::new(
            store.clone(),
            embedder.clone(),
            RetrievalWeights::default(),
        ));
        let orchestrator = Arc::new(TurnOrchestrator::new(
            store.clone(),
            Arc::new(generator),
            embedder.clone(),
            retrieval,
            1600,
            "v1".to_string(),
        ));
        ServerState {
            orchestrator,
            store,
            auth: AuthConfig {
                mode: AuthMode::Disabled,
                token: None,
            },
            embedder,
            embedding_version: "v1".to_string(),
        }
    }

    #[test]
    fn authorize_accepts_matching_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer token-123"),
        );
        assert!(authorize(
            &headers,
            &AuthConfig {
                mode: AuthMode::Required,
                token: Some("token-123".to_string()),
            }
        )
        .is_ok());
    }

    #[test]
    fn authorize_rejects_missing_or_invalid_token() {
        let headers = HeaderMap::new();
        let auth = AuthConfig {
            mode: AuthMode::Required,
            token: Some("token-123".to_string()),
        };
        assert!(authorize(&headers, &auth).is_err());

        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer wrong"),
        );
        assert!(authorize(&headers, &auth).is_err());
    }

    #[test]
    fn authorize_allows_when_auth_mode_disabled() {
        let headers = HeaderMap::new();
        assert!(authorize(
            &headers,
            &AuthConfig {
                mode: AuthMode::Disabled,
                token: None,
            }
        )
        .is_ok());
    }

    #[test]
    fn parse_auth_mode_defaults_to_required() {
        assert!(matches!(parse_auth_mode(None).unwrap(), AuthMode::Required));
        assert!(matches!(
            parse_auth_mode(Some("disabled".to_string())).unwrap(),
            AuthMode::Disabled
        ));
        assert!(parse_auth_mode(Some("nope".to_string())).is_err());
    }

    #[test]
    fn payload_history_is_preferred_and_windowed() {
        let store = ConversationStore::in_memory().unwrap();
        let payload: Vec<ChatMessage> =
            (0..30).map(|i| ChatMessage::user(format!("m{i}"))).collect();
        let history = build_chat_history(&store, "t1", Some(&payload));
        assert_eq!(history.len(), HISTORY_TRANSPORT_WINDOW);
        assert_eq!(history.last().unwrap().content, "m29");
    }

    #[test]
    fn stored_history_is_mapped_to_transport_roles() {
        let store = ConversationStore::in_memory().unwrap();
        store
            .insert_message(&MessageDraft::new(
                "t1",
                Role::Lead,
                "hello",
                Stage::Qualifying,
                Source::Generated,
            ))
            .unwrap();
        store
            .insert_message(&MessageDraft::new(
                "t1",
                Role::Agent,
                "hi there",
                Stage::Qualifying,
                Source::Generated,
            ))
            .unwrap();

        let history = build_chat_history(&store, "t1", None);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, "user");
        assert_eq!(history[1].role, "assistant");
    }

    #[test]
    fn missing_thread_yields_empty_history() {
        let store = ConversationStore::in_memory().unwrap();
        assert!(build_chat_history(&store, "", None).is_empty());
        assert!(build_chat_history(&store, "nope", None).is_empty());
    }

    #[tokio::test]
    async fn system_role_turn_produces_a_proactive_message() {
        let store = Arc::new(ConversationStore::in_memory().unwrap());
        let generator = StubGenerator::new([
            r#"{"stage": "working"}"#,
            r#"{"outgoing_message": "Hi! Any luck with those listings? Happy to set up a tour.",
                "next_action_suggested": null}"#,
        ]);
        let state = server_state(store, generator);

        let body = TurnRequest {
            thread_id: Some("t1".to_string()),
            text: "Nudge the lead about scheduling a tour this week".to_string(),
            role: Some("system".to_string()),
            chat_history: None,
            stage: Some(Stage::Working),
            lead_profile: None,
            state: None,
        };
        let outcome = run_turn(&state, body, false).await;

        assert!(outcome.should_send_message);
        assert!(!outcome.escalation);
        assert!(!outcome.message.is_empty());
        // The instruction entered the generation window as a system message;
        // the lead-facing utterance became the placeholder.
        assert_eq!(outcome.state.chat_history[0].role, "system");
        assert!(outcome.state.chat_history[0]
            .content
            .contains("Nudge the lead"));
        assert_eq!(
            outcome.state.chat_history[1].content,
            SYSTEM_INSTRUCTION_PLACEHOLDER
        );
    }

    #[tokio::test]
    async fn system_message_uses_thread_stage_and_resolves_escalation() {
        let store = Arc::new(ConversationStore::in_memory().unwrap());
        store
            .insert_message(&MessageDraft::new(
                "t1",
                Role::Lead,
                "what are the fees?",
                Stage::Touring,
                Source::Generated,
            ))
            .unwrap();
        let escalation_id = store
            .insert_escalation(
                "t1",
                "escalate_fees",
                "fee question",
                "what are the fees?",
                "",
                "touring",
            )
            .unwrap();

        let state = Arc::new(server_state(store.clone(), StubGenerator::unavailable()));
        let response = send_system_message(
            State(state),
            Json(SystemMessageRequest {
                thread_id: Some("t1".to_string()),
                message: "The admin fee is $150. Happy to walk you through it.".to_string(),
                escalation_id: Some(escalation_id),
            }),
        )
        .await
        .unwrap();

        assert_eq!(response.0.status, "sent");
        assert!(response.0.escalation_resolved);

        // Stored with the thread's current stage, not a default.
        let recent = store.recent_in_thread("t1", 5, false).unwrap();
        let stored = recent.iter().find(|c| c.role == Role::System).unwrap();
        assert_eq!(stored.stage, "touring");
        assert_eq!(stored.source, Source::SystemAgent);

        assert!(store.unresolved_escalations(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn system_message_requires_thread_and_message() {
        let store = Arc::new(ConversationStore::in_memory().unwrap());
        let state = Arc::new(server_state(store, StubGenerator::unavailable()));

        let result = send_system_message(
            State(state),
            Json(SystemMessageRequest {
                thread_id: None,
                message: "   ".to_string(),
                escalation_id: None,
            }),
        )
        .await;

        let (status, _) = result.err().unwrap();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
