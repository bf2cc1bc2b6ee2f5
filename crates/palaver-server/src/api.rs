use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, Method},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use palaver_messaging::{ConversationView, MessagingService, ReactionOutcome};
use palaver_net::DeliveryRegistry;
use palaver_shared::protocol::SignalEnvelope;
use palaver_shared::types::{ConversationId, MessageId, UserId};
use palaver_store::{
    BroadcastSettingsPatch, Conversation, Message, MessageMetadata, ParticipantRole,
};

use crate::config::ServerConfig;
use crate::error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<DeliveryRegistry>,
    pub messaging: Arc<MessagingService>,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/call/config", get(call_config))
        .route("/call/signal", post(call_signal))
        .route("/conversations", get(list_conversations))
        .route("/conversations/direct", post(create_direct))
        .route("/conversations/group", post(create_group))
        .route("/conversations/broadcast", post(create_broadcast))
        .route("/conversations/:id/participants", post(add_participants))
        .route("/conversations/:id/messages", post(send_message))
        .route("/conversations/:id/read", post(mark_read))
        .route("/messages/:id/reactions", post(toggle_reaction))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// The authenticated user identity, handed over by the external auth layer
/// as an `x-user-id` header.
fn actor_id(headers: &HeaderMap) -> Result<UserId, ApiError> {
    let raw = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("Missing x-user-id header".into()))?;
    raw.parse()
        .map(UserId)
        .map_err(|_| ApiError::BadRequest("Invalid x-user-id header".into()))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CallConfigResponse {
    stun_servers: Vec<String>,
}

async fn call_config(State(state): State<AppState>) -> Json<CallConfigResponse> {
    Json(CallConfigResponse {
        stun_servers: state.config.ice.stun_servers.clone(),
    })
}

#[derive(Serialize)]
struct SignalResponse {
    delivered: bool,
}

/// Route a call signal to the counterpart of the acting user. A miss means
/// the counterpart is offline; that is an observation, not an error.
async fn call_signal(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(envelope): Json<SignalEnvelope>,
) -> Result<Json<SignalResponse>, ApiError> {
    let actor = actor_id(&headers)?;
    let target = envelope
        .signal
        .counterpart_of(&actor)
        .map(|profile| profile.id)
        .ok_or_else(|| ApiError::Forbidden("Actor is not a party to this call".into()))?;

    let kind = envelope.kind;
    let delivered = state.registry.send(&target, envelope.into_event());
    debug!(
        kind = kind.as_str(),
        from = %actor.short(),
        to = %target.short(),
        delivered,
        "routed call signal"
    );
    Ok(Json(SignalResponse { delivered }))
}

async fn list_conversations(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ConversationView>>, ApiError> {
    let actor = actor_id(&headers)?;
    Ok(Json(state.messaging.user_conversations(&actor)?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DirectRequest {
    user_id: UserId,
}

async fn create_direct(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<DirectRequest>,
) -> Result<Json<Conversation>, ApiError> {
    let actor = actor_id(&headers)?;
    let conversation = state
        .messaging
        .create_direct_conversation(&actor, &req.user_id)?;
    Ok(Json(conversation))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupRequest {
    name: String,
    description: Option<String>,
    #[serde(default)]
    member_ids: Vec<UserId>,
}

async fn create_group(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<GroupRequest>,
) -> Result<Json<Conversation>, ApiError> {
    let actor = actor_id(&headers)?;
    let conversation = state.messaging.create_group_conversation(
        &actor,
        req.name,
        req.description,
        &req.member_ids,
    )?;
    Ok(Json(conversation))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BroadcastRequest {
    name: String,
    description: Option<String>,
    #[serde(default)]
    settings: BroadcastSettingsPatch,
}

async fn create_broadcast(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<BroadcastRequest>,
) -> Result<Json<Conversation>, ApiError> {
    let actor = actor_id(&headers)?;
    let conversation = state.messaging.create_broadcast_channel(
        &actor,
        req.name,
        req.description,
        req.settings,
    )?;
    info!(channel = %conversation.id.short(), "broadcast channel created via API");
    Ok(Json(conversation))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddParticipantsRequest {
    user_ids: Vec<UserId>,
    role: Option<ParticipantRole>,
}

#[derive(Serialize)]
struct AddParticipantsResponse {
    added: Vec<UserId>,
}

async fn add_participants(
    State(state): State<AppState>,
    Path(id): Path<ConversationId>,
    headers: HeaderMap,
    Json(req): Json<AddParticipantsRequest>,
) -> Result<Json<AddParticipantsResponse>, ApiError> {
    let actor = actor_id(&headers)?;
    let added = state.messaging.add_participants(
        id,
        &req.user_ids,
        &actor,
        req.role.unwrap_or(ParticipantRole::Member),
    )?;
    Ok(Json(AddParticipantsResponse { added }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest {
    content: String,
    metadata: Option<MessageMetadata>,
    reply_to: Option<MessageId>,
}

async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<ConversationId>,
    headers: HeaderMap,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<Message>, ApiError> {
    let actor = actor_id(&headers)?;
    let message =
        state
            .messaging
            .send_message(id, &actor, req.content, req.metadata, req.reply_to)?;
    Ok(Json(message))
}

async fn mark_read(
    State(state): State<AppState>,
    Path(id): Path<ConversationId>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let actor = actor_id(&headers)?;
    state.messaging.mark_as_read(id, &actor)?;
    Ok(Json(serde_json::json!({ "marked": true })))
}

#[derive(Deserialize)]
struct ReactionRequest {
    emoji: String,
}

#[derive(Serialize)]
struct ReactionResponse {
    outcome: ReactionOutcome,
}

async fn toggle_reaction(
    State(state): State<AppState>,
    Path(id): Path<MessageId>,
    headers: HeaderMap,
    Json(req): Json<ReactionRequest>,
) -> Result<Json<ReactionResponse>, ApiError> {
    let actor = actor_id(&headers)?;
    let outcome = state.messaging.toggle_reaction(id, &actor, &req.emoji)?;
    Ok(Json(ReactionResponse { outcome }))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
