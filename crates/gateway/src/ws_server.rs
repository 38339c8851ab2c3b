//! HTTP surface: WebSocket upgrade routes, the broadcast hook and health.
//!
//! Every connection check runs before the upgrade so a rejected client gets
//! a plain HTTP status instead of a socket that closes right away.

use crate::analytics::{
    AnalyticsCommandHandler, AnalyticsConnection, AnalyticsService, ANALYTICS_FETCH_TIMEOUT,
    ANALYTICS_SEND_BUFFER,
};
use crate::client::{Client, ClientIdentity, DEFAULT_SEND_BUFFER};
use crate::command::{CommandProcessor, DEFAULT_COMMAND_TIMEOUT};
use crate::config::{GatewayConfig, DEFAULT_ALLOWED_ACTIONS};
use crate::entity_command::{build_topics, is_integrated, normalize_entity, EntityCommandHandler};
use crate::error::{GatewayError, Result};
use crate::hub::Hub;
use crate::section::SectionService;
use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use common::messages::{ACTION_CONNECTED, SYSTEM_ENTITY, TOPIC_SYSTEM_CONNECTED};
use common::{CanonicalMessage, Claims, Metadata, SnapshotAudience, TokenValidator};
use external_services::bearer_token;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Entity event topics a notifications client may receive.
const NOTIFICATION_TOPICS: &[&str] = &[
    "reservations.created",
    "reservations.updated",
    "reservations.deleted",
    "reservations.status-changed",
    "restaurants.created",
    "restaurants.updated",
    "restaurants.deleted",
    "tables.created",
    "tables.updated",
    "tables.deleted",
    "sections.created",
    "sections.updated",
    "sections.deleted",
    "menus.created",
    "menus.updated",
    "menus.deleted",
    "dishes.created",
    "dishes.updated",
    "dishes.deleted",
    "reviews.created",
    "reviews.updated",
    "reviews.deleted",
    "payments.created",
    "payments.updated",
    "payments.status-changed",
    "subscriptions.created",
    "subscriptions.updated",
    "subscriptions.status-changed",
];

/// Per-connection knobs.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub default_entity: String,
    pub allowed_actions: Vec<String>,
    pub send_buffer: usize,
    pub ping_interval: Duration,
    pub idle_timeout: Duration,
    pub command_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            default_entity: "restaurants".to_string(),
            allowed_actions: DEFAULT_ALLOWED_ACTIONS.split(',').map(str::to_string).collect(),
            send_buffer: DEFAULT_SEND_BUFFER,
            ping_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

impl From<&GatewayConfig> for ConnectionSettings {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            default_entity: config.default_entity.clone(),
            allowed_actions: config.allowed_actions.clone(),
            send_buffer: config.send_buffer,
            ping_interval: config.ping_interval,
            idle_timeout: config.idle_timeout,
            command_timeout: config.command_timeout,
        }
    }
}

/// Shared application state.
pub struct AppState {
    pub hub: Hub,
    pub validator: Arc<dyn TokenValidator>,
    pub sections: Arc<SectionService>,
    pub analytics: Arc<AnalyticsService>,
    pub settings: ConnectionSettings,
    notification_seq: AtomicU64,
}

impl AppState {
    pub fn new(
        hub: Hub,
        validator: Arc<dyn TokenValidator>,
        sections: Arc<SectionService>,
        analytics: Arc<AnalyticsService>,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            hub,
            validator,
            sections,
            analytics,
            settings,
            notification_seq: AtomicU64::new(0),
        }
    }
}

/// Create the HTTP router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws/notifications", get(notifications_handler))
        .route("/ws/analytics/{scope}/{entity}", get(analytics_handler))
        .route("/ws/{entity}/{section}", get(section_handler))
        .route("/ws/{entity}/{section}/{token}", get(section_handler))
        .route("/broadcast", post(broadcast_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "clients": state.hub.client_count(),
        "topics": state.hub.topic_count(),
    }))
}

fn header_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .map(str::to_string)
}

fn query_token(query: &HashMap<String, String>) -> Option<String> {
    query
        .get("token")
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

/// Split the socket and run both loops; returns once the read side ends.
async fn run_connection(
    socket: WebSocket,
    client: Arc<Client>,
    rx: mpsc::Receiver<Message>,
    processor: CommandProcessor,
    settings: &ConnectionSettings,
) {
    let (sink, stream) = socket.split();
    tokio::spawn(client.clone().run_write_loop(sink, rx, settings.ping_interval));
    client
        .run_read_loop(stream, Arc::new(processor), settings.idle_timeout)
        .await;
}

/// `/ws/{entity}/{section}[/{token}]`
async fn section_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response> {
    let mut entity = normalize_entity(params.get("entity").map(String::as_str).unwrap_or_default());
    if entity.is_empty() {
        entity = normalize_entity(&state.settings.default_entity);
    }
    let section = params
        .get("section")
        .map(|s| s.trim().to_string())
        .unwrap_or_default();

    if entity.is_empty() {
        warn!(section_id = %section, "ws rejected: missing entity");
        return Err(GatewayError::MissingInput("entity"));
    }
    if !is_integrated(&entity) {
        warn!(entity = %entity, section_id = %section, "ws rejected: entity not integrated");
        return Err(GatewayError::NotIntegrated(entity));
    }
    if section.is_empty() {
        warn!(entity = %entity, "ws rejected: missing section");
        return Err(GatewayError::MissingInput("section"));
    }

    let token = params
        .get("token")
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .or_else(|| query_token(&query))
        .or_else(|| header_token(&headers))
        .unwrap_or_default();

    let claims = state.sections.connect(&token, &section).inspect_err(|e| {
        warn!(entity = %entity, section_id = %section, error = %e, "ws connect rejected");
    })?;

    Ok(ws.on_upgrade(move |socket| serve_section(socket, state, entity, section, token, claims)))
}

async fn serve_section(
    socket: WebSocket,
    state: Arc<AppState>,
    entity: String,
    section: String,
    token: String,
    claims: Claims,
) {
    let settings = &state.settings;
    let mut processor = CommandProcessor::new(settings.command_timeout);
    let audience = SnapshotAudience::from_claims(&claims);
    if let Some(handler) =
        EntityCommandHandler::new(&entity, &section, &token, audience, state.sections.clone())
    {
        processor = processor.with_fallback(Arc::new(handler));
    }

    let (client, rx) = Client::new(
        state.hub.clone(),
        ClientIdentity {
            user_id: claims.subject.clone(),
            session_id: claims.session_id.clone(),
            section_id: section.clone(),
            entity: entity.clone(),
            token,
        },
        settings.send_buffer,
    );
    let topics = build_topics(&entity, &settings.allowed_actions);
    state.hub.attach_client(&client, &topics);

    let mut metadata = Metadata::new();
    metadata.insert("userId".to_string(), claims.subject.clone());
    metadata.insert("sessionId".to_string(), claims.session_id.clone());
    metadata.insert("sectionId".to_string(), section.clone());
    let connected = CanonicalMessage::new(TOPIC_SYSTEM_CONNECTED, SYSTEM_ENTITY, ACTION_CONNECTED)
        .with_metadata(metadata)
        .with_data(json!({
            "entity": entity,
            "sectionId": section,
            "allowedTopics": topics,
            "roles": claims.roles,
        }));
    client.send_message(&connected);

    info!(
        entity = %entity,
        section_id = %section,
        user_id = %claims.subject,
        session_id = %claims.session_id,
        roles = ?claims.roles,
        "ws connected"
    );
    run_connection(socket, client, rx, processor, settings).await;
}

/// Notification topics visible to `roles`: admins get everything, owners
/// everything except user administration, anyone else reservation, review
/// and restaurant events.
pub fn notification_topics(roles: &[String]) -> Vec<String> {
    let has = |role: &str| roles.iter().any(|r| r.trim().eq_ignore_ascii_case(role));
    let (admin, owner) = (has("ADMIN"), has("OWNER"));

    NOTIFICATION_TOPICS
        .iter()
        .filter(|topic| {
            if admin {
                true
            } else if owner {
                !topic.starts_with("users.") && !topic.starts_with("owner-upgrades.")
            } else {
                ["reservations.", "reviews.", "restaurants."]
                    .iter()
                    .any(|prefix| topic.starts_with(prefix))
            }
        })
        .map(|topic| topic.to_string())
        .collect()
}

/// `/ws/notifications`
async fn notifications_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response> {
    let token = query_token(&query)
        .or_else(|| header_token(&headers))
        .unwrap_or_default();
    let claims = state.validator.validate(&token).map_err(|e| {
        warn!(error = %e, "notifications ws auth failed");
        GatewayError::AuthInvalid(e.to_string())
    })?;

    Ok(ws.on_upgrade(move |socket| serve_notifications(socket, state, token, claims)))
}

async fn serve_notifications(socket: WebSocket, state: Arc<AppState>, token: String, claims: Claims) {
    let session_id = format!(
        "notif-{}",
        state.notification_seq.fetch_add(1, Ordering::Relaxed) + 1
    );
    let topics = notification_topics(&claims.roles);

    let (client, rx) = Client::new(
        state.hub.clone(),
        ClientIdentity {
            user_id: claims.subject.clone(),
            session_id: session_id.clone(),
            section_id: String::new(),
            entity: "notifications".to_string(),
            token,
        },
        state.settings.send_buffer,
    );
    state.hub.attach_client(&client, &topics);

    info!(
        user_id = %claims.subject,
        session_id = %session_id,
        roles = ?claims.roles,
        topics = topics.len(),
        "notifications ws connected"
    );
    let processor = CommandProcessor::new(state.settings.command_timeout);
    run_connection(socket, client, rx, processor, &state.settings).await;
}

/// `/ws/analytics/{scope}/{entity}`
async fn analytics_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path((scope, entity)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response> {
    let Some(endpoint) = state.analytics.resolve(&scope, &entity).cloned() else {
        warn!(scope = %scope, entity = %entity, "analytics ws unsupported endpoint");
        return Ok((StatusCode::NOT_FOUND, "analytics endpoint not available").into_response());
    };

    let token = header_token(&headers).unwrap_or_default();
    let request = endpoint.request_from_params(&params);
    let connection = state
        .analytics
        .connect(endpoint.key, &token, &request)
        .await
        .inspect_err(|e| warn!(key = %endpoint.key, error = %e, "analytics connect rejected"))?;

    Ok(ws.on_upgrade(move |socket| serve_analytics(socket, state, token, connection)))
}

async fn serve_analytics(
    socket: WebSocket,
    state: Arc<AppState>,
    token: String,
    connection: AnalyticsConnection,
) {
    let AnalyticsConnection {
        claims,
        message,
        request,
        endpoint,
    } = connection;
    let claims = claims.unwrap_or_default();
    let user_id = claims.subject.trim().to_string();
    let session_id = match claims.session_id.trim() {
        "" => state.analytics.next_session_id(endpoint.key),
        sid => sid.to_string(),
    };
    let topics = endpoint.topics();

    let handler = AnalyticsCommandHandler::new(
        endpoint.clone(),
        &session_id,
        &token,
        request.clone(),
        state.analytics.clone(),
    );
    let processor = CommandProcessor::new(state.settings.command_timeout.max(ANALYTICS_FETCH_TIMEOUT))
        .with_fallback(Arc::new(handler));

    let (client, rx) = Client::new(
        state.hub.clone(),
        ClientIdentity {
            user_id: user_id.clone(),
            session_id: session_id.clone(),
            section_id: String::new(),
            entity: endpoint.key.to_string(),
            token: token.clone(),
        },
        ANALYTICS_SEND_BUFFER,
    );
    state.hub.attach_client(&client, &topics);
    state
        .analytics
        .register_session(&session_id, endpoint.key, &token, &request);
    let analytics = state.analytics.clone();
    let hook_session = session_id.clone();
    client.add_close_hook(move |_| analytics.unregister_session(&hook_session));

    client.send_message(&message);

    let mut metadata = Metadata::new();
    metadata.insert("scope".to_string(), endpoint.scope.to_string());
    metadata.insert("analyticsKey".to_string(), endpoint.key.to_string());
    if !user_id.is_empty() {
        metadata.insert("userId".to_string(), user_id.clone());
    }
    metadata.insert("sessionId".to_string(), session_id.clone());
    let connected = CanonicalMessage::new(TOPIC_SYSTEM_CONNECTED, SYSTEM_ENTITY, ACTION_CONNECTED)
        .with_metadata(metadata)
        .with_data(json!({
            "mode": "analytics",
            "entity": endpoint.entity(),
            "topics": topics,
            "identifier": request.identifier,
            "query": request.query,
            "roles": claims.roles,
        }));
    client.send_message(&connected);

    info!(key = %endpoint.key, user_id = %user_id, session_id = %session_id, scope = %endpoint.scope, "analytics ws connected");
    run_connection(socket, client, rx, processor, &state.settings).await;
}

/// Body of `POST /broadcast`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct BroadcastRequest {
    pub event: String,
    pub topic: String,
    pub reservation_id: String,
    pub payment_id: String,
    pub status: String,
    pub amount: f64,
    pub timestamp: String,
    pub data: Map<String, Value>,
}

#[derive(Debug, Serialize)]
pub struct BroadcastResponse {
    pub success: bool,
    pub message: String,
    pub event: String,
    pub delivered: usize,
}

impl BroadcastRequest {
    /// Message for the hub; the topic defaults to the event name.
    pub fn into_message(self) -> CanonicalMessage {
        let topic = match self.topic.trim() {
            "" => self.event.trim().to_string(),
            topic => topic.to_string(),
        };

        let mut data = Map::new();
        data.insert("event".to_string(), Value::String(self.event.clone()));
        let optional = [
            ("reservation_id", &self.reservation_id),
            ("payment_id", &self.payment_id),
            ("status", &self.status),
            ("timestamp", &self.timestamp),
        ];
        for (key, value) in optional {
            if !value.is_empty() {
                data.insert(key.to_string(), Value::String(value.clone()));
            }
        }
        if self.amount > 0.0 {
            data.insert("amount".to_string(), json!(self.amount));
        }
        data.extend(self.data);

        let resource_id = if self.reservation_id.is_empty() {
            self.payment_id
        } else {
            self.reservation_id
        };
        CanonicalMessage::new(topic, "payment", "status-changed")
            .with_resource_id(resource_id)
            .with_data(Value::Object(data))
    }
}

/// `POST /broadcast`
async fn broadcast_handler(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<BroadcastRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "invalid request body").into_response();
    };
    if request.event.trim().is_empty() {
        return GatewayError::MissingInput("event").into_response();
    }

    let event = request.event.clone();
    let msg = request.into_message();
    let delivered = state.hub.broadcast(&msg);
    info!(event = %event, topic = %msg.topic, resource_id = %msg.resource_id, delivered, "http broadcast");

    Json(BroadcastResponse {
        success: true,
        message: "Message broadcasted successfully".to_string(),
        event,
        delivered,
    })
    .into_response()
}
