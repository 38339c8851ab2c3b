//! Analytics streams: a static registry of analytics endpoints, the initial
//! fetch behind `/ws/analytics/{scope}/{entity}`, client-driven refetches and
//! event-driven refresh of every open dashboard that depends on a changed
//! entity.

use crate::client::Client;
use crate::command::{Command, FallbackHandler};
use crate::error::{GatewayError, Result};
use crate::hub::Hub;
use crate::section::command_error;
use async_trait::async_trait;
use common::messages::{
    error_topic, merge_metadata, snapshot_topic, ACTION_ERROR, ACTION_SNAPSHOT, META_SESSION_ID,
};
use common::{
    AnalyticsFetcher, AnalyticsRequest, AnalyticsSnapshot, CanonicalMessage,
    Claims, FetchError, Metadata, TokenValidator,
};
use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Deadline for one analytics fetch.
pub const ANALYTICS_FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Outbound queue capacity of analytics clients.
pub const ANALYTICS_SEND_BUFFER: usize = 4;

/// One analytics REST endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyticsEndpoint {
    /// `analytics-<scope>-<entity>`; also the entity of emitted messages.
    pub key: &'static str,
    pub scope: &'static str,
    pub path: &'static str,
    /// Request parameter holding the required identifier, sent upstream as a
    /// query parameter of the same name.
    pub identifier_param: Option<&'static str>,
    /// Query parameters forwarded upstream; anything else is dropped.
    pub query_params: &'static [&'static str],
    pub require_token: bool,
}

const START_DATE: &[&str] = &["startDate"];
const BY_RESTAURANT: &[&str] = &["restaurantId", "startDate"];

const fn public(key: &'static str, path: &'static str) -> AnalyticsEndpoint {
    AnalyticsEndpoint {
        key,
        scope: "public",
        path,
        identifier_param: None,
        query_params: START_DATE,
        require_token: false,
    }
}

const fn admin(
    key: &'static str,
    path: &'static str,
    query_params: &'static [&'static str],
) -> AnalyticsEndpoint {
    AnalyticsEndpoint {
        key,
        scope: "admin",
        path,
        identifier_param: None,
        query_params,
        require_token: true,
    }
}

const ENDPOINTS: &[AnalyticsEndpoint] = &[
    public("analytics-public-users", "/api/v1/users/analytics"),
    public("analytics-public-dishes", "/api/v1/dishes/analytics"),
    public("analytics-public-menus", "/api/v1/menus/analytics"),
    AnalyticsEndpoint {
        key: "analytics-restaurant-users",
        scope: "restaurant",
        path: "/api/v1/users/analytics",
        identifier_param: Some("restaurantId"),
        query_params: START_DATE,
        require_token: true,
    },
    admin("analytics-admin-users", "/api/v1/users/analytics", START_DATE),
    admin("analytics-admin-restaurants", "/api/v1/restaurants/analytics", START_DATE),
    admin("analytics-admin-sections", "/api/v1/sections/analytics", BY_RESTAURANT),
    admin(
        "analytics-admin-tables",
        "/api/v1/tables/analytics",
        &["sectionId", "restaurantId", "startDate"],
    ),
    admin("analytics-admin-images", "/api/v1/images/analytics", START_DATE),
    admin("analytics-admin-objects", "/api/v1/objects/analytics", START_DATE),
    admin("analytics-admin-subscriptions", "/api/v1/subscriptions/analytics", START_DATE),
    admin(
        "analytics-admin-subscription-plans",
        "/api/v1/subscription-plans/analytics",
        START_DATE,
    ),
    admin("analytics-admin-reservations", "/api/v1/reservations/analytics", BY_RESTAURANT),
    admin("analytics-admin-reviews", "/api/v1/reviews/analytics/stats", BY_RESTAURANT),
    admin("analytics-admin-payments", "/api/v1/payments/analytics", BY_RESTAURANT),
    admin("analytics-admin-auth", "/api/v1/auth/analytics", START_DATE),
];

impl AnalyticsEndpoint {
    pub fn entity(&self) -> &'static str {
        self.key
    }

    /// Topics an analytics client is attached to.
    pub fn topics(&self) -> Vec<String> {
        [snapshot_topic(self.key), error_topic(self.key)]
            .into_iter()
            .flatten()
            .collect()
    }

    /// Request built from connection query parameters.
    pub fn request_from_params(&self, params: &HashMap<String, String>) -> AnalyticsRequest {
        let identifier = self
            .identifier_param
            .and_then(|param| params.get(param))
            .map(|v| v.trim().to_string())
            .unwrap_or_default();
        let query = self
            .query_params
            .iter()
            .filter_map(|key| params.get(*key).map(|v| (key.to_string(), v.clone())))
            .collect();
        self.sanitize(&AnalyticsRequest { identifier, query })
    }

    /// Keep only allowed, non-blank query parameters.
    pub fn sanitize(&self, request: &AnalyticsRequest) -> AnalyticsRequest {
        let cleaned = request.cleaned();
        AnalyticsRequest {
            identifier: cleaned.identifier,
            query: cleaned
                .query
                .into_iter()
                .filter(|(key, _)| self.query_params.contains(&key.as_str()))
                .collect(),
        }
    }

    /// Upstream query for `request`, including the identifier when required.
    pub fn upstream_query(&self, request: &AnalyticsRequest) -> Result<BTreeMap<String, String>> {
        let mut query = request.query.clone();
        if let Some(param) = self.identifier_param {
            let identifier = request.identifier.trim();
            if identifier.is_empty() {
                return Err(GatewayError::MissingInput("identifier"));
            }
            query.insert(param.to_string(), identifier.to_string());
        }
        Ok(query)
    }
}

/// Registry keyed by `analytics-<scope>-<entity>`.
pub fn default_endpoints() -> HashMap<&'static str, AnalyticsEndpoint> {
    ENDPOINTS.iter().map(|e| (e.key, e.clone())).collect()
}

fn normalize_scope(raw: &str) -> String {
    let scope = raw.trim().to_lowercase();
    match scope.as_str() {
        "public" | "pub" => "public".to_string(),
        "restaurant" | "rest" | "owner" => "restaurant".to_string(),
        "admin" | "administrator" | "adm" | "auth" => "admin".to_string(),
        _ => scope,
    }
}

fn normalize_analytics_entity(scope: &str, raw: &str) -> String {
    let entity = raw.trim().to_lowercase().replace('_', "-");
    let resolved = match (scope, entity.as_str()) {
        ("public", "user" | "users" | "public-user" | "public-users") => "users",
        ("public", "dish" | "dishes") => "dishes",
        ("public", "menu" | "menus") => "menus",
        ("restaurant", "user" | "users" | "restaurant" | "restaurant-user" | "restaurant-users") => {
            "users"
        }
        ("admin", "auth" | "auth-user" | "auth-users" | "user" | "users") => "auth",
        ("admin", "restaurant" | "restaurants") => "restaurants",
        ("admin", "section" | "sections") => "sections",
        ("admin", "table" | "tables") => "tables",
        ("admin", "image" | "images") => "images",
        ("admin", "object" | "objects") => "objects",
        ("admin", "subscription" | "subscriptions") => "subscriptions",
        (
            "admin",
            "subscription-plan" | "subscription-plans" | "subscriptionplan" | "subscriptionplans",
        ) => "subscription-plans",
        ("admin", "reservation" | "reservations") => "reservations",
        ("admin", "review" | "reviews") => "reviews",
        ("admin", "payment" | "payments") => "payments",
        _ => return entity,
    };
    resolved.to_string()
}

/// Registry key for a scope/entity pair after alias resolution; empty when
/// either part is blank.
pub fn analytics_key(scope: &str, entity: &str) -> String {
    let scope = normalize_scope(scope);
    let entity = normalize_analytics_entity(&scope, entity);
    if scope.is_empty() || entity.is_empty() {
        return String::new();
    }
    format!("analytics-{}-{}", scope, entity)
}

/// Analytics keys whose figures change when `entity` changes.
pub fn analytics_dependencies(entity: &str) -> &'static [&'static str] {
    match entity.trim().to_lowercase().as_str() {
        "restaurants" => &[
            "analytics-admin-restaurants",
            "analytics-admin-sections",
            "analytics-admin-tables",
            "analytics-admin-payments",
        ],
        "sections" => &["analytics-admin-sections", "analytics-admin-tables"],
        "tables" => &["analytics-admin-tables", "analytics-admin-payments"],
        "images" => &["analytics-admin-images"],
        "objects" | "section-objects" => &["analytics-admin-objects", "analytics-admin-sections"],
        "subscriptions" => &[
            "analytics-admin-subscriptions",
            "analytics-admin-subscription-plans",
            "analytics-admin-payments",
        ],
        "subscription-plans" => &["analytics-admin-subscription-plans"],
        "reservations" => &["analytics-admin-reservations", "analytics-restaurant-users"],
        "reviews" => &["analytics-admin-reviews"],
        "payments" => &["analytics-admin-payments"],
        "auth-users" => &[
            "analytics-admin-auth",
            "analytics-public-users",
            "analytics-restaurant-users",
        ],
        "menus" => &["analytics-public-menus"],
        "dishes" => &["analytics-public-dishes"],
        _ => &[],
    }
}

/// `<key>.snapshot` carrying the analytics payload.
pub fn build_analytics_message(
    endpoint: &AnalyticsEndpoint,
    snapshot: &AnalyticsSnapshot,
    request: &AnalyticsRequest,
) -> CanonicalMessage {
    let mut metadata = Metadata::new();
    metadata.insert("scope".to_string(), endpoint.scope.to_string());
    let identifier = request.identifier.trim();
    if !identifier.is_empty() {
        metadata.insert("identifier".to_string(), identifier.to_string());
    }
    for (key, value) in &request.query {
        if !key.trim().is_empty() && !value.trim().is_empty() {
            metadata.insert(format!("query.{}", key.trim()), value.trim().to_string());
        }
    }
    merge_metadata(&mut metadata, &snapshot.metadata);

    CanonicalMessage::new(
        snapshot_topic(endpoint.key).unwrap_or_default(),
        endpoint.key,
        ACTION_SNAPSHOT,
    )
    .with_resource_id(identifier)
    .with_data(snapshot.payload.clone())
    .with_metadata(metadata)
}

/// Result of a successful analytics connection.
#[derive(Debug, Clone)]
pub struct AnalyticsConnection {
    /// Present when a token was supplied.
    pub claims: Option<Claims>,
    pub message: CanonicalMessage,
    pub request: AnalyticsRequest,
    pub endpoint: AnalyticsEndpoint,
}

#[derive(Debug, Clone)]
struct AnalyticsSession {
    key: &'static str,
    token: String,
    request: AnalyticsRequest,
}

pub struct AnalyticsService {
    validator: Arc<dyn TokenValidator>,
    fetcher: Arc<dyn AnalyticsFetcher>,
    endpoints: HashMap<&'static str, AnalyticsEndpoint>,
    sessions: DashMap<String, AnalyticsSession>,
    hub: Hub,
    fetch_timeout: Duration,
    session_seq: AtomicU64,
}

impl AnalyticsService {
    pub fn new(
        validator: Arc<dyn TokenValidator>,
        fetcher: Arc<dyn AnalyticsFetcher>,
        hub: Hub,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            validator,
            fetcher,
            endpoints: default_endpoints(),
            sessions: DashMap::new(),
            hub,
            fetch_timeout,
            session_seq: AtomicU64::new(0),
        }
    }

    pub fn endpoint(&self, key: &str) -> Option<&AnalyticsEndpoint> {
        self.endpoints.get(key.trim())
    }

    /// Endpoint for the `/ws/analytics/{scope}/{entity}` path parameters.
    pub fn resolve(&self, scope: &str, entity: &str) -> Option<&AnalyticsEndpoint> {
        self.endpoint(&analytics_key(scope, entity))
    }

    /// Fallback session id for connections whose token carries none.
    pub fn next_session_id(&self, key: &str) -> String {
        format!("{}-{}", key, self.session_seq.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Validate the token (required or supplied) and fetch the first snapshot.
    pub async fn connect(
        &self,
        key: &str,
        token: &str,
        request: &AnalyticsRequest,
    ) -> Result<AnalyticsConnection> {
        let endpoint = self
            .endpoint(key)
            .ok_or_else(|| GatewayError::NotIntegrated(key.to_string()))?
            .clone();
        let request = endpoint.sanitize(request);

        let token = token.trim();
        if endpoint.require_token && token.is_empty() {
            warn!(key = %endpoint.key, "analytics connect missing token");
            return Err(GatewayError::MissingInput("token"));
        }
        let claims = if token.is_empty() {
            None
        } else {
            Some(self.validator.validate(token)?)
        };

        info!(key = %endpoint.key, query = ?request.query, "analytics connect fetch");
        let snapshot = self.fetch(&endpoint, token, &request).await?;

        Ok(AnalyticsConnection {
            claims,
            message: build_analytics_message(&endpoint, &snapshot, &request),
            request,
            endpoint,
        })
    }

    /// Refetch with `command` merged over `base`. Returns the message and the
    /// request that produced it.
    pub async fn handle_command(
        &self,
        key: &str,
        token: &str,
        base: &AnalyticsRequest,
        command: &AnalyticsRequest,
    ) -> Result<(CanonicalMessage, AnalyticsRequest)> {
        let endpoint = self
            .endpoint(key)
            .ok_or(GatewayError::Upstream(FetchError::Unsupported))?
            .clone();
        let request = endpoint.sanitize(&merge_request(base, command));

        debug!(key = %endpoint.key, query = ?request.query, "analytics command fetch");
        let snapshot = self.fetch(&endpoint, token.trim(), &request).await?;
        Ok((build_analytics_message(&endpoint, &snapshot, &request), request))
    }

    async fn fetch(
        &self,
        endpoint: &AnalyticsEndpoint,
        token: &str,
        request: &AnalyticsRequest,
    ) -> Result<AnalyticsSnapshot> {
        let query = endpoint.upstream_query(request)?;
        let fetched = tokio::time::timeout(
            self.fetch_timeout,
            self.fetcher.fetch(token, endpoint.path, &query),
        )
        .await
        .unwrap_or(Err(FetchError::Timeout))?;
        Ok(fetched)
    }

    pub fn register_session(&self, session_id: &str, key: &str, token: &str, request: &AnalyticsRequest) {
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return;
        }
        let Some(endpoint) = self.endpoint(key) else {
            return;
        };
        self.sessions.insert(
            session_id.to_string(),
            AnalyticsSession {
                key: endpoint.key,
                token: token.trim().to_string(),
                request: endpoint.sanitize(request),
            },
        );
    }

    /// Same as `register_session`; an unknown session is inserted.
    pub fn update_session(&self, session_id: &str, key: &str, token: &str, request: &AnalyticsRequest) {
        self.register_session(session_id, key, token, request);
    }

    pub fn unregister_session(&self, session_id: &str) {
        self.sessions.remove(session_id.trim());
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Refresh every session whose endpoint depends on `entity`.
    pub async fn refresh_by_entity(&self, entity: &str) -> usize {
        let keys = analytics_dependencies(entity);
        if keys.is_empty() {
            return 0;
        }

        let targets: Vec<(String, AnalyticsSession)> = self
            .sessions
            .iter()
            .filter(|entry| keys.contains(&entry.value().key))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut refreshed = 0;
        for (session_id, session) in targets {
            if self.refresh_session(&session_id, session).await {
                refreshed += 1;
            }
        }
        refreshed
    }

    async fn refresh_session(&self, session_id: &str, session: AnalyticsSession) -> bool {
        let Some(endpoint) = self.endpoint(session.key).cloned() else {
            return false;
        };
        let request = endpoint.sanitize(&session.request);

        let snapshot = match self.fetch(&endpoint, &session.token, &request).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(key = %endpoint.key, session_id = %session_id, error = %e, "analytics refresh failed");
                self.hub
                    .broadcast(&refresh_error(&endpoint, session_id, &request, &e.to_string()));
                return false;
            }
        };

        let mut msg = build_analytics_message(&endpoint, &snapshot, &request);
        msg.metadata
            .insert(META_SESSION_ID.to_string(), session_id.to_string());
        msg.metadata
            .insert("analyticsKey".to_string(), endpoint.key.to_string());
        self.hub.broadcast(&msg);
        counter!("gateway_analytics_refreshes_total").increment(1);

        if let Some(mut stored) = self.sessions.get_mut(session_id) {
            stored.request = request;
        }
        true
    }
}

/// `<key>.error` addressed to one analytics session.
fn refresh_error(
    endpoint: &AnalyticsEndpoint,
    session_id: &str,
    request: &AnalyticsRequest,
    reason: &str,
) -> CanonicalMessage {
    let mut metadata = Metadata::new();
    metadata.insert("scope".to_string(), endpoint.scope.to_string());
    metadata.insert("analyticsKey".to_string(), endpoint.key.to_string());
    metadata.insert(META_SESSION_ID.to_string(), session_id.to_string());
    metadata.insert("action".to_string(), "refresh".to_string());
    metadata.insert("reason".to_string(), reason.to_string());
    if !request.identifier.trim().is_empty() {
        metadata.insert("identifier".to_string(), request.identifier.trim().to_string());
    }

    CanonicalMessage::new(
        error_topic(endpoint.key).unwrap_or_default(),
        endpoint.key,
        ACTION_ERROR,
    )
    .with_data(json!({ "error": reason }))
    .with_metadata(metadata)
}

/// A non-blank identifier replaces the base one; blank query values remove
/// the key.
fn merge_request(base: &AnalyticsRequest, command: &AnalyticsRequest) -> AnalyticsRequest {
    let mut merged = base.cleaned();
    if !command.identifier.trim().is_empty() {
        merged.identifier = command.identifier.trim().to_string();
    }
    for (key, value) in &command.query {
        let (key, value) = (key.trim(), value.trim());
        if key.is_empty() {
            continue;
        }
        if value.is_empty() {
            merged.query.remove(key);
        } else {
            merged.query.insert(key.to_string(), value.to_string());
        }
    }
    merged
}

/// `refresh` / `fetch` / `query` commands of one analytics connection.
pub struct AnalyticsCommandHandler {
    endpoint: AnalyticsEndpoint,
    session_id: String,
    token: String,
    base: Mutex<AnalyticsRequest>,
    service: Arc<AnalyticsService>,
}

impl AnalyticsCommandHandler {
    pub fn new(
        endpoint: AnalyticsEndpoint,
        session_id: &str,
        token: &str,
        base: AnalyticsRequest,
        service: Arc<AnalyticsService>,
    ) -> Self {
        Self {
            endpoint,
            session_id: session_id.to_string(),
            token: token.trim().to_string(),
            base: Mutex::new(base),
            service,
        }
    }

    fn reply_error(&self, client: &Arc<Client>, action: &str, reason: &str) {
        client.send_message(&command_error(self.endpoint.key, "", action, reason));
    }
}

#[async_trait]
impl FallbackHandler for AnalyticsCommandHandler {
    async fn handle(&self, client: Arc<Client>, command: Command) {
        let action = command.normalized_action();
        if !matches!(action.as_str(), "refresh" | "fetch" | "query") {
            debug!(key = %self.endpoint.key, action = %action, "analytics command unsupported");
            self.reply_error(&client, &action, "unsupported action");
            return;
        }

        let payload = match command.decode_payload::<AnalyticsRequest>() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(key = %self.endpoint.key, action = %action, error = %e, "analytics command decode failed");
                self.reply_error(&client, &action, "invalid payload");
                return;
            }
        };

        let base = self.base.lock().clone();
        match self
            .service
            .handle_command(self.endpoint.key, &self.token, &base, &payload)
            .await
        {
            Ok((msg, updated)) => {
                self.service
                    .update_session(&self.session_id, self.endpoint.key, &self.token, &updated);
                *self.base.lock() = updated;
                client.send_message(&msg);
            }
            Err(e) => {
                warn!(key = %self.endpoint.key, action = %action, error = %e, "analytics command failed");
                self.reply_error(&client, &action, &e.to_string());
            }
        }
    }
}
