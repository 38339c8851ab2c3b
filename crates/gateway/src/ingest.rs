//! Ingestion pipeline: durable log records → `CanonicalMessage` → topic
//! handler → hub broadcast and snapshot refresh.
//!
//! ```text
//! TopicConsumer ──► StreamConsumer ──► HandlerRegistry ──► EntityStreamHandler
//!                        │                                   ├─► Hub::broadcast
//!                   CircuitBreaker                           ├─► SectionService refresh
//!                  (shared by all)                           └─► AnalyticsService refresh
//! ```

use crate::analytics::AnalyticsService;
use crate::breaker::CircuitBreaker;
use crate::error::Result;
use crate::hub::Hub;
use crate::section::SectionService;
use async_trait::async_trait;
use common::messages::{ACTION_SNAPSHOT, META_SECTION_ID};
use common::{CanonicalMessage, Metadata};
use metrics::counter;
use nats_client::{RawRecord, TopicConsumer};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Topic the generic user broadcast handler listens on.
pub const USER_CREATED_TOPIC: &str = "user.created";

/// Sequential source of raw records for one topic.
#[async_trait]
pub trait RecordSource: Send {
    fn topic(&self) -> &str;

    async fn next_record(&mut self) -> anyhow::Result<RawRecord>;

    /// Acknowledge the last record returned by `next_record`.
    async fn commit(&mut self) -> anyhow::Result<()>;
}

#[async_trait]
impl RecordSource for TopicConsumer {
    fn topic(&self) -> &str {
        TopicConsumer::topic(self)
    }

    async fn next_record(&mut self) -> anyhow::Result<RawRecord> {
        TopicConsumer::next_record(self).await
    }

    async fn commit(&mut self) -> anyhow::Result<()> {
        TopicConsumer::commit(self).await
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawEvent {
    entity: String,
    action: String,
    resource_id: String,
    topic: String,
    metadata: Metadata,
    data: Value,
}

/// `(entity, action)` from the last two segments of a subject; the last
/// segment and `unknown` when there is only one.
fn infer_entity_action(subject: &str) -> (String, String) {
    let parts: Vec<&str> = subject.split('.').map(str::trim).collect();
    if let [.., entity, action] = parts.as_slice() {
        if !entity.is_empty() && !action.is_empty() {
            return (entity.to_string(), action.to_string());
        }
    }
    let last = parts.last().copied().unwrap_or_default();
    (last.to_string(), "unknown".to_string())
}

/// Decode a record, never dropping it: payloads that are not an event
/// envelope keep the subject as topic and the raw text as data.
pub fn decode_record(record: &RawRecord) -> CanonicalMessage {
    let (inferred_entity, inferred_action) = infer_entity_action(&record.subject);

    let event: RawEvent = match serde_json::from_slice(&record.payload) {
        Ok(event) => event,
        Err(e) => {
            debug!(subject = %record.subject, error = %e, "record is not an event envelope");
            return CanonicalMessage::new(record.subject.clone(), inferred_entity, inferred_action)
                .with_data(Value::String(String::from_utf8_lossy(&record.payload).into_owned()));
        }
    };

    let entity = non_blank(event.entity).unwrap_or(inferred_entity);
    let action = non_blank(event.action).unwrap_or(inferred_action);
    let mut msg = CanonicalMessage::new(event.topic.trim(), entity, action)
        .with_resource_id(event.resource_id)
        .with_data(event.data)
        .with_metadata(event.metadata);
    msg.derive_topic();
    msg
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Handler for one exact topic.
#[async_trait]
pub trait TopicHandler: Send + Sync {
    fn topic(&self) -> &str;

    async fn handle(&self, msg: CanonicalMessage) -> Result<()>;
}

/// Topic → handler table built at start-up.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TopicHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under its topic, replacing any previous one.
    pub fn register(&mut self, handler: Arc<dyn TopicHandler>) {
        let topic = handler.topic().trim().to_string();
        if self.handlers.insert(topic.clone(), handler).is_some() {
            warn!(topic = %topic, "topic handler replaced");
        }
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.handlers.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the handler registered for `msg.topic`. Unmatched topics are
    /// dropped without error.
    pub async fn dispatch(&self, msg: CanonicalMessage) -> Result<()> {
        match self.handlers.get(msg.topic.trim()) {
            Some(handler) => handler.handle(msg).await,
            None => {
                debug!(topic = %msg.topic, "no handler for topic");
                Ok(())
            }
        }
    }
}

/// Forwards events of one entity topic to clients and refreshes the caches
/// that depend on the entity.
pub struct EntityStreamHandler {
    entity: String,
    topic: String,
    allowed_actions: HashSet<String>,
    hub: Hub,
    sections: Arc<SectionService>,
    analytics: Option<Arc<AnalyticsService>>,
}

impl EntityStreamHandler {
    pub fn new(
        entity: &str,
        topic: &str,
        allowed_actions: &[String],
        hub: Hub,
        sections: Arc<SectionService>,
        analytics: Option<Arc<AnalyticsService>>,
    ) -> Self {
        Self {
            entity: entity.trim().to_string(),
            topic: topic.trim().to_string(),
            allowed_actions: allowed_actions
                .iter()
                .map(|a| a.trim().to_lowercase())
                .filter(|a| !a.is_empty())
                .collect(),
            hub,
            sections,
            analytics,
        }
    }

    fn allows(&self, action: &str) -> bool {
        self.allowed_actions.is_empty() || self.allowed_actions.contains(&action.trim().to_lowercase())
    }
}

#[async_trait]
impl TopicHandler for EntityStreamHandler {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn handle(&self, mut msg: CanonicalMessage) -> Result<()> {
        if !self.allows(&msg.action) {
            debug!(topic = %self.topic, action = %msg.action, "action filtered");
            return Ok(());
        }

        msg.derive_topic();
        self.hub.broadcast(&msg);

        if msg.action.trim().eq_ignore_ascii_case(ACTION_SNAPSHOT) {
            return Ok(());
        }
        let entity = if self.entity.is_empty() {
            msg.entity.trim()
        } else {
            self.entity.as_str()
        };
        if entity.is_empty() {
            return Ok(());
        }

        match msg.metadata_value(META_SECTION_ID) {
            Some(section_id) => {
                info!(entity = %entity, action = %msg.action, section_id = %section_id, "refreshing section snapshots");
                self.sections.refresh_section(entity, section_id).await;
            }
            None => {
                info!(entity = %entity, action = %msg.action, "refreshing snapshots in all sections");
                self.sections.refresh_all_sections(entity).await;
            }
        }
        if let Some(analytics) = &self.analytics {
            analytics.refresh_by_entity(entity).await;
        }
        Ok(())
    }
}

/// Broadcasts every event of its topic unchanged.
pub struct BroadcastHandler {
    topic: String,
    hub: Hub,
}

impl BroadcastHandler {
    pub fn new(topic: &str, hub: Hub) -> Self {
        Self {
            topic: topic.trim().to_string(),
            hub,
        }
    }
}

#[async_trait]
impl TopicHandler for BroadcastHandler {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn handle(&self, mut msg: CanonicalMessage) -> Result<()> {
        msg.derive_topic();
        self.hub.broadcast(&msg);
        Ok(())
    }
}

/// Reads one topic until shutdown, dispatching every record. Read errors are
/// counted against the shared breaker; while it is open no read is attempted.
pub struct StreamConsumer<S> {
    source: S,
    breaker: Arc<CircuitBreaker>,
}

impl<S: RecordSource> StreamConsumer<S> {
    pub fn new(source: S, breaker: Arc<CircuitBreaker>) -> Self {
        Self { source, breaker }
    }

    pub async fn consume(mut self, registry: Arc<HandlerRegistry>, mut shutdown: watch::Receiver<bool>) {
        let topic = self.source.topic().to_string();
        info!(topic = %topic, "stream consumer started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Some(wait) = self.breaker.remaining_open() {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(wait) => {}
                }
                continue;
            }

            let read = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                read = self.source.next_record() => read,
            };

            match read {
                Ok(record) => {
                    self.breaker.record_success();
                    let msg = decode_record(&record);
                    counter!("gateway_events_ingested_total", "topic" => topic.clone()).increment(1);
                    debug!(
                        topic = %topic,
                        entity = %msg.entity,
                        action = %msg.action,
                        resource_id = %msg.resource_id,
                        "record consumed"
                    );

                    if let Err(e) = registry.dispatch(msg).await {
                        counter!("gateway_handler_errors_total", "topic" => topic.clone()).increment(1);
                        warn!(topic = %topic, error = %e, "handler failed");
                    }
                    if let Err(e) = self.source.commit().await {
                        warn!(topic = %topic, error = %e, "commit failed");
                    }
                }
                Err(e) => {
                    let opened = self.breaker.record_failure();
                    if opened.is_some() || self.breaker.should_log() {
                        warn!(
                            topic = %topic,
                            errors = self.breaker.consecutive_errors(),
                            error = %e,
                            "stream read failed"
                        );
                    }
                }
            }
        }

        info!(topic = %topic, "stream consumer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::client::{Client, ClientIdentity};
    use crate::entity_command::build_topics;
    use crate::section::tests::{FakeFetcher, Outcome, StaticValidator};
    use anyhow::anyhow;
    use axum::extract::ws::Message;
    use bytes::Bytes;
    use common::{PagedQuery, SnapshotAudience};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::sync::{mpsc, Notify};
    use tokio::time::Instant;

    fn record(subject: &str, payload: &str) -> RawRecord {
        RawRecord {
            subject: subject.to_string(),
            payload: Bytes::from(payload.to_string()),
        }
    }

    fn decode_frame(frame: Message) -> CanonicalMessage {
        match frame {
            Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    struct Recording {
        topic: String,
        seen: Mutex<Vec<CanonicalMessage>>,
        notify: Notify,
    }

    impl Recording {
        fn new(topic: &str) -> Arc<Self> {
            Arc::new(Self {
                topic: topic.to_string(),
                seen: Mutex::new(Vec::new()),
                notify: Notify::new(),
            })
        }
    }

    #[async_trait]
    impl TopicHandler for Recording {
        fn topic(&self) -> &str {
            &self.topic
        }

        async fn handle(&self, msg: CanonicalMessage) -> Result<()> {
            self.seen.lock().push(msg);
            self.notify.notify_one();
            Ok(())
        }
    }

    /// Scripted source; blocks forever once the script is exhausted.
    struct ScriptedSource {
        script: VecDeque<std::result::Result<RawRecord, String>>,
        reads: Arc<Mutex<Vec<Instant>>>,
        commits: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl RecordSource for ScriptedSource {
        fn topic(&self) -> &str {
            "restaurants.updated"
        }

        async fn next_record(&mut self) -> anyhow::Result<RawRecord> {
            let Some(next) = self.script.pop_front() else {
                return std::future::pending().await;
            };
            self.reads.lock().push(Instant::now());
            next.map_err(|e| anyhow!(e))
        }

        async fn commit(&mut self) -> anyhow::Result<()> {
            *self.commits.lock() += 1;
            Ok(())
        }
    }

    #[test]
    fn test_decode_envelope_without_topic() {
        let msg = decode_record(&record(
            "restaurants.updated",
            r#"{"entity":"restaurants","action":"updated","resourceId":"r1","metadata":{"sectionId":"s1"},"data":{"name":"Casa"}}"#,
        ));
        assert_eq!(msg.topic, "restaurants.updated");
        assert_eq!(msg.resource_id, "r1");
        assert_eq!(msg.metadata["sectionId"], "s1");
        assert_eq!(msg.data["name"], "Casa");
    }

    #[test]
    fn test_decode_fills_missing_fields_from_subject() {
        let msg = decode_record(&record("tables.deleted", r#"{"resourceId":"t1"}"#));
        assert_eq!(msg.entity, "tables");
        assert_eq!(msg.action, "deleted");
        assert_eq!(msg.topic, "tables.deleted");

        let msg = decode_record(&record("tables.deleted", r#"{"topic":"custom.topic","entity":"x","action":"y"}"#));
        assert_eq!(msg.topic, "custom.topic");
    }

    #[test]
    fn test_decode_non_envelope_payload() {
        let msg = decode_record(&record("reviews.created", "not json"));
        assert_eq!(msg.topic, "reviews.created");
        assert_eq!(msg.entity, "reviews");
        assert_eq!(msg.action, "created");
        assert_eq!(msg.data, json!("not json"));

        let msg = decode_record(&record("heartbeat", "[1,2]"));
        assert_eq!(msg.topic, "heartbeat");
        assert_eq!(msg.entity, "heartbeat");
        assert_eq!(msg.action, "unknown");
    }

    #[tokio::test]
    async fn test_registry_dispatches_exact_topic() {
        let handler = Recording::new("tables.created");
        let mut registry = HandlerRegistry::new();
        registry.register(handler.clone());

        registry
            .dispatch(CanonicalMessage::new("tables.created", "tables", "created"))
            .await
            .unwrap();
        registry
            .dispatch(CanonicalMessage::new("tables.created.v2", "tables", "created"))
            .await
            .unwrap();
        registry
            .dispatch(CanonicalMessage::new("tables.updated", "tables", "updated"))
            .await
            .unwrap();

        assert_eq!(handler.seen.lock().len(), 1);
        assert_eq!(registry.topics(), vec!["tables.created".to_string()]);
    }

    fn section_service(hub: &Hub, fetcher: Arc<FakeFetcher>) -> Arc<SectionService> {
        Arc::new(SectionService::new(
            Arc::new(StaticValidator),
            fetcher,
            hub.clone(),
            Duration::from_secs(1),
        ))
    }

    fn section_client(hub: &Hub, section: &str, topics: &[String]) -> (Arc<Client>, mpsc::Receiver<Message>) {
        let (client, rx) = Client::new(
            hub.clone(),
            ClientIdentity {
                user_id: "u1".into(),
                session_id: format!("sess-{}", section),
                section_id: section.into(),
                entity: "restaurants".into(),
                token: "good".into(),
            },
            16,
        );
        hub.attach_client(&client, topics);
        (client, rx)
    }

    #[tokio::test]
    async fn test_entity_event_broadcasts_then_refreshes_section() {
        let hub = Hub::new();
        let fetcher = FakeFetcher::new(Outcome::Ok(json!({"v": 1})));
        let sections = section_service(&hub, fetcher.clone());
        sections
            .list("good", "restaurants", "s1", SnapshotAudience::Owner, &PagedQuery::default())
            .await
            .unwrap();
        sections
            .detail("good", "restaurants", "s1", SnapshotAudience::Owner, "r1")
            .await
            .unwrap();

        let allowed = vec!["created".to_string(), "updated".to_string(), "deleted".to_string()];
        let (_client, mut rx) = section_client(&hub, "s1", &build_topics("restaurants", &allowed));
        let handler = EntityStreamHandler::new(
            "restaurants",
            "restaurants.updated",
            &allowed,
            hub.clone(),
            sections.clone(),
            None,
        );

        fetcher.set(Outcome::Ok(json!({"v": 2})));
        let event = decode_record(&record(
            "restaurants.updated",
            r#"{"entity":"restaurants","action":"updated","resourceId":"r1","metadata":{"sectionId":"s1"}}"#,
        ));
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(handler));
        registry.dispatch(event).await.unwrap();

        let first = decode_frame(rx.try_recv().unwrap());
        assert_eq!(first.topic, "restaurants.updated");
        assert_eq!(first.resource_id, "r1");

        let mut refreshed = vec![
            decode_frame(rx.try_recv().unwrap()),
            decode_frame(rx.try_recv().unwrap()),
        ];
        refreshed.sort_by(|a, b| a.topic.cmp(&b.topic));
        assert_eq!(refreshed[0].topic, "restaurants.detail");
        assert_eq!(refreshed[1].topic, "restaurants.list");
        assert!(refreshed.iter().all(|m| m.data == json!({"v": 2})));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disallowed_and_snapshot_actions() {
        let hub = Hub::new();
        let fetcher = FakeFetcher::new(Outcome::Ok(json!({"v": 1})));
        let sections = section_service(&hub, fetcher.clone());
        sections
            .list("good", "tables", "s1", SnapshotAudience::Owner, &PagedQuery::default())
            .await
            .unwrap();
        let calls_before = fetcher.calls();

        let topics = vec!["tables.archived".to_string(), "tables.snapshot".to_string()];
        let (_client, mut rx) = section_client(&hub, "s1", &topics);
        let handler = EntityStreamHandler::new(
            "tables",
            "tables.snapshot",
            &["Snapshot".to_string()],
            hub.clone(),
            sections,
            None,
        );

        handler
            .handle(CanonicalMessage::new("", "tables", "archived"))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());

        handler
            .handle(CanonicalMessage::new("", "tables", "snapshot"))
            .await
            .unwrap();
        assert_eq!(decode_frame(rx.try_recv().unwrap()).topic, "tables.snapshot");
        assert_eq!(fetcher.calls(), calls_before);
    }

    #[tokio::test]
    async fn test_broadcast_handler_forwards() {
        let hub = Hub::new();
        let (client, mut rx) = Client::new(hub.clone(), ClientIdentity::default(), 4);
        hub.attach_client_to_all(&client);

        let handler = BroadcastHandler::new(USER_CREATED_TOPIC, hub.clone());
        handler
            .handle(CanonicalMessage::new("", "user", "created"))
            .await
            .unwrap();
        assert_eq!(decode_frame(rx.try_recv().unwrap()).topic, "user.created");
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumer_backs_off_while_circuit_open() {
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
            threshold: 3,
            backoff_floor: Duration::from_secs(2),
            backoff_ceiling: Duration::from_secs(8),
            log_interval: Duration::from_secs(30),
        }));
        let reads = Arc::new(Mutex::new(Vec::new()));
        let commits = Arc::new(Mutex::new(0));
        let source = ScriptedSource {
            script: VecDeque::from(vec![
                Err("down".to_string()),
                Err("down".to_string()),
                Err("down".to_string()),
                Ok(record("restaurants.updated", r#"{"entity":"restaurants","action":"updated"}"#)),
            ]),
            reads: reads.clone(),
            commits: commits.clone(),
        };

        let handler = Recording::new("restaurants.updated");
        let mut registry = HandlerRegistry::new();
        registry.register(handler.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let start = Instant::now();
        let task = tokio::spawn(
            StreamConsumer::new(source, breaker.clone()).consume(Arc::new(registry), shutdown_rx),
        );

        handler.notify.notified().await;

        let reads = reads.lock().clone();
        assert_eq!(reads.len(), 4);
        assert!(reads[2] - start < Duration::from_millis(10));
        assert!(reads[3] - reads[2] >= Duration::from_secs(2));
        assert_eq!(breaker.consecutive_errors(), 0);
        assert_eq!(breaker.open_count(), 1);
        assert_eq!(*commits.lock(), 1);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
