//! Connect-section use case: authenticated section sessions, cached list and
//! detail reads, and event-driven cache refresh.
//!
//! Reads are served from the cache when an entry exists and go upstream only
//! on a miss. A successful fetch stores the entry, a not-found evicts it, and
//! a transient failure falls back to any copy stored meanwhile. Entries never
//! expire: they are kept current by refreshes triggered by ingested events,
//! which rebroadcast the refetched snapshot to the section through the hub.

use crate::cache::{CacheEntry, CacheKind, EntryKey, SnapshotCache};
use crate::error::{GatewayError, Result};
use crate::hub::Hub;
use chrono::Utc;
use common::messages::{
    detail_topic, error_topic, list_topic, merge_metadata, ACTION_DETAIL, ACTION_ERROR,
    ACTION_LIST, META_SECTION_ID,
};
use common::{
    CanonicalMessage, Claims, FetchError, FetchResult, Metadata, PagedQuery, SectionSnapshot,
    SectionSnapshotFetcher, SnapshotAudience, TokenValidator,
};
use metrics::counter;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const ORIGIN_REQUEST: &str = "request";
pub const ORIGIN_REFRESH: &str = "refresh";

/// Default deadline for a single upstream fetch.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SectionService {
    validator: Arc<dyn TokenValidator>,
    fetcher: Arc<dyn SectionSnapshotFetcher>,
    cache: SnapshotCache,
    hub: Hub,
    fetch_timeout: Duration,
}

impl SectionService {
    pub fn new(
        validator: Arc<dyn TokenValidator>,
        fetcher: Arc<dyn SectionSnapshotFetcher>,
        hub: Hub,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            validator,
            fetcher,
            cache: SnapshotCache::new(),
            hub,
            fetch_timeout,
        }
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn cache(&self) -> &SnapshotCache {
        &self.cache
    }

    /// Validate the inputs of a section connection and resolve its claims.
    pub fn connect(&self, token: &str, section_id: &str) -> Result<Claims> {
        let token = token.trim();
        if token.is_empty() {
            return Err(GatewayError::MissingInput("token"));
        }
        if section_id.trim().is_empty() {
            return Err(GatewayError::MissingInput("section"));
        }
        Ok(self.validator.validate(token)?)
    }

    /// Cached list read for `entity` under `section_id`.
    pub async fn list(
        &self,
        token: &str,
        entity: &str,
        section_id: &str,
        audience: SnapshotAudience,
        query: &PagedQuery,
    ) -> FetchResult<CanonicalMessage> {
        let query = query.normalize("");
        let key = EntryKey::list(section_id, entity, audience, &query);

        if let Some(cached) = self.cache.get(&key) {
            debug!(
                section_id = %key.section_id,
                key = %key.key,
                fetched_at = %cached.fetched_at,
                "list served from cache"
            );
            return Ok(build_list_message(
                entity,
                section_id,
                &query,
                &cached.snapshot,
                ORIGIN_REQUEST,
            ));
        }

        let fetched = with_deadline(
            self.fetch_timeout,
            self.fetcher
                .fetch_entity_list(token, entity, section_id, audience, &query),
        )
        .await;

        let snapshot = self.settle(&key, fetched, |snapshot| CacheEntry {
            section_id: section_id.trim().to_string(),
            scope: entity.to_string(),
            kind: CacheKind::List,
            query: query.clone(),
            resource_id: String::new(),
            audience,
            token: token.to_string(),
            snapshot,
            fetched_at: Utc::now(),
        })?;

        Ok(build_list_message(
            entity,
            section_id,
            &query,
            &snapshot,
            ORIGIN_REQUEST,
        ))
    }

    /// Cached detail read for one resource.
    pub async fn detail(
        &self,
        token: &str,
        entity: &str,
        section_id: &str,
        audience: SnapshotAudience,
        resource_id: &str,
    ) -> FetchResult<CanonicalMessage> {
        let resource_id = resource_id.trim();
        if resource_id.is_empty() {
            return Err(FetchError::NotFound);
        }
        let key = EntryKey::item(section_id, entity, audience, resource_id);

        if let Some(cached) = self.cache.get(&key) {
            debug!(
                section_id = %key.section_id,
                key = %key.key,
                fetched_at = %cached.fetched_at,
                "detail served from cache"
            );
            return Ok(build_detail_message(
                entity,
                section_id,
                resource_id,
                &cached.snapshot,
                ORIGIN_REQUEST,
            ));
        }

        let fetched = with_deadline(
            self.fetch_timeout,
            self.fetcher
                .fetch_entity_detail(token, entity, audience, resource_id),
        )
        .await;

        let snapshot = self.settle(&key, fetched, |snapshot| CacheEntry {
            section_id: section_id.trim().to_string(),
            scope: entity.to_string(),
            kind: CacheKind::Item,
            query: PagedQuery::default(),
            resource_id: resource_id.to_string(),
            audience,
            token: token.to_string(),
            snapshot,
            fetched_at: Utc::now(),
        })?;

        Ok(build_detail_message(
            entity,
            section_id,
            resource_id,
            &snapshot,
            ORIGIN_REQUEST,
        ))
    }

    /// Apply the cache policy to a fetch outcome.
    fn settle<F>(
        &self,
        key: &EntryKey,
        fetched: FetchResult<SectionSnapshot>,
        entry: F,
    ) -> FetchResult<SectionSnapshot>
    where
        F: FnOnce(SectionSnapshot) -> CacheEntry,
    {
        match fetched {
            Ok(snapshot) => {
                self.cache.set(entry(snapshot.clone()));
                Ok(snapshot)
            }
            Err(FetchError::NotFound) => {
                if self.cache.delete(key) {
                    debug!(section_id = %key.section_id, key = %key.key, "evicted cache entry");
                }
                Err(FetchError::NotFound)
            }
            Err(e) if e.is_transient() => match self.cache.get(key) {
                Some(cached) => {
                    counter!("gateway_cache_stale_served_total").increment(1);
                    warn!(
                        section_id = %key.section_id,
                        key = %key.key,
                        fetched_at = %cached.fetched_at,
                        error = %e,
                        "upstream fetch failed, serving cached snapshot"
                    );
                    Ok(cached.snapshot)
                }
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    /// Refetch every cached entry of `entity` in `section_id` and rebroadcast
    /// the fresh snapshots. Returns the number of entries refreshed.
    pub async fn refresh_section(&self, entity: &str, section_id: &str) -> usize {
        let entity = entity.trim();
        let section_id = section_id.trim();
        if entity.is_empty() || section_id.is_empty() {
            return 0;
        }

        let entries: Vec<CacheEntry> = self
            .cache
            .entries_for_section(section_id)
            .into_iter()
            .filter(|entry| entry.scope.eq_ignore_ascii_case(entity))
            .collect();

        let mut refreshed = 0;
        for entry in entries {
            if self.refresh_entry(entry).await {
                refreshed += 1;
            }
        }
        if refreshed > 0 {
            counter!("gateway_cache_refreshes_total").increment(refreshed as u64);
            debug!(entity = %entity, section_id = %section_id, refreshed, "section snapshots refreshed");
        }
        refreshed
    }

    /// Refresh `entity` entries in every known section.
    pub async fn refresh_all_sections(&self, entity: &str) -> usize {
        let mut refreshed = 0;
        for section_id in self.cache.section_ids() {
            refreshed += self.refresh_section(entity, &section_id).await;
        }
        refreshed
    }

    async fn refresh_entry(&self, entry: CacheEntry) -> bool {
        let key = entry.key();
        let fetched = match entry.kind {
            CacheKind::List => {
                with_deadline(
                    self.fetch_timeout,
                    self.fetcher.fetch_entity_list(
                        &entry.token,
                        &entry.scope,
                        &entry.section_id,
                        entry.audience,
                        &entry.query,
                    ),
                )
                .await
            }
            CacheKind::Item => {
                with_deadline(
                    self.fetch_timeout,
                    self.fetcher.fetch_entity_detail(
                        &entry.token,
                        &entry.scope,
                        entry.audience,
                        &entry.resource_id,
                    ),
                )
                .await
            }
        };

        let snapshot = match fetched {
            Ok(snapshot) => snapshot,
            Err(FetchError::NotFound) => {
                self.cache.delete(&key);
                info!(section_id = %entry.section_id, key = %key.key, "snapshot gone upstream, evicted");
                return false;
            }
            Err(e) => {
                warn!(section_id = %entry.section_id, key = %key.key, error = %e, "snapshot refresh failed");
                return false;
            }
        };

        let msg = match entry.kind {
            CacheKind::List => build_list_message(
                &entry.scope,
                &entry.section_id,
                &entry.query,
                &snapshot,
                ORIGIN_REFRESH,
            ),
            CacheKind::Item => build_detail_message(
                &entry.scope,
                &entry.section_id,
                &entry.resource_id,
                &snapshot,
                ORIGIN_REFRESH,
            ),
        };

        self.cache.set(CacheEntry {
            snapshot,
            fetched_at: Utc::now(),
            ..entry
        });
        self.hub.broadcast(&msg);
        true
    }
}

async fn with_deadline<T, F>(deadline: Duration, fut: F) -> FetchResult<T>
where
    F: Future<Output = FetchResult<T>>,
{
    tokio::time::timeout(deadline, fut)
        .await
        .unwrap_or(Err(FetchError::Timeout))
}

/// Metadata key naming the resource of a detail message.
pub fn resource_key(entity: &str) -> &'static str {
    match entity.trim().to_lowercase().as_str() {
        "tables" => "tableId",
        "reservations" => "reservationId",
        _ => "restaurantId",
    }
}

/// `<entity>.list` addressed to `section_id`.
pub fn build_list_message(
    entity: &str,
    section_id: &str,
    query: &PagedQuery,
    snapshot: &SectionSnapshot,
    origin: &str,
) -> CanonicalMessage {
    let mut metadata = query.metadata(section_id);
    merge_metadata(&mut metadata, &snapshot.list_metadata);
    metadata.insert("origin".to_string(), origin.to_string());

    CanonicalMessage::new(list_topic(entity).unwrap_or_default(), entity, ACTION_LIST)
        .with_resource_id(section_id.trim())
        .with_data(snapshot.payload.clone())
        .with_metadata(metadata)
}

/// `<entity>.detail` addressed to `section_id`.
pub fn build_detail_message(
    entity: &str,
    section_id: &str,
    resource_id: &str,
    snapshot: &SectionSnapshot,
    origin: &str,
) -> CanonicalMessage {
    let mut metadata = Metadata::new();
    metadata.insert(META_SECTION_ID.to_string(), section_id.trim().to_string());
    metadata.insert(resource_key(entity).to_string(), resource_id.trim().to_string());
    merge_metadata(&mut metadata, &snapshot.detail_metadata);
    metadata.insert("origin".to_string(), origin.to_string());

    CanonicalMessage::new(detail_topic(entity).unwrap_or_default(), entity, ACTION_DETAIL)
        .with_resource_id(resource_id.trim())
        .with_data(snapshot.payload.clone())
        .with_metadata(metadata)
}

/// `<entity>.error` reply to a failed command.
pub fn command_error(entity: &str, section_id: &str, action: &str, reason: &str) -> CanonicalMessage {
    let section_id = section_id.trim();
    let mut metadata = Metadata::new();
    if !section_id.is_empty() {
        metadata.insert(META_SECTION_ID.to_string(), section_id.to_string());
    }
    metadata.insert("action".to_string(), action.to_string());
    if !reason.trim().is_empty() {
        metadata.insert("reason".to_string(), reason.to_string());
    }

    CanonicalMessage::new(error_topic(entity).unwrap_or_default(), entity, ACTION_ERROR)
        .with_resource_id(section_id)
        .with_data(json!({ "error": reason }))
        .with_metadata(metadata)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::client::{Client, ClientIdentity};
    use async_trait::async_trait;
    use axum::extract::ws::Message;
    use common::AuthError;
    use parking_lot::Mutex;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    pub(crate) struct StaticValidator;

    impl TokenValidator for StaticValidator {
        fn validate(&self, token: &str) -> std::result::Result<Claims, AuthError> {
            match token {
                "good" => Ok(Claims {
                    subject: "u1".into(),
                    session_id: "sess-1".into(),
                    roles: vec!["OWNER".into()],
                }),
                "admin" => Ok(Claims {
                    subject: "a1".into(),
                    session_id: "sess-admin".into(),
                    roles: vec!["ADMIN".into()],
                }),
                _ => Err(AuthError::InvalidToken("signature".into())),
            }
        }
    }

    pub(crate) enum Outcome {
        Ok(Value),
        Fail(FetchError),
        Stall,
    }

    pub(crate) struct FakeFetcher {
        pub outcome: Mutex<Outcome>,
        pub calls: AtomicUsize,
        pub audiences: Mutex<Vec<SnapshotAudience>>,
    }

    impl FakeFetcher {
        pub fn new(outcome: Outcome) -> Arc<Self> {
            Arc::new(Self {
                outcome: Mutex::new(outcome),
                calls: AtomicUsize::new(0),
                audiences: Mutex::new(Vec::new()),
            })
        }

        pub fn set(&self, outcome: Outcome) {
            *self.outcome.lock() = outcome;
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        async fn respond(&self, audience: SnapshotAudience, detail: bool) -> FetchResult<SectionSnapshot> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.audiences.lock().push(audience);
            let result = match &*self.outcome.lock() {
                Outcome::Ok(value) => {
                    let mut snapshot = SectionSnapshot::new(value.clone());
                    let mut extra = Metadata::new();
                    extra.insert("itemsCount".into(), "1".into());
                    if detail {
                        snapshot.merge_detail_metadata(&extra);
                    } else {
                        snapshot.merge_list_metadata(&extra);
                    }
                    Some(Ok(snapshot))
                }
                Outcome::Fail(e) => Some(Err(e.clone())),
                Outcome::Stall => None,
            };
            match result {
                Some(result) => result,
                None => std::future::pending().await,
            }
        }
    }

    #[async_trait]
    impl SectionSnapshotFetcher for FakeFetcher {
        async fn fetch_entity_list(
            &self,
            _token: &str,
            _entity: &str,
            _section_id: &str,
            audience: SnapshotAudience,
            _query: &PagedQuery,
        ) -> FetchResult<SectionSnapshot> {
            self.respond(audience, false).await
        }

        async fn fetch_entity_detail(
            &self,
            _token: &str,
            _entity: &str,
            audience: SnapshotAudience,
            _resource_id: &str,
        ) -> FetchResult<SectionSnapshot> {
            self.respond(audience, true).await
        }
    }

    fn service(fetcher: Arc<FakeFetcher>) -> SectionService {
        SectionService::new(
            Arc::new(StaticValidator),
            fetcher,
            Hub::new(),
            Duration::from_secs(1),
        )
    }

    fn section_client(hub: &Hub, section: &str, topics: &[&str]) -> (Arc<Client>, mpsc::Receiver<Message>) {
        let (client, rx) = Client::new(
            hub.clone(),
            ClientIdentity {
                user_id: "u1".into(),
                session_id: format!("sess-{}", section),
                section_id: section.into(),
                entity: "restaurants".into(),
                token: "good".into(),
            },
            8,
        );
        let topics: Vec<String> = topics.iter().map(|t| t.to_string()).collect();
        hub.attach_client(&client, &topics);
        (client, rx)
    }

    fn decode(frame: Message) -> CanonicalMessage {
        match frame {
            Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_connect_validates_inputs() {
        let service = service(FakeFetcher::new(Outcome::Ok(json!({}))));

        assert!(matches!(service.connect(" ", "s1"), Err(GatewayError::MissingInput("token"))));
        assert!(matches!(service.connect("good", ""), Err(GatewayError::MissingInput("section"))));
        assert!(matches!(service.connect("bad", "s1"), Err(GatewayError::AuthInvalid(_))));
        assert_eq!(service.connect("good", "s1").unwrap().subject, "u1");
    }

    const OWNER: SnapshotAudience = SnapshotAudience::Owner;

    fn item_entry(section: &str, resource_id: &str, payload: Value) -> CacheEntry {
        CacheEntry {
            section_id: section.to_string(),
            scope: "tables".to_string(),
            kind: CacheKind::Item,
            query: PagedQuery::default(),
            resource_id: resource_id.to_string(),
            audience: OWNER,
            token: "good".to_string(),
            snapshot: SectionSnapshot::new(payload),
            fetched_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_list_success_is_cached() {
        let fetcher = FakeFetcher::new(Outcome::Ok(json!({"items": [{"id": "r1"}]})));
        let service = service(fetcher.clone());

        let query = PagedQuery { page: 2, ..Default::default() };
        let msg = service.list("good", "restaurants", "s1", OWNER, &query).await.unwrap();

        assert_eq!(msg.topic, "restaurants.list");
        assert_eq!(msg.resource_id, "s1");
        assert_eq!(msg.metadata["page"], "2");
        assert_eq!(msg.metadata["limit"], "20");
        assert_eq!(msg.metadata["itemsCount"], "1");
        assert_eq!(msg.metadata["origin"], ORIGIN_REQUEST);
        assert_eq!(service.cache().len(), 1);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_upstream() {
        let fetcher = FakeFetcher::new(Outcome::Ok(json!({"items": ["first"]})));
        let service = service(fetcher.clone());

        service.list("good", "restaurants", "s1", OWNER, &PagedQuery::default()).await.unwrap();
        fetcher.set(Outcome::Ok(json!({"items": ["second"]})));
        let msg = service
            .list("good", "restaurants", "s1", OWNER, &PagedQuery { page: 1, ..Default::default() })
            .await
            .unwrap();

        assert_eq!(fetcher.calls(), 1);
        assert_eq!(msg.data, json!({"items": ["first"]}));
        assert_eq!(msg.metadata["origin"], ORIGIN_REQUEST);

        service.detail("good", "tables", "s1", OWNER, "t1").await.unwrap();
        service.detail("good", "tables", "s1", OWNER, " t1 ").await.unwrap();
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_audiences_are_fetched_and_cached_separately() {
        let fetcher = FakeFetcher::new(Outcome::Ok(json!({"items": []})));
        let service = service(fetcher.clone());
        let query = PagedQuery::default();

        service.list("admin", "restaurants", "s1", SnapshotAudience::Admin, &query).await.unwrap();
        service.list("good", "restaurants", "s1", OWNER, &query).await.unwrap();
        service.list("good", "restaurants", "s1", OWNER, &query).await.unwrap();

        assert_eq!(fetcher.calls(), 2);
        assert_eq!(*fetcher.audiences.lock(), vec![SnapshotAudience::Admin, OWNER]);
        assert_eq!(service.cache().len(), 2);

        fetcher.set(Outcome::Ok(json!({"v": 2})));
        assert_eq!(service.refresh_section("restaurants", "s1").await, 2);
        let mut refreshed = fetcher.audiences.lock()[2..].to_vec();
        refreshed.sort_by_key(|a| a.as_str());
        assert_eq!(refreshed, vec![SnapshotAudience::Admin, OWNER]);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_serving_last_snapshot() {
        let fetcher = FakeFetcher::new(Outcome::Ok(json!({"items": ["fresh"]})));
        let service = service(fetcher.clone());
        let query = PagedQuery::default();
        service.list("good", "tables", "s1", OWNER, &query).await.unwrap();

        fetcher.set(Outcome::Fail(FetchError::Status(503)));
        assert_eq!(service.refresh_section("tables", "s1").await, 0);
        let msg = service.list("good", "tables", "s1", OWNER, &query).await.unwrap();
        assert_eq!(msg.data, json!({"items": ["fresh"]}));

        // No cached copy for another page: the error surfaces.
        let other = PagedQuery { page: 3, ..Default::default() };
        assert_eq!(
            service.list("good", "tables", "s1", OWNER, &other).await.unwrap_err(),
            FetchError::Status(503)
        );
    }

    #[test]
    fn test_transient_failure_falls_back_to_stored_entry() {
        let service = service(FakeFetcher::new(Outcome::Ok(json!({}))));
        let stored = item_entry("s1", "t1", json!({"id": "t1"}));
        let key = stored.key();
        service.cache().set(stored.clone());

        for error in [FetchError::Timeout, FetchError::Transport("reset".into())] {
            let snapshot = service.settle(&key, Err(error), |_| stored.clone()).unwrap();
            assert_eq!(snapshot.payload, json!({"id": "t1"}));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_without_cached_copy_fails() {
        let fetcher = FakeFetcher::new(Outcome::Ok(json!({"id": "t1"})));
        let service = service(fetcher.clone());
        service.detail("good", "tables", "s1", OWNER, "t1").await.unwrap();

        fetcher.set(Outcome::Stall);
        let msg = service.detail("good", "tables", "s1", OWNER, "t1").await.unwrap();
        assert_eq!(msg.data, json!({"id": "t1"}));

        assert_eq!(
            service.detail("good", "tables", "s1", OWNER, "t2").await.unwrap_err(),
            FetchError::Timeout
        );
    }

    #[test]
    fn test_not_found_evicts_entry() {
        let service = service(FakeFetcher::new(Outcome::Ok(json!({}))));
        let stored = item_entry("s1", "t1", json!({"id": "t1"}));
        let key = stored.key();
        service.cache().set(stored.clone());

        assert_eq!(
            service.settle(&key, Err(FetchError::NotFound), |_| stored.clone()).unwrap_err(),
            FetchError::NotFound
        );
        assert!(service.cache().is_empty());
    }

    #[tokio::test]
    async fn test_read_after_eviction_goes_upstream() {
        let fetcher = FakeFetcher::new(Outcome::Ok(json!({"id": "t1"})));
        let service = service(fetcher.clone());
        service.detail("good", "tables", "s1", OWNER, "t1").await.unwrap();

        fetcher.set(Outcome::Fail(FetchError::NotFound));
        assert_eq!(service.refresh_section("tables", "s1").await, 0);
        assert!(service.cache().is_empty());

        assert_eq!(
            service.detail("good", "tables", "s1", OWNER, "t1").await.unwrap_err(),
            FetchError::NotFound
        );
        assert_eq!(fetcher.calls(), 3);
    }

    #[tokio::test]
    async fn test_forbidden_is_never_served_from_cache() {
        let fetcher = FakeFetcher::new(Outcome::Fail(FetchError::Forbidden));
        let service = service(fetcher.clone());
        let stored = item_entry("s1", "t1", json!({"id": "t1"}));
        let key = stored.key();
        service.cache().set(stored.clone());

        assert_eq!(
            service.settle(&key, Err(FetchError::Forbidden), |_| stored.clone()).unwrap_err(),
            FetchError::Forbidden
        );
        assert_eq!(service.cache().len(), 1);

        assert_eq!(
            service
                .list("good", "payments", "s1", OWNER, &PagedQuery::default())
                .await
                .unwrap_err(),
            FetchError::Forbidden
        );
        assert_eq!(service.cache().len(), 1);
    }

    #[tokio::test]
    async fn test_blank_resource_id_is_not_found() {
        let fetcher = FakeFetcher::new(Outcome::Ok(json!({})));
        let service = service(fetcher.clone());
        assert_eq!(
            service.detail("good", "tables", "s1", OWNER, "  ").await.unwrap_err(),
            FetchError::NotFound
        );
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_refresh_rebroadcasts_matching_entries_only() {
        let fetcher = FakeFetcher::new(Outcome::Ok(json!({"v": 1})));
        let service = service(fetcher.clone());
        service.list("good", "restaurants", "s1", OWNER, &PagedQuery::default()).await.unwrap();
        service.detail("good", "restaurants", "s1", OWNER, "r1").await.unwrap();
        service.list("good", "tables", "s1", OWNER, &PagedQuery::default()).await.unwrap();
        service.list("good", "restaurants", "s2", OWNER, &PagedQuery::default()).await.unwrap();

        let (_c1, mut rx1) = section_client(
            service.hub(),
            "s1",
            &["restaurants.list", "restaurants.detail", "tables.list"],
        );
        let (_c2, mut rx2) = section_client(service.hub(), "s2", &["restaurants.list"]);

        fetcher.set(Outcome::Ok(json!({"v": 2})));
        assert_eq!(service.refresh_section("Restaurants", "s1").await, 2);

        let mut topics = Vec::new();
        while let Ok(frame) = rx1.try_recv() {
            let msg = decode(frame);
            assert_eq!(msg.metadata["origin"], ORIGIN_REFRESH);
            assert_eq!(msg.data, json!({"v": 2}));
            topics.push(msg.topic);
        }
        topics.sort();
        assert_eq!(topics, vec!["restaurants.detail", "restaurants.list"]);
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_refresh_not_found_evicts_and_failure_keeps() {
        let fetcher = FakeFetcher::new(Outcome::Ok(json!({"v": 1})));
        let service = service(fetcher.clone());
        service.detail("good", "tables", "s1", OWNER, "t1").await.unwrap();
        service.detail("good", "tables", "s2", OWNER, "t9").await.unwrap();

        fetcher.set(Outcome::Fail(FetchError::Transport("down".into())));
        assert_eq!(service.refresh_all_sections("tables").await, 0);
        assert_eq!(service.cache().len(), 2);

        fetcher.set(Outcome::Fail(FetchError::NotFound));
        assert_eq!(service.refresh_section("tables", "s1").await, 0);
        assert_eq!(service.cache().section_ids(), vec!["s2".to_string()]);
    }

    #[test]
    fn test_detail_message_resource_keys() {
        let snapshot = SectionSnapshot::new(json!({"id": "t1"}));
        let msg = build_detail_message("tables", "s1", "t1", &snapshot, ORIGIN_REQUEST);
        assert_eq!(msg.topic, "tables.detail");
        assert_eq!(msg.metadata["tableId"], "t1");
        assert_eq!(msg.metadata[META_SECTION_ID], "s1");

        let msg = build_detail_message("reservations", "s1", "x", &snapshot, ORIGIN_REQUEST);
        assert_eq!(msg.metadata["reservationId"], "x");

        let msg = build_detail_message("restaurants", "s1", "r1", &snapshot, ORIGIN_REQUEST);
        assert_eq!(msg.metadata["restaurantId"], "r1");
    }

    #[test]
    fn test_command_error_shape() {
        let msg = command_error("tables", "s1", "list", "snapshot not found");
        assert_eq!(msg.topic, "tables.error");
        assert_eq!(msg.action, "error");
        assert_eq!(msg.metadata["reason"], "snapshot not found");
        assert_eq!(msg.metadata["action"], "list");
        assert_eq!(msg.metadata[META_SECTION_ID], "s1");
        assert_eq!(msg.resource_id, "s1");
        assert_eq!(msg.data["error"], "snapshot not found");
    }
}
