//! Entity list/detail fetcher backed by the public REST API.

use crate::error::Result;
use crate::rest::{normalize_payload, RestClient};
use async_trait::async_trait;
use common::{
    FetchError, FetchResult, Metadata, PagedQuery, SectionSnapshot, SectionSnapshotFetcher,
    SnapshotAudience,
};
use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn};

/// How the list path of an entity is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListPath {
    /// Fixed collection path; the section is not part of the URL.
    Static(&'static str),
    /// Collection path followed by the section id as last segment.
    PerSection(&'static str),
}

#[derive(Debug, Clone, Copy)]
struct EntityEndpoint {
    list: ListPath,
    detail_base: &'static str,
}

fn endpoint_for(entity: &str) -> Option<EntityEndpoint> {
    use ListPath::{PerSection, Static};

    let (list, detail_base) = match entity {
        "restaurants" => (Static("/api/v1/public/restaurant"), "/api/v1/public/restaurant"),
        "tables" => (PerSection("/api/v1/public/table/section"), "/api/v1/public/table"),
        "reservations" => (
            PerSection("/api/v1/public/reservations/restaurant"),
            "/api/v1/public/reservations",
        ),
        "reviews" => (
            PerSection("/api/v1/public/review/restaurant"),
            "/api/v1/public/review",
        ),
        "sections" => (
            PerSection("/api/v1/public/section/restaurant"),
            "/api/v1/public/section",
        ),
        "objects" => (Static("/api/v1/public/object"), "/api/v1/public/object"),
        "menus" => (Static("/api/v1/public/menus"), "/api/v1/public/menus"),
        "dishes" => (Static("/api/v1/public/dishes"), "/api/v1/public/dishes"),
        "images" => (Static("/api/v1/image"), "/api/v1/image"),
        "section-objects" => (
            Static("/api/v1/admin/section-objects"),
            "/api/v1/admin/section-objects",
        ),
        "payments" => (
            PerSection("/api/v1/restaurant/payments/restaurant"),
            "/api/v1/restaurant/payments",
        ),
        "subscriptions" => (
            PerSection("/api/v1/restaurant/subscriptions/restaurant"),
            "/api/v1/admin/subscriptions",
        ),
        "subscription-plans" => (
            Static("/api/v1/public/subscription-plans"),
            "/api/v1/public/subscription-plans",
        ),
        "auth-users" => (Static("/api/v1/public/users"), "/api/v1/public/users"),
        _ => return None,
    };
    Some(EntityEndpoint { list, detail_base })
}

/// Owner-scoped overrides; `None` parts keep the default endpoint.
fn owner_override(entity: &str) -> Option<(Option<ListPath>, Option<&'static str>)> {
    use ListPath::{PerSection, Static};

    let paths = match entity {
        "restaurants" => (Some(Static("/api/v1/restaurant/me")), Some("/api/v1/restaurant")),
        "tables" => (
            Some(PerSection("/api/v1/restaurant/tables/section")),
            Some("/api/v1/restaurant/tables"),
        ),
        "reservations" => (
            Some(Static("/api/v1/restaurant/reservations")),
            Some("/api/v1/restaurant/reservations"),
        ),
        "sections" => (
            Some(PerSection("/api/v1/restaurant/sections/restaurant")),
            Some("/api/v1/restaurant/sections"),
        ),
        "payments" => (
            Some(PerSection("/api/v1/restaurant/payments/restaurant")),
            Some("/api/v1/restaurant/payments"),
        ),
        "subscriptions" => (
            Some(PerSection("/api/v1/restaurant/subscriptions/restaurant")),
            None,
        ),
        _ => return None,
    };
    Some(paths)
}

fn resolve_endpoint(entity: &str, audience: SnapshotAudience) -> Option<EntityEndpoint> {
    let mut endpoint = endpoint_for(entity)?;
    if audience == SnapshotAudience::Owner {
        if let Some((list, detail_base)) = owner_override(entity) {
            endpoint.list = list.unwrap_or(endpoint.list);
            endpoint.detail_base = detail_base.unwrap_or(endpoint.detail_base);
        }
    }
    Some(endpoint)
}

/// Whether the REST API exposes list/detail endpoints for `entity`.
pub fn is_supported_entity(entity: &str) -> bool {
    endpoint_for(entity.trim().to_lowercase().as_str()).is_some()
}

/// `SectionSnapshotFetcher` over HTTP.
#[derive(Debug, Clone)]
pub struct SectionSnapshotHttpClient {
    rest: RestClient,
}

impl SectionSnapshotHttpClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            rest: RestClient::new(base_url, timeout)?,
        })
    }

    pub fn from_rest(rest: RestClient) -> Self {
        Self { rest }
    }

    fn lookup(entity: &str, audience: SnapshotAudience) -> FetchResult<EntityEndpoint> {
        resolve_endpoint(entity.trim().to_lowercase().as_str(), audience).ok_or_else(|| {
            warn!(entity = %entity, "snapshot entity unsupported");
            FetchError::Unsupported
        })
    }
}

#[async_trait]
impl SectionSnapshotFetcher for SectionSnapshotHttpClient {
    async fn fetch_entity_list(
        &self,
        token: &str,
        entity: &str,
        section_id: &str,
        audience: SnapshotAudience,
        query: &PagedQuery,
    ) -> FetchResult<SectionSnapshot> {
        let endpoint = Self::lookup(entity, audience)?;
        let section_id = section_id.trim();
        if section_id.is_empty() {
            return Err(FetchError::NotFound);
        }
        info!(
            entity = %entity,
            section_id = %section_id,
            audience = audience.as_str(),
            "snapshot list fetch start"
        );

        let url = match endpoint.list {
            ListPath::Static(path) => self.rest.endpoint(path, &[])?,
            ListPath::PerSection(path) => self.rest.endpoint(path, &[section_id])?,
        };
        let payload = self
            .rest
            .get_json(token, url, &query.to_query_pairs(""))
            .await?;

        let mut snapshot = SectionSnapshot::new(normalize_payload(payload));
        let metadata = list_metadata(&snapshot.payload);
        snapshot.merge_list_metadata(&metadata);
        Ok(snapshot)
    }

    async fn fetch_entity_detail(
        &self,
        token: &str,
        entity: &str,
        audience: SnapshotAudience,
        resource_id: &str,
    ) -> FetchResult<SectionSnapshot> {
        let endpoint = Self::lookup(entity, audience)?;
        let resource_id = resource_id.trim();
        if resource_id.is_empty() {
            return Err(FetchError::NotFound);
        }
        info!(entity = %entity, resource_id = %resource_id, "snapshot detail fetch start");

        let url = self.rest.endpoint(endpoint.detail_base, &[resource_id])?;
        let payload = self.rest.get_json(token, url, &[]).await?;
        Ok(SectionSnapshot::new(normalize_payload(payload)))
    }
}

/// `itemsCount` and `total` hints for list messages.
fn list_metadata(payload: &Value) -> Metadata {
    let mut metadata = Metadata::new();
    let items = payload
        .get("items")
        .or_else(|| payload.get("data"))
        .and_then(Value::as_array);
    if let Some(items) = items {
        metadata.insert("itemsCount".to_string(), items.len().to_string());
    }
    let total = payload
        .get("total")
        .or_else(|| payload.pointer("/meta/total"))
        .and_then(Value::as_u64);
    if let Some(total) = total {
        metadata.insert("total".to_string(), total.to_string());
    }
    metadata
}
