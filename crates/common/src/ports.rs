//! Capabilities the gateway consumes from external collaborators.

use crate::error::{AuthError, FetchResult};
use crate::query::PagedQuery;
use crate::snapshot::{AnalyticsSnapshot, SectionSnapshot};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Identity resolved from a validated token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Claims {
    pub subject: String,
    pub session_id: String,
    pub roles: Vec<String>,
}

impl Claims {
    /// Case-insensitive role check.
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r.eq_ignore_ascii_case(role))
    }
}

/// Which view of the REST API a snapshot is fetched through.
///
/// Owners read their own restaurant through owner-scoped endpoints; admins
/// and everyone else use the default ones. Snapshots of different audiences
/// are never shared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SnapshotAudience {
    Admin,
    Owner,
    #[default]
    Public,
}

impl SnapshotAudience {
    /// ADMIN wins over OWNER when a token carries both.
    pub fn from_claims(claims: &Claims) -> Self {
        if claims.has_role("ADMIN") {
            Self::Admin
        } else if claims.has_role("OWNER") {
            Self::Owner
        } else {
            Self::Public
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Owner => "owner",
            Self::Public => "public",
        }
    }
}

/// Validates bearer tokens locally; no I/O is performed.
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str) -> Result<Claims, AuthError>;
}

/// Fetches entity lists and details for a section from the REST API.
#[async_trait]
pub trait SectionSnapshotFetcher: Send + Sync {
    async fn fetch_entity_list(
        &self,
        token: &str,
        entity: &str,
        section_id: &str,
        audience: SnapshotAudience,
        query: &PagedQuery,
    ) -> FetchResult<SectionSnapshot>;

    async fn fetch_entity_detail(
        &self,
        token: &str,
        entity: &str,
        audience: SnapshotAudience,
        resource_id: &str,
    ) -> FetchResult<SectionSnapshot>;
}

/// Fetches analytics payloads from an already-resolved REST path.
#[async_trait]
pub trait AnalyticsFetcher: Send + Sync {
    async fn fetch(
        &self,
        token: &str,
        path: &str,
        query: &BTreeMap<String, String>,
    ) -> FetchResult<AnalyticsSnapshot>;
}
