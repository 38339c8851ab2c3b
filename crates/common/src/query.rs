//! Paging, sorting and filtering parameters shared by list commands.

use crate::messages::{Metadata, META_SECTION_ID};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::form_urlencoded::byte_serialize;

pub const DEFAULT_PAGE: i64 = 1;
pub const DEFAULT_LIMIT: i64 = 20;
pub const MAX_LIMIT: i64 = 100;

/// List query as sent by clients in a `list` command payload.
///
/// Filters live in a `BTreeMap`, so iteration order is always sorted by key
/// regardless of the order the client sent them in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PagedQuery {
    pub page: i64,
    pub limit: i64,
    pub search: String,
    pub sort_by: String,
    pub sort_order: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub filters: BTreeMap<String, String>,
}

impl PagedQuery {
    /// Sanitized copy with defaults and bounds applied.
    ///
    /// `default_search` is used when no explicit search term is provided.
    pub fn normalize(&self, default_search: &str) -> Self {
        let page = if self.page <= 0 { DEFAULT_PAGE } else { self.page };
        let limit = match self.limit {
            l if l <= 0 => DEFAULT_LIMIT,
            l if l > MAX_LIMIT => MAX_LIMIT,
            l => l,
        };

        let mut search = self.search.trim().to_string();
        if search.is_empty() {
            search = default_search.trim().to_string();
        }

        Self {
            page,
            limit,
            search,
            sort_by: self.sort_by.trim().to_string(),
            sort_order: self.sort_order.trim().to_uppercase(),
            filters: sanitize_filters(&self.filters),
        }
    }

    /// Stable cache key: logically identical queries produce the same key.
    ///
    /// Free-text parts are percent-encoded, so separators inside values
    /// cannot make two different queries collide.
    pub fn canonical_key(&self) -> String {
        let normalized = self.normalize("");
        let mut key = format!(
            "page={}&limit={}&search={}&sortBy={}&sortOrder={}",
            normalized.page,
            normalized.limit,
            encode(&normalized.search.to_lowercase()),
            encode(&normalized.sort_by.to_lowercase()),
            encode(&normalized.sort_order),
        );
        if !normalized.filters.is_empty() {
            let filters: Vec<String> = normalized
                .filters
                .iter()
                .map(|(k, v)| format!("{}={}", encode(k), encode(v)))
                .collect();
            key.push_str("&filters=");
            key.push_str(&filters.join(";"));
        }
        key
    }

    /// Metadata attached to list messages built from this query.
    pub fn metadata(&self, section_id: &str) -> Metadata {
        let normalized = self.normalize("");
        let mut metadata = Metadata::new();
        metadata.insert(META_SECTION_ID.to_string(), section_id.trim().to_string());
        metadata.insert("page".to_string(), normalized.page.to_string());
        metadata.insert("limit".to_string(), normalized.limit.to_string());
        if !normalized.search.is_empty() {
            metadata.insert("search".to_string(), normalized.search);
        }
        if !normalized.sort_by.is_empty() {
            metadata.insert("sortBy".to_string(), normalized.sort_by);
        }
        if !normalized.sort_order.is_empty() {
            metadata.insert("sortOrder".to_string(), normalized.sort_order);
        }
        for (key, value) in normalized.filters {
            metadata.insert(key, value);
        }
        metadata
    }

    /// Query-string pairs for the upstream REST call.
    pub fn to_query_pairs(&self, default_search: &str) -> Vec<(String, String)> {
        let normalized = self.normalize(default_search);
        let mut pairs = vec![
            ("page".to_string(), normalized.page.to_string()),
            ("limit".to_string(), normalized.limit.to_string()),
        ];
        if !normalized.search.is_empty() {
            pairs.push(("q".to_string(), normalized.search));
        }
        if !normalized.sort_by.is_empty() {
            pairs.push(("sortBy".to_string(), normalized.sort_by));
        }
        if !normalized.sort_order.is_empty() {
            pairs.push(("sortOrder".to_string(), normalized.sort_order));
        }
        pairs.extend(normalized.filters);
        pairs
    }
}

fn encode(value: &str) -> String {
    byte_serialize(value.as_bytes()).collect()
}

fn sanitize_filters(filters: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    filters
        .iter()
        .filter_map(|(key, value)| {
            let key = key.trim();
            let value = value.trim();
            if key.is_empty() || value.is_empty() {
                None
            } else {
                Some((key.to_lowercase(), value.to_string()))
            }
        })
        .collect()
}
