//! Upstream snapshot representations.

use crate::messages::{merge_metadata, Metadata};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// State of a section or resource as returned by the REST API.
///
/// The payload stays untyped so whatever the upstream emits is forwarded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SectionSnapshot {
    pub payload: Value,
    /// Extra metadata for `entity.list` messages.
    pub list_metadata: Metadata,
    /// Extra metadata for `entity.detail` messages.
    pub detail_metadata: Metadata,
}

impl SectionSnapshot {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            ..Default::default()
        }
    }

    pub fn merge_list_metadata(&mut self, values: &Metadata) {
        merge_metadata(&mut self.list_metadata, values);
    }

    pub fn merge_detail_metadata(&mut self, values: &Metadata) {
        merge_metadata(&mut self.detail_metadata, values);
    }
}

/// Decoded analytics payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalyticsSnapshot {
    pub payload: Value,
    pub metadata: Metadata,
}

/// Parameters for an analytics fetch; also the payload of analytics commands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsRequest {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub identifier: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub query: BTreeMap<String, String>,
}

impl AnalyticsRequest {
    /// Copy with trimmed identifier and blank query entries removed.
    pub fn cleaned(&self) -> Self {
        Self {
            identifier: self.identifier.trim().to_string(),
            query: self
                .query
                .iter()
                .filter_map(|(k, v)| {
                    let (k, v) = (k.trim(), v.trim());
                    (!k.is_empty() && !v.is_empty()).then(|| (k.to_string(), v.to_string()))
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_skips_blank_entries() {
        let mut snapshot = SectionSnapshot::default();
        let mut values = Metadata::new();
        values.insert("itemsCount".to_string(), " 3 ".to_string());
        values.insert("total".to_string(), "".to_string());
        snapshot.merge_list_metadata(&values);

        assert_eq!(snapshot.list_metadata.len(), 1);
        assert_eq!(snapshot.list_metadata["itemsCount"], "3");
    }

    #[test]
    fn test_analytics_request_cleaned() {
        let request: AnalyticsRequest =
            serde_json::from_str(r#"{"identifier":" r1 ","query":{"from":"2024-01-01","to":" "}}"#)
                .unwrap();
        let cleaned = request.cleaned();
        assert_eq!(cleaned.identifier, "r1");
        assert_eq!(cleaned.query.len(), 1);
    }
}
