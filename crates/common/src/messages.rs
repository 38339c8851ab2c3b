//! Canonical realtime message envelope.
//!
//! The same envelope is produced by the ingestion decoder, by command replies
//! and by cache refreshes, and is serialized as-is to WebSocket clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// String key/value pairs used for addressing (`userId`, `sessionId`,
/// `sectionId`) and for display hints.
pub type Metadata = HashMap<String, String>;

pub const SYSTEM_ENTITY: &str = "system";

pub const ACTION_CONNECTED: &str = "connected";
pub const ACTION_PONG: &str = "pong";
pub const ACTION_ERROR: &str = "error";
pub const ACTION_LIST: &str = "list";
pub const ACTION_DETAIL: &str = "detail";
pub const ACTION_SNAPSHOT: &str = "snapshot";
pub const ACTION_CREATED: &str = "created";
pub const ACTION_UPDATED: &str = "updated";
pub const ACTION_DELETED: &str = "deleted";

pub const TOPIC_SYSTEM_CONNECTED: &str = "system.connected";
pub const TOPIC_SYSTEM_PONG: &str = "system.pong";

/// Metadata keys understood by the hub's addressing filter.
pub const META_USER_ID: &str = "userId";
pub const META_SESSION_ID: &str = "sessionId";
pub const META_SECTION_ID: &str = "sectionId";

/// Message exchanged between the durable log and WebSocket clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalMessage {
    /// Routing key, conventionally `<entity>.<action>`.
    pub topic: String,
    pub entity: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_id: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
    pub timestamp: DateTime<Utc>,
}

impl CanonicalMessage {
    /// Create a message stamped with the current UTC time.
    pub fn new(
        topic: impl Into<String>,
        entity: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            entity: entity.into(),
            action: action.into(),
            resource_id: String::new(),
            data: Value::Null,
            metadata: Metadata::new(),
            timestamp: Utc::now(),
        }
    }

    /// `system.pong` reply to a client `ping`.
    pub fn pong() -> Self {
        Self::new(TOPIC_SYSTEM_PONG, SYSTEM_ENTITY, ACTION_PONG)
    }

    pub fn with_resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = resource_id.into();
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// A message without a topic can never be routed by the hub.
    pub fn is_routable(&self) -> bool {
        !self.topic.trim().is_empty()
    }

    /// Trimmed metadata value, `None` when absent or blank.
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Fill an empty topic from `entity.action`.
    pub fn derive_topic(&mut self) {
        if self.topic.trim().is_empty() {
            if let Some(topic) = entity_topic(&self.entity, &self.action) {
                self.topic = topic;
            }
        }
    }
}

/// Copy non-empty entries from `values` into `into`, trimming keys and values.
pub fn merge_metadata(into: &mut Metadata, values: &Metadata) {
    for (key, value) in values {
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() || value.is_empty() {
            continue;
        }
        into.insert(key.to_string(), value.to_string());
    }
}

/// Build `entity.action`, or `None` if either part is blank.
pub fn entity_topic(entity: &str, action: &str) -> Option<String> {
    let entity = entity.trim();
    let action = action.trim();
    if entity.is_empty() || action.is_empty() {
        return None;
    }
    Some(format!("{}.{}", entity, action))
}

pub fn snapshot_topic(entity: &str) -> Option<String> {
    entity_topic(entity, ACTION_SNAPSHOT)
}

pub fn list_topic(entity: &str) -> Option<String> {
    entity_topic(entity, ACTION_LIST)
}

pub fn detail_topic(entity: &str) -> Option<String> {
    entity_topic(entity, ACTION_DETAIL)
}

pub fn error_topic(entity: &str) -> Option<String> {
    entity_topic(entity, ACTION_ERROR)
}
