//! Realtime gateway: fans entity events out to WebSocket clients.
//!
//! This service:
//! - Accepts section, notification and analytics WebSocket connections
//! - Consumes entity event topics from NATS JetStream durable consumers
//! - Broadcasts events to subscribed clients and refreshes cached snapshots
//! - Serves list/detail/analytics commands through a stale-tolerant cache
//!
//! ## Architecture
//!
//! ```text
//! NATS: <entity>.<action>  (one durable consumer per topic)
//!         ↓
//! StreamConsumer ── CircuitBreaker (shared)
//!         ↓
//! HandlerRegistry → EntityStreamHandler / BroadcastHandler
//!         ↓                       ↓
//!        Hub  ←── SectionService / AnalyticsService (refresh)
//!         ↓
//! WebSocket clients (bounded queues, slow clients evicted)
//! ```

pub mod analytics;
pub mod breaker;
pub mod cache;
pub mod client;
pub mod command;
pub mod config;
pub mod entity_command;
pub mod error;
pub mod hub;
pub mod ingest;
pub mod section;
pub mod ws_server;

pub use analytics::{AnalyticsService, ANALYTICS_FETCH_TIMEOUT};
pub use breaker::{BreakerConfig, CircuitBreaker};
pub use cache::SnapshotCache;
pub use client::{Client, ClientId, ClientIdentity};
pub use command::{Command, CommandProcessor, FallbackHandler};
pub use config::{ConfigError, GatewayConfig};
pub use error::{GatewayError, Result};
pub use hub::Hub;
pub use ingest::{
    decode_record, BroadcastHandler, EntityStreamHandler, HandlerRegistry, RecordSource,
    StreamConsumer, TopicHandler, USER_CREATED_TOPIC,
};
pub use section::SectionService;
pub use ws_server::{create_router, AppState, ConnectionSettings};
