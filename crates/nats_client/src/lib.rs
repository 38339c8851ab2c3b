//! NATS JetStream access for the realtime gateway.
//!
//! Domain events live in one stream per entity (`RESTAURANTS_EVENTS` capturing
//! `restaurants.>`). The gateway reads them through durable pull consumers, so
//! replicas sharing a durable name split the work like a consumer group.

pub mod client;

pub use client::{
    durable_name, NatsClient, RawRecord, StreamConfig, TopicConsumer, DEFAULT_MAX_BYTES,
    DEFAULT_MAX_MESSAGES, DEFAULT_RETENTION_SECS,
};
