//! NATS client implementation with JetStream support.

use anyhow::{anyhow, Result};
use async_nats::jetstream::consumer::{pull, PullConsumer};
use async_nats::jetstream::{self, stream::Stream};
use bytes::Bytes;
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default retention period for entity streams (7 days).
pub const DEFAULT_RETENTION_SECS: u64 = 7 * 24 * 60 * 60;

/// Default max messages per stream.
pub const DEFAULT_MAX_MESSAGES: i64 = 1_000_000;

/// Default max bytes per stream (1GB).
pub const DEFAULT_MAX_BYTES: i64 = 1_073_741_824;

/// Configuration for creating a stream.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Stream name.
    pub name: String,
    /// Subject patterns to capture.
    pub subjects: Vec<String>,
    /// Retention period in seconds.
    pub max_age_secs: u64,
    /// Maximum number of messages.
    pub max_messages: i64,
    /// Maximum bytes.
    pub max_bytes: i64,
}

impl StreamConfig {
    /// Stream holding every event of one entity.
    ///
    /// Creates stream named `{ENTITY}_EVENTS` with subject `{entity}.>`
    pub fn for_entity(entity: &str) -> Self {
        let entity = entity.trim();
        let name = format!("{}_EVENTS", sanitize(entity).to_uppercase());

        Self {
            name,
            subjects: vec![format!("{}.>", entity)],
            max_age_secs: DEFAULT_RETENTION_SECS,
            max_messages: DEFAULT_MAX_MESSAGES,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }

    /// Set retention period in seconds.
    pub fn with_retention(mut self, secs: u64) -> Self {
        self.max_age_secs = secs;
        self
    }
}

/// Durable consumer name for one topic: `{prefix}_{topic}` with characters
/// NATS rejects in consumer names replaced by `_`.
pub fn durable_name(prefix: &str, topic: &str) -> String {
    format!("{}_{}", sanitize(prefix.trim()), sanitize(topic.trim()))
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            '.' | '*' | '>' | '-' | ' ' | '\t' => '_',
            c => c,
        })
        .collect()
}

/// One record read from the log.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub subject: String,
    pub payload: Bytes,
}

/// JetStream context of one NATS connection.
#[derive(Clone)]
pub struct NatsClient {
    jetstream: jetstream::Context,
}

impl NatsClient {
    /// Connect to a NATS server and create a JetStream context.
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", url);
        let client = async_nats::connect(url).await?;
        Ok(Self {
            jetstream: jetstream::new(client),
        })
    }

    /// Create or get a stream with the given configuration.
    pub async fn ensure_stream_with_config(&self, config: &StreamConfig) -> Result<Stream> {
        info!(
            "Ensuring stream '{}' exists (subjects: {:?}, retention: {}s)",
            config.name, config.subjects, config.max_age_secs
        );

        let stream = self
            .jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: config.name.clone(),
                subjects: config.subjects.clone(),
                retention: jetstream::stream::RetentionPolicy::Limits,
                max_messages: config.max_messages,
                max_bytes: config.max_bytes,
                max_age: Duration::from_secs(config.max_age_secs),
                storage: jetstream::stream::StorageType::File,
                ..Default::default()
            })
            .await?;

        info!("Stream '{}' ready", config.name);
        Ok(stream)
    }

    /// Convenience method to create the event stream for an entity.
    pub async fn ensure_entity_stream(&self, entity: &str) -> Result<Stream> {
        let config = StreamConfig::for_entity(entity);
        self.ensure_stream_with_config(&config).await
    }

    /// Bind a durable pull consumer to exactly one topic of an entity stream.
    ///
    /// Replicas using the same `durable` prefix share the consumer and split
    /// its messages between them.
    pub async fn topic_consumer(
        &self,
        entity: &str,
        topic: &str,
        durable: &str,
    ) -> Result<TopicConsumer> {
        let stream = self.ensure_entity_stream(entity).await?;
        let name = durable_name(durable, topic);

        let consumer: PullConsumer = stream
            .get_or_create_consumer(
                &name,
                pull::Config {
                    durable_name: Some(name.clone()),
                    filter_subject: topic.to_string(),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await?;

        info!("Durable consumer '{}' bound to '{}'", name, topic);
        Ok(TopicConsumer {
            consumer,
            topic: topic.to_string(),
            messages: None,
            pending: None,
        })
    }
}

/// Sequential reader over one durable pull consumer.
///
/// A failed pull drops the message stream; the next read re-opens it, which is
/// how the consumer reconnects after an outage.
pub struct TopicConsumer {
    consumer: PullConsumer,
    topic: String,
    messages: Option<pull::Stream>,
    pending: Option<jetstream::Message>,
}

impl TopicConsumer {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Block until the next record arrives.
    pub async fn next_record(&mut self) -> Result<RawRecord> {
        if self.messages.is_none() {
            debug!(topic = %self.topic, "opening pull message stream");
            self.messages = Some(self.consumer.messages().await?);
        }
        let Some(messages) = self.messages.as_mut() else {
            return Err(anyhow!("message stream unavailable"));
        };

        match messages.next().await {
            Some(Ok(message)) => {
                let record = RawRecord {
                    subject: message.subject.to_string(),
                    payload: message.payload.clone(),
                };
                self.pending = Some(message);
                Ok(record)
            }
            Some(Err(e)) => {
                self.messages = None;
                Err(anyhow!("pull from '{}' failed: {}", self.topic, e))
            }
            None => {
                self.messages = None;
                Err(anyhow!("message stream for '{}' ended", self.topic))
            }
        }
    }

    /// Acknowledge the last record returned by `next_record`.
    pub async fn commit(&mut self) -> Result<()> {
        if let Some(message) = self.pending.take() {
            if let Err(e) = message.ack().await {
                warn!(topic = %self.topic, "ack failed: {}", e);
                return Err(anyhow!("ack failed: {}", e));
            }
        }
        Ok(())
    }
}
