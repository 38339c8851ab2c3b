//! Inbound command dispatch.
//!
//! Built-in actions (`subscribe`, `unsubscribe`, `ping`) are non-blocking and
//! run inline on the read loop. Everything else goes to an optional feature
//! fallback which runs on its own task under a deadline. A fallback that
//! misses the deadline is answered with an `<entity>.error` reply.

use crate::client::Client;
use crate::section::command_error;
use async_trait::async_trait;
use common::CanonicalMessage;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default deadline for fallback handlers.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// One client command frame: `{action, topic?, payload?}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Command {
    pub action: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub topic: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl Command {
    /// Trimmed, lower-cased action name.
    pub fn normalized_action(&self) -> String {
        self.action.trim().to_lowercase()
    }

    /// Decode the payload; an absent payload decodes to `T::default()`.
    pub fn decode_payload<T>(&self) -> serde_json::Result<T>
    where
        T: DeserializeOwned + Default,
    {
        if self.payload.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(self.payload.clone())
    }
}

/// Synchronous handler for a named action.
pub type CommandHandler = Arc<dyn Fn(&Arc<Client>, &Command) + Send + Sync>;

/// Feature-specific handler for actions without a registered handler.
#[async_trait]
pub trait FallbackHandler: Send + Sync {
    async fn handle(&self, client: Arc<Client>, command: Command);
}

/// Action name → handler table for one connection.
pub struct CommandProcessor {
    handlers: HashMap<String, CommandHandler>,
    fallback: Option<Arc<dyn FallbackHandler>>,
    fallback_timeout: Duration,
}

impl CommandProcessor {
    /// Processor seeded with the built-in actions and no fallback.
    pub fn new(fallback_timeout: Duration) -> Self {
        let mut processor = Self {
            handlers: HashMap::new(),
            fallback: None,
            fallback_timeout,
        };

        processor.register(
            "subscribe",
            Arc::new(|client: &Arc<Client>, command: &Command| {
                let topic = command.topic.trim();
                if !topic.is_empty() {
                    client.hub().subscribe(client, topic);
                }
            }),
        );
        processor.register(
            "unsubscribe",
            Arc::new(|client: &Arc<Client>, command: &Command| {
                let topic = command.topic.trim();
                if !topic.is_empty() {
                    client.hub().unsubscribe(client, topic);
                }
            }),
        );
        processor.register(
            "ping",
            Arc::new(|client: &Arc<Client>, _: &Command| {
                client.send_message(&CanonicalMessage::pong());
            }),
        );
        processor
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn FallbackHandler>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Register (or replace) the handler for `action`.
    pub fn register(&mut self, action: &str, handler: CommandHandler) {
        self.handlers.insert(action.trim().to_lowercase(), handler);
    }

    /// Run the handler for `command`.
    pub fn process(&self, client: &Arc<Client>, command: Command) {
        let action = command.normalized_action();
        if let Some(handler) = self.handlers.get(&action) {
            handler(client, &command);
            return;
        }

        let Some(fallback) = self.fallback.clone() else {
            debug!(session_id = %client.session_id(), action = %action, "unhandled command ignored");
            return;
        };

        let client = client.clone();
        let deadline = self.fallback_timeout;
        tokio::spawn(async move {
            if tokio::time::timeout(deadline, fallback.handle(client.clone(), command))
                .await
                .is_err()
            {
                warn!(session_id = %client.session_id(), action = %action, "command timed out");
                client.send_message(&command_error(
                    client.entity(),
                    client.section_id(),
                    &action,
                    "timeout",
                ));
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientIdentity;
    use crate::hub::Hub;
    use axum::extract::ws::Message;
    use parking_lot::Mutex;
    use serde_json::json;
    use tokio::sync::{mpsc, Notify};

    fn connected(hub: &Hub) -> (Arc<Client>, mpsc::Receiver<Message>) {
        let (client, rx) = Client::new(
            hub.clone(),
            ClientIdentity {
                user_id: "u1".into(),
                session_id: "s1".into(),
                ..Default::default()
            },
            4,
        );
        hub.attach_client(&client, &[]);
        (client, rx)
    }

    fn command(value: Value) -> Command {
        serde_json::from_value(value).unwrap()
    }

    struct Recorder {
        seen: Mutex<Vec<String>>,
        done: Notify,
    }

    #[async_trait]
    impl FallbackHandler for Recorder {
        async fn handle(&self, _client: Arc<Client>, command: Command) {
            self.seen.lock().push(command.normalized_action());
            self.done.notify_one();
        }
    }

    struct Stuck;

    #[async_trait]
    impl FallbackHandler for Stuck {
        async fn handle(&self, _client: Arc<Client>, _command: Command) {
            std::future::pending::<()>().await;
        }
    }

    #[test]
    fn test_command_decoding_defaults() {
        let cmd = command(json!({"action": "list"}));
        assert_eq!(cmd.topic, "");
        assert!(cmd.payload.is_null());

        #[derive(Default, Deserialize)]
        struct Payload {
            #[serde(default)]
            id: String,
        }
        assert_eq!(cmd.decode_payload::<Payload>().unwrap().id, "");

        let cmd = command(json!({"action": "get", "payload": {"id": "r1"}}));
        assert_eq!(cmd.decode_payload::<Payload>().unwrap().id, "r1");

        let cmd = command(json!({"action": "get", "payload": "oops"}));
        assert!(cmd.decode_payload::<Payload>().is_err());
    }

    #[tokio::test]
    async fn test_builtin_subscribe_unsubscribe_ping() {
        let hub = Hub::new();
        let (client, mut rx) = connected(&hub);
        let processor = CommandProcessor::new(DEFAULT_COMMAND_TIMEOUT);

        processor.process(&client, command(json!({"action": "Subscribe", "topic": "tables.updated"})));
        assert_eq!(hub.subscriber_count("tables.updated"), 1);

        processor.process(&client, command(json!({"action": "unsubscribe", "topic": "tables.updated"})));
        assert_eq!(hub.subscriber_count("tables.updated"), 0);

        processor.process(&client, command(json!({"action": "subscribe"})));
        assert_eq!(hub.topic_count(), 0);

        processor.process(&client, command(json!({"action": "ping"})));
        match rx.recv().await.unwrap() {
            Message::Text(text) => assert!(text.as_str().contains("system.pong")),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_action_without_fallback_is_ignored() {
        let hub = Hub::new();
        let (client, mut rx) = connected(&hub);
        CommandProcessor::new(DEFAULT_COMMAND_TIMEOUT).process(&client, command(json!({"action": "list"})));
        assert!(rx.try_recv().is_err());
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn test_fallback_receives_unknown_actions() {
        let hub = Hub::new();
        let (client, _rx) = connected(&hub);
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            done: Notify::new(),
        });
        let processor = CommandProcessor::new(DEFAULT_COMMAND_TIMEOUT).with_fallback(recorder.clone());

        processor.process(&client, command(json!({"action": " LIST_TABLES "})));
        recorder.done.notified().await;

        assert_eq!(*recorder.seen.lock(), vec!["list_tables".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_fallback_does_not_block_builtins() {
        let hub = Hub::new();
        let (client, mut rx) = connected(&hub);
        let processor = CommandProcessor::new(Duration::from_secs(10)).with_fallback(Arc::new(Stuck));

        processor.process(&client, command(json!({"action": "list"})));
        processor.process(&client, command(json!({"action": "ping"})));
        assert!(rx.recv().await.is_some());

        tokio::time::advance(Duration::from_secs(11)).await;
        tokio::task::yield_now().await;
        assert!(!client.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_timeout_replies_with_error() {
        let hub = Hub::new();
        let (client, mut rx) = Client::new(
            hub.clone(),
            ClientIdentity {
                user_id: "u1".into(),
                session_id: "s1".into(),
                section_id: "sec-9".into(),
                entity: "tables".into(),
                token: "tok".into(),
            },
            4,
        );
        hub.attach_client(&client, &["tables.error".to_string()]);
        let processor = CommandProcessor::new(Duration::from_secs(1)).with_fallback(Arc::new(Stuck));

        processor.process(&client, command(json!({"action": "List_Tables"})));
        tokio::time::advance(Duration::from_secs(2)).await;

        let msg: CanonicalMessage = match rx.recv().await.unwrap() {
            Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("unexpected frame {:?}", other),
        };
        assert_eq!(msg.topic, "tables.error");
        assert_eq!(msg.metadata["action"], "list_tables");
        assert_eq!(msg.metadata["reason"], "timeout");
        assert_eq!(msg.metadata["sectionId"], "sec-9");
        assert!(!client.is_closed());
    }
}
