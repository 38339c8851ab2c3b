//! Per-connection client session.
//!
//! A client owns a bounded outbound queue drained by its write loop, the set
//! of topics it is subscribed to and the hooks run when it closes. The hub owns
//! the authoritative membership; both sides are mutated under the hub lock.

use crate::command::{Command, CommandProcessor};
use crate::hub::Hub;
use axum::extract::ws::Message;
use bytes::Bytes;
use common::CanonicalMessage;
use futures::{Sink, SinkExt, Stream, StreamExt};
use metrics::counter;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt::Display;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Unique client identifier.
pub type ClientId = Uuid;

/// Default outbound queue capacity.
pub const DEFAULT_SEND_BUFFER: usize = 8;

type CloseHook = Box<dyn FnOnce(&Client) + Send>;

/// Who is on the other end of the socket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientIdentity {
    pub user_id: String,
    pub session_id: String,
    pub section_id: String,
    pub entity: String,
    pub token: String,
}

/// Result of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    Full,
    Closed,
}

/// State for a single connected client.
pub struct Client {
    /// Unique per connection, even when the identity key repeats.
    pub id: ClientId,
    identity: ClientIdentity,
    hub: Hub,
    tx: Mutex<Option<mpsc::Sender<Message>>>,
    closed: AtomicBool,
    close_signal: watch::Sender<bool>,
    pub(crate) subscribed: Mutex<HashSet<String>>,
    close_hooks: Mutex<Vec<CloseHook>>,
}

impl Client {
    /// Create a client and the receiving end of its outbound queue.
    pub fn new(
        hub: Hub,
        identity: ClientIdentity,
        buffer: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let (close_signal, _) = watch::channel(false);
        let identity = ClientIdentity {
            section_id: identity.section_id.trim().to_string(),
            entity: identity.entity.trim().to_string(),
            ..identity
        };

        let client = Arc::new(Self {
            id: Uuid::new_v4(),
            identity,
            hub,
            tx: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
            close_signal,
            subscribed: Mutex::new(HashSet::new()),
            close_hooks: Mutex::new(Vec::new()),
        });
        (client, rx)
    }

    /// Registry key: `userId:sessionId[:sectionId]`.
    pub fn key(&self) -> String {
        let mut key = format!("{}:{}", self.identity.user_id, self.identity.session_id);
        if !self.identity.section_id.is_empty() {
            key.push(':');
            key.push_str(&self.identity.section_id);
        }
        key
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn user_id(&self) -> &str {
        &self.identity.user_id
    }

    pub fn session_id(&self) -> &str {
        &self.identity.session_id
    }

    pub fn section_id(&self) -> &str {
        &self.identity.section_id
    }

    pub fn entity(&self) -> &str {
        &self.identity.entity
    }

    pub fn token(&self) -> &str {
        &self.identity.token
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Topics this client is currently subscribed to.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.subscribed.lock().iter().cloned().collect();
        topics.sort();
        topics
    }

    /// Try to enqueue a pre-serialized frame without blocking.
    pub fn try_deliver(&self, frame: Message) -> Delivery {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Delivery::Closed;
        };
        match tx.try_send(frame) {
            Ok(()) => Delivery::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Serialize and enqueue a message for this client only.
    ///
    /// A full queue evicts the client; returns whether the message was queued.
    pub fn send_message(self: &Arc<Self>, msg: &CanonicalMessage) -> bool {
        let json = match serde_json::to_string(msg) {
            Ok(json) => json,
            Err(e) => {
                error!(topic = %msg.topic, error = %e, "message serialization failed");
                return false;
            }
        };

        match self.try_deliver(Message::Text(json.into())) {
            Delivery::Queued => true,
            Delivery::Full => {
                warn!(
                    user_id = %self.identity.user_id,
                    session_id = %self.identity.session_id,
                    section_id = %self.identity.section_id,
                    "send buffer full, evicting client"
                );
                counter!("gateway_evictions_total", "reason" => "backpressure").increment(1);
                self.hub.detach_async(self.clone());
                false
            }
            Delivery::Closed => false,
        }
    }

    /// Register a callback run once when the client closes. Runs immediately
    /// if the client is already closed.
    pub fn add_close_hook<F>(&self, hook: F)
    where
        F: FnOnce(&Client) + Send + 'static,
    {
        let mut hooks = self.close_hooks.lock();
        if !self.is_closed() {
            hooks.push(Box::new(hook));
            return;
        }
        drop(hooks);
        self.run_hook(Box::new(hook));
    }

    /// Close the outbound queue, stop both loops and run close hooks.
    /// Only the first call has any effect.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        // Dropping the sender lets the write loop drain what is queued and exit.
        self.tx.lock().take();
        self.close_signal.send_replace(true);

        let hooks = std::mem::take(&mut *self.close_hooks.lock());
        for hook in hooks {
            self.run_hook(hook);
        }

        counter!("gateway_disconnections_total").increment(1);
        info!(
            user_id = %self.identity.user_id,
            session_id = %self.identity.session_id,
            section_id = %self.identity.section_id,
            "client closed"
        );
    }

    fn run_hook(&self, hook: CloseHook) {
        if catch_unwind(AssertUnwindSafe(|| hook(self))).is_err() {
            error!(session_id = %self.identity.session_id, "close hook panicked");
        }
    }

    /// Inbound loop: decode one command per frame and hand it to `processor`.
    ///
    /// Exits on peer close, read error, idle timeout or local close, then
    /// detaches the client from the hub.
    pub async fn run_read_loop<S, E>(
        self: Arc<Self>,
        mut stream: S,
        processor: Arc<CommandProcessor>,
        idle_timeout: Duration,
    ) where
        S: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        let mut closed = self.close_signal.subscribe();

        loop {
            let next = tokio::select! {
                biased;

                _ = closed.wait_for(|closed| *closed) => break,

                next = timeout(idle_timeout, stream.next()) => next,
            };

            match next {
                Err(_) => {
                    info!(session_id = %self.identity.session_id, "idle timeout");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    warn!(session_id = %self.identity.session_id, error = %e, "read error");
                    break;
                }
                Ok(Some(Ok(msg))) => match msg {
                    Message::Text(text) => self.dispatch_frame(text.as_str().as_bytes(), &processor),
                    Message::Binary(data) => self.dispatch_frame(&data, &processor),
                    // Any frame, pongs included, resets the idle timer.
                    Message::Ping(_) | Message::Pong(_) => {}
                    Message::Close(_) => break,
                },
            }
        }

        self.hub.detach_client(&self);
    }

    fn dispatch_frame(self: &Arc<Self>, frame: &[u8], processor: &CommandProcessor) {
        match serde_json::from_slice::<Command>(frame) {
            Ok(command) => processor.process(self, command),
            Err(e) => {
                debug!(session_id = %self.identity.session_id, error = %e, "invalid command frame");
            }
        }
    }

    /// Outbound loop: drain the queue in order and send a ping every
    /// `ping_interval`. Exits once the queue is closed and drained or a
    /// write fails.
    pub async fn run_write_loop<S>(
        self: Arc<Self>,
        mut sink: S,
        mut rx: mpsc::Receiver<Message>,
        ping_interval: Duration,
    ) where
        S: Sink<Message> + Unpin,
        S::Error: Display,
    {
        let mut ping = interval_at(Instant::now() + ping_interval, ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    if let Err(e) = sink.send(msg).await {
                        warn!(session_id = %self.identity.session_id, error = %e, "write error");
                        break;
                    }
                }

                _ = ping.tick() => {
                    if let Err(e) = sink.send(Message::Ping(Bytes::new())).await {
                        warn!(session_id = %self.identity.session_id, error = %e, "ping error");
                        break;
                    }
                }
            }
        }

        if let Err(e) = sink.close().await {
            debug!(session_id = %self.identity.session_id, error = %e, "socket close failed");
        }
        self.hub.detach_client(&self);
    }
}
