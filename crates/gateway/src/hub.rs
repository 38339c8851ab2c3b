//! Topic-indexed subscriber registry and filtered fan-out.
//!
//! All membership lives behind one `RwLock`. Index mutation takes the write
//! lock; `broadcast` holds the read lock only while it snapshots candidates,
//! so a slow client never stalls registration or other broadcasts.
//!
//! Lock order is hub state, then a client's `subscribed` set. A client is
//! never closed while the hub lock is held because close runs user hooks.

use crate::client::{Client, ClientId, Delivery};
use axum::extract::ws::Message;
use common::messages::{META_SECTION_ID, META_SESSION_ID, META_USER_ID};
use common::CanonicalMessage;
use metrics::{counter, gauge};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct HubState {
    /// Identity key (`userId:sessionId[:sectionId]`) → live client.
    clients: HashMap<String, Arc<Client>>,
    /// Topic → subscribers.
    topics: HashMap<String, HashMap<ClientId, Arc<Client>>>,
    /// Clients receiving every routable message.
    global: HashMap<ClientId, Arc<Client>>,
}

impl HubState {
    fn is_registered(&self, client: &Client) -> bool {
        matches!(self.clients.get(&client.key()), Some(c) if c.id == client.id)
    }

    fn remove_memberships(&mut self, client: &Client) {
        let topics: Vec<String> = client.subscribed.lock().drain().collect();
        for topic in topics {
            if let Some(subscribers) = self.topics.get_mut(&topic) {
                subscribers.remove(&client.id);
                if subscribers.is_empty() {
                    self.topics.remove(&topic);
                }
            }
        }
        self.global.remove(&client.id);
    }
}

/// Shared connection hub. Cloning is cheap; every clone sees the same state.
#[derive(Clone, Default)]
pub struct Hub {
    state: Arc<RwLock<HubState>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `client` at its identity key, evicting any other client that
    /// holds the same key.
    pub fn register_client(&self, client: &Arc<Client>) {
        let evicted = {
            let mut state = self.state.write();
            let previous = state.clients.insert(client.key(), client.clone());
            match previous {
                Some(old) if old.id != client.id => {
                    state.remove_memberships(&old);
                    Some(old)
                }
                _ => None,
            }
        };

        if let Some(old) = evicted {
            info!(
                user_id = %old.user_id(),
                session_id = %old.session_id(),
                section_id = %old.section_id(),
                "duplicate identity, evicting previous connection"
            );
            counter!("gateway_evictions_total", "reason" => "duplicate").increment(1);
            old.close();
        }
        counter!("gateway_connections_total").increment(1);

        gauge!("gateway_active_connections").set(self.client_count() as f64);
        info!(
            user_id = %client.user_id(),
            session_id = %client.session_id(),
            section_id = %client.section_id(),
            "client registered"
        );
    }

    /// Add a registered client to `topic`. Returns false for blank topics or
    /// clients the hub no longer tracks.
    pub fn subscribe(&self, client: &Arc<Client>, topic: &str) -> bool {
        let topic = topic.trim();
        if topic.is_empty() {
            return false;
        }

        let mut state = self.state.write();
        if !state.is_registered(client) {
            debug!(session_id = %client.session_id(), topic = %topic, "subscribe from detached client ignored");
            return false;
        }
        state
            .topics
            .entry(topic.to_string())
            .or_default()
            .insert(client.id, client.clone());
        client.subscribed.lock().insert(topic.to_string());
        debug!(session_id = %client.session_id(), topic = %topic, "subscribed");
        true
    }

    /// Remove `client` from `topic`, pruning the topic when it empties.
    pub fn unsubscribe(&self, client: &Arc<Client>, topic: &str) {
        let topic = topic.trim();
        let mut state = self.state.write();
        if let Some(subscribers) = state.topics.get_mut(topic) {
            subscribers.remove(&client.id);
            if subscribers.is_empty() {
                state.topics.remove(topic);
            }
        }
        client.subscribed.lock().remove(topic);
        debug!(session_id = %client.session_id(), topic = %topic, "unsubscribed");
    }

    /// Register and subscribe to every non-blank topic.
    pub fn attach_client(&self, client: &Arc<Client>, topics: &[String]) {
        self.register_client(client);
        for topic in topics {
            self.subscribe(client, topic);
        }
        info!(session_id = %client.session_id(), topics = ?topics, "client attached");
    }

    /// Register as a global subscriber that receives every routable message.
    pub fn attach_client_to_all(&self, client: &Arc<Client>) {
        self.register_client(client);
        let mut state = self.state.write();
        if state.is_registered(client) {
            state.global.insert(client.id, client.clone());
        }
    }

    /// Remove `client` from every index and close it. Safe to call repeatedly;
    /// a newer client registered under the same key is left untouched.
    pub fn detach_client(&self, client: &Arc<Client>) {
        let removed = {
            let mut state = self.state.write();
            let owned = state.is_registered(client);
            if owned {
                state.clients.remove(&client.key());
            }
            state.remove_memberships(client);
            owned
        };

        client.close();

        if removed {
            gauge!("gateway_active_connections").set(self.client_count() as f64);
            info!(
                user_id = %client.user_id(),
                session_id = %client.session_id(),
                section_id = %client.section_id(),
                "client detached"
            );
        }
    }

    /// Detach on a separate task when a runtime is available.
    pub fn detach_async(&self, client: Arc<Client>) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let hub = self.clone();
                handle.spawn(async move { hub.detach_client(&client) });
            }
            Err(_) => self.detach_client(&client),
        }
    }

    /// Fan `msg` out to topic subscribers plus global subscribers.
    ///
    /// Present `userId`/`sessionId`/`sectionId` metadata restricts delivery to
    /// clients matching all of them. Clients with a full queue are evicted.
    /// Returns the number of clients the message was queued for.
    pub fn broadcast(&self, msg: &CanonicalMessage) -> usize {
        if !msg.is_routable() {
            warn!(entity = %msg.entity, action = %msg.action, "dropping message without topic");
            return 0;
        }

        let candidates: Vec<Arc<Client>> = {
            let state = self.state.read();
            let mut seen = HashSet::new();
            state
                .topics
                .get(&msg.topic)
                .into_iter()
                .flat_map(|subscribers| subscribers.values())
                .chain(state.global.values())
                .filter(|c| seen.insert(c.id))
                .cloned()
                .collect()
        };

        let user = msg.metadata_value(META_USER_ID);
        let session = msg.metadata_value(META_SESSION_ID);
        let section = msg.metadata_value(META_SECTION_ID);
        let targets: Vec<Arc<Client>> = candidates
            .into_iter()
            .filter(|c| user.map_or(true, |u| c.user_id() == u))
            .filter(|c| session.map_or(true, |s| c.session_id() == s))
            .filter(|c| section.map_or(true, |s| c.section_id() == s))
            .collect();

        counter!("gateway_broadcasts_total").increment(1);
        if targets.is_empty() {
            debug!(topic = %msg.topic, "no subscribers");
            return 0;
        }

        let json = match serde_json::to_string(msg) {
            Ok(json) => json,
            Err(e) => {
                error!(topic = %msg.topic, error = %e, "broadcast serialization failed");
                return 0;
            }
        };
        let frame = Message::Text(json.into());

        let mut delivered = 0;
        for client in targets {
            match client.try_deliver(frame.clone()) {
                Delivery::Queued => delivered += 1,
                Delivery::Full => {
                    warn!(
                        topic = %msg.topic,
                        session_id = %client.session_id(),
                        "send buffer full, evicting client"
                    );
                    counter!("gateway_evictions_total", "reason" => "backpressure").increment(1);
                    self.detach_async(client);
                }
                Delivery::Closed => self.detach_async(client),
            }
        }

        debug!(topic = %msg.topic, delivered, "broadcast");
        delivered
    }

    pub fn client_count(&self) -> usize {
        self.state.read().clients.len()
    }

    pub fn topic_count(&self) -> usize {
        self.state.read().topics.len()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.state
            .read()
            .topics
            .get(topic.trim())
            .map_or(0, HashMap::len)
    }

    /// Whether `client` is the live connection for its identity key.
    pub fn is_registered(&self, client: &Client) -> bool {
        self.state.read().is_registered(client)
    }
}
