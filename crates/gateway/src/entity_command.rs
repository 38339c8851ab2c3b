//! Entity commands for section connections (`list`, `detail` and their
//! per-entity aliases) plus entity naming helpers.

use crate::client::Client;
use crate::command::{Command, FallbackHandler};
use crate::section::{command_error, SectionService};
use async_trait::async_trait;
use common::messages::{detail_topic, entity_topic, error_topic, list_topic, snapshot_topic};
use common::{PagedQuery, SnapshotAudience};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Entities with section command support: (entity, plural action, singular action).
const INTEGRATED_ENTITIES: &[(&str, &str, &str)] = &[
    ("restaurants", "restaurants", "restaurant"),
    ("tables", "tables", "table"),
    ("reservations", "reservations", "reservation"),
    ("reviews", "reviews", "review"),
    ("sections", "sections", "section"),
    ("objects", "objects", "object"),
    ("menus", "menus", "menu"),
    ("dishes", "dishes", "dish"),
    ("images", "images", "image"),
    ("section-objects", "section_objects", "section_object"),
    ("payments", "payments", "payment"),
    ("subscriptions", "subscriptions", "subscription"),
    ("subscription-plans", "subscription_plans", "subscription_plan"),
    ("auth-users", "auth_users", "auth_user"),
];

/// Canonical entity name for a path segment. Blank, `-` and `default` map to
/// an empty string so the caller can fall back to its default entity.
pub fn normalize_entity(raw: &str) -> String {
    let trimmed = raw.trim().to_lowercase();
    let canonical = match trimmed.as_str() {
        "" | "-" | "default" => "",
        "restaurant" | "restaurants" => "restaurants",
        "table" | "tables" => "tables",
        "reservation" | "reservations" => "reservations",
        "section" | "sections" => "sections",
        "review" | "reviews" => "reviews",
        "object" | "objects" => "objects",
        "menu" | "menus" => "menus",
        "dish" | "dishes" => "dishes",
        "image" | "images" => "images",
        "sectionobject" | "sectionobjects" | "section-object" | "section-objects"
        | "section_object" | "section_objects" => "section-objects",
        "payment" | "payments" => "payments",
        "subscription" | "subscriptions" => "subscriptions",
        "subscription-plan" | "subscription-plans" | "subscription_plan"
        | "subscription_plans" | "subscriptionplan" | "subscriptionplans" => "subscription-plans",
        "auth-user" | "auth-users" | "auth_user" | "auth_users" | "authuser" | "authusers"
        | "auth" => "auth-users",
        _ => return trimmed,
    };
    canonical.to_string()
}

fn integration(entity: &str) -> Option<(&'static str, &'static str, &'static str)> {
    INTEGRATED_ENTITIES
        .iter()
        .copied()
        .find(|(name, _, _)| *name == entity)
}

/// Whether section connections are supported for the canonical `entity`.
pub fn is_integrated(entity: &str) -> bool {
    integration(entity).is_some()
}

/// Topics a section client of `entity` is attached to: the snapshot, list,
/// detail and error topics, then `entity.<action>` per allowed action.
pub fn build_topics(entity: &str, allowed_actions: &[String]) -> Vec<String> {
    let entity = entity.trim();
    let mut topics = Vec::new();
    let mut seen = HashSet::new();

    let base = [
        snapshot_topic(entity),
        list_topic(entity),
        detail_topic(entity),
        error_topic(entity),
    ];
    let custom = allowed_actions
        .iter()
        .map(|action| entity_topic(entity, &action.trim().to_lowercase()));

    for topic in base.into_iter().chain(custom).flatten() {
        if seen.insert(topic.clone()) {
            topics.push(topic);
        }
    }
    topics
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GetEntityPayload {
    id: String,
}

/// Fallback handler bound to one section connection.
pub struct EntityCommandHandler {
    entity: String,
    section_id: String,
    token: String,
    audience: SnapshotAudience,
    list_action: String,
    get_action: String,
    service: Arc<SectionService>,
}

impl EntityCommandHandler {
    /// `None` when `entity` has no command support.
    pub fn new(
        entity: &str,
        section_id: &str,
        token: &str,
        audience: SnapshotAudience,
        service: Arc<SectionService>,
    ) -> Option<Self> {
        let (entity, plural, singular) = integration(entity)?;
        Some(Self {
            entity: entity.to_string(),
            section_id: section_id.trim().to_string(),
            token: token.to_string(),
            audience,
            list_action: format!("list_{}", plural),
            get_action: format!("get_{}", singular),
            service,
        })
    }

    async fn handle_list(&self, client: &Arc<Client>, command: &Command) {
        let query = match command.decode_payload::<PagedQuery>() {
            Ok(query) => query,
            Err(e) => {
                warn!(entity = %self.entity, section_id = %self.section_id, error = %e, "list payload decode failed");
                self.reply_error(client, "list", "invalid payload");
                return;
            }
        };

        match self
            .service
            .list(&self.token, &self.entity, &self.section_id, self.audience, &query)
            .await
        {
            Ok(msg) => {
                client.send_message(&msg);
            }
            Err(e) => {
                warn!(entity = %self.entity, section_id = %self.section_id, error = %e, "list fetch failed");
                self.reply_error(client, "list", &e.to_string());
            }
        }
    }

    async fn handle_detail(&self, client: &Arc<Client>, command: &Command) {
        let resource_id = match command.decode_payload::<GetEntityPayload>() {
            Ok(payload) if !payload.id.trim().is_empty() => payload.id.trim().to_string(),
            Ok(_) => {
                self.reply_error(client, "detail", "invalid payload");
                return;
            }
            Err(e) => {
                warn!(entity = %self.entity, section_id = %self.section_id, error = %e, "detail payload decode failed");
                self.reply_error(client, "detail", "invalid payload");
                return;
            }
        };

        match self
            .service
            .detail(
                &self.token,
                &self.entity,
                &self.section_id,
                self.audience,
                &resource_id,
            )
            .await
        {
            Ok(msg) => {
                client.send_message(&msg);
            }
            Err(e) => {
                warn!(
                    entity = %self.entity,
                    section_id = %self.section_id,
                    resource_id = %resource_id,
                    error = %e,
                    "detail fetch failed"
                );
                self.reply_error(client, "detail", &e.to_string());
            }
        }
    }

    fn reply_error(&self, client: &Arc<Client>, action: &str, reason: &str) {
        client.send_message(&command_error(&self.entity, &self.section_id, action, reason));
    }
}

#[async_trait]
impl FallbackHandler for EntityCommandHandler {
    async fn handle(&self, client: Arc<Client>, command: Command) {
        let action = command.normalized_action();
        if action == "list" || action == "fetch_all" || action == self.list_action {
            self.handle_list(&client, &command).await;
        } else if action == "detail" || action == "fetch_one" || action == self.get_action {
            self.handle_detail(&client, &command).await;
        } else {
            debug!(entity = %self.entity, section_id = %self.section_id, action = %command.action, "unknown entity command");
            self.reply_error(&client, "unknown", "unsupported action");
        }
    }
}
