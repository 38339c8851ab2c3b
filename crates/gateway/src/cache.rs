//! Per-section store of last-known-good snapshots.
//!
//! Entries are never expired by time. They are replaced by successful fetches
//! and removed only when the upstream answers not-found.

use chrono::{DateTime, Utc};
use common::{PagedQuery, SectionSnapshot, SnapshotAudience};
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    List,
    Item,
}

impl CacheKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheKind::List => "list",
            CacheKind::Item => "item",
        }
    }
}

/// Location of an entry: its section plus the canonical key inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryKey {
    pub section_id: String,
    pub key: String,
}

impl EntryKey {
    pub fn list(
        section_id: &str,
        scope: &str,
        audience: SnapshotAudience,
        query: &PagedQuery,
    ) -> Self {
        Self {
            section_id: section_id.trim().to_string(),
            key: cache_key(scope, CacheKind::List, audience, query, ""),
        }
    }

    pub fn item(
        section_id: &str,
        scope: &str,
        audience: SnapshotAudience,
        resource_id: &str,
    ) -> Self {
        Self {
            section_id: section_id.trim().to_string(),
            key: cache_key(
                scope,
                CacheKind::Item,
                audience,
                &PagedQuery::default(),
                resource_id,
            ),
        }
    }
}

/// `scope|kind|audience|<canonical query or resource id>`.
pub fn cache_key(
    scope: &str,
    kind: CacheKind,
    audience: SnapshotAudience,
    query: &PagedQuery,
    resource_id: &str,
) -> String {
    let scope = scope.trim().to_lowercase();
    match kind {
        CacheKind::List => format!(
            "{}|list|{}|{}",
            scope,
            audience.as_str(),
            query.canonical_key()
        ),
        CacheKind::Item => format!(
            "{}|item|{}|{}",
            scope,
            audience.as_str(),
            resource_id.trim()
        ),
    }
}

/// A stored fetch result with what is needed to repeat the fetch.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub section_id: String,
    pub scope: String,
    pub kind: CacheKind,
    /// Normalized list query; default for items.
    pub query: PagedQuery,
    /// Resource id for items; empty for lists.
    pub resource_id: String,
    pub audience: SnapshotAudience,
    /// Token the snapshot was fetched with, reused by refreshes.
    pub token: String,
    pub snapshot: SectionSnapshot,
    pub fetched_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn key(&self) -> EntryKey {
        match self.kind {
            CacheKind::List => {
                EntryKey::list(&self.section_id, &self.scope, self.audience, &self.query)
            }
            CacheKind::Item => {
                EntryKey::item(&self.section_id, &self.scope, self.audience, &self.resource_id)
            }
        }
    }
}

/// Section → key → entry. Reads return clones.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    sections: RwLock<HashMap<String, HashMap<String, CacheEntry>>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, entry: CacheEntry) {
        let EntryKey { section_id, key } = entry.key();
        self.sections
            .write()
            .entry(section_id)
            .or_default()
            .insert(key, entry);
    }

    pub fn get(&self, key: &EntryKey) -> Option<CacheEntry> {
        self.sections
            .read()
            .get(&key.section_id)
            .and_then(|entries| entries.get(&key.key))
            .cloned()
    }

    /// Remove an entry; empty sections are pruned. Returns whether it existed.
    pub fn delete(&self, key: &EntryKey) -> bool {
        let mut sections = self.sections.write();
        let Some(entries) = sections.get_mut(&key.section_id) else {
            return false;
        };
        let removed = entries.remove(&key.key).is_some();
        if entries.is_empty() {
            sections.remove(&key.section_id);
        }
        removed
    }

    pub fn entries_for_section(&self, section_id: &str) -> Vec<CacheEntry> {
        self.sections
            .read()
            .get(section_id.trim())
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn section_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sections.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sections.read().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn list_entry(section: &str, scope: &str, query: PagedQuery) -> CacheEntry {
        CacheEntry {
            section_id: section.to_string(),
            scope: scope.to_string(),
            kind: CacheKind::List,
            query,
            resource_id: String::new(),
            audience: SnapshotAudience::Admin,
            token: "tok".to_string(),
            snapshot: SectionSnapshot::new(json!({"items": []})),
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn test_equivalent_queries_share_an_entry() {
        let cache = SnapshotCache::new();
        let mut filters = BTreeMap::new();
        filters.insert(" Status ".to_string(), "open ".to_string());
        let noisy = PagedQuery {
            search: " pizza ".to_string(),
            filters,
            ..Default::default()
        };
        cache.set(list_entry("s1", "tables", noisy));

        let mut filters = BTreeMap::new();
        filters.insert("status".to_string(), "open".to_string());
        let clean = PagedQuery {
            page: 1,
            limit: 20,
            search: "pizza".to_string(),
            filters,
            ..Default::default()
        };

        assert!(cache.get(&EntryKey::list("s1", "Tables", SnapshotAudience::Admin, &clean)).is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_items_and_lists_do_not_collide() {
        let cache = SnapshotCache::new();
        cache.set(list_entry("s1", "tables", PagedQuery::default()));
        cache.set(CacheEntry {
            kind: CacheKind::Item,
            resource_id: "t1".to_string(),
            ..list_entry("s1", "tables", PagedQuery::default())
        });

        assert_eq!(cache.entries_for_section("s1").len(), 2);
        assert!(cache.get(&EntryKey::item("s1", "tables", SnapshotAudience::Admin, " t1 ")).is_some());
        assert!(cache.get(&EntryKey::item("s2", "tables", SnapshotAudience::Admin, "t1")).is_none());
    }

    #[test]
    fn test_audiences_get_separate_entries() {
        let cache = SnapshotCache::new();
        cache.set(list_entry("s1", "restaurants", PagedQuery::default()));
        let owner_key = EntryKey::list(
            "s1",
            "restaurants",
            SnapshotAudience::Owner,
            &PagedQuery::default(),
        );
        assert!(cache.get(&owner_key).is_none());

        cache.set(CacheEntry {
            audience: SnapshotAudience::Owner,
            snapshot: SectionSnapshot::new(json!({"items": ["mine"]})),
            ..list_entry("s1", "restaurants", PagedQuery::default())
        });
        assert_eq!(cache.len(), 2);
        assert_eq!(
            cache.get(&owner_key).unwrap().snapshot.payload,
            json!({"items": ["mine"]})
        );
        let admin_key = EntryKey::list(
            "s1",
            "restaurants",
            SnapshotAudience::Admin,
            &PagedQuery::default(),
        );
        assert_eq!(cache.get(&admin_key).unwrap().snapshot.payload, json!({"items": []}));
    }

    #[test]
    fn test_delete_prunes_empty_sections() {
        let cache = SnapshotCache::new();
        cache.set(list_entry("s1", "tables", PagedQuery::default()));
        cache.set(list_entry("s2", "tables", PagedQuery::default()));
        assert_eq!(cache.section_ids(), vec!["s1".to_string(), "s2".to_string()]);

        let key = EntryKey::list("s1", "tables", SnapshotAudience::Admin, &PagedQuery::default());
        assert!(cache.delete(&key));
        assert!(!cache.delete(&key));
        assert!(cache.get(&key).is_none());
        assert_eq!(cache.section_ids(), vec!["s2".to_string()]);
    }

    #[test]
    fn test_get_returns_copies() {
        let cache = SnapshotCache::new();
        cache.set(list_entry("s1", "tables", PagedQuery::default()));
        let key = EntryKey::list("s1", "tables", SnapshotAudience::Admin, &PagedQuery::default());

        let mut copy = cache.get(&key).unwrap();
        copy.snapshot.payload = json!({"mutated": true});

        assert_eq!(cache.get(&key).unwrap().snapshot.payload, json!({"items": []}));
    }
}
