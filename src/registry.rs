//! Entity registry: stable entity ids for integration-provided entities.
//!
//! An entity is identified by `(domain, platform, unique_id)`. The first
//! time one is seen it gets `<domain>.<slug(name)>`, suffixed `_2`, `_3`, ...
//! when that id is taken. Later lookups with the same key return the same
//! id, even after the entity detached and attached again.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityEntry {
    pub entity_id: String,
    pub domain: String,
    pub platform: String,
    pub unique_id: String,
    pub original_name: String,
}

type EntryKey = (String, String, String);

#[derive(Default)]
struct Entries {
    by_key: HashMap<EntryKey, Arc<EntityEntry>>,
    by_entity_id: HashMap<String, Arc<EntityEntry>>,
}

#[derive(Default)]
pub struct EntityRegistry {
    entries: RwLock<Entries>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(
        &self,
        domain: &str,
        platform: &str,
        unique_id: &str,
        name: &str,
    ) -> Arc<EntityEntry> {
        let key = (domain.to_string(), platform.to_string(), unique_id.to_string());
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = entries.by_key.get(&key) {
            return existing.clone();
        }

        let mut object_id = slugify(name);
        if object_id.is_empty() {
            object_id = slugify(unique_id);
        }
        let preferred = format!("{}.{}", domain, object_id);
        let mut entity_id = preferred.clone();
        let mut tries = 1;
        while entries.by_entity_id.contains_key(&entity_id) {
            tries += 1;
            entity_id = format!("{}_{}", preferred, tries);
        }

        let entry = Arc::new(EntityEntry {
            entity_id: entity_id.clone(),
            domain: domain.to_string(),
            platform: platform.to_string(),
            unique_id: unique_id.to_string(),
            original_name: name.to_string(),
        });
        entries.by_key.insert(key, entry.clone());
        entries.by_entity_id.insert(entity_id, entry.clone());
        tracing::info!(entity_id = %entry.entity_id, unique_id = %unique_id, "Registered new entity");
        entry
    }

    pub fn get(&self, entity_id: &str) -> Option<Arc<EntityEntry>> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .by_entity_id
            .get(entity_id)
            .cloned()
    }

    /// All entries, ordered by entity id.
    pub fn list(&self) -> Vec<Arc<EntityEntry>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<_> = entries.by_entity_id.values().cloned().collect();
        all.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        all
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .by_entity_id
            .len()
    }
}

/// Lowercase `name`, turn every run of non-alphanumerics into one `_`.
pub fn slugify(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .split('_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}
