use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::bus::{EventBus, EVENT_STATE_CHANGED};

/// State object as published for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    pub last_changed: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub context: Context,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            parent_id: None,
            user_id: None,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Current state of every entity. Each recorded change is announced on the
/// event bus as `state_changed`.
pub struct StateMachine {
    states: DashMap<String, EntityState>,
    bus: Arc<EventBus>,
}

impl StateMachine {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            states: DashMap::new(),
            bus,
        }
    }

    pub fn get_all(&self) -> Vec<EntityState> {
        let mut all: Vec<EntityState> = self
            .states
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        all
    }

    pub fn get(&self, entity_id: &str) -> Option<EntityState> {
        self.states.get(entity_id).map(|entry| entry.value().clone())
    }

    /// Record a state unconditionally.
    #[cfg(test)]
    pub fn set(&self, entity_id: &str, state: String, attributes: Map<String, Value>) -> EntityState {
        self.write(entity_id, state, attributes, true).0
    }

    /// Record a state only when the state string or attributes differ from
    /// the current ones. Returns the new state when something was recorded.
    pub fn set_if_changed(
        &self,
        entity_id: &str,
        state: String,
        attributes: Map<String, Value>,
    ) -> Option<EntityState> {
        let (new_state, recorded) = self.write(entity_id, state, attributes, false);
        recorded.then_some(new_state)
    }

    fn write(
        &self,
        entity_id: &str,
        state: String,
        attributes: Map<String, Value>,
        force: bool,
    ) -> (EntityState, bool) {
        let now = Utc::now();
        // Compare and insert under one entry guard so concurrent writers to
        // the same entity cannot interleave.
        let (old_state, new_state) = match self.states.entry(entity_id.to_string()) {
            Entry::Occupied(mut slot) => {
                let prev = slot.get();
                let state_changed = prev.state != state;
                if !force && !state_changed && prev.attributes == attributes {
                    return (prev.clone(), false);
                }
                let last_changed = if state_changed { now } else { prev.last_changed };
                let new_state = EntityState {
                    entity_id: entity_id.to_string(),
                    state,
                    attributes,
                    last_changed,
                    last_updated: now,
                    context: Context::new(),
                };
                (Some(slot.insert(new_state.clone())), new_state)
            }
            Entry::Vacant(slot) => {
                let new_state = EntityState {
                    entity_id: entity_id.to_string(),
                    state,
                    attributes,
                    last_changed: now,
                    last_updated: now,
                    context: Context::new(),
                };
                slot.insert(new_state.clone());
                (None, new_state)
            }
        };

        self.bus.fire_with_context(
            EVENT_STATE_CHANGED,
            serde_json::json!({
                "entity_id": entity_id,
                "old_state": old_state,
                "new_state": new_state,
            }),
            new_state.context.clone(),
        );

        (new_state, true)
    }

    /// Remove an entity's state. Announced as `state_changed` with a null
    /// new state.
    pub fn remove(&self, entity_id: &str) -> bool {
        match self.states.remove(entity_id) {
            Some((_, old_state)) => {
                self.bus.fire(
                    EVENT_STATE_CHANGED,
                    serde_json::json!({
                        "entity_id": entity_id,
                        "old_state": old_state,
                        "new_state": null,
                    }),
                );
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_sm() -> (StateMachine, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new(64));
        (StateMachine::new(bus.clone()), bus)
    }

    fn attrs(brightness: u8) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("brightness".to_string(), json!(brightness));
        m
    }

    #[test]
    fn test_set_and_get() {
        let (sm, _bus) = make_sm();
        sm.set("light.kitchen", "on".to_string(), attrs(128));
        let s = sm.get("light.kitchen").unwrap();
        assert_eq!(s.state, "on");
        assert_eq!(s.attributes["brightness"], 128);
        assert_eq!(sm.len(), 1);
    }

    #[test]
    fn test_set_if_changed_skips_identical_state() {
        let (sm, bus) = make_sm();
        let mut rx = bus.subscribe();

        assert!(sm.set_if_changed("light.kitchen", "on".to_string(), attrs(128)).is_some());
        assert!(sm.set_if_changed("light.kitchen", "on".to_string(), attrs(128)).is_none());
        assert!(sm.set_if_changed("light.kitchen", "on".to_string(), attrs(200)).is_some());

        let mut fired = 0;
        while rx.try_recv().is_ok() {
            fired += 1;
        }
        assert_eq!(fired, 2);
    }

    #[test]
    fn test_last_changed_tracks_state_only() {
        let (sm, _bus) = make_sm();
        let first = sm.set("light.kitchen", "on".to_string(), attrs(10));
        let second = sm.set("light.kitchen", "on".to_string(), attrs(20));
        assert_eq!(first.last_changed, second.last_changed);
        assert!(second.last_updated >= first.last_updated);

        let third = sm.set("light.kitchen", "off".to_string(), attrs(20));
        assert!(third.last_changed >= second.last_changed);
    }

    #[test]
    fn test_state_changed_event_payload() {
        let (sm, bus) = make_sm();
        let mut rx = bus.subscribe();
        sm.set("light.kitchen", "on".to_string(), Map::new());

        let event = rx.try_recv().unwrap();
        assert_eq!(event.event_type, "state_changed");
        assert_eq!(event.data["entity_id"], "light.kitchen");
        assert!(event.data["old_state"].is_null());
        assert_eq!(event.data["new_state"]["state"], "on");
    }

    #[test]
    fn test_remove() {
        let (sm, bus) = make_sm();
        sm.set("scene.evening", "unknown".to_string(), Map::new());
        let mut rx = bus.subscribe();

        assert!(sm.remove("scene.evening"));
        assert!(!sm.remove("scene.evening"));
        assert!(sm.get("scene.evening").is_none());
        let event = rx.try_recv().unwrap();
        assert!(event.data["new_state"].is_null());
    }

    #[test]
    fn test_get_all_sorted() {
        let (sm, _bus) = make_sm();
        sm.set("scene.b", "unknown".to_string(), Map::new());
        sm.set("light.a", "off".to_string(), Map::new());
        let ids: Vec<String> = sm.get_all().into_iter().map(|s| s.entity_id).collect();
        assert_eq!(ids, vec!["light.a", "scene.b"]);
    }
}
