//! Event bus.
//!
//! Every event goes out on a single broadcast channel; subscribers filter
//! by `event_type` themselves. Firing never blocks and never fails: with no
//! subscribers the event is simply dropped.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::state::Context;

pub const EVENT_STATE_CHANGED: &str = "state_changed";

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub event_type: String,
    pub data: Value,
    pub origin: &'static str,
    pub time_fired: DateTime<Utc>,
    pub context: Context,
}

pub struct EventBus {
    tx: broadcast::Sender<Event>,
    fired: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            fired: AtomicU64::new(0),
        }
    }

    pub fn fire(&self, event_type: impl Into<String>, data: Value) -> Event {
        self.fire_with_context(event_type, data, Context::new())
    }

    pub fn fire_with_context(
        &self,
        event_type: impl Into<String>,
        data: Value,
        context: Context,
    ) -> Event {
        let event = Event {
            event_type: event_type.into(),
            data,
            origin: "LOCAL",
            time_fired: Utc::now(),
            context,
        };
        tracing::trace!(event_type = %event.event_type, "Firing event");
        let _ = self.tx.send(event.clone());
        self.fired.fetch_add(1, Ordering::Relaxed);
        event
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Total events fired since startup.
    pub fn fired(&self) -> u64 {
        self.fired.load(Ordering::Relaxed)
    }
}
