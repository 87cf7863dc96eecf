//! Driver-side elements: one per UPB device (light) or link (scene).
//!
//! Elements are owned by the PIM driver. The driver mutates them in response
//! to panel traffic and notifies registered callbacks with a [`Changeset`].
//! Everything else only reads them and queues commands through them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use super::DriverError;

/// Unit id for devices, link id for links.
pub type ElementIndex = u16;

/// Transition rate sentinel meaning "use the device's instant rate".
pub const RATE_INSTANT: i16 = -1;

/// Highest native level a UPB device reports.
pub const MAX_LEVEL: u8 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Light,
    Link,
}

impl ElementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementKind::Light => "light",
            ElementKind::Link => "link",
        }
    }
}

impl std::fmt::Display for ElementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command queued to the driver for one element.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    TurnOn { level: u8, rate: i16 },
    TurnOff { rate: i16 },
    Activate,
    Deactivate,
    Goto { level: u8, rate: i16 },
    FadeStart { level: u8, rate: i16 },
    FadeStop,
    Blink { rate: u8 },
    UpdateStatus,
}

impl Command {
    /// The `last_change` record this command leaves behind once the driver
    /// has applied it. Status polls leave none.
    pub fn last_change(&self) -> Option<LastChange> {
        let (command, level, rate) = match *self {
            Command::TurnOn { level, rate } => (ChangeCommand::TurnOn, Some(level), Some(rate)),
            Command::TurnOff { rate } => (ChangeCommand::TurnOff, None, Some(rate)),
            Command::Activate => (ChangeCommand::Activate, None, None),
            Command::Deactivate => (ChangeCommand::Deactivate, None, None),
            Command::Goto { level, rate } => (ChangeCommand::Goto, Some(level), Some(rate)),
            Command::FadeStart { level, rate } => {
                (ChangeCommand::FadeStart, Some(level), Some(rate))
            }
            Command::FadeStop => (ChangeCommand::FadeStop, None, None),
            Command::Blink { rate } => (ChangeCommand::Blink, None, Some(i16::from(rate))),
            Command::UpdateStatus => return None,
        };
        Some(LastChange {
            command,
            level,
            rate,
        })
    }
}

/// A command addressed to a specific element, as it travels to the driver.
#[derive(Debug, Clone, PartialEq)]
pub struct PimRequest {
    pub kind: ElementKind,
    pub index: ElementIndex,
    pub command: Command,
}

/// Commands that can appear in an element's `last_change`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeCommand {
    TurnOn,
    TurnOff,
    Activate,
    Deactivate,
    Goto,
    FadeStart,
    FadeStop,
    Blink,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastChange {
    pub command: ChangeCommand,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<i16>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Status(Option<u8>),
    LastChange(LastChange),
}

/// The set of fields that changed in one driver update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Changeset {
    changes: Vec<Change>,
}

impl Changeset {
    pub fn new(changes: Vec<Change>) -> Self {
        Self { changes }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// New status, if the status changed. The inner `None` means the
    /// status became unknown.
    pub fn status(&self) -> Option<Option<u8>> {
        self.changes.iter().find_map(|c| match c {
            Change::Status(s) => Some(*s),
            _ => None,
        })
    }

    pub fn last_change(&self) -> Option<&LastChange> {
        self.changes.iter().find_map(|c| match c {
            Change::LastChange(lc) => Some(lc),
            _ => None,
        })
    }
}

pub type CallbackId = u64;

pub type ElementCallback = Arc<dyn Fn(&Element, &Changeset) + Send + Sync>;

#[derive(Debug, Default)]
struct ElementFields {
    status: Option<u8>,
    last_change: Option<LastChange>,
}

/// One UPB device or link as known to the driver.
pub struct Element {
    index: ElementIndex,
    kind: ElementKind,
    name: String,
    dimmable: bool,
    fields: RwLock<ElementFields>,
    callbacks: Mutex<Vec<(CallbackId, ElementCallback)>>,
    next_callback: AtomicU64,
    tx: mpsc::UnboundedSender<PimRequest>,
}

impl std::fmt::Debug for Element {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Element")
            .field("kind", &self.kind)
            .field("index", &self.index)
            .field("name", &self.name)
            .field("status", &self.status())
            .finish()
    }
}

impl Element {
    pub fn light(
        index: ElementIndex,
        name: impl Into<String>,
        dimmable: bool,
        tx: mpsc::UnboundedSender<PimRequest>,
    ) -> Self {
        Self::new(ElementKind::Light, index, name.into(), dimmable, tx)
    }

    /// Links are always "dimmable": goto and fade carry a level.
    pub fn link(
        index: ElementIndex,
        name: impl Into<String>,
        tx: mpsc::UnboundedSender<PimRequest>,
    ) -> Self {
        Self::new(ElementKind::Link, index, name.into(), true, tx)
    }

    fn new(
        kind: ElementKind,
        index: ElementIndex,
        name: String,
        dimmable: bool,
        tx: mpsc::UnboundedSender<PimRequest>,
    ) -> Self {
        Self {
            index,
            kind,
            name,
            dimmable,
            fields: RwLock::new(ElementFields::default()),
            callbacks: Mutex::new(Vec::new()),
            next_callback: AtomicU64::new(1),
            tx,
        }
    }

    /// Seed the status before the element is shared.
    pub fn with_status(self, status: Option<u8>) -> Self {
        self.fields.write().unwrap_or_else(|e| e.into_inner()).status = status;
        self
    }

    pub fn index(&self) -> ElementIndex {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dimmable(&self) -> bool {
        self.dimmable
    }

    pub fn status(&self) -> Option<u8> {
        self.fields.read().unwrap_or_else(|e| e.into_inner()).status
    }

    pub fn last_change(&self) -> Option<LastChange> {
        self.fields
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .last_change
            .clone()
    }

    /// Field dump used as the base of an entity's attributes.
    pub fn as_dict(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("index".to_string(), Value::from(self.index));
        map.insert("name".to_string(), Value::String(self.name.clone()));
        map.insert(
            "element_type".to_string(),
            Value::String(self.kind.as_str().to_string()),
        );
        if self.kind == ElementKind::Light {
            map.insert("dimmable".to_string(), Value::Bool(self.dimmable));
            map.insert(
                "status".to_string(),
                self.status().map(Value::from).unwrap_or(Value::Null),
            );
        }
        map
    }

    // ── Callbacks ────────────────────────────────────────

    pub fn add_callback(&self, callback: ElementCallback) -> CallbackId {
        let id = self.next_callback.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, callback));
        id
    }

    /// Returns false if the callback was not registered.
    pub fn remove_callback(&self, id: CallbackId) -> bool {
        let mut callbacks = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
        let before = callbacks.len();
        callbacks.retain(|(cb_id, _)| *cb_id != id);
        callbacks.len() != before
    }

    #[cfg(test)]
    pub fn callback_count(&self) -> usize {
        self.callbacks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Driver entry point: record new field values and notify callbacks.
    ///
    /// Status values equal to the current one are dropped from the
    /// changeset; `last_change` is always reported so repeated commands
    /// are still observable. Nothing is notified for an empty changeset.
    pub fn apply_changes(&self, changes: Vec<Change>) {
        let changeset = {
            let mut fields = self.fields.write().unwrap_or_else(|e| e.into_inner());
            let mut applied = Vec::with_capacity(changes.len());
            for change in changes {
                match change {
                    Change::Status(status) => {
                        if fields.status != status {
                            fields.status = status;
                            applied.push(Change::Status(status));
                        }
                    }
                    Change::LastChange(last) => {
                        fields.last_change = Some(last.clone());
                        applied.push(Change::LastChange(last));
                    }
                }
            }
            Changeset::new(applied)
        };

        if changeset.is_empty() {
            return;
        }

        // Callbacks may add or remove callbacks; never hold the lock while
        // invoking them.
        let callbacks: Vec<ElementCallback> = self
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();

        for callback in callbacks {
            callback(self, &changeset);
        }
    }

    // ── Commands ─────────────────────────────────────────

    pub fn turn_on(&self, level: u8, rate: i16) -> Result<(), DriverError> {
        self.send(Command::TurnOn {
            level: level.min(MAX_LEVEL),
            rate,
        })
    }

    pub fn turn_off(&self, rate: i16) -> Result<(), DriverError> {
        self.send(Command::TurnOff { rate })
    }

    pub fn activate(&self) -> Result<(), DriverError> {
        self.send(Command::Activate)
    }

    pub fn deactivate(&self) -> Result<(), DriverError> {
        self.send(Command::Deactivate)
    }

    pub fn goto(&self, level: u8, rate: i16) -> Result<(), DriverError> {
        self.send(Command::Goto {
            level: level.min(MAX_LEVEL),
            rate,
        })
    }

    pub fn fade_start(&self, level: u8, rate: i16) -> Result<(), DriverError> {
        self.send(Command::FadeStart {
            level: level.min(MAX_LEVEL),
            rate,
        })
    }

    pub fn fade_stop(&self) -> Result<(), DriverError> {
        self.send(Command::FadeStop)
    }

    pub fn blink(&self, rate: u8) -> Result<(), DriverError> {
        self.send(Command::Blink { rate })
    }

    pub fn update_status(&self) -> Result<(), DriverError> {
        self.send(Command::UpdateStatus)
    }

    fn send(&self, command: Command) -> Result<(), DriverError> {
        tracing::debug!(
            kind = %self.kind,
            index = self.index,
            ?command,
            "Queueing UPB command"
        );
        self.tx
            .send(PimRequest {
                kind: self.kind,
                index: self.index,
                command,
            })
            .map_err(|_| DriverError::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_light() -> (Element, mpsc::UnboundedReceiver<PimRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Element::light(7, "Kitchen", true, tx), rx)
    }

    #[test]
    fn test_commands_are_queued_with_element_address() {
        let (light, mut rx) = make_light();
        light.turn_on(80, 5).unwrap();
        light.turn_off(RATE_INSTANT).unwrap();

        let first = rx.try_recv().unwrap();
        assert_eq!(first.kind, ElementKind::Light);
        assert_eq!(first.index, 7);
        assert_eq!(first.command, Command::TurnOn { level: 80, rate: 5 });
        assert_eq!(
            rx.try_recv().unwrap().command,
            Command::TurnOff { rate: -1 }
        );
    }

    #[test]
    fn test_levels_are_clamped_to_native_range() {
        let (light, mut rx) = make_light();
        light.turn_on(250, RATE_INSTANT).unwrap();
        assert_eq!(
            rx.try_recv().unwrap().command,
            Command::TurnOn { level: 100, rate: -1 }
        );
    }

    #[test]
    fn test_send_fails_when_driver_is_gone() {
        let (light, rx) = make_light();
        drop(rx);
        assert!(matches!(light.activate(), Err(DriverError::ChannelClosed)));
    }

    #[test]
    fn test_callbacks_receive_only_real_changes() {
        let (light, _rx) = make_light();
        let light = light.with_status(Some(10));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        light.add_callback(Arc::new(move |_el: &Element, cs: &Changeset| {
            sink.lock().unwrap().push(cs.clone());
        }));

        // Same status: nothing to report
        light.apply_changes(vec![Change::Status(Some(10))]);
        assert!(seen.lock().unwrap().is_empty());

        light.apply_changes(vec![Change::Status(Some(55))]);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].status(), Some(Some(55)));
        assert_eq!(light.status(), Some(55));
    }

    #[test]
    fn test_last_change_is_always_reported() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let link = Element::link(3, "Evening", tx);
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        link.add_callback(Arc::new(move |_el: &Element, cs: &Changeset| {
            assert!(cs.last_change().is_some());
            c.fetch_add(1, Ordering::SeqCst);
        }));

        let activate = Command::Activate.last_change().unwrap();
        link.apply_changes(vec![Change::LastChange(activate.clone())]);
        link.apply_changes(vec![Change::LastChange(activate)]);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(
            link.last_change().map(|lc| lc.command),
            Some(ChangeCommand::Activate)
        );
    }

    #[test]
    fn test_remove_callback() {
        let (light, _rx) = make_light();
        let id = light.add_callback(Arc::new(|_: &Element, _: &Changeset| {}));
        assert_eq!(light.callback_count(), 1);
        assert!(light.remove_callback(id));
        assert!(!light.remove_callback(id));
        assert_eq!(light.callback_count(), 0);
    }

    #[test]
    fn test_as_dict() {
        let (light, _rx) = make_light();
        let dict = light.as_dict();
        assert_eq!(dict["index"], 7);
        assert_eq!(dict["name"], "Kitchen");
        assert_eq!(dict["element_type"], "light");
        assert_eq!(dict["dimmable"], true);
        assert!(dict["status"].is_null());
    }

    #[test]
    fn test_last_change_records() {
        let goto = Command::Goto { level: 40, rate: 3 }.last_change().unwrap();
        assert_eq!(goto.command, ChangeCommand::Goto);
        assert_eq!(goto.level, Some(40));
        assert_eq!(goto.rate, Some(3));

        let blink = Command::Blink { rate: 20 }.last_change().unwrap();
        assert_eq!(blink.level, None);
        assert_eq!(blink.rate, Some(20));

        assert!(Command::UpdateStatus.last_change().is_none());
    }
}
