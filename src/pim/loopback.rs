//! In-memory PIM driver.
//!
//! Stands in for a physical panel: the device and link inventory comes from
//! configuration, and every command is applied to that inventory on a tokio
//! task, producing the same element callbacks a real panel would. Links
//! drive their member lights to the member's preset level on activate.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::{
    Change, Command, DriverError, Element, ElementIndex, ElementKind, Flags, Pim, PimConfig,
    PimRequest, MAX_LEVEL,
};

/// Devices and links the loopback panel knows about.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub lights: Vec<LightSpec>,
    #[serde(default)]
    pub links: Vec<LinkSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LightSpec {
    pub index: ElementIndex,
    pub name: String,
    #[serde(default = "default_dimmable")]
    pub dimmable: bool,
    /// Initial native level; unknown until the first status sync if absent.
    #[serde(default)]
    pub status: Option<u8>,
}

fn default_dimmable() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkSpec {
    pub index: ElementIndex,
    pub name: String,
    #[serde(default)]
    pub members: Vec<LinkMember>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkMember {
    pub light: ElementIndex,
    /// Preset level applied when the link is activated.
    #[serde(default = "default_member_level")]
    pub level: u8,
}

fn default_member_level() -> u8 {
    MAX_LEVEL
}

/// The simulated panel: elements plus link membership.
struct Panel {
    lights: BTreeMap<ElementIndex, Arc<Element>>,
    links: BTreeMap<ElementIndex, Arc<Element>>,
    members: BTreeMap<ElementIndex, Vec<LinkMember>>,
}

impl Panel {
    fn apply(&self, request: PimRequest) {
        let elements = match request.kind {
            ElementKind::Light => &self.lights,
            ElementKind::Link => &self.links,
        };
        let Some(element) = elements.get(&request.index) else {
            tracing::warn!(
                kind = %request.kind,
                index = request.index,
                "loopback: command for unknown element dropped"
            );
            return;
        };

        tracing::trace!(
            kind = %request.kind,
            index = request.index,
            command = ?request.command,
            "loopback: applying command"
        );

        match request.kind {
            ElementKind::Light => self.apply_light(element, &request.command),
            ElementKind::Link => self.apply_link(element, &request.command),
        }
    }

    fn apply_light(&self, light: &Element, command: &Command) {
        let status = match *command {
            Command::TurnOn { level, .. }
            | Command::Goto { level, .. }
            | Command::FadeStart { level, .. } => Some(settle(light, level)),
            Command::TurnOff { .. } => Some(0),
            Command::UpdateStatus => Some(light.status().unwrap_or(0)),
            Command::Activate | Command::Deactivate | Command::FadeStop | Command::Blink { .. } => {
                None
            }
        };

        let mut changes = Vec::new();
        if let Some(status) = status {
            changes.push(Change::Status(Some(status)));
        }
        if let Some(last) = command.last_change() {
            changes.push(Change::LastChange(last));
        }
        light.apply_changes(changes);
    }

    fn apply_link(&self, link: &Element, command: &Command) {
        let members = self.members.get(&link.index()).map(Vec::as_slice).unwrap_or(&[]);
        for member in members {
            let level = match *command {
                Command::Activate => member.level,
                Command::Deactivate => 0,
                Command::Goto { level, .. } | Command::FadeStart { level, .. } => level,
                _ => continue,
            };
            if let Some(light) = self.lights.get(&member.light) {
                light.apply_changes(vec![Change::Status(Some(settle(light, level)))]);
            }
        }

        if let Some(last) = command.last_change() {
            link.apply_changes(vec![Change::LastChange(last)]);
        }
    }
}

/// Level a device actually ends up at: relays are either off or full on.
fn settle(light: &Element, level: u8) -> u8 {
    let level = level.min(MAX_LEVEL);
    if light.dimmable() || level == 0 {
        level
    } else {
        MAX_LEVEL
    }
}

pub struct LoopbackPim {
    url: String,
    flags: Flags,
    panel: Arc<Panel>,
    requests: Mutex<Option<mpsc::UnboundedReceiver<PimRequest>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    connected: watch::Sender<bool>,
}

impl LoopbackPim {
    pub fn new(config: &PimConfig, inventory: &Inventory) -> Result<Self, DriverError> {
        if let Some(path) = &config.export_file {
            std::fs::metadata(path).map_err(|source| DriverError::ExportFile {
                path: path.clone(),
                source,
            })?;
        }

        let (tx, rx) = mpsc::unbounded_channel();

        let lights: BTreeMap<_, _> = inventory
            .lights
            .iter()
            .map(|spec| {
                let light = Element::light(spec.index, spec.name.clone(), spec.dimmable, tx.clone())
                    .with_status(spec.status.map(|s| s.min(MAX_LEVEL)));
                (spec.index, Arc::new(light))
            })
            .collect();

        let mut links = BTreeMap::new();
        let mut members = BTreeMap::new();
        for spec in &inventory.links {
            for member in &spec.members {
                if !lights.contains_key(&member.light) {
                    return Err(DriverError::UnknownElement {
                        kind: ElementKind::Light,
                        index: member.light,
                    });
                }
            }
            links.insert(
                spec.index,
                Arc::new(Element::link(spec.index, spec.name.clone(), tx.clone())),
            );
            members.insert(spec.index, spec.members.clone());
        }

        Ok(Self {
            url: config.url.clone(),
            flags: config.flags.clone(),
            panel: Arc::new(Panel {
                lights,
                links,
                members,
            }),
            requests: Mutex::new(Some(rx)),
            worker: Mutex::new(None),
            connected: watch::channel(false).0,
        })
    }

    #[cfg(test)]
    fn light(&self, index: ElementIndex) -> Option<Arc<Element>> {
        self.panel.lights.get(&index).cloned()
    }

    #[cfg(test)]
    fn link(&self, index: ElementIndex) -> Option<Arc<Element>> {
        self.panel.links.get(&index).cloned()
    }
}

impl Pim for LoopbackPim {
    fn connect(&self) -> Result<(), DriverError> {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if worker.is_some() {
            return Ok(());
        }

        let handle = tokio::runtime::Handle::try_current().map_err(|_| DriverError::NoRuntime)?;
        let mut rx = self
            .requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(DriverError::ChannelClosed)?;

        let panel = self.panel.clone();
        *worker = Some(handle.spawn(async move {
            while let Some(request) = rx.recv().await {
                panel.apply(request);
            }
        }));
        self.connected.send_replace(true);

        tracing::info!(
            url = %self.url,
            lights = self.panel.lights.len(),
            links = self.panel.links.len(),
            flags = ?self.flags,
            "Loopback PIM connected"
        );

        if !self.flags.is_set("no_sync") {
            for light in self.panel.lights.values().filter(|l| l.status().is_none()) {
                light.update_status()?;
            }
        }

        Ok(())
    }

    fn disconnect(&self) {
        if let Some(worker) = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take() {
            worker.abort();
        }
        if self.connected.send_replace(false) {
            tracing::info!(url = %self.url, "Loopback PIM disconnected");
        }
    }

    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    fn watch_connection(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    fn lights(&self) -> Vec<Arc<Element>> {
        self.panel.lights.values().cloned().collect()
    }

    fn links(&self) -> Vec<Arc<Element>> {
        self.panel.links.values().cloned().collect()
    }
}

impl Drop for LoopbackPim {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pim::ChangeCommand;
    use std::time::Duration;

    fn inventory() -> Inventory {
        serde_yaml::from_str(
            r#"
lights:
  - { index: 7, name: Kitchen, status: 0 }
  - { index: 9, name: Porch, dimmable: false }
links:
  - index: 1
    name: Evening
    members:
      - { light: 7, level: 40 }
      - { light: 9, level: 30 }
"#,
        )
        .unwrap()
    }

    fn make_pim(flags: &str) -> LoopbackPim {
        let config = PimConfig {
            url: "loopback://test".to_string(),
            export_file: None,
            flags: flags.parse().unwrap(),
        };
        LoopbackPim::new(&config, &inventory()).unwrap()
    }

    /// Wait until the worker has drained everything queued so far.
    async fn settle_worker(pim: &LoopbackPim, check: impl Fn(&LoopbackPim) -> bool) {
        for _ in 0..200 {
            if check(pim) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("loopback worker did not reach expected state");
    }

    #[test]
    fn test_inventory_defaults() {
        let inv = inventory();
        assert!(inv.lights[0].dimmable);
        assert_eq!(inv.lights[1].status, None);
        assert_eq!(inv.links[0].members.len(), 2);
    }

    #[test]
    fn test_connect_without_runtime_fails() {
        let pim = make_pim("");
        assert!(matches!(pim.connect(), Err(DriverError::NoRuntime)));
        assert!(!pim.is_connected());
    }

    #[test]
    fn test_unknown_member_rejected() {
        let mut inv = inventory();
        inv.links[0].members.push(LinkMember { light: 99, level: 10 });
        let config = PimConfig {
            url: "loopback://".to_string(),
            export_file: None,
            flags: Flags::default(),
        };
        assert!(matches!(
            LoopbackPim::new(&config, &inv),
            Err(DriverError::UnknownElement { index: 99, .. })
        ));
    }

    #[test]
    fn test_missing_export_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = PimConfig {
            url: "loopback://".to_string(),
            export_file: Some(dir.path().join("missing.upe")),
            flags: Flags::default(),
        };
        assert!(matches!(
            LoopbackPim::new(&config, &inventory()),
            Err(DriverError::ExportFile { .. })
        ));
    }

    #[tokio::test]
    async fn test_connect_syncs_unknown_status() {
        let pim = make_pim("");
        pim.connect().unwrap();
        assert!(pim.is_connected());
        settle_worker(&pim, |p| p.light(9).and_then(|l| l.status()) == Some(0)).await;
    }

    #[tokio::test]
    async fn test_no_sync_flag_skips_status_sync() {
        let pim = make_pim("no_sync");
        pim.connect().unwrap();
        // Push a marker command through and wait for it, so the queue is drained
        let kitchen = pim.light(7).unwrap();
        kitchen.turn_on(10, -1).unwrap();
        settle_worker(&pim, |p| p.light(7).and_then(|l| l.status()) == Some(10)).await;
        assert_eq!(pim.light(9).unwrap().status(), None);
    }

    #[tokio::test]
    async fn test_light_commands_change_status() {
        let pim = make_pim("");
        pim.connect().unwrap();
        let kitchen = pim.light(7).unwrap();

        kitchen.turn_on(75, -1).unwrap();
        settle_worker(&pim, |p| p.light(7).and_then(|l| l.status()) == Some(75)).await;

        kitchen.turn_off(-1).unwrap();
        settle_worker(&pim, |p| p.light(7).and_then(|l| l.status()) == Some(0)).await;

        // Relays go straight to full
        pim.light(9).unwrap().turn_on(20, -1).unwrap();
        settle_worker(&pim, |p| p.light(9).and_then(|l| l.status()) == Some(100)).await;
    }

    #[tokio::test]
    async fn test_link_activation_drives_members() {
        let pim = make_pim("");
        pim.connect().unwrap();
        let evening = pim.link(1).unwrap();

        evening.activate().unwrap();
        settle_worker(&pim, |p| {
            p.link(1).and_then(|l| l.last_change()).map(|lc| lc.command)
                == Some(ChangeCommand::Activate)
        })
        .await;
        assert_eq!(pim.light(7).unwrap().status(), Some(40));
        assert_eq!(pim.light(9).unwrap().status(), Some(100));

        evening.goto(60, 5).unwrap();
        settle_worker(&pim, |p| p.light(7).and_then(|l| l.status()) == Some(60)).await;
        let last = pim.link(1).unwrap().last_change().unwrap();
        assert_eq!(last.command, ChangeCommand::Goto);
        assert_eq!(last.level, Some(60));
        assert_eq!(last.rate, Some(5));

        evening.deactivate().unwrap();
        settle_worker(&pim, |p| p.light(9).and_then(|l| l.status()) == Some(0)).await;
        assert_eq!(pim.light(7).unwrap().status(), Some(0));
    }

    #[tokio::test]
    async fn test_disconnect_stops_worker() {
        let pim = make_pim("no_sync");
        pim.connect().unwrap();
        pim.disconnect();
        assert!(!pim.is_connected());
        // The receiver went away with the worker
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(
            pim.light(7).unwrap().activate(),
            Err(DriverError::ChannelClosed)
        ));
    }
}
