//! UPB lighting integration.
//!
//! `setup` opens one PIM driver, connects it and loads the `light` and
//! `scene` platforms on background tasks. Each platform declares its
//! services before any of its entities attach.

pub mod entity;
pub mod light;
pub mod scene;

use std::sync::{Arc, Mutex, Weak};

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::api::AppState;
use crate::config::{ConfigError, UpbConfig};
use crate::pim::{self, DriverError, Pim};

use light::UpbLightEntity;
use scene::UpbLinkEntity;

pub const DOMAIN: &str = "upb";

pub const PLATFORMS: [&str; 2] = ["light", "scene"];

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("invalid UPB configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("UPB driver failed: {0}")]
    Driver(#[from] DriverError),

    #[error("UPB setup requires a running tokio runtime")]
    NoRuntime,
}

pub struct UpbIntegration {
    app: Arc<AppState>,
    pim: Arc<dyn Pim>,
    lights: Mutex<Vec<UpbLightEntity>>,
    links: Mutex<Vec<UpbLinkEntity>>,
    platform_tasks: Mutex<Vec<JoinHandle<usize>>>,
    connection_watch: Mutex<Option<JoinHandle<()>>>,
}

impl UpbIntegration {
    pub fn setup(app: Arc<AppState>, config: &UpbConfig) -> Result<Arc<Self>, SetupError> {
        let pim = pim::open(&config.pim_config()?, &config.inventory())?;
        Self::start(app, pim)
    }

    /// Connect `pim` and schedule the platform loads. Does not wait for
    /// them; see [`join_platforms`](Self::join_platforms).
    pub fn start(app: Arc<AppState>, pim: Arc<dyn Pim>) -> Result<Arc<Self>, SetupError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| SetupError::NoRuntime)?;
        pim.connect()?;
        tracing::info!("UPB PIM connected");

        let integration = Arc::new(Self {
            app,
            pim,
            lights: Mutex::new(Vec::new()),
            links: Mutex::new(Vec::new()),
            platform_tasks: Mutex::new(Vec::new()),
            connection_watch: Mutex::new(None),
        });

        let tasks: Vec<JoinHandle<usize>> = PLATFORMS
            .iter()
            .map(|&platform| {
                let integration = integration.clone();
                handle.spawn(async move {
                    match platform {
                        "light" => light::setup_platform(&integration),
                        "scene" => scene::setup_platform(&integration),
                        other => {
                            tracing::warn!(platform = %other, "Unknown UPB platform");
                            0
                        }
                    }
                })
            })
            .collect();
        *integration
            .platform_tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = tasks;

        let watcher = handle.spawn(watch_connection(
            Arc::downgrade(&integration),
            integration.pim.watch_connection(),
        ));
        *integration
            .connection_watch
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(watcher);

        Ok(integration)
    }

    pub fn app(&self) -> &Arc<AppState> {
        &self.app
    }

    pub fn pim(&self) -> &Arc<dyn Pim> {
        &self.pim
    }

    pub(crate) fn add_light(&self, entity: UpbLightEntity) {
        self.lights
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entity);
    }

    pub(crate) fn add_link(&self, entity: UpbLinkEntity) {
        self.links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entity);
    }

    pub fn lights(&self) -> Vec<UpbLightEntity> {
        self.lights.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn links(&self) -> Vec<UpbLinkEntity> {
        self.links.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Republish every entity. Returns how many states changed.
    pub fn refresh_all(&self) -> usize {
        let lights = self.lights();
        let links = self.links();
        let mut changed = 0;
        for light in &lights {
            if light.refresh() {
                tracing::debug!(entity_id = %light.entity_id(), "UPB light republished");
                changed += 1;
            }
        }
        for link in &links {
            if link.refresh() {
                tracing::debug!(entity_id = %link.entity_id(), "UPB link republished");
                changed += 1;
            }
        }
        changed
    }

    /// Wait for pending platform loads. Returns how many entities they
    /// attached; loads already joined count as zero.
    pub async fn join_platforms(&self) -> usize {
        let tasks = std::mem::take(
            &mut *self
                .platform_tasks
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        );
        let mut attached = 0;
        for task in tasks {
            match task.await {
                Ok(count) => attached += count,
                Err(e) => tracing::warn!(error = %e, "UPB platform load failed"),
            }
        }
        attached
    }

    /// Detach every entity, withdraw the integration's services and
    /// disconnect the driver.
    pub async fn shutdown(&self) {
        self.join_platforms().await;

        let lights = std::mem::take(&mut *self.lights.lock().unwrap_or_else(|e| e.into_inner()));
        let links = std::mem::take(&mut *self.links.lock().unwrap_or_else(|e| e.into_inner()));
        let detached = lights.iter().filter(|e| e.detach()).count()
            + links.iter().filter(|e| e.detach()).count();

        let withdrawn = self.app.relay.withdraw(DOMAIN);
        if let Some(watcher) = self
            .connection_watch
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            watcher.abort();
        }
        self.pim.disconnect();
        tracing::info!(detached, withdrawn, "UPB integration shut down");
    }
}

/// Republish all entities whenever the driver connects or disconnects, so
/// availability shows without waiting for an element change.
async fn watch_connection(integration: Weak<UpbIntegration>, mut connection: watch::Receiver<bool>) {
    while connection.changed().await.is_ok() {
        let connected = *connection.borrow_and_update();
        let Some(integration) = integration.upgrade() else {
            break;
        };
        let changed = integration.refresh_all();
        if connected {
            tracing::info!(changed, "UPB PIM connection restored");
        } else {
            tracing::warn!(changed, "UPB PIM connection lost");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pim::testing::FakePim;
    use crate::pim::element::LastChange;
    use crate::pim::loopback::LinkMember;
    use crate::pim::{Change, ChangeCommand, Command, LightSpec, LinkSpec};
    use serde_json::{json, Map, Value};
    use std::time::Duration;

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    fn loopback_config() -> UpbConfig {
        UpbConfig {
            url: "loopback://test".to_string(),
            file_path: String::new(),
            flags: String::new(),
            lights: vec![
                LightSpec {
                    index: 7,
                    name: "Kitchen".to_string(),
                    dimmable: true,
                    status: Some(0),
                },
                LightSpec {
                    index: 8,
                    name: "Porch".to_string(),
                    dimmable: false,
                    status: Some(0),
                },
            ],
            links: vec![LinkSpec {
                index: 1,
                name: "Evening".to_string(),
                members: vec![LinkMember { light: 7, level: 40 }],
            }],
        }
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_setup_loads_both_platforms() {
        let app = Arc::new(AppState::new());
        let upb = UpbIntegration::setup(app.clone(), &loopback_config()).unwrap();
        assert_eq!(upb.join_platforms().await, 3);
        assert_eq!(upb.join_platforms().await, 0);

        assert_eq!(upb.lights().len(), 2);
        assert_eq!(upb.links().len(), 1);
        assert_eq!(app.state_machine.get("light.kitchen").unwrap().state, "off");
        assert_eq!(app.state_machine.get("scene.evening").unwrap().state, "unknown");
        assert!(app.services.has_handler("upb", "upb_link_goto"));
        assert!(app.services.has_handler("light", "turn_on"));
        upb.shutdown().await;
    }

    #[tokio::test]
    async fn test_bad_url_fails_setup() {
        let app = Arc::new(AppState::new());
        let mut config = loopback_config();
        config.url = "serial:///dev/ttyUSB0".to_string();
        let err = UpbIntegration::setup(app, &config).err().unwrap();
        assert!(matches!(err, SetupError::Driver(DriverError::UnsupportedTransport(_))));
    }

    #[test]
    fn test_setup_needs_runtime() {
        let app = Arc::new(AppState::new());
        let err = UpbIntegration::start(app, Arc::new(FakePim::new())).err().unwrap();
        assert!(matches!(err, SetupError::NoRuntime));
    }

    #[tokio::test]
    async fn test_service_call_reaches_loopback_panel() {
        let app = Arc::new(AppState::new());
        let upb = UpbIntegration::setup(app.clone(), &loopback_config()).unwrap();
        upb.join_platforms().await;

        app.services
            .call("light", "turn_on", obj(json!({"entity_id": "light.kitchen", "brightness": 102})))
            .unwrap();
        wait_for(|| app.state_machine.get("light.kitchen").is_some_and(|s| s.state == "on")).await;
        let state = app.state_machine.get("light.kitchen").unwrap();
        assert_eq!(state.attributes["brightness"], 102);
        assert_eq!(state.attributes["status"], 40);

        upb.shutdown().await;
    }

    #[tokio::test]
    async fn test_link_activation_fires_event_and_drives_members() {
        let app = Arc::new(AppState::new());
        let upb = UpbIntegration::setup(app.clone(), &loopback_config()).unwrap();
        upb.join_platforms().await;
        let mut rx = app.bus.subscribe();

        app.services
            .call("scene", "turn_on", obj(json!({"entity_id": "scene.evening"})))
            .unwrap();
        wait_for(|| {
            app.state_machine
                .get("light.kitchen")
                .is_some_and(|s| s.attributes["brightness"] == 102)
        })
        .await;

        let mut activated = 0;
        while let Ok(event) = rx.try_recv() {
            if event.event_type == "upb.scene_activated" {
                assert_eq!(event.data, json!({"entity_id": "scene.evening"}));
                activated += 1;
            }
        }
        assert_eq!(activated, 1);
        assert_ne!(app.state_machine.get("scene.evening").unwrap().state, "unknown");

        upb.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_releases_everything() {
        let app = Arc::new(AppState::new());
        let mut fake = FakePim::new();
        let light = fake.add_light(7, "Kitchen", true);
        let link = fake.add_link(1, "Evening");
        let fake = Arc::new(fake);
        let upb = UpbIntegration::start(app.clone(), fake.clone()).unwrap();
        upb.join_platforms().await;
        assert_eq!(light.callback_count(), 1);

        upb.shutdown().await;
        assert!(!fake.is_connected());
        assert_eq!(light.callback_count(), 0);
        assert_eq!(link.callback_count(), 0);
        assert!(app.state_machine.get_all().is_empty());
        assert!(app.services.list_services().is_empty());
        assert!(upb.lights().is_empty());
        assert!(upb.links().is_empty());

        // Elements still report, nobody listens.
        link.apply_changes(vec![Change::LastChange(LastChange {
            command: ChangeCommand::Activate,
            level: None,
            rate: None,
        })]);
        assert!(app.state_machine.get_all().is_empty());
    }

    #[tokio::test]
    async fn test_connection_loss_marks_entities_unavailable() {
        let app = Arc::new(AppState::new());
        let mut fake = FakePim::new();
        fake.add_light(7, "Kitchen", true);
        fake.add_link(1, "Evening");
        let fake = Arc::new(fake);
        let upb = UpbIntegration::start(app.clone(), fake.clone()).unwrap();
        upb.join_platforms().await;
        assert_eq!(app.state_machine.get("light.kitchen").unwrap().state, "off");

        fake.set_connected(false);
        wait_for(|| {
            ["light.kitchen", "scene.evening"].iter().all(|id| {
                app.state_machine
                    .get(id)
                    .is_some_and(|s| s.state == entity::STATE_UNAVAILABLE)
            })
        })
        .await;

        fake.set_connected(true);
        wait_for(|| app.state_machine.get("light.kitchen").is_some_and(|s| s.state == "off")).await;
        assert_eq!(app.state_machine.get("scene.evening").unwrap().state, "unknown");
        upb.shutdown().await;
    }

    #[tokio::test]
    async fn test_commands_after_setup_queue_to_driver() {
        let app = Arc::new(AppState::new());
        let mut fake = FakePim::new();
        fake.add_light(7, "Kitchen", true);
        let fake = Arc::new(fake);
        let upb = UpbIntegration::start(app.clone(), fake.clone()).unwrap();
        upb.join_platforms().await;

        app.services
            .call("light", "turn_on", obj(json!({"entity_id": "light.kitchen"})))
            .unwrap();
        let cmds: Vec<Command> = fake.take_requests().into_iter().map(|r| r.command).collect();
        assert_eq!(cmds, vec![Command::TurnOn { level: 100, rate: -1 }]);
        upb.shutdown().await;
    }
}
