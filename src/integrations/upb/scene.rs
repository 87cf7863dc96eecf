//! UPB links as `scene` entities.
//!
//! Links have no level of their own. Their entities relay commands to the
//! driver and turn the link's `last_change` into `upb.scene_*` bus events.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use super::entity::{int_field, unsupported, EntityCore, UpbAdapter, UpbEntity};
use super::{UpbIntegration, DOMAIN};
use crate::dispatcher::SignalPayload;
use crate::pim::{ChangeCommand, Changeset, Element, RATE_INSTANT};
use crate::relay::EntityServiceRelay;
use crate::schema::{Field, ServiceSchema};
use crate::services::ServiceError;

pub const STATE_UNKNOWN: &str = "unknown";

const DEFAULT_BLINK_RATE: u8 = 20;

/// Event suffix for each link command, as in `upb.scene_<suffix>`.
fn event_suffix(command: ChangeCommand) -> Option<&'static str> {
    match command {
        ChangeCommand::Goto => Some("goto"),
        ChangeCommand::Activate => Some("activated"),
        ChangeCommand::Deactivate => Some("deactivated"),
        ChangeCommand::Blink => Some("blink"),
        ChangeCommand::FadeStart => Some("fade_started"),
        ChangeCommand::FadeStop => Some("fade_stopped"),
        ChangeCommand::TurnOn | ChangeCommand::TurnOff => None,
    }
}

pub struct UpbLink {
    last_activated: Mutex<Option<DateTime<Utc>>>,
}

impl UpbLink {
    pub fn last_activated(&self) -> Option<DateTime<Utc>> {
        *self.last_activated.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl UpbAdapter for UpbLink {
    const DOMAIN: &'static str = "scene";
    const CLASS_NAME: &'static str = "UpbLink";

    fn new(_element: &Element) -> Self {
        UpbLink {
            last_activated: Mutex::new(None),
        }
    }

    fn element_changed(&self, core: &EntityCore, changeset: &Changeset) {
        let Some(last) = changeset.last_change() else {
            return;
        };
        let Some(suffix) = event_suffix(last.command) else {
            tracing::debug!(entity_id = %core.entity_id(), command = ?last.command, "No scene event for command");
            return;
        };

        let mut data = Map::new();
        data.insert("entity_id".to_string(), Value::from(core.entity_id()));
        if matches!(last.command, ChangeCommand::Goto | ChangeCommand::FadeStart) {
            data.insert(
                "brightness_pct".to_string(),
                last.level.map(Value::from).unwrap_or(Value::Null),
            );
        }
        // A zero rate is left out, like a missing one.
        if let Some(rate) = last.rate.filter(|r| *r != 0) {
            data.insert("rate".to_string(), Value::from(rate));
        }

        if last.command == ChangeCommand::Activate {
            *self.last_activated.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
        }

        let event_type = format!("{}.scene_{}", DOMAIN, suffix);
        tracing::debug!(entity_id = %core.entity_id(), event_type = %event_type, "Firing scene event");
        core.app().bus.fire(event_type, Value::Object(data));
    }

    fn state(&self, _core: &EntityCore) -> String {
        match self.last_activated() {
            Some(at) => at.to_rfc3339_opts(SecondsFormat::Micros, true),
            None => STATE_UNKNOWN.to_string(),
        }
    }

    fn initial_attrs(&self, core: &EntityCore) -> Map<String, Value> {
        let mut attrs = Map::new();
        if let Some(last) = core.element().last_change() {
            attrs.insert(
                "last_change".to_string(),
                serde_json::to_value(last).unwrap_or(Value::Null),
            );
        }
        attrs
    }

    fn call_service(
        &self,
        core: &EntityCore,
        service: &str,
        data: &SignalPayload,
    ) -> Result<(), ServiceError> {
        let element = core.element();
        let level = |key: &str| Ok::<u8, ServiceError>(int_field(data, key)?.clamp(0, 100) as u8);
        let rate = || Ok::<i16, ServiceError>(int_field(data, "rate")?.clamp(-1, 255) as i16);
        match service {
            "turn_on" | "upb_link_activate" => Ok(element.activate()?),
            "upb_link_deactivate" => Ok(element.deactivate()?),
            "upb_link_goto" => Ok(element.goto(level("brightness_pct")?, rate()?)?),
            "upb_link_fade_start" => Ok(element.fade_start(level("brightness_pct")?, rate()?)?),
            "upb_link_fade_stop" => Ok(element.fade_stop()?),
            "upb_link_blink" => Ok(element.blink(rate()?.max(0) as u8)?),
            other => Err(unsupported(core.entity_id(), other)),
        }
    }
}

fn level_schema() -> ServiceSchema {
    ServiceSchema::entity_service(vec![
        Field::int("brightness_pct", 0, 100).required(),
        Field::int("rate", -1, 255).default(RATE_INSTANT),
    ])
}

/// `(domain, service, schema)` for everything a link entity answers to.
pub fn services() -> Vec<(&'static str, &'static str, ServiceSchema)> {
    vec![
        ("scene", "turn_on", ServiceSchema::entity_service(vec![])),
        (DOMAIN, "upb_link_activate", ServiceSchema::entity_service(vec![])),
        (DOMAIN, "upb_link_deactivate", ServiceSchema::entity_service(vec![])),
        (DOMAIN, "upb_link_goto", level_schema()),
        (DOMAIN, "upb_link_fade_start", level_schema()),
        (DOMAIN, "upb_link_fade_stop", ServiceSchema::entity_service(vec![])),
        (
            DOMAIN,
            "upb_link_blink",
            ServiceSchema::entity_service(vec![Field::int("rate", 0, 255).default(DEFAULT_BLINK_RATE)]),
        ),
    ]
}

pub fn declare_services(relay: &EntityServiceRelay) -> usize {
    services()
        .into_iter()
        .filter(|(domain, service, schema)| {
            relay.declare(DOMAIN, UpbLink::CLASS_NAME, domain, service, schema.clone())
        })
        .count()
}

/// Platform load: declare services, then build and attach one entity per
/// link. Returns the number of entities attached.
pub fn setup_platform(integration: &UpbIntegration) -> usize {
    let app = integration.app();
    declare_services(&app.relay);

    let pim = integration.pim();
    let mut attached = 0;
    for element in pim.links() {
        let entity = UpbEntity::<UpbLink>::new(element, pim.clone(), app.clone());
        if entity.attach() {
            attached += 1;
        }
        integration.add_link(entity);
    }
    tracing::info!(count = attached, "UPB scene platform loaded");
    attached
}

pub type UpbLinkEntity = Arc<UpbEntity<UpbLink>>;
