//! UPB devices as `light` entities.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde_json::{Map, Value};

use super::entity::{int_field, unsupported, EntityCore, UpbAdapter, UpbEntity};
use super::{UpbIntegration, DOMAIN};
use crate::dispatcher::SignalPayload;
use crate::pim::{Changeset, Element, RATE_INSTANT};
use crate::relay::EntityServiceRelay;
use crate::schema::{Field, ServiceSchema};
use crate::services::ServiceError;

pub const SUPPORT_BRIGHTNESS: u32 = 1;
pub const SUPPORT_FLASH: u32 = 8;
pub const SUPPORT_TRANSITION: u32 = 32;

pub const ATTR_BRIGHTNESS: &str = "brightness";
pub const ATTR_BRIGHTNESS_PCT: &str = "brightness_pct";
pub const ATTR_TRANSITION: &str = "transition";
pub const ATTR_FLASH: &str = "flash";
pub const ATTR_RATE: &str = "rate";

pub const FLASH_SHORT: &str = "short";
pub const FLASH_LONG: &str = "long";
const BLINK_RATE_SHORT: u8 = 50;
const BLINK_RATE_LONG: u8 = 100;
const DEFAULT_BLINK_RATE: u8 = 20;

/// Native 0-100 level to the 0-255 brightness scale.
pub fn to_brightness(status: Option<u8>) -> u8 {
    match status {
        Some(level) => (f64::from(level) * 2.55).round().min(255.0) as u8,
        None => 0,
    }
}

/// 0-255 brightness to the native 0-100 level.
pub fn to_level(brightness: i64) -> u8 {
    (brightness.clamp(0, 255) as f64 / 2.55).round() as u8
}

/// Rate fields are range-checked by their schemas; clamp anyway so a
/// widened schema can't wrap.
fn rate_field(data: &SignalPayload, key: &str) -> Result<i16, ServiceError> {
    Ok(int_field(data, key)?.clamp(i64::from(RATE_INSTANT), 255) as i16)
}

fn level_field(data: &SignalPayload, key: &str) -> Result<u8, ServiceError> {
    Ok(int_field(data, key)?.clamp(0, 100) as u8)
}

pub struct UpbLight {
    brightness: AtomicU8,
}

impl UpbLight {
    pub fn brightness(&self) -> u8 {
        self.brightness.load(Ordering::Relaxed)
    }

    pub fn is_on(&self) -> bool {
        self.brightness() != 0
    }

    fn supported_features(element: &Element) -> u32 {
        if element.dimmable() {
            SUPPORT_BRIGHTNESS | SUPPORT_TRANSITION | SUPPORT_FLASH
        } else {
            SUPPORT_FLASH
        }
    }

    fn turn_on(&self, element: &Element, data: &SignalPayload) -> Result<(), ServiceError> {
        if let Some(flash) = data.get(ATTR_FLASH).and_then(Value::as_str) {
            let rate = if flash == FLASH_SHORT {
                BLINK_RATE_SHORT
            } else {
                BLINK_RATE_LONG
            };
            return Ok(element.blink(rate)?);
        }

        let rate = match data.get(ATTR_TRANSITION).and_then(Value::as_f64) {
            Some(t) => t.round().clamp(0.0, 255.0) as i16,
            None => RATE_INSTANT,
        };
        let level = if data.contains_key(ATTR_BRIGHTNESS_PCT) {
            level_field(data, ATTR_BRIGHTNESS_PCT)?
        } else if data.contains_key(ATTR_BRIGHTNESS) {
            to_level(int_field(data, ATTR_BRIGHTNESS)?)
        } else {
            to_level(255)
        };
        Ok(element.turn_on(level, rate)?)
    }

    fn turn_off(&self, element: &Element, data: &SignalPayload) -> Result<(), ServiceError> {
        let rate = match data.get(ATTR_TRANSITION).and_then(Value::as_f64) {
            Some(t) => t.round().clamp(0.0, 255.0) as i16,
            None => RATE_INSTANT,
        };
        Ok(element.turn_off(rate)?)
    }
}

impl UpbAdapter for UpbLight {
    const DOMAIN: &'static str = "light";
    const CLASS_NAME: &'static str = "UpbLight";

    fn new(element: &Element) -> Self {
        UpbLight {
            brightness: AtomicU8::new(to_brightness(element.status())),
        }
    }

    fn element_changed(&self, core: &EntityCore, changeset: &Changeset) {
        // An empty changeset is the priming call on attach.
        if changeset.is_empty() || changeset.status().is_some() {
            self.brightness
                .store(to_brightness(core.element().status()), Ordering::Relaxed);
        }
    }

    fn state(&self, _core: &EntityCore) -> String {
        let state = if self.is_on() { "on" } else { "off" };
        state.to_string()
    }

    fn entity_attrs(&self, core: &EntityCore) -> Map<String, Value> {
        let mut attrs = Map::new();
        attrs.insert(ATTR_BRIGHTNESS.to_string(), Value::from(self.brightness()));
        attrs.insert(
            "supported_features".to_string(),
            Value::from(Self::supported_features(core.element())),
        );
        attrs
    }

    fn call_service(
        &self,
        core: &EntityCore,
        service: &str,
        data: &SignalPayload,
    ) -> Result<(), ServiceError> {
        let element = core.element();
        match service {
            "turn_on" => self.turn_on(element, data),
            "turn_off" => self.turn_off(element, data),
            "toggle" => {
                if self.is_on() {
                    self.turn_off(element, data)
                } else {
                    self.turn_on(element, data)
                }
            }
            "upb_light_fade_start" => Ok(element.fade_start(
                level_field(data, ATTR_BRIGHTNESS_PCT)?,
                rate_field(data, ATTR_RATE)?,
            )?),
            "upb_light_fade_stop" => Ok(element.fade_stop()?),
            "upb_light_blink" => Ok(element.blink(rate_field(data, ATTR_RATE)?.max(0) as u8)?),
            "upb_light_update_status" => Ok(element.update_status()?),
            other => Err(unsupported(core.entity_id(), other)),
        }
    }
}

fn turn_on_schema() -> ServiceSchema {
    ServiceSchema::entity_service(vec![
        Field::int(ATTR_BRIGHTNESS, 0, 255),
        Field::int(ATTR_BRIGHTNESS_PCT, 0, 100),
        Field::float(ATTR_TRANSITION, 0.0, 255.0),
        Field::one_of(ATTR_FLASH, &[FLASH_SHORT, FLASH_LONG]),
    ])
}

/// `(domain, service, schema)` for everything a light entity answers to.
pub fn services() -> Vec<(&'static str, &'static str, ServiceSchema)> {
    let transition_only = || ServiceSchema::entity_service(vec![Field::float(ATTR_TRANSITION, 0.0, 255.0)]);
    vec![
        ("light", "turn_on", turn_on_schema()),
        ("light", "turn_off", transition_only()),
        ("light", "toggle", turn_on_schema()),
        (
            DOMAIN,
            "upb_light_fade_start",
            ServiceSchema::entity_service(vec![
                Field::int(ATTR_BRIGHTNESS_PCT, 0, 100).required(),
                Field::int(ATTR_RATE, -1, 255).default(RATE_INSTANT),
            ]),
        ),
        (DOMAIN, "upb_light_fade_stop", ServiceSchema::entity_service(vec![])),
        (
            DOMAIN,
            "upb_light_blink",
            ServiceSchema::entity_service(vec![
                Field::int(ATTR_RATE, 0, 255).default(DEFAULT_BLINK_RATE),
            ]),
        ),
        (DOMAIN, "upb_light_update_status", ServiceSchema::entity_service(vec![])),
    ]
}

pub fn declare_services(relay: &EntityServiceRelay) -> usize {
    services()
        .into_iter()
        .filter(|(domain, service, schema)| {
            relay.declare(DOMAIN, UpbLight::CLASS_NAME, domain, service, schema.clone())
        })
        .count()
}

/// Platform load: declare services, then build and attach one entity per
/// device. Returns the number of entities attached.
pub fn setup_platform(integration: &UpbIntegration) -> usize {
    let app = integration.app();
    declare_services(&app.relay);

    let pim = integration.pim();
    let mut attached = 0;
    for element in pim.lights() {
        let entity = UpbEntity::<UpbLight>::new(element, pim.clone(), app.clone());
        if entity.attach() {
            attached += 1;
        }
        integration.add_light(entity);
    }
    tracing::info!(count = attached, "UPB light platform loaded");
    attached
}

pub type UpbLightEntity = Arc<UpbEntity<UpbLight>>;
