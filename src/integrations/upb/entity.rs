//! Shared entity plumbing for UPB elements.
//!
//! [`UpbEntity`] owns everything common to lights and links: identity,
//! availability, the element callback and the relay bindings. What differs
//! per element kind lives in a [`UpbAdapter`].

use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};

use super::DOMAIN;
use crate::api::AppState;
use crate::dispatcher::SignalPayload;
use crate::pim::element::CallbackId;
use crate::pim::{Changeset, Element, Pim};
use crate::relay::{ServiceTarget, SignalBinding};
use crate::services::ServiceError;

pub const STATE_UNAVAILABLE: &str = "unavailable";

/// The non-generic half of an entity, handed to adapters.
pub struct EntityCore {
    element: Arc<Element>,
    pim: Arc<dyn Pim>,
    app: Arc<AppState>,
    entity_id: String,
    unique_id: String,
}

impl EntityCore {
    pub fn element(&self) -> &Arc<Element> {
        &self.element
    }

    pub fn app(&self) -> &Arc<AppState> {
        &self.app
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn available(&self) -> bool {
        self.pim.is_connected()
    }
}

/// Per-kind behavior plugged into [`UpbEntity`].
pub trait UpbAdapter: Send + Sync + Sized + 'static {
    /// Entity domain the adapter publishes under (`light`, `scene`).
    const DOMAIN: &'static str;
    /// Used for unique ids and as the service declaration key.
    const CLASS_NAME: &'static str;

    fn new(element: &Element) -> Self;

    /// Called for every element change, and once with an empty changeset
    /// when the entity attaches. Runs before the state is refreshed.
    fn element_changed(&self, _core: &EntityCore, _changeset: &Changeset) {}

    fn state(&self, core: &EntityCore) -> String;

    /// Extra attributes merged over the element's own field dump.
    fn initial_attrs(&self, _core: &EntityCore) -> Map<String, Value> {
        Map::new()
    }

    /// Entity-model attributes such as `brightness` or `supported_features`.
    fn entity_attrs(&self, _core: &EntityCore) -> Map<String, Value> {
        Map::new()
    }

    fn call_service(
        &self,
        core: &EntityCore,
        service: &str,
        data: &SignalPayload,
    ) -> Result<(), ServiceError>;
}

struct Attachment {
    callback_id: CallbackId,
    bindings: Vec<SignalBinding>,
}

pub struct UpbEntity<A: UpbAdapter> {
    core: EntityCore,
    adapter: A,
    attachment: Mutex<Option<Attachment>>,
    /// Held from reading the element through publishing its state.
    refresh_lock: Mutex<()>,
}

impl<A: UpbAdapter> UpbEntity<A> {
    pub fn new(element: Arc<Element>, pim: Arc<dyn Pim>, app: Arc<AppState>) -> Arc<Self> {
        let unique_id = unique_id_for::<A>(&element);
        let entity_id = app
            .entities
            .get_or_create(A::DOMAIN, DOMAIN, &unique_id, element.name())
            .entity_id
            .clone();
        tracing::debug!(name = %element.name(), unique_id = %unique_id, entity_id = %entity_id, "UPB entity created");

        Arc::new(Self {
            adapter: A::new(&element),
            core: EntityCore {
                element,
                pim,
                app,
                entity_id,
                unique_id,
            },
            attachment: Mutex::new(None),
            refresh_lock: Mutex::new(()),
        })
    }

    /// Read through from the element on every call.
    pub fn name(&self) -> &str {
        self.core.element.name()
    }

    pub fn entity_id(&self) -> &str {
        &self.core.entity_id
    }

    pub fn state(&self) -> String {
        if self.core.available() {
            self.adapter.state(&self.core)
        } else {
            STATE_UNAVAILABLE.to_string()
        }
    }

    pub fn attributes(&self) -> Map<String, Value> {
        let mut attrs = self.core.element.as_dict();
        attrs.extend(self.adapter.initial_attrs(&self.core));
        attrs.insert("friendly_name".to_string(), Value::from(self.name()));
        attrs.extend(self.adapter.entity_attrs(&self.core));
        attrs
    }

    /// Publish the current state. Returns false when nothing changed.
    pub fn refresh(&self) -> bool {
        let _guard = self.refresh_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.publish()
    }

    fn publish(&self) -> bool {
        self.core
            .app
            .state_machine
            .set_if_changed(&self.core.entity_id, self.state(), self.attributes())
            .is_some()
    }

    fn on_element_changed(&self, changeset: &Changeset) {
        let _guard = self.refresh_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.adapter.element_changed(&self.core, changeset);
        self.publish();
    }

    /// Subscribe to the element, publish an initial state and bind the
    /// services declared for this class. Returns false if already attached.
    pub fn attach(self: &Arc<Self>) -> bool {
        let mut attachment = self.attachment.lock().unwrap_or_else(|e| e.into_inner());
        if attachment.is_some() {
            return false;
        }

        let weak = Arc::downgrade(self);
        let callback_id = self.core.element.add_callback(Arc::new(
            move |_element: &Element, changeset: &Changeset| {
                if let Some(entity) = weak.upgrade() {
                    entity.on_element_changed(changeset);
                }
            },
        ));
        self.on_element_changed(&Changeset::default());

        let target: Arc<dyn ServiceTarget> = self.clone();
        let bindings =
            self.core
                .app
                .relay
                .bind(DOMAIN, A::CLASS_NAME, &self.core.entity_id, &target);
        tracing::debug!(
            entity_id = %self.core.entity_id,
            unique_id = %self.core.unique_id,
            services = bindings.len(),
            "UPB entity attached"
        );

        *attachment = Some(Attachment {
            callback_id,
            bindings,
        });
        true
    }

    /// Undo [`attach`](Self::attach) and drop the published state.
    pub fn detach(&self) -> bool {
        let Some(attachment) = self
            .attachment
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            return false;
        };
        self.core.element.remove_callback(attachment.callback_id);
        self.core.app.relay.unbind(attachment.bindings);
        self.core.app.state_machine.remove(&self.core.entity_id);
        tracing::debug!(entity_id = %self.core.entity_id, "UPB entity detached");
        true
    }
}

#[cfg(test)]
impl<A: UpbAdapter> UpbEntity<A> {
    pub fn unique_id(&self) -> &str {
        &self.core.unique_id
    }

    pub fn available(&self) -> bool {
        self.core.available()
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn element(&self) -> &Arc<Element> {
        &self.core.element
    }

    pub fn is_attached(&self) -> bool {
        self.attachment
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

impl<A: UpbAdapter> ServiceTarget for UpbEntity<A> {
    fn call_service(&self, service: &str, data: &SignalPayload) -> Result<(), ServiceError> {
        tracing::debug!(entity_id = %self.core.entity_id, service = %service, "UPB service call");
        self.adapter.call_service(&self.core, service, data)
    }
}

pub fn unique_id_for<A: UpbAdapter>(element: &Element) -> String {
    format!("{}_{}", A::CLASS_NAME.to_lowercase(), element.index())
}

/// Integer payload field. Schemas guarantee presence and range for the
/// fields adapters read, so a missing field here is a wiring error.
pub(crate) fn int_field(data: &SignalPayload, key: &str) -> Result<i64, ServiceError> {
    data.get(key)
        .and_then(Value::as_i64)
        .ok_or_else(|| ServiceError::CallFailed(format!("missing integer field {key:?}")))
}

pub(crate) fn unsupported(entity_id: &str, service: &str) -> ServiceError {
    ServiceError::CallFailed(format!("{entity_id} does not support {service}"))
}
