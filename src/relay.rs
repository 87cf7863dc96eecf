//! Entity service relay.
//!
//! Integrations declare services per `(integration, class)` and entities
//! bind to them when they attach. A call to `domain.service` fans out as
//! one dispatcher signal per targeted entity id:
//!
//! ```text
//! registry handler  ->  SIGNAL_<domain.service>_<entity_id>  ->  entity.call_service
//! ```
//!
//! Ids with no bound entity get no delivery; the call itself still succeeds.

use std::sync::{Arc, Weak};

use dashmap::DashMap;

use crate::dispatcher::{Dispatcher, SignalId, SignalPayload};
use crate::schema::{ServiceSchema, ATTR_ENTITY_ID};
use crate::services::{ServiceCall, ServiceError, ServiceRegistry};

/// Something that can receive relayed service calls, usually an entity.
pub trait ServiceTarget: Send + Sync {
    /// `service` is the bare service name (`turn_on`, `upb_link_goto`).
    fn call_service(&self, service: &str, data: &SignalPayload) -> Result<(), ServiceError>;
}

pub fn signal_name(qualified_service: &str, entity_id: &str) -> String {
    format!("SIGNAL_{}_{}", qualified_service, entity_id)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Declared {
    domain: String,
    service: String,
}

impl Declared {
    fn qualified(&self) -> String {
        format!("{}.{}", self.domain, self.service)
    }
}

/// One live signal connection made by [`EntityServiceRelay::bind`].
#[derive(Debug)]
pub struct SignalBinding {
    pub signal: String,
    pub service: String,
    id: SignalId,
}

pub struct EntityServiceRelay {
    dispatcher: Arc<Dispatcher>,
    services: Arc<ServiceRegistry>,
    /// (integration, class) -> declared services, in declaration order
    declared: DashMap<(String, String), Vec<Declared>>,
    /// qualified service -> number of (integration, class) keys declaring it
    handler_refs: DashMap<String, usize>,
}

impl EntityServiceRelay {
    pub fn new(dispatcher: Arc<Dispatcher>, services: Arc<ServiceRegistry>) -> Self {
        Self {
            dispatcher,
            services,
            declared: DashMap::new(),
            handler_refs: DashMap::new(),
        }
    }

    /// Declare `domain.service` for entities of `class`.
    ///
    /// Returns `false` (and changes nothing) when the key already declares
    /// this service. The registry handler is installed on the first
    /// declaration of a qualified name by any key.
    pub fn declare(
        &self,
        integration: &str,
        class: &str,
        domain: &str,
        service: &str,
        schema: ServiceSchema,
    ) -> bool {
        let decl = Declared {
            domain: domain.to_string(),
            service: service.to_string(),
        };
        let qualified = decl.qualified();
        {
            let mut entry = self
                .declared
                .entry((integration.to_string(), class.to_string()))
                .or_default();
            if entry.contains(&decl) {
                tracing::warn!(
                    integration = %integration,
                    class = %class,
                    service = %qualified,
                    "Service already declared, ignoring"
                );
                return false;
            }
            entry.push(decl);
        }

        let first = {
            let mut refs = self.handler_refs.entry(qualified.clone()).or_insert(0);
            *refs += 1;
            *refs == 1
        };
        if first {
            self.services
                .register(domain, service, schema, self.fan_out(qualified.clone()));
        }
        tracing::debug!(integration = %integration, class = %class, service = %qualified, "Service declared");
        true
    }

    /// The registry handler for one qualified service.
    fn fan_out(
        &self,
        qualified: String,
    ) -> impl Fn(&ServiceCall) -> Result<(), ServiceError> + Send + Sync + 'static {
        let dispatcher = self.dispatcher.clone();
        move |call: &ServiceCall| {
            let mut payload = call.data.clone();
            payload.remove(ATTR_ENTITY_ID);

            let mut first_error = None;
            for entity_id in call.entity_ids() {
                let signal = signal_name(&qualified, &entity_id);
                match dispatcher.send(&signal, &payload) {
                    Ok(0) => {
                        tracing::debug!(service = %qualified, entity_id = %entity_id, "No entity bound, dropping")
                    }
                    Ok(_) => {}
                    Err(e) => {
                        first_error.get_or_insert(e);
                    }
                }
            }
            match first_error {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    /// Services declared under `(integration, class)` as `domain.service`.
    #[cfg(test)]
    pub fn declared_services(&self, integration: &str, class: &str) -> Vec<String> {
        self.declared
            .get(&(integration.to_string(), class.to_string()))
            .map(|decls| decls.iter().map(Declared::qualified).collect())
            .unwrap_or_default()
    }

    /// Connect `target` to every service declared for its class.
    ///
    /// The relay only keeps a weak reference; once the target is dropped
    /// its signals become no-ops until they are unbound.
    pub fn bind(
        &self,
        integration: &str,
        class: &str,
        entity_id: &str,
        target: &Arc<dyn ServiceTarget>,
    ) -> Vec<SignalBinding> {
        let decls = self
            .declared
            .get(&(integration.to_string(), class.to_string()))
            .map(|d| d.value().clone())
            .unwrap_or_default();

        decls
            .into_iter()
            .map(|decl| {
                let signal = signal_name(&decl.qualified(), entity_id);
                let weak: Weak<dyn ServiceTarget> = Arc::downgrade(target);
                let service = decl.service.clone();
                let id = self.dispatcher.connect(
                    &signal,
                    Arc::new(move |payload: &SignalPayload| match weak.upgrade() {
                        Some(target) => target.call_service(&service, payload),
                        None => Ok(()),
                    }),
                );
                tracing::trace!(signal = %signal, "Entity service bound");
                SignalBinding {
                    signal,
                    service: decl.service,
                    id,
                }
            })
            .collect()
    }

    pub fn unbind(&self, bindings: Vec<SignalBinding>) -> usize {
        bindings
            .into_iter()
            .filter(|b| self.dispatcher.disconnect(&b.signal, b.id))
            .count()
    }

    /// Drop every declaration made by `integration`, unregistering services
    /// no other declaration still needs.
    pub fn withdraw(&self, integration: &str) -> usize {
        let keys: Vec<(String, String)> = self
            .declared
            .iter()
            .filter(|e| e.key().0 == integration)
            .map(|e| e.key().clone())
            .collect();

        let mut unregistered = 0;
        for key in keys {
            let Some((_, decls)) = self.declared.remove(&key) else {
                continue;
            };
            for decl in decls {
                let qualified = decl.qualified();
                let last = match self.handler_refs.get_mut(&qualified) {
                    Some(mut refs) => {
                        *refs = refs.saturating_sub(1);
                        *refs == 0
                    }
                    None => false,
                };
                if last {
                    self.handler_refs.remove(&qualified);
                    if self.services.unregister(&decl.domain, &decl.service) {
                        unregistered += 1;
                    }
                }
            }
        }
        tracing::debug!(integration = %integration, unregistered, "Services withdrawn");
        unregistered
    }
}
