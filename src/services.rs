//! Dynamic service registry.
//!
//! Services are keyed by `(domain, service)`. Each one carries the schema
//! its data is validated against before the handler ever sees it, so
//! handlers work on canonical data only.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::pim::DriverError;
use crate::schema::{SchemaError, ServiceSchema, ATTR_ENTITY_ID};
use crate::state::Context;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service not found: {domain}.{service}")]
    NotFound { domain: String, service: String },

    #[error("invalid service data: {0}")]
    InvalidData(#[from] SchemaError),

    #[error("driver rejected command: {0}")]
    Driver(#[from] DriverError),

    #[error("service call failed: {0}")]
    CallFailed(String),
}

/// The data passed to a service handler when a service is called.
#[derive(Debug, Clone)]
pub struct ServiceCall {
    pub domain: String,
    pub service: String,
    /// Validated data, defaults applied.
    pub data: Map<String, Value>,
    pub context: Context,
}

impl ServiceCall {
    /// Entity ids the call targets; empty when the call names none.
    pub fn entity_ids(&self) -> Vec<String> {
        match self.data.get(ATTR_ENTITY_ID) {
            Some(Value::Array(ids)) => ids
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            Some(Value::String(id)) => vec![id.clone()],
            _ => Vec::new(),
        }
    }
}

pub type ServiceHandlerFn = Arc<dyn Fn(&ServiceCall) -> Result<(), ServiceError> + Send + Sync>;

struct RegisteredService {
    schema: ServiceSchema,
    handler: ServiceHandlerFn,
}

#[derive(Default)]
pub struct ServiceRegistry {
    handlers: DashMap<(String, String), RegisteredService>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `domain.service`.
    pub fn register<F>(&self, domain: &str, service: &str, schema: ServiceSchema, handler: F)
    where
        F: Fn(&ServiceCall) -> Result<(), ServiceError> + Send + Sync + 'static,
    {
        tracing::debug!(domain = %domain, service = %service, "Registering service");
        let replaced = self
            .handlers
            .insert(
                (domain.to_string(), service.to_string()),
                RegisteredService {
                    schema,
                    handler: Arc::new(handler),
                },
            )
            .is_some();
        if replaced {
            tracing::warn!(domain = %domain, service = %service, "Service handler replaced");
        }
    }

    pub fn unregister(&self, domain: &str, service: &str) -> bool {
        self.handlers
            .remove(&(domain.to_string(), service.to_string()))
            .is_some()
    }

    /// Check if a handler exists for a (domain, service) pair.
    #[cfg(test)]
    pub fn has_handler(&self, domain: &str, service: &str) -> bool {
        self.handlers
            .contains_key(&(domain.to_string(), service.to_string()))
    }

    /// Validate `data` against the service's schema and run its handler.
    pub fn call(&self, domain: &str, service: &str, data: Map<String, Value>) -> Result<(), ServiceError> {
        let (schema, handler) = match self.handlers.get(&(domain.to_string(), service.to_string())) {
            Some(entry) => (entry.schema.clone(), entry.handler.clone()),
            None => {
                return Err(ServiceError::NotFound {
                    domain: domain.to_string(),
                    service: service.to_string(),
                })
            }
        };

        let data = schema.validate(&data)?;
        let call = ServiceCall {
            domain: domain.to_string(),
            service: service.to_string(),
            data,
            context: Context::new(),
        };
        let logged = Value::Object(call.data.clone());
        tracing::debug!(
            domain = %call.domain,
            service = %call.service,
            context = %call.context.id,
            data = %logged,
            "Service called"
        );
        handler(&call)
    }

    /// List all registered services grouped by domain.
    pub fn list_services(&self) -> BTreeMap<String, Vec<String>> {
        let mut result: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for entry in self.handlers.iter() {
            let (domain, service) = entry.key();
            result.entry(domain.clone()).or_default().push(service.clone());
        }
        for services in result.values_mut() {
            services.sort();
        }
        result
    }

    /// Services as a JSON array in the WebSocket `get_services` shape.
    pub fn list_domains_json(&self) -> Value {
        let mut arr = Vec::new();
        for (domain, svcs) in self.list_services() {
            let mut svc_map = Map::new();
            for svc in svcs {
                let fields = self
                    .handlers
                    .get(&(domain.clone(), svc.clone()))
                    .map(|entry| entry.schema.describe())
                    .unwrap_or_else(|| Value::Object(Map::new()));
                svc_map.insert(svc, serde_json::json!({"description": "", "fields": fields}));
            }
            arr.push(serde_json::json!({
                "domain": domain,
                "services": svc_map,
            }));
        }
        Value::Array(arr)
    }
}
