use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;

use crate::bus::EventBus;
use crate::dispatcher::Dispatcher;
use crate::registry::{EntityEntry, EntityRegistry};
use crate::relay::EntityServiceRelay;
use crate::schema::ATTR_ENTITY_ID;
use crate::services::{ServiceError, ServiceRegistry};
use crate::state::{EntityState, StateMachine};

/// Shared application state: the hub every integration plugs into.
pub struct AppState {
    pub bus: Arc<EventBus>,
    pub state_machine: StateMachine,
    pub services: Arc<ServiceRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub relay: EntityServiceRelay,
    pub entities: EntityRegistry,
    pub started_at: Instant,
}

impl AppState {
    pub fn new() -> Self {
        let bus = Arc::new(EventBus::new(4096));
        let services = Arc::new(ServiceRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new());
        Self {
            state_machine: StateMachine::new(bus.clone()),
            relay: EntityServiceRelay::new(dispatcher.clone(), services.clone()),
            entities: EntityRegistry::new(),
            started_at: Instant::now(),
            bus,
            services,
            dispatcher,
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

/// GET /api/ response
#[derive(Serialize)]
struct ApiStatus {
    message: String,
}

/// POST /api/events/{event_type} response
#[derive(Serialize)]
struct EventResponse {
    message: String,
}

type ApiError = (StatusCode, Json<Value>);

fn error_body(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(serde_json::json!({ "message": message.into() })))
}

pub fn service_error_status(err: &ServiceError) -> StatusCode {
    match err {
        ServiceError::NotFound { .. } => StatusCode::NOT_FOUND,
        ServiceError::InvalidData(_) => StatusCode::BAD_REQUEST,
        ServiceError::Driver(_) | ServiceError::CallFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Turn a request body into service data. Accepts the fields at top level
/// or a `target: {entity_id}` block; the two are merged.
pub fn service_data(body: Value) -> Result<Map<String, Value>, String> {
    let mut data = match body {
        Value::Object(m) => m,
        Value::Null => Map::new(),
        other => return Err(format!("expected a JSON object, got {}", other)),
    };
    if let Some(target) = data.remove("target") {
        match target {
            Value::Object(mut t) => {
                if let Some(ids) = t.remove(ATTR_ENTITY_ID) {
                    data.entry(ATTR_ENTITY_ID).or_insert(ids);
                }
            }
            Value::Null => {}
            _ => return Err("target must be an object".to_string()),
        }
    }
    Ok(data)
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/", get(api_status))
        .route("/api/states", get(get_states))
        .route("/api/states/:entity_id", get(get_state))
        .route("/api/entities", get(list_entities))
        .route("/api/entities/:entity_id", get(get_entity))
        .route("/api/services", get(list_services))
        .route("/api/services/:domain/:service", post(call_service))
        .route("/api/events/:event_type", post(fire_event))
        .route("/api/health", get(health))
        .with_state(state)
}

/// GET /api/: API running check
async fn api_status() -> Json<ApiStatus> {
    Json(ApiStatus {
        message: "API running.".to_string(),
    })
}

/// GET /api/states: return all entity states
async fn get_states(State(app): State<Arc<AppState>>) -> Json<Vec<EntityState>> {
    Json(app.state_machine.get_all())
}

/// GET /api/states/{entity_id}: return single entity state
async fn get_state(
    State(app): State<Arc<AppState>>,
    Path(entity_id): Path<String>,
) -> Result<Json<EntityState>, StatusCode> {
    app.state_machine
        .get(&entity_id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// GET /api/entities: registered entities, including detached ones
async fn list_entities(State(app): State<Arc<AppState>>) -> Json<Vec<EntityEntry>> {
    Json(app.entities.list().iter().map(|e| EntityEntry::clone(e)).collect())
}

async fn get_entity(
    State(app): State<Arc<AppState>>,
    Path(entity_id): Path<String>,
) -> Result<Json<EntityEntry>, StatusCode> {
    app.entities
        .get(&entity_id)
        .map(|e| Json(EntityEntry::clone(&e)))
        .ok_or(StatusCode::NOT_FOUND)
}

/// GET /api/services
async fn list_services(State(app): State<Arc<AppState>>) -> Json<Value> {
    Json(app.services.list_domains_json())
}

/// POST /api/services/{domain}/{service}: call a service
async fn call_service(
    State(app): State<Arc<AppState>>,
    Path((domain, service)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let body: Value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| error_body(StatusCode::BAD_REQUEST, format!("invalid JSON: {}", e)))?
    };
    let data = service_data(body).map_err(|e| error_body(StatusCode::BAD_REQUEST, e))?;

    tracing::info!(domain = %domain, service = %service, "Service called");
    match app.services.call(&domain, &service, data) {
        Ok(()) => Ok(Json(serde_json::json!([]))),
        Err(e) => {
            tracing::warn!(domain = %domain, service = %service, error = %e, "Service call failed");
            Err(error_body(service_error_status(&e), e.to_string()))
        }
    }
}

/// POST /api/events/{event_type}: fire an event
async fn fire_event(
    State(app): State<Arc<AppState>>,
    Path(event_type): Path<String>,
    body: Bytes,
) -> Result<Json<EventResponse>, ApiError> {
    let data: Value = if body.is_empty() {
        Value::Object(Map::new())
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| error_body(StatusCode::BAD_REQUEST, format!("invalid JSON: {}", e)))?
    };
    tracing::info!(event_type = %event_type, "Event fired");
    app.bus.fire(event_type.clone(), data);
    Ok(Json(EventResponse {
        message: format!("Event {} fired.", event_type),
    }))
}

/// GET /api/health: health check with metrics
async fn health(State(app): State<Arc<AppState>>) -> Json<Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "entity_count": app.state_machine.len(),
        "registered_entities": app.entities.len(),
        "bound_services": app.dispatcher.total_listeners(),
        "events_fired": app.bus.fired(),
        "uptime_seconds": app.started_at.elapsed().as_secs(),
    }))
}
