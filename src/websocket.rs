use axum::extract::ws::{Message, WebSocket};
use axum::{
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

use crate::api::{service_data, AppState};
use crate::bus::Event;
use crate::services::ServiceError;
use crate::state::Context;

/// WebSocket message types (HA WebSocket API compatible, no auth phase)
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum WsOutgoing {
    #[serde(rename = "result")]
    Result {
        id: u64,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<WsError>,
    },
    #[serde(rename = "event")]
    Event { id: u64, event: Value },
    #[serde(rename = "pong")]
    Pong { id: u64 },
}

#[derive(Debug, Serialize)]
struct WsError {
    code: &'static str,
    message: String,
}

#[derive(Debug, Deserialize)]
struct WsIncoming {
    id: Option<u64>,
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(flatten)]
    data: serde_json::Map<String, Value>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/websocket", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(app): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, app))
}

/// Per-connection state: subscription id -> optional event type filter.
#[derive(Default)]
struct Session {
    subscriptions: HashMap<u64, Option<String>>,
}

impl Session {
    /// Handle one client message and produce the reply.
    fn handle(&mut self, app: &AppState, incoming: WsIncoming) -> WsOutgoing {
        let id = incoming.id.unwrap_or(0);
        let data = incoming.data;
        match incoming.msg_type.as_str() {
            "subscribe_events" => {
                let event_type = data
                    .get("event_type")
                    .and_then(Value::as_str)
                    .map(String::from);
                self.subscriptions.insert(id, event_type);
                ws_ok(id, None)
            }
            "unsubscribe_events" => {
                let sub = data.get("subscription").and_then(Value::as_u64);
                match sub.and_then(|s| self.subscriptions.remove(&s)) {
                    Some(_) => ws_ok(id, None),
                    None => ws_err(id, "not_found", "Subscription not found."),
                }
            }
            "get_states" => ws_ok(id, serde_json::to_value(app.state_machine.get_all()).ok()),
            "get_services" => ws_ok(id, Some(app.services.list_domains_json())),
            "call_service" => {
                let domain = data.get("domain").and_then(Value::as_str).unwrap_or("");
                let service = data.get("service").and_then(Value::as_str).unwrap_or("");
                let mut body = data.get("service_data").cloned().unwrap_or(Value::Null);
                if let Some(target) = data.get("target") {
                    if let Value::Null = body {
                        body = Value::Object(Default::default());
                    }
                    if let Value::Object(m) = &mut body {
                        m.insert("target".to_string(), target.clone());
                    }
                }
                let svc_data = match service_data(body) {
                    Ok(d) => d,
                    Err(e) => return ws_err(id, "invalid_format", e),
                };
                match app.services.call(domain, service, svc_data) {
                    Ok(()) => ws_ok(id, Some(serde_json::json!({"context": Context::new()}))),
                    Err(e) => {
                        let code = match &e {
                            ServiceError::NotFound { .. } => "not_found",
                            ServiceError::InvalidData(_) => "invalid_format",
                            _ => "home_assistant_error",
                        };
                        ws_err(id, code, e.to_string())
                    }
                }
            }
            "fire_event" => {
                let event_type = data
                    .get("event_type")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                let event_data = data
                    .get("event_data")
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Default::default()));
                tracing::info!(event_type = %event_type, "WS event fired");
                let event = app.bus.fire(event_type, event_data);
                ws_ok(id, Some(serde_json::json!({"context": event.context})))
            }
            "ping" => WsOutgoing::Pong { id },
            _ => {
                tracing::debug!(msg_type = %incoming.msg_type, "Unknown WS message type");
                ws_err(id, "unknown_command", "Unknown command.")
            }
        }
    }

    /// Subscription ids that want `event`.
    fn matching(&self, event: &Event) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .subscriptions
            .iter()
            .filter(|(_, filter)| filter.as_deref().map_or(true, |t| t == event.event_type))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }
}

async fn handle_ws(mut socket: WebSocket, app: Arc<AppState>) {
    let mut events = app.bus.subscribe();
    let mut session = Session::default();

    loop {
        tokio::select! {
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = match serde_json::from_str::<WsIncoming>(&text) {
                            Ok(incoming) => session.handle(&app, incoming),
                            Err(e) => ws_err(0, "invalid_format", e.to_string()),
                        };
                        if !send(&mut socket, &reply).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "WS receive failed");
                        break;
                    }
                    _ => {}
                }
            }

            event = events.recv() => {
                match event {
                    Ok(event) => {
                        for sub_id in session.matching(&event) {
                            let out = WsOutgoing::Event {
                                id: sub_id,
                                event: serde_json::to_value(&event).unwrap_or(Value::Null),
                            };
                            if !send(&mut socket, &out).await {
                                return;
                            }
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "WS client lagging, events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }
}

async fn send(socket: &mut WebSocket, msg: &WsOutgoing) -> bool {
    match serde_json::to_string(msg) {
        Ok(text) => socket.send(Message::Text(text)).await.is_ok(),
        Err(e) => {
            tracing::warn!(error = %e, "WS message serialization failed");
            true
        }
    }
}

fn ws_ok(id: u64, result: Option<Value>) -> WsOutgoing {
    WsOutgoing::Result {
        id,
        success: true,
        result,
        error: None,
    }
}

fn ws_err(id: u64, code: &'static str, message: impl Into<String>) -> WsOutgoing {
    WsOutgoing::Result {
        id,
        success: false,
        result: None,
        error: Some(WsError {
            code,
            message: message.into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ServiceSchema;
    use crate::services::ServiceCall;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn incoming(v: Value) -> WsIncoming {
        serde_json::from_value(v).unwrap()
    }

    fn reply(session: &mut Session, app: &AppState, v: Value) -> Value {
        serde_json::to_value(session.handle(app, incoming(v))).unwrap()
    }

    #[test]
    fn test_ping() {
        let app = AppState::new();
        let out = reply(&mut Session::default(), &app, json!({"id": 4, "type": "ping"}));
        assert_eq!(out, json!({"id": 4, "type": "pong"}));
    }

    #[test]
    fn test_subscribe_filter() {
        let app = AppState::new();
        let mut session = Session::default();
        reply(&mut session, &app, json!({"id": 1, "type": "subscribe_events"}));
        reply(
            &mut session,
            &app,
            json!({"id": 2, "type": "subscribe_events", "event_type": "upb.scene_activated"}),
        );

        let scene = app.bus.fire("upb.scene_activated", json!({}));
        let other = app.bus.fire("state_changed", json!({}));
        assert_eq!(session.matching(&scene), vec![1, 2]);
        assert_eq!(session.matching(&other), vec![1]);

        let out = reply(&mut session, &app, json!({"id": 3, "type": "unsubscribe_events", "subscription": 1}));
        assert_eq!(out["success"], true);
        assert!(session.matching(&other).is_empty());

        let out = reply(&mut session, &app, json!({"id": 4, "type": "unsubscribe_events", "subscription": 1}));
        assert_eq!(out["success"], false);
    }

    #[test]
    fn test_call_service() {
        let app = AppState::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        app.services.register("scene", "turn_on", ServiceSchema::entity_service(vec![]), move |call: &ServiceCall| {
            assert_eq!(call.entity_ids(), vec!["scene.evening"]);
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let mut session = Session::default();
        let out = reply(
            &mut session,
            &app,
            json!({"id": 5, "type": "call_service", "domain": "scene", "service": "turn_on",
                   "target": {"entity_id": "scene.evening"}}),
        );
        assert_eq!(out["success"], true);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let out = reply(
            &mut session,
            &app,
            json!({"id": 6, "type": "call_service", "domain": "scene", "service": "nope"}),
        );
        assert_eq!(out["error"]["code"], "not_found");
    }

    #[test]
    fn test_fire_event_and_get_states() {
        let app = AppState::new();
        let mut rx = app.bus.subscribe();
        let mut session = Session::default();
        let out = reply(
            &mut session,
            &app,
            json!({"id": 7, "type": "fire_event", "event_type": "custom", "event_data": {"a": 1}}),
        );
        assert_eq!(out["success"], true);
        assert_eq!(rx.try_recv().unwrap().data["a"], 1);

        app.state_machine
            .set("light.kitchen", "off".to_string(), Default::default());
        let out = reply(&mut session, &app, json!({"id": 8, "type": "get_states"}));
        assert_eq!(out["result"][0]["entity_id"], "light.kitchen");
    }

    #[test]
    fn test_unknown_command() {
        let app = AppState::new();
        let out = reply(&mut Session::default(), &app, json!({"id": 9, "type": "auth"}));
        assert_eq!(out["success"], false);
        assert_eq!(out["error"]["code"], "unknown_command");
    }
}
