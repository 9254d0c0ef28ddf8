//! REST API and WebSocket routes

use crate::messages::{ControlMessage, Envelope};
use crate::registry::{Message, SubscriberId, SubscriberRegistry};
use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use pitwall_core::model::DriverStats;
use pitwall_core::{RadioMessage, TelemetrySample};
use pitwall_sources::IngestError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc::Receiver;
use tower_http::cors::CorsLayer;
use tracing::{debug, warn};

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/ws", get(ws_all))
        .route("/ws/:driver_id", get(ws_driver))
        // Live ingest
        .route("/api/ingest/telemetry", post(ingest_telemetry))
        .route("/api/ingest/radio", post(ingest_radio))
        // Driver baselines
        .route("/api/drivers/:id/stats", get(driver_stats))
        .route("/api/drivers/:id/reset", post(driver_reset))
        .route("/api/subscribers", get(subscribers))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// === Status Endpoints ===

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "message": "Pitwall telemetry pipeline",
        "status": "running",
    }))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

// === Ingest Endpoints ===

/// Either a single item or a batch
#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::Many(items) => items,
            OneOrMany::One(item) => vec![item],
        }
    }
}

#[derive(Serialize)]
struct Accepted {
    accepted: usize,
}

fn ingest<T>(
    items: Vec<T>,
    push: impl Fn(T) -> Result<(), IngestError>,
) -> Result<(StatusCode, Json<Accepted>), (StatusCode, String)> {
    let mut accepted = 0;
    for item in items {
        push(item).map_err(|e| {
            warn!("Ingest rejected after {} items: {}", accepted, e);
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        })?;
        accepted += 1;
    }
    Ok((StatusCode::ACCEPTED, Json(Accepted { accepted })))
}

async fn ingest_telemetry(
    State(state): State<AppState>,
    Json(body): Json<OneOrMany<TelemetrySample>>,
) -> Result<(StatusCode, Json<Accepted>), (StatusCode, String)> {
    ingest(body.into_vec(), |sample| state.ingest.push_sample(sample))
}

async fn ingest_radio(
    State(state): State<AppState>,
    Json(body): Json<OneOrMany<RadioMessage>>,
) -> Result<(StatusCode, Json<Accepted>), (StatusCode, String)> {
    ingest(body.into_vec(), |message| state.ingest.push_text(message))
}

// === Driver Endpoints ===

async fn driver_stats(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DriverStats>, (StatusCode, String)> {
    state
        .dispatch
        .stats(&id)
        .await
        .map(Json)
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
}

async fn driver_reset(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .dispatch
        .reset(&id)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
}

#[derive(Serialize)]
struct SubscriberCounts {
    total: usize,
    by_driver: BTreeMap<String, usize>,
}

async fn subscribers(State(state): State<AppState>) -> Json<SubscriberCounts> {
    Json(SubscriberCounts {
        total: state.registry.len(),
        by_driver: state.registry.entity_counts(),
    })
}

// === WebSocket Endpoints ===

async fn ws_all(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.registry, None))
}

async fn ws_driver(
    ws: WebSocketUpgrade,
    Path(driver_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.registry, Some(driver_id)))
}

/// Pump one subscriber's queue into its socket until either side goes away
async fn handle_socket(socket: WebSocket, registry: SubscriberRegistry, driver_id: Option<String>) {
    let (id, mut rx) = open_subscription(&registry, driver_id);

    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sender.send(WsMessage::Text(message.to_string())).await.is_err() {
                break;
            }
        }
    });

    let control_registry = registry.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            match message {
                WsMessage::Text(text) => handle_control(&control_registry, id, &text),
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    registry.disconnect(id);
}

/// Register a new subscriber, following `driver_id` from the start when given
///
/// Following through the URL path is silent; only `subscribe_driver`
/// requests are acknowledged.
pub fn open_subscription(
    registry: &SubscriberRegistry,
    driver_id: Option<String>,
) -> (SubscriberId, Receiver<Message>) {
    let (id, rx) = registry.connect();
    if let Some(driver_id) = driver_id {
        if let Err(e) = registry.connect_to_entity(id, &driver_id) {
            warn!("Could not subscribe {} to {}: {}", id, driver_id, e);
        }
    }
    (id, rx)
}

/// Apply one inbound text frame from subscriber `id`
pub fn handle_control(registry: &SubscriberRegistry, id: SubscriberId, text: &str) {
    let Some(ControlMessage::SubscribeDriver { driver_id }) = ControlMessage::parse(text) else {
        debug!("Ignoring message from subscriber {}", id);
        return;
    };

    if let Err(e) = registry.connect_to_entity(id, &driver_id) {
        warn!("Could not subscribe {} to {}: {}", id, driver_id, e);
        return;
    }

    match (Envelope::Subscribed { driver_id }).to_message() {
        Ok(ack) => {
            if let Err(e) = registry.send_to(id, &ack) {
                warn!("Could not acknowledge subscription for {}: {}", id, e);
            }
        }
        Err(e) => warn!("Failed to serialize subscription ack: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_subscription_is_not_acknowledged() {
        let registry = SubscriberRegistry::new(8, 3);
        let (id, mut rx) = open_subscription(&registry, Some("DRIVER_A".to_string()));

        assert_eq!(registry.entity_of(id).as_deref(), Some("DRIVER_A"));
        assert_eq!(registry.entity_subscriber_count("DRIVER_A"), 1);
        assert!(rx.try_recv().is_err(), "nothing queued before any event");
    }

    #[test]
    fn test_subscribe_request_is_acknowledged() {
        let registry = SubscriberRegistry::new(8, 3);
        let (id, mut rx) = open_subscription(&registry, None);

        handle_control(&registry, id, r#"{"type":"subscribe_driver","driver_id":"DRIVER_B"}"#);

        assert_eq!(registry.entity_of(id).as_deref(), Some("DRIVER_B"));
        let ack: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(ack["type"], "subscribed");
        assert_eq!(ack["driver_id"], "DRIVER_B");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unknown_control_frame_changes_nothing() {
        let registry = SubscriberRegistry::new(8, 3);
        let (id, mut rx) = open_subscription(&registry, Some("DRIVER_A".to_string()));

        handle_control(&registry, id, r#"{"type":"ping"}"#);

        assert_eq!(registry.entity_of(id).as_deref(), Some("DRIVER_A"));
        assert!(rx.try_recv().is_err());
    }
}
