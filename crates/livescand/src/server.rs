use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use livescan_core::Device;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use crate::config::Config;
use crate::engine::EngineHandle;

/// Static body of the liveness-check endpoint.
pub const INDEX_BODY: &str = "Liveness Detection Backend (Ensemble Model) Running!";

/// Inbound event carrying a base64 frame.
pub const IMAGE_EVENT: &str = "image";
/// Outbound event carrying `{className, confidence}`.
pub const PREDICTION_EVENT: &str = "prediction_result";

/// Shared state accessible by route handlers.
pub struct AppState {
    pub engine: EngineHandle,
    pub device: Device,
    pub inference_timeout: Duration,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(engine: EngineHandle, config: &Config) -> Self {
        Self {
            engine,
            device: config.device,
            inference_timeout: config.inference_timeout(),
            started_at: Utc::now(),
        }
    }
}

/// Event envelope used on the WebSocket channel: `{"event": ..., "data": ...}`.
#[derive(Debug, Deserialize)]
struct InboundEvent {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ImagePayload {
    image: String,
}

#[derive(Debug, Serialize)]
struct OutboundEvent<T> {
    event: &'static str,
    data: T,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/status", get(status))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn index() -> &'static str {
    INDEX_BODY
}

/// Daemon status: version, device and which models are loaded.
async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let models = state.engine.availability();
    Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "device": state.device.to_string(),
        "ready": models.all(),
        "models": models,
        "started_at": state.started_at.to_rfc3339(),
        "inference_timeout_secs": state.inference_timeout.as_secs(),
    }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let conn_id = uuid::Uuid::new_v4();
    let span = tracing::info_span!("ws", conn = %conn_id);

    async move {
        tracing::info!("client connected");
        while let Some(msg) = socket.recv().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::debug!(error = %e, "websocket receive failed");
                    break;
                }
            };
            match msg {
                Message::Text(text) => {
                    let Some(reply) = handle_event(&state, text.as_str()).await else {
                        continue;
                    };
                    if let Err(e) = socket.send(Message::Text(reply.into())).await {
                        tracing::debug!(error = %e, "websocket send failed");
                        break;
                    }
                }
                Message::Binary(_) => tracing::debug!("ignoring binary frame"),
                Message::Close(_) => break,
                // Ping/pong are answered by the protocol layer.
                _ => {}
            }
        }
        tracing::info!("client disconnected");
    }
    .instrument(span)
    .await
}

/// Process one inbound text frame and return the reply frame, if any.
///
/// Every failure path (bad JSON, unknown event, undecodable image, no model
/// result) yields `None`: nothing is sent back.
pub async fn handle_event(state: &AppState, text: &str) -> Option<String> {
    let event: InboundEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            tracing::debug!(error = %e, "ignoring malformed event");
            return None;
        }
    };
    if event.event != IMAGE_EVENT {
        tracing::debug!(event = %event.event, "ignoring unknown event");
        return None;
    }
    let payload: ImagePayload = match serde_json::from_value(event.data) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::debug!(error = %e, "ignoring image event without image field");
            return None;
        }
    };

    let decoded =
        tokio::task::spawn_blocking(move || livescan_core::decode_base64_image(&payload.image))
            .await;
    let image = match decoded {
        Ok(Ok(image)) => image,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "dropping undecodable frame");
            return None;
        }
        Err(e) => {
            tracing::error!(error = %e, "decode task failed");
            return None;
        }
    };

    let prediction = state.engine.predict(image, state.inference_timeout).await?;
    tracing::info!(
        class = %prediction.class,
        confidence = prediction.confidence,
        "prediction emitted"
    );

    let reply = OutboundEvent {
        event: PREDICTION_EVENT,
        data: prediction,
    };
    match serde_json::to_string(&reply) {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode prediction event");
            None
        }
    }
}
