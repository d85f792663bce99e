use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::metrics::Metrics;
use crate::registry::{ConnectionRegistry, OutboundMessage, SessionTransport, TransportError};

/// Write half of an accepted WebSocket, as stored in the registry. The read
/// half stays with the accept loop below.
pub type SessionSink = SplitSink<WebSocket, Message>;

#[async_trait]
impl SessionTransport for SessionSink {
    async fn write_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        let text = String::from_utf8(frame.to_vec()).map_err(TransportError::new)?;
        self.send(Message::Text(text))
            .await
            .map_err(TransportError::new)
    }
}

#[derive(Clone)]
struct GatewayState {
    registry: Arc<ConnectionRegistry<SessionSink>>,
    metrics: Arc<Metrics>,
}

/// WebSocket accept surface: upgrades inbound connections, registers them
/// under the session identity, and unregisters on disconnect.
pub struct Gateway {
    listen_address: String,
    port: u16,
    registry: Arc<ConnectionRegistry<SessionSink>>,
    metrics: Arc<Metrics>,
}

impl Gateway {
    pub fn new(
        listen_address: impl Into<String>,
        port: u16,
        registry: Arc<ConnectionRegistry<SessionSink>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            listen_address: listen_address.into(),
            port,
            registry,
            metrics,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let state = GatewayState {
            registry: self.registry,
            metrics: self.metrics,
        };

        let app = Router::new()
            .route("/health", get(health_check))
            .route("/metrics", get(metrics_export))
            .route("/ws/:identity", get(ws_handler))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state);

        let addr = format!("{}:{}", self.listen_address, self.port);
        info!("Gateway listening on {}", addr);
        let listener = TcpListener::bind(&addr).await?;
        axum::serve(listener, app).await?;
        Ok(())
    }
}

async fn health_check() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn metrics_export() -> impl IntoResponse {
    let encoder = prometheus::TextEncoder::new();
    match encoder.encode_to_string(&prometheus::gather()) {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(identity): Path<String>,
    State(state): State<GatewayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session(socket, identity, state))
}

async fn handle_session(socket: WebSocket, identity: String, state: GatewayState) {
    let (sink, mut inbound) = socket.split();

    state.registry.register(identity.clone(), sink);
    state.metrics.active_sessions.inc();
    info!("WebSocket session established for '{}'", identity);

    state
        .registry
        .broadcast(&OutboundMessage::new(
            "user_joined",
            json!({"user_id": identity.as_str()}),
        ))
        .await;

    // Park on the read half until the peer goes away. Inbound traffic other
    // than close is ignored; client-to-server messages take the HTTP surface.
    while let Some(message) = inbound.next().await {
        match message {
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                debug!("WebSocket read error for '{}': {}", identity, err);
                break;
            }
        }
    }

    state.registry.unregister(&identity);
    state.metrics.active_sessions.dec();
    state
        .registry
        .broadcast(&OutboundMessage::new(
            "user_left",
            json!({"user_id": identity.as_str()}),
        ))
        .await;
    info!("WebSocket session closed for '{}'", identity);
}
