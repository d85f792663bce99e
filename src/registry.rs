use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Message delivered to a live session.
///
/// Serializes to the `{"success": true, "type": ..., "data": ...}` shape the
/// frontend expects; `type` carries the routing key of the originating event.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundMessage {
    pub success: bool,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: serde_json::Value,
}

impl OutboundMessage {
    pub fn new(kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            success: true,
            kind: kind.into(),
            data,
        }
    }
}

/// Error from a single framed write on a session transport.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct TransportError(Box<dyn std::error::Error + Send + Sync>);

impl TransportError {
    pub fn new<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self(Box::new(err))
    }
}

#[derive(Debug, Error)]
pub enum SendError {
    /// The recipient has no live session. Expected whenever a delivery races
    /// a disconnect; callers log it rather than treating it as fatal.
    #[error("connection not found")]
    ConnectionNotFound,
    #[error("failed to encode outbound message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("transport write failed: {0}")]
    Transport(#[from] TransportError),
}

/// Write half of a live client connection.
///
/// Implementations are not expected to tolerate concurrent writers; the
/// registry serializes all writes through the handle's own lock.
#[async_trait]
pub trait SessionTransport: Send + 'static {
    /// Writes one complete frame to the client.
    async fn write_frame(&mut self, frame: Bytes) -> Result<(), TransportError>;
}

/// A registered session: the transport paired with its write lock.
struct SessionHandle<T> {
    transport: Mutex<T>,
}

/// In-memory map from session identity to its exclusively-owned connection.
///
/// Two lock levels: the registry-wide RwLock covers map access only and is
/// released before any write; each handle's own Mutex covers exactly one
/// frame write. Sends to different identities never contend.
pub struct ConnectionRegistry<T> {
    sessions: RwLock<HashMap<String, Arc<SessionHandle<T>>>>,
}

impl<T: SessionTransport> ConnectionRegistry<T> {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a session, replacing any existing one under the same
    /// identity. The superseded transport is not closed here; the accept
    /// loop that owns it handles its own teardown.
    pub fn register(&self, identity: impl Into<String>, transport: T) {
        let identity = identity.into();
        let handle = Arc::new(SessionHandle {
            transport: Mutex::new(transport),
        });
        self.sessions.write().insert(identity.clone(), handle);
        info!("Registered session for '{}'", identity);
    }

    /// Removes a session. A no-op when the identity is absent: disconnect
    /// ordering is not guaranteed relative to a concurrent re-registration.
    pub fn unregister(&self, identity: &str) {
        if self.sessions.write().remove(identity).is_some() {
            info!("Unregistered session for '{}'", identity);
        }
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.sessions.read().contains_key(identity)
    }

    /// One-shot snapshot of the identities present at call time. Later
    /// registry mutations do not affect an already-produced snapshot.
    pub fn identities(&self) -> impl Iterator<Item = String> {
        let ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        ids.into_iter()
    }

    /// Writes `message` to the identified session as a single frame.
    ///
    /// The map lock is dropped before the write; only the handle's own lock
    /// is held across the transport I/O. A write failure is surfaced without
    /// unregistering the session - removal is the accept loop's call.
    pub async fn send(&self, identity: &str, message: &OutboundMessage) -> Result<(), SendError> {
        let handle = self
            .lookup(identity)
            .ok_or(SendError::ConnectionNotFound)?;
        let frame = Bytes::from(serde_json::to_vec(message)?);

        let mut transport = handle.transport.lock().await;
        transport.write_frame(frame).await?;
        debug!("Sent '{}' message to '{}'", message.kind, identity);
        Ok(())
    }

    /// Sends `message` to every session present when the call started. A
    /// failure for one identity is logged and does not abort the rest.
    pub async fn broadcast(&self, message: &OutboundMessage) {
        for identity in self.identities() {
            if let Err(err) = self.send(&identity, message).await {
                warn!("Failed to broadcast to '{}': {}", identity, err);
            }
        }
    }

    fn lookup(&self, identity: &str) -> Option<Arc<SessionHandle<T>>> {
        self.sessions.read().get(identity).cloned()
    }
}

impl<T: SessionTransport> Default for ConnectionRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
