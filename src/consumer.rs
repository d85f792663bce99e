use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::value::RawValue;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::broker_link::{BrokerLink, LinkError};
use crate::metrics::Metrics;
use crate::registry::{ConnectionRegistry, OutboundMessage, SendError, SessionTransport};

/// Addressed unit read from the broker queue. `data` stays raw here; the
/// payload gets its own decode pass so a publisher can ship any JSON shape.
#[derive(Debug, Deserialize)]
struct Envelope {
    owner_id: String,
    #[serde(default)]
    data: Option<Box<RawValue>>,
}

/// What became of one frame. Drives the metrics counters and keeps the frame
/// handling testable without a live broker.
#[derive(Debug, PartialEq, Eq)]
enum FrameOutcome {
    Delivered,
    RecipientOffline,
    DeliveryFailed,
    Malformed,
}

/// Bridges broker frames to the connection registry: one subscription, one
/// sequential processing loop, per-recipient ordering for free.
pub struct DeliveryConsumer<T> {
    link: Arc<BrokerLink>,
    registry: Arc<ConnectionRegistry<T>>,
    queue: String,
    metrics: Arc<Metrics>,
}

impl<T: SessionTransport> DeliveryConsumer<T> {
    pub fn new(
        link: Arc<BrokerLink>,
        registry: Arc<ConnectionRegistry<T>>,
        queue: impl Into<String>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            link,
            registry,
            queue: queue.into(),
            metrics,
        }
    }

    /// Subscribes once and processes frames in broker delivery order for the
    /// lifetime of the subscription. No per-frame failure ends the loop; only
    /// the stream itself ending does.
    pub async fn run(self) -> Result<(), LinkError> {
        let mut frames = self.link.consume(&self.queue).await?;
        info!("Delivery consumer started on queue '{}'", self.queue);

        while let Some(frame) = frames.next().await {
            let delivery = match frame {
                Ok(delivery) => delivery,
                Err(err) => {
                    warn!("Consume stream error: {}", err);
                    continue;
                }
            };
            self.metrics.frames_received.inc();

            let outcome = handle_frame(
                &self.registry,
                delivery.routing_key.as_str(),
                &delivery.data,
            )
            .await;
            match outcome {
                FrameOutcome::Delivered => self.metrics.messages_delivered.inc(),
                FrameOutcome::RecipientOffline => self.metrics.recipients_offline.inc(),
                FrameOutcome::DeliveryFailed => self.metrics.delivery_failures.inc(),
                FrameOutcome::Malformed => {}
            }
        }

        info!("Consume stream for '{}' ended", self.queue);
        Ok(())
    }
}

/// Decodes one frame and forwards its payload to the addressed session.
async fn handle_frame<T: SessionTransport>(
    registry: &ConnectionRegistry<T>,
    routing_key: &str,
    body: &[u8],
) -> FrameOutcome {
    let envelope: Envelope = match serde_json::from_slice(body) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!("Skipping malformed envelope: {}", err);
            return FrameOutcome::Malformed;
        }
    };

    let payload = match &envelope.data {
        Some(raw) => match serde_json::from_str(raw.get()) {
            Ok(value) => value,
            Err(err) => {
                warn!(
                    "Skipping frame for '{}', undecodable payload: {}",
                    envelope.owner_id, err
                );
                return FrameOutcome::Malformed;
            }
        },
        None => serde_json::Value::Null,
    };

    let message = OutboundMessage::new(routing_key, payload);
    match registry.send(&envelope.owner_id, &message).await {
        Ok(()) => {
            debug!(
                "Delivered '{}' frame to '{}'",
                routing_key, envelope.owner_id
            );
            FrameOutcome::Delivered
        }
        Err(SendError::ConnectionNotFound) => {
            debug!(
                "Recipient '{}' not connected, dropping frame",
                envelope.owner_id
            );
            FrameOutcome::RecipientOffline
        }
        Err(err) => {
            warn!(
                "Failed to deliver frame to '{}': {}",
                envelope.owner_id, err
            );
            FrameOutcome::DeliveryFailed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingTransport;
    use serde_json::json;

    #[tokio::test]
    async fn frame_reaches_the_addressed_session() {
        let registry = ConnectionRegistry::new();
        let transport = RecordingTransport::default();
        registry.register("u1", transport.clone());

        let body = br#"{"owner_id":"u1","data":{"text":"hi"}}"#;
        let outcome = handle_frame(&registry, "chat.message", body).await;

        assert_eq!(outcome, FrameOutcome::Delivered);
        let frames = transport.frames.lock();
        assert_eq!(frames.len(), 1);
        let written: serde_json::Value = serde_json::from_slice(&frames[0]).unwrap();
        assert_eq!(
            written,
            json!({"success": true, "type": "chat.message", "data": {"text": "hi"}})
        );
    }

    #[tokio::test]
    async fn offline_recipient_drops_the_frame() {
        let registry: ConnectionRegistry<RecordingTransport> = ConnectionRegistry::new();
        let body = br#"{"owner_id":"u1","data":{"text":"hi"}}"#;
        let outcome = handle_frame(&registry, "chat.message", body).await;
        assert_eq!(outcome, FrameOutcome::RecipientOffline);
    }

    #[tokio::test]
    async fn malformed_frame_is_skipped_and_later_frames_still_deliver() {
        let registry = ConnectionRegistry::new();
        let transport = RecordingTransport::default();
        registry.register("u1", transport.clone());

        let outcome = handle_frame(&registry, "chat.message", b"not json at all").await;
        assert_eq!(outcome, FrameOutcome::Malformed);
        assert!(transport.frames.lock().is_empty());

        let outcome = handle_frame(
            &registry,
            "chat.message",
            br#"{"owner_id":"u1","data":{"text":"hi"}}"#,
        )
        .await;
        assert_eq!(outcome, FrameOutcome::Delivered);
        assert_eq!(transport.frames.lock().len(), 1);
    }

    #[tokio::test]
    async fn envelope_without_data_delivers_null_payload() {
        let registry = ConnectionRegistry::new();
        let transport = RecordingTransport::default();
        registry.register("u1", transport.clone());

        let outcome = handle_frame(&registry, "user_left", br#"{"owner_id":"u1"}"#).await;

        assert_eq!(outcome, FrameOutcome::Delivered);
        let frames = transport.frames.lock();
        let written: serde_json::Value = serde_json::from_slice(&frames[0]).unwrap();
        assert_eq!(
            written,
            json!({"success": true, "type": "user_left", "data": null})
        );
    }

    #[tokio::test]
    async fn failing_transport_reports_delivery_failure() {
        let registry = ConnectionRegistry::new();
        registry.register("u1", RecordingTransport::failing());

        let outcome = handle_frame(
            &registry,
            "chat.message",
            br#"{"owner_id":"u1","data":{}}"#,
        )
        .await;
        assert_eq!(outcome, FrameOutcome::DeliveryFailed);
    }
}
