use prometheus::{register_int_counter, register_int_gauge, IntCounter, IntGauge};
use std::sync::Arc;

pub struct Metrics {
    pub frames_received: IntCounter,
    pub messages_delivered: IntCounter,
    pub recipients_offline: IntCounter,
    pub delivery_failures: IntCounter,
    pub active_sessions: IntGauge,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            frames_received: register_int_counter!(
                "bridge_frames_received_total",
                "Total number of frames read from the broker queue"
            )
            .unwrap(),
            messages_delivered: register_int_counter!(
                "bridge_messages_delivered_total",
                "Total number of messages written to live sessions"
            )
            .unwrap(),
            recipients_offline: register_int_counter!(
                "bridge_recipients_offline_total",
                "Frames dropped because the recipient had no live session"
            )
            .unwrap(),
            delivery_failures: register_int_counter!(
                "bridge_delivery_failures_total",
                "Frames that failed to write to an existing session"
            )
            .unwrap(),
            active_sessions: register_int_gauge!(
                "bridge_active_sessions",
                "Number of currently registered WebSocket sessions"
            )
            .unwrap(),
        })
    }
}
