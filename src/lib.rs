pub mod bridge;
pub mod broker_link;
pub mod config;
pub mod consumer;
pub mod gateway;
pub mod metrics;
pub mod registry;

#[cfg(test)]
pub(crate) mod test_support;

pub use bridge::RealtimeBridge;
pub use broker_link::{BrokerLink, LinkError};
pub use config::Config;
pub use consumer::DeliveryConsumer;
pub use registry::{ConnectionRegistry, OutboundMessage, SendError, SessionTransport};
