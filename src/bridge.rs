use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info};

use crate::broker_link::BrokerLink;
use crate::config::Config;
use crate::consumer::DeliveryConsumer;
use crate::gateway::{Gateway, SessionSink};
use crate::metrics::Metrics;
use crate::registry::ConnectionRegistry;

/// Composition root: owns the registry, the broker link and the gateway, and
/// wires the delivery consumer between them.
pub struct RealtimeBridge {
    config: Config,
    registry: Arc<ConnectionRegistry<SessionSink>>,
    link: Arc<BrokerLink>,
    metrics: Arc<Metrics>,
}

impl RealtimeBridge {
    /// Dials the broker up front. No broker, no service: a startup dial
    /// failure is returned to the caller rather than retried.
    pub async fn new(config: Config) -> Result<Self> {
        info!("Initializing realtime bridge");

        let link = BrokerLink::connect(config.broker.uri.as_str())
            .await
            .context("failed to connect to the message broker")?;

        Ok(Self {
            config,
            registry: Arc::new(ConnectionRegistry::new()),
            link: Arc::new(link),
            metrics: Metrics::new(),
        })
    }

    pub async fn run(self) -> Result<()> {
        let broker = &self.config.broker;
        let queue = self
            .link
            .setup_queue(
                &broker.queue,
                &broker.exchange,
                broker.kind(),
                &broker.routing_key,
                broker.durable,
                Default::default(),
            )
            .await
            .context("failed to set up broker topology")?;
        info!("Broker topology ready, consuming from '{}'", queue);

        let consumer = DeliveryConsumer::new(
            Arc::clone(&self.link),
            Arc::clone(&self.registry),
            queue,
            Arc::clone(&self.metrics),
        );
        tokio::spawn(async move {
            if let Err(err) = consumer.run().await {
                error!("Delivery consumer stopped: {}", err);
            }
        });

        let gateway = Gateway::new(
            self.config.gateway.listen_address.clone(),
            self.config.gateway.port,
            Arc::clone(&self.registry),
            Arc::clone(&self.metrics),
        );

        tokio::select! {
            result = gateway.run() => {
                result.context("gateway server failed")?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down realtime bridge");
            }
        }

        self.link.close().await;
        Ok(())
    }
}
