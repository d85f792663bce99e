use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

const DELIVERY_MODE_PERSISTENT: u8 = 2;

#[derive(Debug, Error)]
pub enum LinkError {
    /// The link was shut down with `close()`; terminal, no implicit reconnect.
    #[error("broker link has been closed")]
    Closed,
    #[error("failed to encode message payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to reach broker: {0}")]
    Connect(#[source] lapin::Error),
    #[error("failed to declare exchange '{exchange}': {source}")]
    DeclareExchange {
        exchange: String,
        source: lapin::Error,
    },
    #[error("failed to declare queue '{queue}': {source}")]
    DeclareQueue { queue: String, source: lapin::Error },
    #[error("failed to bind queue '{queue}' to exchange '{exchange}': {source}")]
    Bind {
        queue: String,
        exchange: String,
        source: lapin::Error,
    },
    #[error("publish to exchange '{exchange}' failed: {source}")]
    Publish {
        exchange: String,
        source: lapin::Error,
    },
    #[error("failed to start consuming from '{queue}': {source}")]
    Consume { queue: String, source: lapin::Error },
}

enum LinkState {
    /// Down but repairable; the next `ensure_channel` call retries.
    Connecting,
    Open {
        connection: Connection,
        channel: Channel,
    },
    /// Explicitly shut down. Terminal.
    Closed,
}

/// Owned connection + channel to the message broker, with self-repair.
///
/// The state lock is reader/writer: operations take the read side to grab the
/// current channel, repair paths take the write side. Holding the write lock
/// for the whole repair is what keeps concurrent callers from racing a second
/// reconnect; everyone else blocks and then sees the repaired state on the
/// double-check.
pub struct BrokerLink {
    uri: String,
    state: RwLock<LinkState>,
}

impl BrokerLink {
    /// Dials the broker and opens the initial channel. A startup dial failure
    /// is propagated: there is no service without a broker.
    pub async fn connect(uri: impl Into<String>) -> Result<Self, LinkError> {
        let uri = uri.into();
        let (connection, channel) = Self::dial(&uri).await?;
        info!("Connected to message broker");

        Ok(Self {
            uri,
            state: RwLock::new(LinkState::Open {
                connection,
                channel,
            }),
        })
    }

    async fn dial(uri: &str) -> Result<(Connection, Channel), LinkError> {
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(LinkError::Connect)?;
        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                let _ = connection.close(200, "channel setup failed").await;
                return Err(LinkError::Connect(err));
            }
        };
        Ok((connection, channel))
    }

    /// Returns an open channel, repairing the link first if needed.
    ///
    /// Fast path: read lock, channel still open, done. Repair path: write
    /// lock, double-check (another caller may have repaired while we waited),
    /// then reopen the channel on the live connection or fall back to a full
    /// redial. A failed repair leaves the link retryable for the next call.
    pub(crate) async fn ensure_channel(&self) -> Result<Channel, LinkError> {
        {
            let state = self.state.read().await;
            match &*state {
                LinkState::Open { channel, .. } if channel.status().connected() => {
                    return Ok(channel.clone());
                }
                LinkState::Closed => return Err(LinkError::Closed),
                _ => {}
            }
        }

        let mut state = self.state.write().await;
        match &*state {
            LinkState::Open { channel, .. } if channel.status().connected() => {
                return Ok(channel.clone());
            }
            LinkState::Closed => return Err(LinkError::Closed),
            _ => {}
        }

        warn!("Broker channel is down, repairing link");
        let prev = std::mem::replace(&mut *state, LinkState::Connecting);
        if let LinkState::Open { connection, .. } = prev {
            if connection.status().connected() {
                match connection.create_channel().await {
                    Ok(channel) => {
                        info!("Recreated channel on the existing broker connection");
                        let fresh = channel.clone();
                        *state = LinkState::Open {
                            connection,
                            channel,
                        };
                        return Ok(fresh);
                    }
                    Err(err) => {
                        warn!(
                            "Failed to recreate channel, falling back to full reconnect: {}",
                            err
                        );
                        let _ = connection.close(200, "superseded").await;
                    }
                }
            } else {
                let _ = connection.close(200, "superseded").await;
            }
        }

        let (connection, channel) = Self::dial(&self.uri).await?;
        info!("Reconnected to message broker");
        let fresh = channel.clone();
        *state = LinkState::Open {
            connection,
            channel,
        };
        Ok(fresh)
    }

    /// Explicit shutdown: channel, then connection. Terminal - subsequent
    /// operations fail with `LinkError::Closed` instead of reconnecting.
    pub async fn close(&self) {
        let mut state = self.state.write().await;
        if let LinkState::Open {
            connection,
            channel,
        } = std::mem::replace(&mut *state, LinkState::Closed)
        {
            let _ = channel.close(200, "shutdown").await;
            let _ = connection.close(200, "shutdown").await;
        }
        info!("Broker link closed");
    }

    /// Declares the exchange and queue and binds them with `routing_key`.
    /// All three declarations are idempotent on the broker side, so a failure
    /// aborts without rollback; the whole call is safe to retry.
    pub async fn setup_queue(
        &self,
        queue: &str,
        exchange: &str,
        kind: ExchangeKind,
        routing_key: &str,
        durable: bool,
        args: FieldTable,
    ) -> Result<String, LinkError> {
        let channel = self.ensure_channel().await?;

        channel
            .exchange_declare(
                exchange,
                kind,
                ExchangeDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|source| LinkError::DeclareExchange {
                exchange: exchange.to_string(),
                source,
            })?;

        let declared = channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable,
                    ..Default::default()
                },
                args,
            )
            .await
            .map_err(|source| LinkError::DeclareQueue {
                queue: queue.to_string(),
                source,
            })?;

        channel
            .queue_bind(
                declared.name().as_str(),
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|source| LinkError::Bind {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                source,
            })?;

        info!(
            "Declared queue '{}' bound to exchange '{}' with key '{}'",
            declared.name().as_str(),
            exchange,
            routing_key
        );
        Ok(declared.name().as_str().to_string())
    }

    /// Publishes `message` as persistent JSON. If the channel died underneath
    /// the publish, repairs the link and retries exactly once; the bound
    /// retry keeps a broker outage from turning into a retry storm.
    pub async fn publish<M: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &M,
    ) -> Result<(), LinkError> {
        let payload = serde_json::to_vec(message)?;

        let channel = self.ensure_channel().await?;
        match Self::publish_on(&channel, exchange, routing_key, &payload).await {
            Ok(()) => Ok(()),
            Err(err) if !channel.status().connected() => {
                warn!(
                    "Channel closed during publish, reconnecting for one retry: {}",
                    err
                );
                let channel = self.ensure_channel().await?;
                Self::publish_on(&channel, exchange, routing_key, &payload)
                    .await
                    .map_err(|source| LinkError::Publish {
                        exchange: exchange.to_string(),
                        source,
                    })
            }
            Err(source) => Err(LinkError::Publish {
                exchange: exchange.to_string(),
                source,
            }),
        }
    }

    async fn publish_on(
        channel: &Channel,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), lapin::Error> {
        channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(DELIVERY_MODE_PERSISTENT),
            )
            .await?
            .await?;
        Ok(())
    }

    /// Opens a subscription on `queue`. The returned stream is unbounded and
    /// non-restartable; it ends only when the subscription is canceled or the
    /// channel closes.
    ///
    /// Frames are acknowledged by the broker on handoff (auto-ack): a frame
    /// whose recipient is offline at that instant is dropped, not redelivered.
    pub async fn consume(&self, queue: &str) -> Result<Consumer, LinkError> {
        let mut channel = self.ensure_channel().await?;

        // Probe for the queue first. A failed passive declare closes the
        // channel broker-side, so the fallback declares on a fresh one.
        let probe = channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await;
        if let Err(err) = probe {
            warn!("Queue '{}' missing on probe ({}), declaring it", queue, err);
            channel = self.ensure_channel().await?;
            channel
                .queue_declare(
                    queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|source| LinkError::DeclareQueue {
                    queue: queue.to_string(),
                    source,
                })?;
        }

        let tag = format!("bridge-{}", Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|source| LinkError::Consume {
                queue: queue.to_string(),
                source,
            })?;

        info!("Consuming from queue '{}' as '{}'", queue, tag);
        Ok(consumer)
    }
}
