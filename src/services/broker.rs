//! Confirmed-publish AMQP wire for notification payloads.
//!
//! One long-lived connection with a publisher-confirms channel. Topology
//! is declared idempotently on every (re)connect. Reconnection uses a
//! linearly increasing backoff and is serialized by an `is_connecting`
//! guard; a publish that cannot get a channel fails so the caller can
//! route the payload to the fallback store.

use crate::error::AppError;
use crate::models::NotificationPayload;
use crate::services::metrics;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use lapin::{
    options::{
        BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{error, info, warn};

pub const NOTIFICATION_EXCHANGE: &str = "notifications";
pub const NOTIFICATION_QUEUE: &str = "notifications.renewal";
pub const DLQ_EXCHANGE: &str = "notifications.dlq";
pub const DLQ_QUEUE: &str = "notifications.dlq";
pub const DLQ_ROUTING_KEY: &str = "dlq";

const SOURCE_HEADER: &str = "renewal-service";
const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(5);
const RECONNECT_MAX_ATTEMPTS: u32 = 10;
const PUBLISH_RETRY_ATTEMPTS: u32 = 3;
const PUBLISH_RETRY_DELAY: Duration = Duration::from_secs(5);

/// How many publishes the batch fan-out keeps in flight at once.
pub const SEND_BATCH_CONCURRENCY: usize = 10;

#[async_trait]
pub trait NotificationBroker: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Publish one payload and await the broker ack. `retry_count` lands
    /// in the `x-retry-count` header.
    async fn publish(&self, payload: &NotificationPayload, retry_count: u32)
        -> Result<(), AppError>;
}

struct BrokerHandles {
    connection: Connection,
    channel: Channel,
}

pub struct AmqpBroker {
    uri: String,
    handles: RwLock<Option<BrokerHandles>>,
    is_connecting: AtomicBool,
}

impl AmqpBroker {
    pub fn new(uri: String) -> Self {
        Self {
            uri,
            handles: RwLock::new(None),
            is_connecting: AtomicBool::new(false),
        }
    }

    /// Open the connection and confirm channel, declaring topology.
    pub async fn connect(&self) -> Result<(), AppError> {
        let connection =
            Connection::connect(&self.uri, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        declare_topology(&channel).await?;

        *self.handles.write().expect("broker lock poisoned") = Some(BrokerHandles {
            connection,
            channel,
        });

        info!("AMQP connection established");
        Ok(())
    }

    /// Reconnect with linearly increasing backoff, serialized across tasks.
    async fn ensure_connected(&self) -> Result<(), AppError> {
        if self.is_connected() {
            return Ok(());
        }

        if self
            .is_connecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AppError::BrokerError(anyhow::anyhow!(
                "Reconnect already in progress"
            )));
        }

        let mut result = Err(AppError::BrokerError(anyhow::anyhow!(
            "AMQP reconnect attempts exhausted"
        )));
        for attempt in 1..=RECONNECT_MAX_ATTEMPTS {
            match self.connect().await {
                Ok(()) => {
                    result = Ok(());
                    break;
                }
                Err(e) => {
                    let delay = RECONNECT_BASE_DELAY * attempt;
                    warn!(
                        attempt = attempt,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "AMQP reconnect failed"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        self.is_connecting.store(false, Ordering::SeqCst);
        result
    }

    fn channel(&self) -> Option<Channel> {
        self.handles
            .read()
            .expect("broker lock poisoned")
            .as_ref()
            .map(|h| h.channel.clone())
    }

    pub async fn close(&self) {
        let handles = self.handles.write().expect("broker lock poisoned").take();
        if let Some(handles) = handles {
            if let Err(e) = handles.channel.close(200, "shutdown").await {
                warn!(error = %e, "Failed to close AMQP channel");
            }
            if let Err(e) = handles.connection.close(200, "shutdown").await {
                warn!(error = %e, "Failed to close AMQP connection");
            }
        }
    }
}

async fn declare_topology(channel: &Channel) -> Result<(), AppError> {
    let durable = ExchangeDeclareOptions {
        durable: true,
        ..Default::default()
    };

    channel
        .exchange_declare(
            NOTIFICATION_EXCHANGE,
            ExchangeKind::Topic,
            durable,
            FieldTable::default(),
        )
        .await?;
    channel
        .exchange_declare(
            DLQ_EXCHANGE,
            ExchangeKind::Topic,
            durable,
            FieldTable::default(),
        )
        .await?;

    let mut main_args = FieldTable::default();
    main_args.insert(
        ShortString::from("x-dead-letter-exchange"),
        AMQPValue::LongString(DLQ_EXCHANGE.into()),
    );
    main_args.insert(
        ShortString::from("x-dead-letter-routing-key"),
        AMQPValue::LongString(DLQ_ROUTING_KEY.into()),
    );
    main_args.insert(
        ShortString::from("x-max-length"),
        AMQPValue::LongInt(1_000_000),
    );
    main_args.insert(
        ShortString::from("x-overflow"),
        AMQPValue::LongString("reject-publish".into()),
    );
    channel
        .queue_declare(
            NOTIFICATION_QUEUE,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            main_args,
        )
        .await?;

    let mut dlq_args = FieldTable::default();
    dlq_args.insert(
        ShortString::from("x-message-ttl"),
        AMQPValue::LongInt(86_400_000),
    );
    dlq_args.insert(ShortString::from("x-max-length"), AMQPValue::LongInt(10_000));
    channel
        .queue_declare(
            DLQ_QUEUE,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            dlq_args,
        )
        .await?;

    channel
        .queue_bind(
            NOTIFICATION_QUEUE,
            NOTIFICATION_EXCHANGE,
            "#",
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;
    channel
        .queue_bind(
            DLQ_QUEUE,
            DLQ_EXCHANGE,
            DLQ_ROUTING_KEY,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

    Ok(())
}

fn envelope_properties(payload: &NotificationPayload, retry_count: u32) -> BasicProperties {
    let mut headers = FieldTable::default();
    headers.insert(
        ShortString::from("x-retry-count"),
        AMQPValue::LongInt(retry_count as i32),
    );
    headers.insert(
        ShortString::from("x-original-timestamp"),
        AMQPValue::LongString(payload.timestamp.to_rfc3339().into()),
    );
    headers.insert(
        ShortString::from("x-source"),
        AMQPValue::LongString(SOURCE_HEADER.into()),
    );

    BasicProperties::default()
        .with_content_type(ShortString::from("application/json"))
        .with_delivery_mode(2)
        .with_message_id(ShortString::from(payload.id.to_string()))
        .with_headers(headers)
}

#[async_trait]
impl NotificationBroker for AmqpBroker {
    fn is_connected(&self) -> bool {
        self.handles
            .read()
            .expect("broker lock poisoned")
            .as_ref()
            .map(|h| h.connection.status().connected())
            .unwrap_or(false)
    }

    async fn publish(
        &self,
        payload: &NotificationPayload,
        retry_count: u32,
    ) -> Result<(), AppError> {
        let body = serde_json::to_vec(payload)?;
        let properties = envelope_properties(payload, retry_count);

        let mut last_error = AppError::BrokerError(anyhow::anyhow!("Publish attempts exhausted"));
        for attempt in 1..=PUBLISH_RETRY_ATTEMPTS {
            let channel = match self.channel() {
                Some(c) => c,
                None => {
                    self.ensure_connected().await?;
                    match self.channel() {
                        Some(c) => c,
                        None => {
                            return Err(AppError::BrokerError(anyhow::anyhow!(
                                "AMQP channel unavailable"
                            )))
                        }
                    }
                }
            };

            let published = async {
                let confirm = channel
                    .basic_publish(
                        NOTIFICATION_EXCHANGE,
                        &payload.event_type,
                        BasicPublishOptions::default(),
                        &body,
                        properties.clone(),
                    )
                    .await?
                    .await?;
                Ok::<Confirmation, lapin::Error>(confirm)
            }
            .await;

            match published {
                Ok(Confirmation::Nack(_)) => {
                    return Err(AppError::BrokerError(anyhow::anyhow!(
                        "Broker nacked message {}",
                        payload.id
                    )));
                }
                Ok(_) => return Ok(()),
                Err(e) => {
                    warn!(
                        attempt = attempt,
                        message_id = %payload.id,
                        error = %e,
                        "AMQP publish failed"
                    );
                    last_error = AppError::from(e);
                    // A dead connection means the channel is stale; drop it
                    // so the next attempt reconnects instead of respinning.
                    if !self.is_connected() {
                        self.handles.write().expect("broker lock poisoned").take();
                    }
                    if attempt < PUBLISH_RETRY_ATTEMPTS {
                        tokio::time::sleep(PUBLISH_RETRY_DELAY).await;
                    }
                }
            }
        }

        Err(last_error)
    }
}

/// Publish a batch with bounded fan-out. Returns the payloads that could
/// not be delivered so the caller can write them to the fallback store.
pub async fn send_batch(
    broker: &dyn NotificationBroker,
    batch: Vec<NotificationPayload>,
) -> Vec<NotificationPayload> {
    let failed: Vec<Option<NotificationPayload>> = stream::iter(batch.into_iter().map(|payload| {
        async move {
            match broker.publish(&payload, 0).await {
                Ok(()) => {
                    metrics::record_notification("published");
                    None
                }
                Err(e) => {
                    error!(
                        message_id = %payload.id,
                        subscription_id = %payload.subscription_id,
                        error = %e,
                        "Notification publish failed, routing to fallback"
                    );
                    Some(payload)
                }
            }
        }
    }))
    .buffer_unordered(SEND_BATCH_CONCURRENCY)
    .collect()
    .await;

    failed.into_iter().flatten().collect()
}
