use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions},
    types::FieldTable,
    BasicProperties, Channel, Connection, ExchangeKind,
};
use crate::pipeline::{EventPublisher, ProcessedEvent, PublishError};

const PERSISTENT: u8 = 2;

fn hash_str(hasher: &mut blake3::Hasher, s: &str) {
    let len = s.len() as u32;
    hasher.update(&len.to_le_bytes());
    hasher.update(s.as_bytes());
}

/// Stable identifier for an event, so downstream consumers can drop
/// duplicates caused by redelivery of the source message.
pub fn event_id(event: &ProcessedEvent) -> String {
    let mut h = blake3::Hasher::new();
    h.update(event.client_id.as_bytes());
    hash_str(&mut h, &event.metric_name);
    h.update(&event.metric_value.to_bits().to_le_bytes());
    h.update(&event.reading_timestamp.unix_timestamp_nanos().to_le_bytes());
    hash_str(&mut h, event.validation_status.as_str());
    h.finalize().to_hex().to_string()
}

/// Publishes processed-reading events to a durable topic exchange, with
/// publisher confirms enabled.
#[derive(Clone)]
pub struct AmqpEventPublisher {
    channel: Channel,
    exchange: String,
    routing_key: String,
}

impl AmqpEventPublisher {
    pub async fn new(connection: &Connection, exchange: &str, routing_key: &str) -> Result<Self, lapin::Error> {
        let channel = connection.create_channel().await?;
        channel.confirm_select(ConfirmSelectOptions::default()).await?;
        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        tracing::info!(exchange, routing_key, "event publisher ready");

        Ok(Self {
            channel,
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        })
    }

    pub async fn close(&self) {
        if let Err(e) = self.channel.close(200, "publisher shutdown").await {
            tracing::warn!(error = %e, "failed to close publisher channel");
        }
    }
}

#[async_trait::async_trait]
impl EventPublisher for AmqpEventPublisher {
    async fn publish(&self, event: &ProcessedEvent) -> Result<(), PublishError> {
        let body = serde_json::to_vec(event)?;
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(PERSISTENT)
            .with_message_id(event_id(event).into());

        let confirmation = self
            .channel
            .basic_publish(
                &self.exchange,
                &self.routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(PublishError::Nacked);
        }

        tracing::debug!(
            routing_key = %self.routing_key,
            client_id = %event.client_id,
            metric_name = %event.metric_name,
            "published processed event"
        );

        Ok(())
    }
}
