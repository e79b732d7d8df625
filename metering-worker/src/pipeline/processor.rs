use std::time::Instant;

use metering_client::domain::{NewMeterReading, ValidationStatus};
use time::OffsetDateTime;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use super::{
    EventPublisher, IngestMessage, MessageHandler, ProcessError, ProcessedEvent, RawReading,
    ReadingRepository, ReadingTransaction,
};
use crate::transform::{AnomalyDetector, ValidationOutcome, Validator};

/// What a successfully processed message produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSummary {
    pub client_id: Uuid,
    pub readings: usize,
    pub invalid: usize,
    pub published: usize,
}

/// Turns one raw ingest message into stored readings and outbound events.
///
/// Flow:
/// 1. Decode the envelope (undecodable bodies fail without side effects)
/// 2. Resolve the client by fingerprint
/// 3. Validate and anomaly-check every sub-reading, inserting each one,
///    valid or not, inside a single transaction
/// 4. Commit, or roll the whole batch back on the first insert error
/// 5. Publish one event per stored reading; publish failures are logged only
pub struct MessageProcessor<R, P> {
    repository: R,
    publisher: P,
    validator: Validator,
    detector: AnomalyDetector,
    history_window: usize,
}

impl<R, P> MessageProcessor<R, P>
where
    R: ReadingRepository,
    P: EventPublisher,
{
    pub fn new(
        repository: R,
        publisher: P,
        validator: Validator,
        detector: AnomalyDetector,
        history_window: usize,
    ) -> Self {
        Self {
            repository,
            publisher,
            validator,
            detector,
            history_window,
        }
    }

    pub async fn process(&self, body: &[u8]) -> Result<ProcessSummary, ProcessError> {
        let started = Instant::now();

        let msg: IngestMessage = serde_json::from_slice(body)?;
        let span = tracing::info_span!("message", request_id = %msg.request_id);
        let result = self.process_message(&msg, body).instrument(span).await;

        metrics::histogram!("message_processing_seconds").record(started.elapsed().as_secs_f64());
        result
    }

    async fn process_message(&self, msg: &IngestMessage, body: &[u8]) -> Result<ProcessSummary, ProcessError> {
        if msg.client_fingerprint.is_empty() {
            return Err(ProcessError::MissingFingerprint);
        }

        info!(
            client_fingerprint = %msg.client_fingerprint,
            pm_count = msg.payload.pm.len(),
            "processing message"
        );

        let user_agent = (!msg.user_agent.is_empty()).then_some(msg.user_agent.as_str());
        let resolved = self
            .repository
            .resolve_client(&msg.client_fingerprint, &msg.ip_address, user_agent)
            .await
            .map_err(|e| {
                error!(error = %e, "failed to get or create client");
                ProcessError::ClientResolution(e)
            })?;

        let client_id = resolved.client.id;
        if resolved.inserted {
            info!(%client_id, "registered new client");
        } else {
            debug!(%client_id, "client resolved");
        }

        let mut tx = self.repository.begin().await.map_err(|e| {
            error!(error = %e, "failed to begin transaction");
            ProcessError::Transaction(e)
        })?;

        let mut readings = Vec::with_capacity(msg.payload.pm.len());
        for raw in &msg.payload.pm {
            let reading = self.assess(client_id, raw, msg.received_at, body).await;

            if let Err(source) = tx.insert_reading(&reading).await {
                error!(
                    error = %source,
                    metric_name = %raw.name,
                    "failed to persist reading, rolling back batch"
                );
                if let Err(e) = tx.rollback().await {
                    warn!(error = %e, "explicit rollback failed, transaction discarded");
                }
                return Err(ProcessError::Persist {
                    metric_name: raw.name.clone(),
                    source,
                });
            }

            readings.push(reading);
        }

        tx.commit().await.map_err(|e| {
            error!(error = %e, "failed to commit transaction");
            ProcessError::Commit(e)
        })?;

        let invalid = readings
            .iter()
            .filter(|r| r.validation_status == ValidationStatus::Invalid)
            .count();
        metrics::counter!("readings_persisted_total", "status" => "valid")
            .increment((readings.len() - invalid) as u64);
        metrics::counter!("readings_persisted_total", "status" => "invalid").increment(invalid as u64);

        // Storage is the durability boundary; events are best-effort from here on.
        let published = self.publish_all(&readings).await;

        info!(
            readings_count = readings.len(),
            invalid,
            published,
            "message processed successfully"
        );

        Ok(ProcessSummary {
            client_id,
            readings: readings.len(),
            invalid,
            published,
        })
    }

    async fn assess(
        &self,
        client_id: Uuid,
        raw: &RawReading,
        received_at: OffsetDateTime,
        body: &[u8],
    ) -> NewMeterReading {
        let validation = self.validator.validate(&raw.name, &raw.data, &raw.date, received_at);

        let (validation_status, anomaly_reason) = match validation.outcome {
            ValidationOutcome::Invalid { reason } => {
                debug!(metric_name = %raw.name, %reason, "reading failed validation");
                (ValidationStatus::Invalid, Some(reason))
            }
            ValidationOutcome::Valid { value, .. } => match self.check_anomaly(client_id, &raw.name, value).await {
                Some(reason) => (ValidationStatus::Invalid, Some(reason)),
                None => (ValidationStatus::Valid, None),
            },
        };

        NewMeterReading {
            client_id,
            metric_name: raw.name.clone(),
            metric_value: validation.value,
            // Unparseable claimed timestamps fall back to the receipt time.
            reading_timestamp: validation.timestamp.unwrap_or(received_at),
            received_at,
            validation_status,
            anomaly_reason,
            raw_payload: body.to_vec(),
        }
    }

    async fn check_anomaly(&self, client_id: Uuid, metric_name: &str, value: f64) -> Option<String> {
        let history = match self
            .repository
            .recent_valid_values(client_id, metric_name, self.history_window)
            .await
        {
            Ok(history) => history,
            Err(e) => {
                warn!(
                    error = %e,
                    metric_name,
                    "failed to get historical readings, skipping anomaly detection"
                );
                return None;
            }
        };

        let reason = self.detector.detect(value, &history)?;
        metrics::counter!("readings_anomalies_total").increment(1);
        debug!(metric_name, value, %reason, "anomaly detected");
        Some(reason)
    }

    async fn publish_all(&self, readings: &[NewMeterReading]) -> usize {
        let mut published = 0;

        for reading in readings {
            let event = ProcessedEvent::from(reading);
            match self.publisher.publish(&event).await {
                Ok(()) => {
                    metrics::counter!("events_published_total").increment(1);
                    published += 1;
                }
                Err(e) => {
                    metrics::counter!("events_publish_failures_total").increment(1);
                    error!(
                        error = %e,
                        client_id = %event.client_id,
                        metric_name = %event.metric_name,
                        "failed to publish event"
                    );
                }
            }
        }

        published
    }
}

#[async_trait::async_trait]
impl<R, P> MessageHandler for MessageProcessor<R, P>
where
    R: ReadingRepository,
    P: EventPublisher,
{
    async fn handle(&self, body: &[u8]) -> Result<ProcessSummary, ProcessError> {
        self.process(body).await
    }
}
