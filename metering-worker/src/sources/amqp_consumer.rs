use std::{future::Future, sync::Arc};

use futures::{Stream, StreamExt};
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    Channel, Connection, ExchangeKind,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::pipeline::MessageHandler;

#[derive(thiserror::Error, Debug)]
pub enum ConsumerError {
    #[error("consumer setup failed to {step}: {source}")]
    Setup {
        step: &'static str,
        #[source]
        source: lapin::Error,
    },
    #[error("delivery stream failed: {0}")]
    Stream(#[source] lapin::Error),
    #[error("delivery stream closed by broker")]
    StreamClosed,
}

fn setup(step: &'static str) -> impl FnOnce(lapin::Error) -> ConsumerError {
    move |source| ConsumerError::Setup { step, source }
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    pub dead_letter_queue: String,
    pub prefetch: u16,
    pub consumer_tag: String,
}

/// What happened to a delivery after processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    DeadLetter,
}

/// Settles one delivery with the broker.
#[async_trait::async_trait]
pub trait Acknowledge: Send + Sync {
    async fn acknowledge(&self) -> Result<(), lapin::Error>;

    /// Negative acknowledgement without requeue, which routes to the dead-letter queue.
    async fn dead_letter(&self) -> Result<(), lapin::Error>;
}

#[async_trait::async_trait]
impl Acknowledge for Acker {
    async fn acknowledge(&self) -> Result<(), lapin::Error> {
        self.ack(BasicAckOptions::default()).await
    }

    async fn dead_letter(&self) -> Result<(), lapin::Error> {
        self.nack(BasicNackOptions {
            multiple: false,
            requeue: false,
        })
        .await
    }
}

/// Run the handler on one delivery body and ack or dead-letter it.
///
/// There is no retry: a message that fails once goes straight to the
/// dead-letter queue for out-of-band inspection.
pub async fn settle_delivery<H, A>(handler: &H, body: &[u8], acker: &A) -> Disposition
where
    H: MessageHandler + ?Sized,
    A: Acknowledge + ?Sized,
{
    metrics::counter!("ingest_messages_received_total").increment(1);

    match handler.handle(body).await {
        Ok(summary) => {
            match acker.acknowledge().await {
                Ok(()) => {
                    metrics::counter!("ingest_messages_acked_total").increment(1);
                    debug!(client_id = %summary.client_id, readings = summary.readings, "message acknowledged");
                }
                Err(e) => {
                    // The broker will redeliver; client resolution and history reads are safe to repeat.
                    metrics::counter!("ingest_ack_failures_total").increment(1);
                    error!(error = %e, "failed to ack message");
                }
            }
            Disposition::Ack
        }
        Err(e) => {
            error!(error = %e, body_size = body.len(), "failed to process message, dead-lettering");
            metrics::counter!("ingest_messages_dead_lettered_total").increment(1);
            if let Err(nack_err) = acker.dead_letter().await {
                metrics::counter!("ingest_ack_failures_total").increment(1);
                error!(error = %nack_err, "failed to nack message");
            }
            Disposition::DeadLetter
        }
    }
}

/// Queue arguments that route rejected messages to `dead_letter_queue` through
/// the default exchange.
pub fn dead_letter_arguments(dead_letter_queue: &str) -> FieldTable {
    let mut args = FieldTable::default();
    args.insert("x-dead-letter-exchange".into(), AMQPValue::LongString("".into()));
    args.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(dead_letter_queue.into()),
    );
    args
}

fn durable_queue() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..QueueDeclareOptions::default()
    }
}

async fn open_channel(connection: &Connection, prefetch: u16) -> Result<Channel, ConsumerError> {
    let channel = connection
        .create_channel()
        .await
        .map_err(setup("create channel"))?;
    channel
        .basic_qos(prefetch, BasicQosOptions::default())
        .await
        .map_err(setup("set prefetch"))?;
    Ok(channel)
}

/// Declare exchange, ingest queue, dead-letter queue and binding, returning the
/// channel to consume on.
async fn declare_topology(connection: &Connection, settings: &ConsumerSettings) -> Result<Channel, ConsumerError> {
    let channel = open_channel(connection, settings.prefetch).await?;

    channel
        .exchange_declare(
            &settings.exchange,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(setup("declare ingest exchange"))?;

    let declared = channel
        .queue_declare(
            &settings.queue,
            durable_queue(),
            dead_letter_arguments(&settings.dead_letter_queue),
        )
        .await;

    let channel = match declared {
        Ok(_) => channel,
        Err(e) => {
            // A refused declaration closes the channel, so retry on a fresh one.
            warn!(
                error = %e,
                queue = %settings.queue,
                "failed to declare queue with dead-letter arguments, redeclaring without them"
            );
            let channel = open_channel(connection, settings.prefetch).await?;
            channel
                .queue_declare(&settings.queue, durable_queue(), FieldTable::default())
                .await
                .map_err(setup("declare ingest queue"))?;
            channel
        }
    };

    channel
        .queue_declare(&settings.dead_letter_queue, durable_queue(), FieldTable::default())
        .await
        .map_err(setup("declare dead-letter queue"))?;

    channel
        .queue_bind(
            &settings.queue,
            &settings.exchange,
            &settings.routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(setup("bind ingest queue"))?;

    Ok(channel)
}

/// Owns the ingest subscription: one receive loop, one task per delivery.
///
/// Prefetch bounds the number of unacknowledged deliveries, and with it the
/// number of deliveries processed concurrently.
pub struct IngestConsumer<H> {
    channel: Channel,
    settings: ConsumerSettings,
    handler: Arc<H>,
}

impl<H> IngestConsumer<H>
where
    H: MessageHandler + 'static,
{
    pub async fn declare(
        connection: &Connection,
        settings: ConsumerSettings,
        handler: Arc<H>,
    ) -> Result<Self, ConsumerError> {
        let channel = declare_topology(connection, &settings).await?;

        info!(
            exchange = %settings.exchange,
            queue = %settings.queue,
            dead_letter_queue = %settings.dead_letter_queue,
            routing_key = %settings.routing_key,
            "ingest topology declared"
        );

        Ok(Self {
            channel,
            settings,
            handler,
        })
    }

    /// Consume until `shutdown` fires or the delivery stream fails, then drain
    /// in-flight deliveries and close the channel.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ConsumerError> {
        let deliveries = self
            .channel
            .basic_consume(
                &self.settings.queue,
                &self.settings.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(setup("start consuming"))?;

        info!(
            queue = %self.settings.queue,
            prefetch = self.settings.prefetch,
            "consumer started"
        );

        let stop_receiving = async {
            if let Err(e) = self
                .channel
                .basic_cancel(&self.settings.consumer_tag, BasicCancelOptions::default())
                .await
            {
                warn!(error = %e, "failed to cancel broker consumer");
            }
        };

        let outcome = consume(deliveries, Arc::clone(&self.handler), shutdown, stop_receiving).await;

        // Prefetched deliveries that were never started are requeued by the broker on close.
        if let Err(e) = self.channel.close(200, "consumer shutdown").await {
            warn!(error = %e, "failed to close consumer channel");
        }

        info!("consumer stopped");
        outcome
    }
}

/// A received message: its body and the handle that settles it.
pub trait InboundDelivery: Send + Sync + 'static {
    type Acker: Acknowledge;

    fn body(&self) -> &[u8];

    fn acker(&self) -> &Self::Acker;
}

impl InboundDelivery for Delivery {
    type Acker = Acker;

    fn body(&self) -> &[u8] {
        &self.data
    }

    fn acker(&self) -> &Acker {
        &self.acker
    }
}

/// The receive loop: one tracked task per delivery until `shutdown` fires or
/// the stream ends. `stop_receiving` runs once the loop exits, before waiting
/// for the in-flight tasks, so every started delivery is settled on return.
pub async fn consume<S, D, H, F>(
    mut deliveries: S,
    handler: Arc<H>,
    shutdown: CancellationToken,
    stop_receiving: F,
) -> Result<(), ConsumerError>
where
    S: Stream<Item = Result<D, lapin::Error>> + Unpin,
    D: InboundDelivery,
    H: MessageHandler + 'static,
    F: Future<Output = ()>,
{
    let tracker = TaskTracker::new();

    let outcome = loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!("consumer shutdown requested, stopping receive loop");
                break Ok(());
            }
            next = deliveries.next() => match next {
                Some(Ok(delivery)) => {
                    debug!(body_size = delivery.body().len(), "received message from queue");
                    let handler = Arc::clone(&handler);
                    tracker.spawn(async move {
                        settle_delivery(handler.as_ref(), delivery.body(), delivery.acker()).await;
                    });
                }
                Some(Err(e)) => {
                    error!(error = %e, "delivery stream failed");
                    break Err(ConsumerError::Stream(e));
                }
                None => {
                    warn!("delivery stream closed");
                    break Err(ConsumerError::StreamClosed);
                }
            }
        }
    };

    stop_receiving.await;

    tracker.close();
    info!(in_flight = tracker.len(), "waiting for in-flight deliveries");
    tracker.wait().await;

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use futures::{
        channel::{mpsc, oneshot},
        future::Shared,
        FutureExt,
    };
    use lapin::types::{LongString, ShortString};
    use uuid::Uuid;

    use crate::pipeline::{
        testing::{MemoryRepository, RecordingPublisher},
        MessageProcessor, ProcessError, ProcessSummary,
    };
    use crate::transform::{AnomalyDetector, Validator};

    #[derive(Clone, Default)]
    struct RecordingAcker {
        calls: Arc<Mutex<Vec<Disposition>>>,
    }

    impl RecordingAcker {
        fn calls(&self) -> Vec<Disposition> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Acknowledge for RecordingAcker {
        async fn acknowledge(&self) -> Result<(), lapin::Error> {
            self.calls.lock().unwrap().push(Disposition::Ack);
            Ok(())
        }

        async fn dead_letter(&self) -> Result<(), lapin::Error> {
            self.calls.lock().unwrap().push(Disposition::DeadLetter);
            Ok(())
        }
    }

    struct FixedHandler {
        succeed: bool,
    }

    #[async_trait::async_trait]
    impl MessageHandler for FixedHandler {
        async fn handle(&self, _body: &[u8]) -> Result<ProcessSummary, ProcessError> {
            if self.succeed {
                Ok(ProcessSummary {
                    client_id: Uuid::nil(),
                    readings: 1,
                    invalid: 0,
                    published: 1,
                })
            } else {
                Err(ProcessError::MissingFingerprint)
            }
        }
    }

    #[tokio::test]
    async fn success_is_acked_once() {
        let acker = RecordingAcker::default();
        let d = settle_delivery(&FixedHandler { succeed: true }, b"{}", &acker).await;

        assert_eq!(d, Disposition::Ack);
        assert_eq!(acker.calls(), vec![Disposition::Ack]);
    }

    #[tokio::test]
    async fn failure_is_dead_lettered_without_ack() {
        let acker = RecordingAcker::default();
        let d = settle_delivery(&FixedHandler { succeed: false }, b"{}", &acker).await;

        assert_eq!(d, Disposition::DeadLetter);
        assert_eq!(acker.calls(), vec![Disposition::DeadLetter]);
    }

    #[tokio::test]
    async fn malformed_message_is_dead_lettered() {
        let repo = MemoryRepository::default();
        let processor = MessageProcessor::new(
            repo.clone(),
            RecordingPublisher::default(),
            Validator::new(5),
            AnomalyDetector::new(3.0, 3),
            10,
        );
        let acker = RecordingAcker::default();

        let d = settle_delivery(&processor, b"not json at all", &acker).await;

        assert_eq!(d, Disposition::DeadLetter);
        assert!(repo.clients().is_empty());
    }

    #[tokio::test]
    async fn storage_failure_mid_batch_dead_letters_with_nothing_stored() {
        let repo = MemoryRepository::default();
        repo.fail_insert_number(2);
        let publisher = RecordingPublisher::default();
        let processor = MessageProcessor::new(
            repo.clone(),
            publisher.clone(),
            Validator::new(5),
            AnomalyDetector::new(3.0, 3),
            10,
        );
        let acker = RecordingAcker::default();
        let body = serde_json::to_vec(&serde_json::json!({
            "request_id": "req-9",
            "client_fingerprint": "fp-9",
            "received_at": "2025-12-29T10:31:00Z",
            "payload": { "PM": [
                { "date": "29/12/2025 10:30:00", "data": "1", "name": "kwh" },
                { "date": "29/12/2025 10:30:00", "data": "2", "name": "kwh" },
                { "date": "29/12/2025 10:30:00", "data": "3", "name": "kwh" }
            ] }
        }))
        .unwrap();

        let d = settle_delivery(&processor, &body, &acker).await;

        assert_eq!(d, Disposition::DeadLetter);
        assert_eq!(acker.calls(), vec![Disposition::DeadLetter]);
        assert!(repo.committed().is_empty());
        assert!(publisher.events().is_empty());
    }

    #[test]
    fn dead_letter_arguments_route_through_default_exchange() {
        let args = dead_letter_arguments("ingest.dlq");
        let inner = args.inner();

        assert_eq!(
            inner.get(&ShortString::from("x-dead-letter-exchange")),
            Some(&AMQPValue::LongString(LongString::from("")))
        );
        assert_eq!(
            inner.get(&ShortString::from("x-dead-letter-routing-key")),
            Some(&AMQPValue::LongString(LongString::from("ingest.dlq")))
        );
    }

    struct TestDelivery {
        body: Vec<u8>,
        acker: RecordingAcker,
    }

    impl InboundDelivery for TestDelivery {
        type Acker = RecordingAcker;

        fn body(&self) -> &[u8] {
            &self.body
        }

        fn acker(&self) -> &RecordingAcker {
            &self.acker
        }
    }

    fn delivery(acker: &RecordingAcker) -> Result<TestDelivery, lapin::Error> {
        Ok(TestDelivery {
            body: b"{}".to_vec(),
            acker: acker.clone(),
        })
    }

    /// Succeeds once the gate opens, counting how many calls have started.
    struct GatedHandler {
        started: AtomicUsize,
        gate: Shared<oneshot::Receiver<()>>,
    }

    #[async_trait::async_trait]
    impl MessageHandler for GatedHandler {
        async fn handle(&self, _body: &[u8]) -> Result<ProcessSummary, ProcessError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            let _ = self.gate.clone().await;
            Ok(ProcessSummary {
                client_id: Uuid::nil(),
                readings: 0,
                invalid: 0,
                published: 0,
            })
        }
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_deliveries_to_settle() {
        let (tx, rx) = mpsc::unbounded();
        let (release, gate) = oneshot::channel();
        let handler = Arc::new(GatedHandler {
            started: AtomicUsize::new(0),
            gate: gate.shared(),
        });
        let acker = RecordingAcker::default();
        for _ in 0..3 {
            tx.unbounded_send(delivery(&acker)).unwrap();
        }

        let stopped = Arc::new(Mutex::new(false));
        let stop_flag = Arc::clone(&stopped);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(consume(rx, Arc::clone(&handler), shutdown.clone(), async move {
            *stop_flag.lock().unwrap() = true;
        }));

        while handler.started.load(Ordering::SeqCst) < 3 {
            tokio::task::yield_now().await;
        }
        shutdown.cancel();
        while !*stopped.lock().unwrap() {
            tokio::task::yield_now().await;
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        // Receiving has stopped but the three handlers are still running.
        assert!(!task.is_finished());
        assert!(acker.calls().is_empty());

        release.send(()).unwrap();
        let outcome = task.await.unwrap();

        assert!(outcome.is_ok());
        assert_eq!(acker.calls(), vec![Disposition::Ack; 3]);
        drop(tx);
    }

    #[tokio::test]
    async fn stream_error_stops_loop_after_settling_started_deliveries() {
        let (tx, rx) = mpsc::unbounded();
        let acker = RecordingAcker::default();
        tx.unbounded_send(delivery(&acker)).unwrap();
        tx.unbounded_send(Err(lapin::Error::ChannelsLimitReached)).unwrap();
        tx.unbounded_send(delivery(&acker)).unwrap();

        let mut stop_ran = false;
        let outcome = consume(
            rx,
            Arc::new(FixedHandler { succeed: true }),
            CancellationToken::new(),
            async { stop_ran = true },
        )
        .await;

        assert!(matches!(outcome, Err(ConsumerError::Stream(_))));
        assert!(stop_ran);
        // The delivery after the error is never picked up.
        assert_eq!(acker.calls(), vec![Disposition::Ack]);
        drop(tx);
    }

    #[tokio::test]
    async fn closed_stream_stops_loop() {
        let (tx, rx) = mpsc::unbounded();
        let acker = RecordingAcker::default();
        tx.unbounded_send(delivery(&acker)).unwrap();
        drop(tx);

        let outcome = consume(
            rx,
            Arc::new(FixedHandler { succeed: false }),
            CancellationToken::new(),
            async {},
        )
        .await;

        assert!(matches!(outcome, Err(ConsumerError::StreamClosed)));
        assert_eq!(acker.calls(), vec![Disposition::DeadLetter]);
    }
}
