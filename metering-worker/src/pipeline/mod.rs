//! Per-message ingest pipeline: the envelope types, the storage and publish
//! seams it depends on, and the processor that ties them together.

mod message;
mod processor;
#[cfg(test)]
pub(crate) mod testing;

use metering_client::domain::{NewMeterReading, ResolvedClient};
use uuid::Uuid;

pub use message::{IngestMessage, IngestPayload, ProcessedEvent, RawReading};
pub use processor::{MessageProcessor, ProcessSummary};

#[derive(thiserror::Error, Debug)]
pub enum RepositoryError {
    #[error("failed to resolve client: {0}")]
    ResolveClient(#[source] sqlx::Error),
    #[error("failed to begin transaction: {0}")]
    Begin(#[source] sqlx::Error),
    #[error("failed to insert meter reading: {0}")]
    Insert(#[source] sqlx::Error),
    #[error("failed to query recent readings: {0}")]
    History(#[source] sqlx::Error),
    #[error("failed to commit transaction: {0}")]
    Commit(#[source] sqlx::Error),
    #[error("failed to roll back transaction: {0}")]
    Rollback(#[source] sqlx::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum PublishError {
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to publish event: {0}")]
    Broker(#[from] lapin::Error),
    #[error("broker refused the event")]
    Nacked,
}

/// Why a message could not be processed. Every variant dead-letters the message.
#[derive(thiserror::Error, Debug)]
pub enum ProcessError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("message has an empty client fingerprint")]
    MissingFingerprint,
    #[error("client resolution failed: {0}")]
    ClientResolution(#[source] RepositoryError),
    #[error("could not open batch transaction: {0}")]
    Transaction(#[source] RepositoryError),
    #[error("reading '{metric_name}' could not be stored: {source}")]
    Persist {
        metric_name: String,
        #[source]
        source: RepositoryError,
    },
    #[error("batch commit failed: {0}")]
    Commit(#[source] RepositoryError),
}

/// Client registry and reading store facets of the database.
#[async_trait::async_trait]
pub trait ReadingRepository: Send + Sync {
    type Tx: ReadingTransaction;

    /// Resolve a client by fingerprint, creating it on first sight and
    /// touching `last_seen_at` otherwise.
    async fn resolve_client(
        &self,
        fingerprint: &str,
        ip_address: &str,
        user_agent: Option<&str>,
    ) -> Result<ResolvedClient, RepositoryError>;

    /// Most recent valid values for a client and metric, newest first.
    async fn recent_valid_values(
        &self,
        client_id: Uuid,
        metric_name: &str,
        limit: usize,
    ) -> Result<Vec<f64>, RepositoryError>;

    async fn begin(&self) -> Result<Self::Tx, RepositoryError>;
}

/// One all-or-nothing batch of reading inserts. Dropping it without `commit`
/// discards every insert.
#[async_trait::async_trait]
pub trait ReadingTransaction: Send {
    async fn insert_reading(&mut self, reading: &NewMeterReading) -> Result<Uuid, RepositoryError>;

    async fn commit(self) -> Result<(), RepositoryError>;

    async fn rollback(self) -> Result<(), RepositoryError>;
}

#[async_trait::async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &ProcessedEvent) -> Result<(), PublishError>;
}

/// Processes one raw delivery body. The consumer acks on `Ok` and
/// dead-letters on `Err`.
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, body: &[u8]) -> Result<ProcessSummary, ProcessError>;
}
