//! In-memory doubles for the repository and publisher seams.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use metering_client::domain::{MeterClient, NewMeterReading, ResolvedClient, ValidationStatus};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{EventPublisher, ProcessedEvent, PublishError, ReadingRepository, ReadingTransaction, RepositoryError};

fn injected(what: &str) -> sqlx::Error {
    sqlx::Error::Protocol(format!("injected {what} failure"))
}

#[derive(Default)]
struct MemoryState {
    clients: HashMap<String, MeterClient>,
    committed: Vec<NewMeterReading>,
    inserts: usize,
    fail_insert_number: Option<usize>,
    fail_commit: bool,
    fail_history: bool,
    rollbacks: usize,
}

#[derive(Clone, Default)]
pub struct MemoryRepository {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryRepository {
    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap()
    }

    /// Fail the n-th insert (1-based) across all transactions.
    pub fn fail_insert_number(&self, n: usize) {
        self.lock().fail_insert_number = Some(n);
    }

    pub fn fail_commit(&self) {
        self.lock().fail_commit = true;
    }

    pub fn fail_history(&self) {
        self.lock().fail_history = true;
    }

    pub fn committed(&self) -> Vec<NewMeterReading> {
        self.lock().committed.clone()
    }

    pub fn clients(&self) -> Vec<MeterClient> {
        self.lock().clients.values().cloned().collect()
    }

    pub fn rollbacks(&self) -> usize {
        self.lock().rollbacks
    }
}

#[async_trait::async_trait]
impl ReadingRepository for MemoryRepository {
    type Tx = MemoryTransaction;

    async fn resolve_client(
        &self,
        fingerprint: &str,
        ip_address: &str,
        user_agent: Option<&str>,
    ) -> Result<ResolvedClient, RepositoryError> {
        let now = OffsetDateTime::now_utc();
        let mut state = self.lock();

        if let Some(client) = state.clients.get_mut(fingerprint) {
            client.last_seen_at = now;
            return Ok(ResolvedClient {
                client: client.clone(),
                inserted: false,
            });
        }

        let client = MeterClient {
            id: Uuid::new_v4(),
            client_fingerprint: fingerprint.to_string(),
            ip_address: (!ip_address.is_empty()).then(|| ip_address.to_string()),
            user_agent: user_agent.map(str::to_string),
            first_seen_at: now,
            last_seen_at: now,
            created_at: now,
        };
        state.clients.insert(fingerprint.to_string(), client.clone());
        Ok(ResolvedClient { client, inserted: true })
    }

    async fn recent_valid_values(
        &self,
        client_id: Uuid,
        metric_name: &str,
        limit: usize,
    ) -> Result<Vec<f64>, RepositoryError> {
        let state = self.lock();
        if state.fail_history {
            return Err(RepositoryError::History(injected("history")));
        }

        let mut matching: Vec<&NewMeterReading> = state
            .committed
            .iter()
            .filter(|r| {
                r.client_id == client_id
                    && r.metric_name == metric_name
                    && r.validation_status == ValidationStatus::Valid
            })
            .collect();
        matching.sort_by(|a, b| b.reading_timestamp.cmp(&a.reading_timestamp));

        Ok(matching.into_iter().take(limit).map(|r| r.metric_value).collect())
    }

    async fn begin(&self) -> Result<MemoryTransaction, RepositoryError> {
        Ok(MemoryTransaction {
            state: self.state.clone(),
            pending: Vec::new(),
        })
    }
}

pub struct MemoryTransaction {
    state: Arc<Mutex<MemoryState>>,
    pending: Vec<NewMeterReading>,
}

#[async_trait::async_trait]
impl ReadingTransaction for MemoryTransaction {
    async fn insert_reading(&mut self, reading: &NewMeterReading) -> Result<Uuid, RepositoryError> {
        let mut state = self.state.lock().unwrap();
        state.inserts += 1;
        if state.fail_insert_number == Some(state.inserts) {
            return Err(RepositoryError::Insert(injected("insert")));
        }
        self.pending.push(reading.clone());
        Ok(Uuid::new_v4())
    }

    async fn commit(self) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_commit {
            return Err(RepositoryError::Commit(injected("commit")));
        }
        state.committed.extend(self.pending);
        Ok(())
    }

    async fn rollback(self) -> Result<(), RepositoryError> {
        self.state.lock().unwrap().rollbacks += 1;
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct RecordingPublisher {
    events: Arc<Mutex<Vec<ProcessedEvent>>>,
    fail_metric: Option<String>,
}

impl RecordingPublisher {
    /// Refuses every event for `metric_name`, accepts the rest.
    pub fn failing_for(metric_name: &str) -> Self {
        Self {
            events: Arc::default(),
            fail_metric: Some(metric_name.to_string()),
        }
    }

    pub fn events(&self) -> Vec<ProcessedEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, event: &ProcessedEvent) -> Result<(), PublishError> {
        if self.fail_metric.as_deref() == Some(event.metric_name.as_str()) {
            return Err(PublishError::Nacked);
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}
