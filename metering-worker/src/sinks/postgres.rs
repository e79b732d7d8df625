use metering_client::{
    db::{client_queries, reading_queries},
    domain::{NewMeterReading, ResolvedClient},
};
use sqlx::{postgres::PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::pipeline::{ReadingRepository, ReadingTransaction, RepositoryError};

/// Postgres-backed client registry and reading store.
#[derive(Clone)]
pub struct PgReadingRepository {
    pool: PgPool,
}

impl PgReadingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ReadingRepository for PgReadingRepository {
    type Tx = PgReadingTransaction;

    async fn resolve_client(
        &self,
        fingerprint: &str,
        ip_address: &str,
        user_agent: Option<&str>,
    ) -> Result<ResolvedClient, RepositoryError> {
        client_queries::upsert_client(
            &self.pool,
            fingerprint,
            ip_address,
            user_agent,
            OffsetDateTime::now_utc(),
        )
        .await
        .map_err(RepositoryError::ResolveClient)
    }

    async fn recent_valid_values(
        &self,
        client_id: Uuid,
        metric_name: &str,
        limit: usize,
    ) -> Result<Vec<f64>, RepositoryError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        reading_queries::recent_valid_values(&self.pool, client_id, metric_name, limit)
            .await
            .map_err(RepositoryError::History)
    }

    async fn begin(&self) -> Result<PgReadingTransaction, RepositoryError> {
        let tx = self.pool.begin().await.map_err(RepositoryError::Begin)?;
        Ok(PgReadingTransaction { tx })
    }
}

/// Wraps a pooled transaction; sqlx rolls it back if dropped uncommitted.
pub struct PgReadingTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait::async_trait]
impl ReadingTransaction for PgReadingTransaction {
    async fn insert_reading(&mut self, reading: &NewMeterReading) -> Result<Uuid, RepositoryError> {
        reading_queries::insert_reading(&mut *self.tx, reading)
            .await
            .map_err(RepositoryError::Insert)
    }

    async fn commit(self) -> Result<(), RepositoryError> {
        self.tx.commit().await.map_err(RepositoryError::Commit)
    }

    async fn rollback(self) -> Result<(), RepositoryError> {
        self.tx.rollback().await.map_err(RepositoryError::Rollback)
    }
}
