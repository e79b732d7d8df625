use sqlx::PgExecutor;
use uuid::Uuid;

use crate::domain::{MeterReading, NewMeterReading, ValidationStatus};

pub async fn insert_reading<'e, E>(executor: E, reading: &NewMeterReading) -> Result<Uuid, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_scalar::<_, Uuid>(
        r#"
        INSERT INTO meter_readings_raw (
            client_id, metric_name, metric_value, reading_timestamp,
            received_at, validation_status, anomaly_reason, raw_payload
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING id
        "#,
    )
    .bind(reading.client_id)
    .bind(&reading.metric_name)
    .bind(reading.metric_value)
    .bind(reading.reading_timestamp)
    .bind(reading.received_at)
    .bind(reading.validation_status.as_str())
    .bind(&reading.anomaly_reason)
    .bind(&reading.raw_payload)
    .fetch_one(executor)
    .await
}

/// Values of the most recent valid readings for one client and metric, newest first.
pub async fn recent_valid_values<'e, E>(
    executor: E,
    client_id: Uuid,
    metric_name: &str,
    limit: i64,
) -> Result<Vec<f64>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_scalar::<_, f64>(
        r#"
        SELECT metric_value
        FROM meter_readings_raw
        WHERE client_id = $1
          AND metric_name = $2
          AND validation_status = $3
        ORDER BY reading_timestamp DESC
        LIMIT $4
        "#,
    )
    .bind(client_id)
    .bind(metric_name)
    .bind(ValidationStatus::Valid.as_str())
    .bind(limit)
    .fetch_all(executor)
    .await
}

/// Every stored reading for a client, in receipt order.
pub async fn readings_for_client<'e, E>(executor: E, client_id: Uuid) -> Result<Vec<MeterReading>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_as::<_, MeterReading>(
        r#"
        SELECT
            id,
            client_id,
            metric_name,
            metric_value,
            reading_timestamp,
            received_at,
            validation_status,
            anomaly_reason,
            raw_payload
        FROM meter_readings_raw
        WHERE client_id = $1
        ORDER BY received_at, id
        "#,
    )
    .bind(client_id)
    .fetch_all(executor)
    .await
}
