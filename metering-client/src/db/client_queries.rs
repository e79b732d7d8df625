use sqlx::PgExecutor;
use time::OffsetDateTime;

use crate::domain::{MeterClient, ResolvedClient};

/// Resolve a client by fingerprint, creating it on first sight.
///
/// A single upsert keeps this idempotent under redelivery and concurrent first
/// sightings: an existing row only gets its `last_seen_at` moved forward.
/// Empty `ip_address` / `user_agent` values are stored as NULL.
pub async fn upsert_client<'e, E>(
    executor: E,
    fingerprint: &str,
    ip_address: &str,
    user_agent: Option<&str>,
    seen_at: OffsetDateTime,
) -> Result<ResolvedClient, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_as::<_, ResolvedClient>(
        r#"
        INSERT INTO meter_clients (
            client_fingerprint, ip_address, user_agent,
            first_seen_at, last_seen_at, created_at
        )
        VALUES ($1, NULLIF($2, '')::inet, NULLIF($3, ''), $4, $4, $4)
        ON CONFLICT (client_fingerprint)
            DO UPDATE SET last_seen_at = EXCLUDED.last_seen_at
        RETURNING
            id,
            client_fingerprint,
            host(ip_address) AS ip_address,
            user_agent,
            first_seen_at,
            last_seen_at,
            created_at,
            (xmax = 0) AS inserted
        "#,
    )
    .bind(fingerprint)
    .bind(ip_address)
    .bind(user_agent)
    .bind(seen_at)
    .fetch_one(executor)
    .await
}

pub async fn find_client_by_fingerprint<'e, E>(
    executor: E,
    fingerprint: &str,
) -> Result<Option<MeterClient>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_as::<_, MeterClient>(
        r#"
        SELECT
            id,
            client_fingerprint,
            host(ip_address) AS ip_address,
            user_agent,
            first_seen_at,
            last_seen_at,
            created_at
        FROM meter_clients
        WHERE client_fingerprint = $1
        "#,
    )
    .bind(fingerprint)
    .fetch_optional(executor)
    .await
}
