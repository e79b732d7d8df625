use time::OffsetDateTime;
use uuid::Uuid;

/// A reporting source, identified by the fingerprint it sends with every message.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct MeterClient {
    pub id: Uuid,
    pub client_fingerprint: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub first_seen_at: OffsetDateTime,
    pub last_seen_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
}

/// Result of resolving a fingerprint: the client row and whether this call created it.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ResolvedClient {
    #[sqlx(flatten)]
    pub client: MeterClient,
    pub inserted: bool,
}
