use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Valid,
    Invalid,
}

impl ValidationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Invalid => "invalid",
        }
    }
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug)]
#[error("unknown validation status '{0}'")]
pub struct UnknownValidationStatus(pub String);

impl TryFrom<String> for ValidationStatus {
    type Error = UnknownValidationStatus;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "valid" => Ok(Self::Valid),
            "invalid" => Ok(Self::Invalid),
            _ => Err(UnknownValidationStatus(s)),
        }
    }
}

/// A stored reading, as read back from `meter_readings_raw`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MeterReading {
    pub id: Uuid,
    pub client_id: Uuid,
    pub metric_name: String,
    pub metric_value: f64,
    pub reading_timestamp: OffsetDateTime,
    pub received_at: OffsetDateTime,
    #[sqlx(try_from = "String")]
    pub validation_status: ValidationStatus,
    pub anomaly_reason: Option<String>,
    pub raw_payload: Vec<u8>,
}

/// A reading about to be inserted. The id is assigned by the database.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMeterReading {
    pub client_id: Uuid,
    pub metric_name: String,
    pub metric_value: f64,
    pub reading_timestamp: OffsetDateTime,
    pub received_at: OffsetDateTime,
    pub validation_status: ValidationStatus,
    pub anomaly_reason: Option<String>,
    pub raw_payload: Vec<u8>,
}
