use metering_client::domain::{NewMeterReading, ValidationStatus};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Envelope published by the ingest API for one meter request.
///
/// Sub-readings stay as raw strings; all interpretation happens in the validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestMessage {
    pub request_id: String,
    pub client_fingerprint: String,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub user_agent: String,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    pub payload: IngestPayload,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestPayload {
    #[serde(rename = "PM", default)]
    pub pm: Vec<RawReading>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawReading {
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub name: String,
}

/// Outbound projection of one stored reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedEvent {
    pub client_id: Uuid,
    pub metric_name: String,
    pub metric_value: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub reading_timestamp: OffsetDateTime,
    pub validation_status: ValidationStatus,
}

impl From<&NewMeterReading> for ProcessedEvent {
    fn from(r: &NewMeterReading) -> Self {
        ProcessedEvent {
            client_id: r.client_id,
            metric_name: r.metric_name.clone(),
            metric_value: r.metric_value,
            reading_timestamp: r.reading_timestamp,
            validation_status: r.validation_status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn decodes_ingest_envelope() {
        let body = br#"{
            "request_id": "req-1",
            "client_fingerprint": "fp-abc",
            "ip_address": "10.1.2.3",
            "user_agent": "meter/2.1",
            "received_at": "2025-12-29T10:31:00Z",
            "payload": { "PM": [
                { "date": "29/12/2025 10:30:45", "data": "[245.5]", "name": "kwh" },
                { "date": "29 10:30:45/12/2025", "data": "1.5", "name": "kvarh" }
            ] }
        }"#;

        let msg: IngestMessage = serde_json::from_slice(body).unwrap();
        assert_eq!(msg.request_id, "req-1");
        assert_eq!(msg.received_at, datetime!(2025-12-29 10:31:00 UTC));
        assert_eq!(msg.payload.pm.len(), 2);
        assert_eq!(msg.payload.pm[0].data, "[245.5]");
        assert_eq!(msg.payload.pm[1].name, "kvarh");
    }

    #[test]
    fn optional_metadata_defaults_to_empty() {
        let body = br#"{
            "request_id": "req-2",
            "client_fingerprint": "fp-abc",
            "received_at": "2025-12-29T10:31:00+07:00",
            "payload": {}
        }"#;

        let msg: IngestMessage = serde_json::from_slice(body).unwrap();
        assert!(msg.ip_address.is_empty());
        assert!(msg.user_agent.is_empty());
        assert!(msg.payload.pm.is_empty());
    }

    #[test]
    fn numeric_data_field_is_malformed() {
        let body = br#"{
            "request_id": "req-3",
            "client_fingerprint": "fp-abc",
            "received_at": "2025-12-29T10:31:00Z",
            "payload": { "PM": [ { "date": "x", "data": 1.5, "name": "kwh" } ] }
        }"#;

        assert!(serde_json::from_slice::<IngestMessage>(body).is_err());
    }

    #[test]
    fn event_serializes_with_wire_names() {
        let event = ProcessedEvent {
            client_id: Uuid::nil(),
            metric_name: "kwh".to_string(),
            metric_value: 12.5,
            reading_timestamp: datetime!(2025-12-29 10:30:45 UTC),
            validation_status: ValidationStatus::Invalid,
        };

        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "client_id": "00000000-0000-0000-0000-000000000000",
                "metric_name": "kwh",
                "metric_value": 12.5,
                "reading_timestamp": "2025-12-29T10:30:45Z",
                "validation_status": "invalid"
            })
        );
    }
}
