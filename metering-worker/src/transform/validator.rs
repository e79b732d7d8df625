use time::OffsetDateTime;

use super::timestamp::{is_within_tolerance, parse_meter_timestamp};

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    Valid { value: f64, timestamp: OffsetDateTime },
    Invalid { reason: String },
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid { .. })
    }
}

/// Result of validating one raw reading.
///
/// `value` and `timestamp` carry whatever could be interpreted before the first
/// failing rule, so rejected readings can still be stored for audit.
#[derive(Debug, Clone, PartialEq)]
pub struct Validation {
    pub value: f64,
    pub timestamp: Option<OffsetDateTime>,
    pub outcome: ValidationOutcome,
}

impl Validation {
    fn invalid(value: f64, timestamp: Option<OffsetDateTime>, reason: impl Into<String>) -> Self {
        Self {
            value,
            timestamp,
            outcome: ValidationOutcome::Invalid { reason: reason.into() },
        }
    }
}

/// Structural and value checks for a single meter reading.
///
/// Rules, first failure wins:
/// - metric name must be non-empty.
/// - value (optionally wrapped in one pair of `[` `]`) must be a finite number.
/// - value must be non-negative.
/// - date must parse with one of the known meter formats.
/// - date must lie within the tolerance window around the receipt time.
#[derive(Debug, Clone, Copy)]
pub struct Validator {
    tolerance_minutes: i64,
}

impl Validator {
    pub fn new(tolerance_minutes: i64) -> Self {
        Self { tolerance_minutes }
    }

    pub fn validate(
        &self,
        metric_name: &str,
        raw_value: &str,
        raw_date: &str,
        received_at: OffsetDateTime,
    ) -> Validation {
        if metric_name.is_empty() {
            return Validation::invalid(0.0, None, "empty metric name");
        }

        let value = match parse_metric_value(raw_value) {
            Ok(v) => v,
            Err(e) => return Validation::invalid(0.0, None, format!("invalid metric value: {e}")),
        };

        if value < 0.0 {
            return Validation::invalid(value, None, "negative value detected");
        }

        let timestamp = match parse_meter_timestamp(raw_date) {
            Ok(ts) => ts,
            Err(e) => return Validation::invalid(value, None, format!("invalid timestamp format: {e}")),
        };

        if !is_within_tolerance(timestamp, received_at, self.tolerance_minutes) {
            return Validation::invalid(
                value,
                Some(timestamp),
                format!(
                    "timestamp outside tolerance window (±{} minutes)",
                    self.tolerance_minutes
                ),
            );
        }

        Validation {
            value,
            timestamp: Some(timestamp),
            outcome: ValidationOutcome::Valid { value, timestamp },
        }
    }
}

fn strip_brackets(raw: &str) -> &str {
    raw.strip_prefix('[')
        .and_then(|inner| inner.strip_suffix(']'))
        .unwrap_or(raw)
}

fn parse_metric_value(raw: &str) -> Result<f64, String> {
    let trimmed = strip_brackets(raw);
    let value: f64 = trimmed
        .parse()
        .map_err(|e: std::num::ParseFloatError| format!("parsing '{trimmed}': {e}"))?;

    if !value.is_finite() {
        return Err(format!("parsing '{trimmed}': value is not finite"));
    }

    Ok(value)
}
