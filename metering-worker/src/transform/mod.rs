//! Pure, side-effect free interpretation of raw meter readings.

pub mod anomaly;
pub mod timestamp;
pub mod validator;

pub use anomaly::AnomalyDetector;
pub use timestamp::{is_within_tolerance, parse_meter_timestamp, TimestampParseError, MAX_TOLERANCE_MINUTES};
pub use validator::{Validation, ValidationOutcome, Validator};
