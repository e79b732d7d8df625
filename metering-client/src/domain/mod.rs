mod meter_client;
mod meter_reading;

pub use meter_client::{MeterClient, ResolvedClient};
pub use meter_reading::{MeterReading, NewMeterReading, UnknownValidationStatus, ValidationStatus};
