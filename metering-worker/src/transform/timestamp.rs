use time::{
    format_description::{well_known::Rfc3339, BorrowedFormatItem},
    macros::format_description,
    Duration, OffsetDateTime, PrimitiveDateTime, UtcOffset,
};

/// Wall-clock formats without an offset, interpreted as UTC. Tried in order,
/// before falling back to RFC 3339.
const NAIVE_FORMATS: &[&[BorrowedFormatItem<'static>]] = &[
    // DD/MM/YYYY hh:mm:ss
    format_description!("[day]/[month]/[year] [hour]:[minute]:[second]"),
    // DD hh:mm:ss/MM/YYYY
    format_description!("[day] [hour]:[minute]:[second]/[month]/[year]"),
];

#[derive(thiserror::Error, Debug)]
#[error("failed to parse timestamp '{input}': {last_error}")]
pub struct TimestampParseError {
    pub input: String,
    #[source]
    pub last_error: time::error::Parse,
}

/// Parse a meter-reported timestamp into a UTC instant.
///
/// The first format that parses wins; the error carries the failure of the
/// last attempt (RFC 3339).
pub fn parse_meter_timestamp(input: &str) -> Result<OffsetDateTime, TimestampParseError> {
    for items in NAIVE_FORMATS {
        if let Ok(ts) = PrimitiveDateTime::parse(input, *items) {
            return Ok(ts.assume_utc());
        }
    }

    OffsetDateTime::parse(input, &Rfc3339)
        .map(|ts| ts.to_offset(UtcOffset::UTC))
        .map_err(|last_error| TimestampParseError {
            input: input.to_string(),
            last_error,
        })
}

/// Largest tolerance that still fits a `Duration` in seconds.
pub const MAX_TOLERANCE_MINUTES: i64 = i64::MAX / 60;

/// Whether `reading` lies within `tolerance_minutes` of `received`, boundary inclusive.
///
/// Tolerances past [`MAX_TOLERANCE_MINUTES`] accept every timestamp.
pub fn is_within_tolerance(reading: OffsetDateTime, received: OffsetDateTime, tolerance_minutes: i64) -> bool {
    match tolerance_minutes.checked_mul(60) {
        Some(seconds) => (reading - received).abs() <= Duration::seconds(seconds),
        None => true,
    }
}
