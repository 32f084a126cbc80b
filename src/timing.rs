use chrono::{DateTime, TimeZone, Utc};
use std::time::Instant;

pub fn elapsed_ms(start: Instant) -> u64 {
    let duration = start.elapsed();
    let ms = duration.as_millis();
    u64::try_from(ms).map_or(u64::MAX, |value| value)
}

/// Storage representation of a timestamp.
#[must_use]
pub fn dt_to_ms(value: DateTime<Utc>) -> i64 {
    value.timestamp_millis()
}

#[must_use]
pub fn ms_to_dt(value: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(value)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
