use chrono::{DateTime, Utc};
use std::time::SystemTime;

/// Seconds from 1601-01-01 (the FILETIME epoch) to 1970-01-01.
const FILETIME_UNIX_OFFSET_SECS: i64 = 11_644_473_600;
const TICKS_PER_SEC: i64 = 10_000_000;

/// Converts a Windows FILETIME (100-nanosecond intervals since 1601-01-01 UTC)
/// to a `std::time::SystemTime`.
pub(crate) fn filetime_to_systemtime(filetime: i64) -> SystemTime {
    filetime_to_datetime(filetime).into()
}

fn filetime_to_datetime(filetime: i64) -> DateTime<Utc> {
    let secs = filetime.div_euclid(TICKS_PER_SEC) - FILETIME_UNIX_OFFSET_SECS;
    let nanos = (filetime.rem_euclid(TICKS_PER_SEC) * 100) as u32;
    DateTime::from_timestamp(secs, nanos).unwrap_or(DateTime::<Utc>::MIN_UTC)
}
