//! Timestamp conversion helpers.

use std::time::{SystemTime, UNIX_EPOCH};

/// Microseconds per second.
pub const MICROSECONDS: i64 = 1_000_000;

/// Seconds between the NTP epoch (1900-01-01) and the Unix epoch (1970-01-01).
const NTP_OFFSET: i64 = 2_208_988_800;
const NTP_OFFSET_US: i64 = NTP_OFFSET * MICROSECONDS;

/// Returns the current wall-clock time in microseconds since the Unix epoch.
pub fn unix_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// Rescales `a * b / c` with rounding to nearest, half away from zero.
pub fn rescale(a: i64, b: i64, c: i64) -> i64 {
    let p = a as i128 * b as i128;
    let c = c as i128;
    let r = if p >= 0 {
        (p + c / 2) / c
    } else {
        -((-p + c / 2) / c)
    };
    r as i64
}

/// Converts a 64-bit NTP timestamp (32.32 fixed point, seconds since 1900)
/// to microseconds since the Unix epoch.
///
/// Timestamps small enough to fit in an `i64` are converted first and
/// offset after, so pre-1968 values stay exact instead of underflowing.
pub fn ntp_to_realtime(ntp_timestamp: u64) -> i64 {
    if ntp_timestamp > i64::MAX as u64 {
        rescale(
            (ntp_timestamp - ((NTP_OFFSET as u64) << 32)) as i64,
            MICROSECONDS,
            1i64 << 32,
        )
    } else {
        rescale(ntp_timestamp as i64, MICROSECONDS, 1i64 << 32) - NTP_OFFSET_US
    }
}

/// Converts microseconds since the Unix epoch to a 64-bit NTP timestamp.
pub fn realtime_to_ntp(micros: i64) -> u64 {
    let secs = (micros / MICROSECONDS + NTP_OFFSET) as u64;
    let frac = ((micros % MICROSECONDS) as u64) << 32;
    (secs << 32) | (frac / MICROSECONDS as u64)
}
