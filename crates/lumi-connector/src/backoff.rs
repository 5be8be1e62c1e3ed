//! Reconnect backoff schedule: `min(base * 2^(attempt-1), cap)`.

use std::time::Duration;

pub fn reconnect_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.saturating_mul(2u32.saturating_pow(exponent)).min(cap)
}
