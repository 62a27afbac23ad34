//! Capped exponential backoff shared by every registry HTTP call (§7):
//! base 500ms, factor 2, cap 30s, at most 5 attempts.

use std::time::Duration;

pub const MAX_ATTEMPTS: u32 = 5;
const BASE: Duration = Duration::from_millis(500);
const CAP: Duration = Duration::from_secs(30);

pub fn backoff_delay(attempt: u32) -> Duration {
    let factor = 1u64 << attempt.min(16);
    let millis = BASE.as_millis() as u64 * factor;
    Duration::from_millis(millis).min(CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_and_is_capped() {
        assert_eq!(backoff_delay(0), Duration::from_millis(500));
        assert_eq!(backoff_delay(1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(10), CAP);
    }
}
