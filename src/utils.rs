//! Small helpers shared by the consumer loop.

/// Base delay of the first retry, in milliseconds
const BASE_BACKOFF_MS: u64 = 100;

/// Upper bound of any backoff, in milliseconds
const MAX_BACKOFF_MS: u64 = 10_000;

/// Exponential backoff in milliseconds for the given consecutive failure count.
///
/// With the `jitter` feature, up to a quarter of the delay is added, derived
/// from `seed` so units sharing a failure do not retry in lockstep.
#[cfg_attr(not(feature = "jitter"), allow(unused_variables))]
pub fn calculate_backoff(attempt: u32, seed: u64) -> u64 {
    let exp = attempt.saturating_sub(1).min(16);
    let delay = BASE_BACKOFF_MS
        .saturating_mul(1u64 << exp)
        .min(MAX_BACKOFF_MS);

    #[cfg(feature = "jitter")]
    {
        let spread = delay / 4 + 1;
        let mixed = seed
            .wrapping_mul(0x9E37_79B9_7F4A_7C15)
            .wrapping_add(u64::from(attempt));
        (delay + mixed % spread).min(MAX_BACKOFF_MS)
    }

    #[cfg(not(feature = "jitter"))]
    {
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let first = calculate_backoff(1, 7);
        let second = calculate_backoff(2, 7);

        assert!(first >= BASE_BACKOFF_MS);
        assert!(second > first);
        assert_eq!(calculate_backoff(40, 7), MAX_BACKOFF_MS);
    }

    #[test]
    #[cfg(not(feature = "jitter"))]
    fn test_seed_is_ignored_without_jitter() {
        for attempt in 1..6 {
            assert_eq!(calculate_backoff(attempt, 1), calculate_backoff(attempt, u64::MAX));
        }
        assert_eq!(calculate_backoff(1, 99), BASE_BACKOFF_MS);
    }
}
