//! Exponential backoff with jitter for persistence retries.

use rand::Rng;
use std::time::Duration;

/// Delay before retry number `attempt` (1-based); attempt 0 waits nothing.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let factor = 2u64.saturating_pow(attempt - 1);
    let capped = base_ms.saturating_mul(factor).min(max_ms);

    // Up to 10% jitter so replicas retrying together spread out.
    let jitter_range = capped / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped + jitter)
}

/// Upper bound on the total sleep of `retries` attempts, jitter included.
pub fn retry_budget(retries: u32, base_ms: u64, max_ms: u64) -> Duration {
    let total_ms = (1..retries)
        .map(|attempt| {
            let capped = base_ms
                .saturating_mul(2u64.saturating_pow(attempt - 1))
                .min(max_ms);
            capped + capped / 10
        })
        .fold(0u64, u64::saturating_add);
    Duration::from_millis(total_ms)
}
