//! Reconnect delay calculation

use rand::Rng;
use std::time::Duration;

use crate::config::ReconnectConfig;

/// Jitter spread: the delay is scaled by a uniform factor in [0.7, 1.3]
pub const JITTER_RATIO: f64 = 0.3;

/// `min(max_delay, base_delay * factor^attempt)`, without jitter
pub fn backoff_delay(config: &ReconnectConfig, attempt: u32) -> Duration {
    let max = config.max_delay_ms as f64;
    let exponent = attempt.min(i32::MAX as u32) as i32;
    let raw = config.base_delay_ms as f64 * config.factor.powi(exponent);

    let delay_ms = if raw.is_finite() { raw.min(max) } else { max };
    Duration::from_millis(delay_ms.max(0.0) as u64)
}

/// Perturb a delay by up to ±30%
pub fn apply_jitter<R: Rng + ?Sized>(delay: Duration, rng: &mut R) -> Duration {
    let scale = 1.0 + rng.gen_range(-JITTER_RATIO..=JITTER_RATIO);
    Duration::from_millis((delay.as_millis() as f64 * scale).max(0.0) as u64)
}

/// Delay before reconnect number `attempt + 1`
pub fn reconnect_delay(config: &ReconnectConfig, attempt: u32) -> Duration {
    let delay = backoff_delay(config, attempt);
    if config.jitter {
        apply_jitter(delay, &mut rand::thread_rng())
    } else {
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base: u64, max: u64, factor: f64, jitter: bool) -> ReconnectConfig {
        ReconnectConfig {
            base_delay_ms: base,
            max_delay_ms: max,
            factor,
            jitter,
            ..Default::default()
        }
    }

    #[test]
    fn test_capped_sequence() {
        let config = config(1000, 10000, 2.0, false);
        let delays: Vec<u64> = (0..7)
            .map(|attempt| reconnect_delay(&config, attempt).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 10000, 10000, 10000]);
    }

    #[test]
    fn test_huge_attempt_saturates() {
        let config = config(1000, 60000, 2.0, false);
        assert_eq!(backoff_delay(&config, u32::MAX), Duration::from_millis(60000));
    }

    #[test]
    fn test_jitter_bounds() {
        let config = config(1000, 60000, 2.0, true);
        for _ in 0..200 {
            let ms = reconnect_delay(&config, 2).as_millis() as u64;
            assert!((2800..=5200).contains(&ms), "delay {} out of range", ms);
        }
    }
}
