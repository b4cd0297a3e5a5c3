//! Delay computation between retry attempts

use crate::config::{BackoffStrategy, RetryConfig};
use rand::Rng;
use std::sync::OnceLock;
use std::time::Duration;

// fib(93) overflows u64; beyond that every delay is capped anyway
const FIB_TABLE_LEN: usize = 93;

fn fib_table() -> &'static [u64] {
    static TABLE: OnceLock<Vec<u64>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = vec![0u64, 1];
        while table.len() < FIB_TABLE_LEN {
            let next = table[table.len() - 1] + table[table.len() - 2];
            table.push(next);
        }
        table
    })
}

/// fib(0) = 0, fib(1) = 1
pub fn fibonacci(n: u32) -> f64 {
    fib_table()
        .get(n as usize)
        .map(|&v| v as f64)
        .unwrap_or(f64::INFINITY)
}

/// Raw delay in seconds for `attempt` (counted from 1) before capping
fn raw_delay(attempt: u32, config: &RetryConfig) -> f64 {
    let base = config.base_delay;
    match config.strategy {
        BackoffStrategy::Exponential => {
            let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
            base * config.backoff_factor.powi(exponent)
        }
        BackoffStrategy::Linear => base * attempt as f64,
        BackoffStrategy::Constant => base,
        BackoffStrategy::Fibonacci => fibonacci(attempt) * base,
    }
}

/// Delay in seconds to wait after failed `attempt`.
///
/// Capped at `max_delay`; with jitter enabled the capped value is moved by a
/// uniform amount within `±delay * jitter_range` and clamped to
/// `[0, max_delay]`.
pub fn calculate_delay(attempt: u32, config: &RetryConfig) -> f64 {
    let raw = raw_delay(attempt, config);
    let mut delay = if raw.is_nan() {
        config.max_delay
    } else {
        raw.min(config.max_delay)
    };

    if config.jitter && config.jitter_range > 0.0 && delay > 0.0 && delay.is_finite() {
        let spread = delay * config.jitter_range;
        // gen_range panics when the span overflows
        if (spread * 2.0).is_finite() {
            delay += rand::thread_rng().gen_range(-spread..=spread);
        }
    }

    delay.clamp(0.0, config.max_delay.max(0.0))
}

pub fn delay_duration(attempt: u32, config: &RetryConfig) -> Duration {
    Duration::try_from_secs_f64(calculate_delay(attempt, config)).unwrap_or(Duration::MAX)
}
