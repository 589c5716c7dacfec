//! Exponential backoff with a cap and optional jitter.

use rand::Rng;

/// Jitter strategy applied to a computed delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// No jitter. Use where determinism matters.
    None,

    /// Uniform jitter: the delay is multiplied by a random factor in
    /// `[1 - spread, 1 + spread]`.
    Uniform(f64),
}

impl Default for Jitter {
    fn default() -> Self {
        Jitter::Uniform(0.5)
    }
}

/// Computes the retry delay in milliseconds for a given attempt.
///
/// The raw delay is `initial_ms * base^attempt`, capped at `max_ms` both
/// before and after jitter: the result never exceeds `max_ms` and is
/// monotonically non-decreasing in `attempt` when no jitter is applied.
pub fn delay(attempt: u32, initial_ms: u64, base: f64, max_ms: u64, jitter: &Jitter) -> u64 {
    let raw = (initial_ms as f64) * base.powi(attempt as i32);
    let capped = raw.min(max_ms as f64);

    let jittered = match jitter {
        Jitter::None => capped,
        Jitter::Uniform(spread) => {
            let factor = rand::thread_rng().gen_range(1.0 - spread..=1.0 + spread);
            capped * factor
        }
    };

    (jittered.min(max_ms as f64).max(0.0)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_progression_without_jitter() {
        assert_eq!(delay(0, 100, 2.0, 30_000, &Jitter::None), 100);
        assert_eq!(delay(1, 100, 2.0, 30_000, &Jitter::None), 200);
        assert_eq!(delay(2, 100, 2.0, 30_000, &Jitter::None), 400);
        assert_eq!(delay(9, 100, 2.0, 30_000, &Jitter::None), 30_000);
    }

    #[test]
    fn never_exceeds_cap() {
        for attempt in 0..64 {
            assert!(delay(attempt, 100, 2.0, 30_000, &Jitter::None) <= 30_000);
            assert!(delay(attempt, 100, 2.0, 30_000, &Jitter::Uniform(0.5)) <= 30_000);
        }
    }

    #[test]
    fn monotone_non_decreasing_before_cap() {
        let mut previous = 0;
        for attempt in 0..16 {
            let d = delay(attempt, 100, 2.0, 30_000, &Jitter::None);
            assert!(d >= previous);
            previous = d;
        }
    }

    #[test]
    fn uniform_jitter_stays_within_spread() {
        for _ in 0..100 {
            let d = delay(3, 100, 2.0, 30_000, &Jitter::Uniform(0.5));
            assert!((400..=1200).contains(&d), "jittered delay {d} out of range");
        }
    }
}
