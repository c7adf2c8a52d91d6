//! Delays applied between the attempts of a failing job.
//!
//! Every job carries a `retry_delay_seconds` which is used as the base delay. By default the
//! delay is constant, it can be configured to grow linearly or exponentially with the attempt
//! number and optionally be capped and jittered.
//!
//! All of the constructors and configuration functions are `const`.
//!
//! # Example
//!
//! ```
//! # use cronwarden::backoff::{Backoff, Jitter};
//! # use chrono::TimeDelta;
//! let backoff = Backoff::exponential().with_max(TimeDelta::seconds(30));
//! let base = TimeDelta::seconds(2);
//!
//! assert_eq!(backoff.delay(base, 1), TimeDelta::seconds(2));
//! assert_eq!(backoff.delay(base, 2), TimeDelta::seconds(4));
//! assert_eq!(backoff.delay(base, 3), TimeDelta::seconds(8));
//! assert_eq!(backoff.delay(base, 6), TimeDelta::seconds(30));
//!
//! let backoff = Backoff::constant().with_jitter(Jitter::Absolute(TimeDelta::seconds(1)));
//! assert!(backoff.delay(base, 4) >= TimeDelta::seconds(1));
//! assert!(backoff.delay(base, 4) <= TimeDelta::seconds(3));
//! ```
use chrono::TimeDelta;
use rand::Rng;

/// The longest delay ever waited between two attempts, jitter included.
pub const MAX_DELAY: TimeDelta = TimeDelta::days(7);

/// How the base delay grows with each failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Growth {
    /// Always the base delay.
    #[default]
    Constant,
    /// `base * attempt`.
    Linear,
    /// `base * 2^(attempt - 1)`.
    Exponential,
}

/// A random jitter to be applied to a given delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// A random jitter to be added to the delay in the range `-delta =< jitter =< delta`.
    Absolute(TimeDelta),
    /// A random jitter to be added as a proportion of the current delay.
    Relative(f64),
}

impl Jitter {
    fn apply_jitter(&self, value: TimeDelta) -> TimeDelta {
        let milliseconds = match self {
            Self::Absolute(delta) => delta.num_milliseconds().abs(),
            Self::Relative(ratio) => (value.num_milliseconds() as f64 * ratio).round().abs() as i64,
        };
        let jitter = rand::thread_rng().gen_range(-milliseconds..=milliseconds);
        TimeDelta::try_milliseconds(jitter)
            .and_then(|jitter| value.checked_add(&jitter))
            .unwrap_or(MAX_DELAY)
    }
}

/// Computes the delay before the next attempt of a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Backoff {
    growth: Growth,
    max: Option<TimeDelta>,
    jitter: Option<Jitter>,
}

impl Backoff {
    /// Wait exactly the job's retry delay between attempts.
    pub const fn constant() -> Self {
        Self::new(Growth::Constant)
    }

    pub const fn linear() -> Self {
        Self::new(Growth::Linear)
    }

    pub const fn exponential() -> Self {
        Self::new(Growth::Exponential)
    }

    pub const fn new(growth: Growth) -> Self {
        Self {
            growth,
            max: None,
            jitter: None,
        }
    }

    /// Clamps the delay, before jitter, to `max`.
    pub const fn with_max(mut self, max: TimeDelta) -> Self {
        self.max = Some(max);
        self
    }

    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// The delay to wait after the failed `attempt` (starting at 1) given the job's base delay.
    ///
    /// Never negative and never longer than [`MAX_DELAY`].
    pub fn delay(&self, base: TimeDelta, attempt: u32) -> TimeDelta {
        let attempt = attempt.max(1);
        let mut delay = match self.growth {
            Growth::Constant => base,
            Growth::Linear => i32::try_from(attempt)
                .ok()
                .and_then(|factor| base.checked_mul(factor))
                .unwrap_or(MAX_DELAY),
            Growth::Exponential => 2_i32
                .checked_pow(attempt - 1)
                .and_then(|factor| base.checked_mul(factor))
                .unwrap_or(MAX_DELAY),
        };
        delay = delay.min(self.max.unwrap_or(MAX_DELAY).min(MAX_DELAY));
        if let Some(jitter) = self.jitter {
            delay = jitter.apply_jitter(delay);
        }
        delay.clamp(TimeDelta::zero(), MAX_DELAY)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const BASE: TimeDelta = TimeDelta::seconds(10);

    #[test]
    fn constant() {
        let backoff = Backoff::default();
        assert_eq!(backoff, Backoff::constant());
        assert_eq!(backoff.delay(BASE, 1), BASE);
        assert_eq!(backoff.delay(BASE, 2), BASE);
        assert_eq!(backoff.delay(BASE, 10), BASE);
    }

    #[test]
    fn linear() {
        let backoff = Backoff::linear().with_max(TimeDelta::seconds(40));
        assert_eq!(backoff.delay(BASE, 1), TimeDelta::seconds(10));
        assert_eq!(backoff.delay(BASE, 2), TimeDelta::seconds(20));
        assert_eq!(backoff.delay(BASE, 3), TimeDelta::seconds(30));
        assert_eq!(backoff.delay(BASE, 5), TimeDelta::seconds(40));
    }

    #[test]
    fn exponential() {
        let backoff = Backoff::exponential();
        assert_eq!(backoff.delay(BASE, 0), TimeDelta::seconds(10));
        assert_eq!(backoff.delay(BASE, 1), TimeDelta::seconds(10));
        assert_eq!(backoff.delay(BASE, 2), TimeDelta::seconds(20));
        assert_eq!(backoff.delay(BASE, 3), TimeDelta::seconds(40));
        assert_eq!(backoff.delay(BASE, 40), MAX_DELAY);
    }

    #[test]
    fn exponential_with_max() {
        let backoff = Backoff::exponential().with_max(TimeDelta::minutes(1));
        assert_eq!(backoff.delay(BASE, 3), TimeDelta::seconds(40));
        assert_eq!(backoff.delay(BASE, 4), TimeDelta::minutes(1));
        assert_eq!(backoff.delay(BASE, u32::MAX), TimeDelta::minutes(1));
    }

    #[test]
    fn relative_jitter() {
        let backoff = Backoff::constant().with_jitter(Jitter::Relative(0.1));
        for _ in 0..100 {
            let delay = backoff.delay(BASE, 1);
            assert!(delay >= TimeDelta::seconds(9));
            assert!(delay <= TimeDelta::seconds(11));
        }
    }

    #[test]
    fn huge_delays_are_capped() {
        let jittered = Backoff::constant().with_jitter(Jitter::Absolute(TimeDelta::seconds(1)));
        assert!(jittered.delay(TimeDelta::MAX, 1) <= MAX_DELAY);
        assert!(jittered.delay(TimeDelta::MAX, 1) >= MAX_DELAY - TimeDelta::seconds(1));

        let relative = Backoff::exponential().with_jitter(Jitter::Relative(0.5));
        assert!(relative.delay(TimeDelta::MAX, u32::MAX) <= MAX_DELAY);
        assert_eq!(Backoff::linear().delay(TimeDelta::MAX, 3), MAX_DELAY);
        assert_eq!(
            Backoff::constant()
                .with_max(TimeDelta::MAX)
                .delay(TimeDelta::days(30), 1),
            MAX_DELAY
        );
    }

    #[test]
    fn jitter_never_goes_negative() {
        let backoff = Backoff::constant().with_jitter(Jitter::Absolute(TimeDelta::minutes(5)));
        for _ in 0..100 {
            assert!(backoff.delay(TimeDelta::zero(), 1) >= TimeDelta::zero());
        }
    }
}
