//! # Jitter for restart delays.
//!
//! Many hosts restarting the same failed job at once hammer the store with
//! lease attempts. [`JitterPolicy`] spreads the scheduled delays.
//!
//! - [`JitterPolicy::None`] exact delay
//! - [`JitterPolicy::Equal`] `delay/2 + random[0, delay/2]`
//! - [`JitterPolicy::Full`] `random[0, delay]`

use rand::Rng;
use std::time::Duration;

/// Randomization of a scheduled restart delay.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum JitterPolicy {
    /// Sleep exactly the base delay.
    #[default]
    None,
    /// Keep at least half of the base delay.
    Equal,
    /// Anywhere between zero and the base delay.
    Full,
}

impl JitterPolicy {
    /// Applies the jitter to `delay`.
    pub fn apply(&self, delay: Duration) -> Duration {
        let ms = delay.as_millis().min(u128::from(u64::MAX)) as u64;
        if ms == 0 {
            return delay;
        }
        let mut rng = rand::rng();
        match self {
            JitterPolicy::None => delay,
            JitterPolicy::Full => Duration::from_millis(rng.random_range(0..=ms)),
            JitterPolicy::Equal => {
                let half = ms / 2;
                Duration::from_millis(half + rng.random_range(0..=ms - half))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_is_identity() {
        let d = Duration::from_millis(1234);
        assert_eq!(JitterPolicy::None.apply(d), d);
    }

    #[test]
    fn equal_stays_in_upper_half() {
        let d = Duration::from_secs(2);
        for _ in 0..200 {
            let j = JitterPolicy::Equal.apply(d);
            assert!(j >= Duration::from_secs(1) && j <= d, "{j:?}");
        }
    }

    #[test]
    fn full_never_exceeds_base() {
        let d = Duration::from_millis(500);
        for _ in 0..200 {
            assert!(JitterPolicy::Full.apply(d) <= d);
        }
    }

    #[test]
    fn zero_stays_zero() {
        assert_eq!(JitterPolicy::Full.apply(Duration::ZERO), Duration::ZERO);
    }
}
