use rand::Rng;
use std::time::Duration;

/// Exponential retry delay with a small additive jitter. The jitter stays
/// below half the base so successive delays keep growing until they hit the
/// cap.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let cap_ms = self.cap.as_millis().min(u128::from(u64::MAX)) as u64;
        let shift = attempt.min(16);
        let exp = base_ms.saturating_mul(1u64 << shift);
        if exp >= cap_ms {
            return Duration::from_millis(cap_ms);
        }
        let jitter_span = (base_ms / 2).max(1);
        let jittered = exp.saturating_add(rng.gen_range(0..jitter_span));
        Duration::from_millis(jittered.min(cap_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn delays_strictly_increase_until_the_cap() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(2));
        let mut rng = StdRng::seed_from_u64(7);
        let mut previous = Duration::ZERO;
        let mut capped = false;
        for attempt in 0..8 {
            let delay = backoff.delay_with_rng(attempt, &mut rng);
            if capped {
                assert_eq!(delay, Duration::from_secs(2));
            } else if delay == Duration::from_secs(2) {
                capped = true;
            } else {
                assert!(delay > previous, "attempt {attempt} did not grow");
            }
            previous = delay;
        }
        assert!(capped, "cap was never reached");
    }

    #[test]
    fn jitter_never_exceeds_half_base() {
        let backoff = Backoff::new(Duration::from_millis(200), Duration::from_secs(60));
        let mut rng = StdRng::seed_from_u64(42);
        for attempt in 0..5 {
            let exp = 200u64 << attempt;
            let delay = backoff.delay_with_rng(attempt, &mut rng);
            assert!(delay >= Duration::from_millis(exp));
            assert!(delay < Duration::from_millis(exp + 100));
        }
    }

    #[test]
    fn large_attempts_saturate_at_cap() {
        let backoff = Backoff::new(Duration::from_millis(250), Duration::from_secs(10));
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(
            backoff.delay_with_rng(30, &mut rng),
            Duration::from_secs(10)
        );
    }
}
