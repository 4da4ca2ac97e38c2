use std::time::Duration;

/// Exponential reconnect backoff: `min(base * 2^(attempt-1), max)`.
pub(crate) struct Backoff {
    attempt: u32,
    base_ms: u64,
    max_ms: u64,
    max_attempts: u32,
}

impl Backoff {
    pub(crate) fn new(base_ms: u64, max_ms: u64, max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            base_ms,
            max_ms,
            max_attempts,
        }
    }

    pub(crate) fn next(&mut self) -> Duration {
        self.attempt += 1;
        let factor = 2u64.saturating_pow(self.attempt - 1);
        let delay = self.base_ms.saturating_mul(factor).min(self.max_ms);
        Duration::from_millis(delay)
    }

    pub(crate) fn attempt(&self) -> u32 {
        self.attempt
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_then_cap() {
        let mut backoff = Backoff::new(1_000, 5_000, 10);
        let delays: Vec<u64> = (0..5).map(|_| backoff.next().as_millis() as u64).collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 5_000, 5_000]);
        assert_eq!(backoff.attempt(), 5);
    }

    #[test]
    fn test_exhaustion_and_reset() {
        let mut backoff = Backoff::new(10, 100, 2);
        assert!(!backoff.is_exhausted());
        backoff.next();
        backoff.next();
        assert!(backoff.is_exhausted());
        backoff.reset();
        assert!(!backoff.is_exhausted());
        assert_eq!(backoff.next(), Duration::from_millis(10));
    }

    #[test]
    fn test_large_attempts_do_not_overflow() {
        let mut backoff = Backoff::new(u64::MAX / 2, u64::MAX, 200);
        for _ in 0..100 {
            assert!(backoff.next() <= Duration::from_millis(u64::MAX));
        }
    }
}
