//! Lock-free capacity accounting for parallel scaling work.

use std::sync::atomic::{AtomicU64, Ordering};

/// A CAS-based counter bounded by a fixed maximum. Consumers take capacity
/// up front and return it when done; the counter never goes below zero or
/// above its maximum under any interleaving.
#[derive(Debug)]
pub struct CapacityLimiter {
    max: u64,
    current: AtomicU64,
}

impl CapacityLimiter {
    pub fn new(max: u64) -> Self {
        Self {
            max,
            current: AtomicU64::new(max),
        }
    }

    /// Takes `n` units if available. Returns whether the claim succeeded.
    pub fn try_consume(&self, n: u64) -> bool {
        let mut current = self.current.load(Ordering::Acquire);
        loop {
            if current < n {
                return false;
            }
            match self.current.compare_exchange_weak(
                current,
                current - n,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Returns `n` units, clamping at the configured maximum.
    pub fn return_capacity(&self, n: u64) {
        let mut current = self.current.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(n).min(self.max);
            match self.current.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn available(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    pub fn max(&self) -> u64 {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn consume_and_return() {
        let limiter = CapacityLimiter::new(4);
        assert!(limiter.try_consume(3));
        assert!(!limiter.try_consume(2));
        assert!(limiter.try_consume(1));
        assert_eq!(limiter.available(), 0);

        limiter.return_capacity(2);
        assert_eq!(limiter.available(), 2);

        // Returning more than was taken clamps at the maximum.
        limiter.return_capacity(100);
        assert_eq!(limiter.available(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_claims_respect_the_bound() {
        let limiter = Arc::new(CapacityLimiter::new(10));

        let claims: Vec<_> = (0..1000)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.try_consume(1) })
            })
            .collect();

        let mut granted = 0;
        for claim in claims {
            if claim.await.unwrap() {
                granted += 1;
            }
        }

        assert_eq!(granted, 10);
        assert_eq!(limiter.available(), 0);
    }
}
