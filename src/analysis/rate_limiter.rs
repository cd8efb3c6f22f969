//! Fixed-interval limiter shared by every analysis call in the process.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Guarantees at least `spacing` between the starts of consecutive calls.
///
/// Callers queue on the inner mutex, so slots are handed out in arrival
/// order and never overlap no matter how many workers share the limiter.
#[derive(Debug)]
pub struct MinIntervalLimiter {
    spacing: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl MinIntervalLimiter {
    pub fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            next_slot: Mutex::new(None),
        }
    }

    pub fn spacing(&self) -> Duration {
        self.spacing
    }

    /// Wait until the caller may start a call.
    pub async fn acquire(&self) {
        if self.spacing.is_zero() {
            return;
        }
        let mut next = self.next_slot.lock().await;
        let now = Instant::now();
        if let Some(slot) = *next
            && slot > now
        {
            tokio::time::sleep_until(slot).await;
        }
        *next = Some(Instant::now() + self.spacing);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn calls_are_spaced() {
        let limiter = MinIntervalLimiter::new(Duration::from_millis(500));
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_are_serialized() {
        let limiter = Arc::new(MinIntervalLimiter::new(Duration::from_millis(100)));
        let start = Instant::now();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move {
                    limiter.acquire().await;
                    Instant::now()
                })
            })
            .collect();
        let mut times = Vec::new();
        for h in handles {
            times.push(h.await.unwrap());
        }
        times.sort();
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(100));
        }
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn zero_spacing_never_waits() {
        let limiter = MinIntervalLimiter::new(Duration::ZERO);
        for _ in 0..100 {
            limiter.acquire().await;
        }
    }
}
