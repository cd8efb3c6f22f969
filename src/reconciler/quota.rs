//! Rolling-window request budget shared across reconciler calls.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
struct Window {
    started: Instant,
    used: u32,
}

/// Counts requests against a fixed budget per window.
#[derive(Debug)]
pub struct QuotaTracker {
    limit: u32,
    period: Duration,
    window: Mutex<Window>,
}

impl QuotaTracker {
    pub fn new(limit: u32, period: Duration) -> Self {
        Self {
            limit,
            period,
            window: Mutex::new(Window {
                started: Instant::now(),
                used: 0,
            }),
        }
    }

    /// One day windows, the unit Google quotas are expressed in.
    pub fn daily(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(24 * 60 * 60))
    }

    /// Take one unit of budget. Returns `false` when the window is spent.
    pub fn try_acquire(&self) -> bool {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        self.roll(&mut window);
        if window.used >= self.limit {
            return false;
        }
        window.used += 1;
        true
    }

    pub fn remaining(&self) -> u32 {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        self.roll(&mut window);
        self.limit.saturating_sub(window.used)
    }

    fn roll(&self, window: &mut Window) {
        if window.started.elapsed() >= self.period {
            window.started = Instant::now();
            window.used = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn budget_is_enforced() {
        let quota = QuotaTracker::new(2, Duration::from_secs(60));
        assert!(quota.try_acquire());
        assert!(quota.try_acquire());
        assert!(!quota.try_acquire());
        assert_eq!(quota.remaining(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn window_rolls_over() {
        let quota = QuotaTracker::new(1, Duration::from_secs(60));
        assert!(quota.try_acquire());
        assert!(!quota.try_acquire());
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(quota.try_acquire());
    }

    #[test]
    fn concurrent_acquires_never_exceed_limit() {
        let quota = Arc::new(QuotaTracker::new(50, Duration::from_secs(60)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let quota = Arc::clone(&quota);
                std::thread::spawn(move || (0..20).filter(|_| quota.try_acquire()).count())
            })
            .collect();
        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 50);
    }
}
