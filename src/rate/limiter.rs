use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Lock-free token bucket in its GCRA form.
///
/// A single atomic holds the theoretical arrival time (nanoseconds since
/// `base`). Each reservation advances it by one emission interval with a CAS
/// loop and reports how long the caller has to wait before acting. Callers
/// that are within the burst tolerance wait zero.
pub struct RateLimiter {
    base: Instant,
    interval_nanos: u64,
    tolerance_nanos: u64,
    tat: AtomicU64,
    rate: u32,
    burst: u32,
}

impl RateLimiter {
    /// `rate` tokens per second, up to `burst` tokens back to back.
    pub fn new(rate: u32, burst: u32) -> Self {
        let rate = rate.max(1);
        let burst = burst.max(1);
        let interval_nanos = 1_000_000_000u64 / rate as u64;
        Self {
            base: Instant::now(),
            interval_nanos,
            tolerance_nanos: interval_nanos * (burst as u64 - 1),
            tat: AtomicU64::new(0),
            rate,
            burst,
        }
    }

    /// Burst of one hundredth of a second worth of tokens, at least one.
    pub fn with_default_burst(rate: u32) -> Self {
        Self::new(rate, (rate / 100).max(1))
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    fn now_nanos(&self) -> u64 {
        self.base.elapsed().as_nanos() as u64
    }

    /// Claim one token and return the delay before it may be used.
    pub fn reserve(&self) -> Duration {
        let now = self.now_nanos();
        let mut tat = self.tat.load(Ordering::Acquire);
        loop {
            let new_tat = tat.max(now) + self.interval_nanos;
            match self
                .tat
                .compare_exchange_weak(tat, new_tat, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    let allowed_at =
                        new_tat.saturating_sub(self.interval_nanos + self.tolerance_nanos);
                    return Duration::from_nanos(allowed_at.saturating_sub(now));
                }
                Err(actual) => tat = actual,
            }
        }
    }

    /// Claim a token only if it is usable right now.
    pub fn try_acquire(&self) -> bool {
        let now = self.now_nanos();
        let mut tat = self.tat.load(Ordering::Acquire);
        loop {
            let new_tat = tat.max(now) + self.interval_nanos;
            let allowed_at = new_tat.saturating_sub(self.interval_nanos + self.tolerance_nanos);
            if allowed_at > now {
                return false;
            }
            match self
                .tat
                .compare_exchange_weak(tat, new_tat, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => tat = actual,
            }
        }
    }

    /// Wait for a token. Returns `false` if `cancel` fired first; the
    /// reservation is still consumed in that case.
    pub async fn acquire(&self, cancel: &CancellationToken) -> bool {
        let wait = self.reserve();
        if wait.is_zero() {
            return !cancel.is_cancelled();
        }
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(wait) => true,
        }
    }
}
