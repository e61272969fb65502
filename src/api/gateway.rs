use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Duration, Instant};

/// Paces every outbound exchange call: at least `min_interval` between the
/// start of consecutive calls, across all tasks sharing this instance.
///
/// Callers that arrive early queue on the internal mutex rather than failing.
/// The critical section covers only the wait-and-stamp decision; the network
/// round trip itself runs outside the lock, so calls overlap freely once
/// their start times have been spaced out.
///
/// Constructed once at startup and shared by `Arc`. The gateway never
/// retries: errors from the wrapped call propagate unchanged.
#[derive(Debug)]
pub struct Gateway {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
    calls: AtomicU64,
}

impl Gateway {
    /// `calls_per_second` is the global budget; 10.0 means one call start
    /// every 100ms.
    pub fn new(calls_per_second: f64) -> Arc<Self> {
        let min_interval = if calls_per_second > 0.0 {
            Duration::from_secs_f64(1.0 / calls_per_second)
        } else {
            Duration::ZERO
        };
        Self::with_min_interval(min_interval)
    }

    pub fn with_min_interval(min_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            min_interval,
            last_call: Mutex::new(None),
            calls: AtomicU64::new(0),
        })
    }

    /// Waits for this call's turn, then stamps it as the latest call start.
    pub async fn acquire(&self) {
        let mut last_call = self.last_call.lock().await;
        if let Some(previous) = *last_call {
            sleep_until(previous + self.min_interval).await;
        }
        *last_call = Some(Instant::now());
        self.calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Runs `fut` after the rate limit admits it. Errors pass through.
    pub async fn invoke<F, T>(&self, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        self.acquire().await;
        fut.await
    }

    /// Total calls admitted since construction, for diagnostics
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}
