// =============================================================================
// Request Pacer — enforces the broker's minimum inter-request delay
// =============================================================================
//
// The brokerage session throttles itself: every REST request waits until at
// least `min_delay` has elapsed since the previous one. Counters are atomic
// so any thread can read a snapshot lock-free.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

/// Thread-safe pacer with atomic request counters.
pub struct RequestPacer {
    min_delay: Duration,
    last_request: Mutex<Option<Instant>>,
    total_requests: AtomicU64,
    total_waits: AtomicU64,
}

/// Immutable snapshot of pacer counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacerSnapshot {
    pub total_requests: u64,
    pub total_waits: u64,
    pub min_delay_ms: u64,
}

impl RequestPacer {
    pub fn new(min_delay: Duration) -> Self {
        Self {
            min_delay,
            last_request: Mutex::new(None),
            total_requests: AtomicU64::new(0),
            total_waits: AtomicU64::new(0),
        }
    }

    /// Wait until the minimum delay since the previous request has elapsed,
    /// then claim the slot. Concurrent callers serialize through this.
    pub async fn pace(&self) {
        loop {
            let wait = {
                let mut last = self.last_request.lock();
                let now = Instant::now();
                match *last {
                    Some(prev) => {
                        let elapsed = now.duration_since(prev);
                        if elapsed >= self.min_delay {
                            *last = Some(now);
                            None
                        } else {
                            Some(self.min_delay - elapsed)
                        }
                    }
                    None => {
                        *last = Some(now);
                        None
                    }
                }
            };

            match wait {
                None => {
                    self.total_requests.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Some(delay) => {
                    self.total_waits.fetch_add(1, Ordering::Relaxed);
                    debug!(delay_ms = delay.as_millis() as u64, "pacing broker request");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    pub fn snapshot(&self) -> PacerSnapshot {
        PacerSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_waits: self.total_waits.load(Ordering::Relaxed),
            min_delay_ms: self.min_delay.as_millis() as u64,
        }
    }
}

impl std::fmt::Debug for RequestPacer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestPacer")
            .field("min_delay", &self.min_delay)
            .field(
                "total_requests",
                &self.total_requests.load(Ordering::Relaxed),
            )
            .finish()
    }
}
