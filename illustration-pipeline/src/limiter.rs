use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, thiserror::Error)]
#[error("rate limiter saturated: {waiting} caller(s) already queued (limit {limit})")]
pub struct Saturated {
    pub waiting: usize,
    pub limit: usize,
}

/// Spaces outbound calls to the reasoning service evenly across a minute and
/// rejects callers once too many are already queued.
///
/// One limiter is shared by the scorer and the matcher so the combined call
/// rate stays within the provider's quota.
#[derive(Debug)]
pub struct RateLimiter {
    spacing: Duration,
    max_queue_depth: usize,
    next_slot: Mutex<Option<Instant>>,
    waiting: AtomicUsize,
}

struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RateLimiter {
    pub fn per_minute(requests_per_minute: u32, max_queue_depth: usize) -> Self {
        let spacing = Duration::from_secs_f64(60.0 / f64::from(requests_per_minute.max(1)));
        Self::with_spacing(spacing, max_queue_depth)
    }

    pub fn with_spacing(spacing: Duration, max_queue_depth: usize) -> Self {
        Self {
            spacing,
            max_queue_depth: max_queue_depth.max(1),
            next_slot: Mutex::new(None),
            waiting: AtomicUsize::new(0),
        }
    }

    pub fn spacing(&self) -> Duration {
        self.spacing
    }

    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Waits for the next free slot. Fails immediately when the queue is full.
    pub async fn acquire(&self) -> Result<(), Saturated> {
        let already = self.waiting.fetch_add(1, Ordering::SeqCst);
        let _slot = QueueSlot(&self.waiting);
        if already >= self.max_queue_depth {
            return Err(Saturated {
                waiting: already,
                limit: self.max_queue_depth,
            });
        }

        let at = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let at = next.map_or(now, |slot| slot.max(now));
            *next = Some(at + self.spacing);
            at
        };

        if at > Instant::now() {
            debug!(wait = ?(at - Instant::now()), "waiting for reasoning slot");
            tokio::time::sleep_until(at).await;
        }
        Ok(())
    }
}
