//! Wall clock used for trigger alignment and segment rotation

use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;

/// Millisecond wall clock with a deadline wait.
///
/// Trigger timestamps come from the remote peer, so the clock is wall-clock
/// based rather than process-relative.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;

    /// Suspend the calling task until `deadline_ms` has passed.
    ///
    /// Blocks only the command-handling task that awaits it; the capture
    /// worker keeps running on its own thread.
    async fn wait_until(&self, deadline_ms: u64);
}

/// System wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        Utc::now().timestamp_millis().max(0) as u64
    }

    async fn wait_until(&self, deadline_ms: u64) {
        loop {
            let now = self.now_millis();
            if now >= deadline_ms {
                return;
            }
            // Re-check after waking; the sleep timer is monotonic, the deadline is not.
            tokio::time::sleep(Duration::from_millis(deadline_ms - now)).await;
        }
    }
}
