use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

/// Receives raw byte progress from a fetcher, at whatever rate bytes arrive.
#[async_trait]
pub trait ProgressSink: Send {
    async fn report(&mut self, bytes_downloaded: u64, bytes_total: u64);
}

/// Sink that drops everything, for callers that don't track progress.
pub struct NoProgress;

#[async_trait]
impl ProgressSink for NoProgress {
    async fn report(&mut self, _bytes_downloaded: u64, _bytes_total: u64) {}
}

/// Rate limiter for high-frequency callbacks. The first call always passes.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Returns true (and restarts the window) if the interval has elapsed.
    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    /// Start a fresh window, so the next `ready` passes.
    pub fn reset(&mut self) {
        self.last = None;
    }
}
