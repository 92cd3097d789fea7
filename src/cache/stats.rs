use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters for the range-serving responder
#[derive(Debug, Clone)]
pub struct ProxyStats {
    /// Requests for a recognized media URL
    pub requests: Arc<AtomicU64>,
    /// Answered from a whole-file blob
    pub whole_hits: Arc<AtomicU64>,
    /// Answered by stitching chunk blobs
    pub chunked_hits: Arc<AtomicU64>,
    /// Nothing cached, handed to the network
    pub pass_throughs: Arc<AtomicU64>,
    /// Requests that carried a Range header
    pub range_requests: Arc<AtomicU64>,
    /// 416 responses
    pub unsatisfiable: Arc<AtomicU64>,
    /// Reads that failed on a missing or unreadable blob
    pub read_failures: Arc<AtomicU64>,
    pub bytes_served: Arc<AtomicU64>,
    pub start_time: Instant,
}

impl Default for ProxyStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyStats {
    pub fn new() -> Self {
        Self {
            requests: Arc::new(AtomicU64::new(0)),
            whole_hits: Arc::new(AtomicU64::new(0)),
            chunked_hits: Arc::new(AtomicU64::new(0)),
            pass_throughs: Arc::new(AtomicU64::new(0)),
            range_requests: Arc::new(AtomicU64::new(0)),
            unsatisfiable: Arc::new(AtomicU64::new(0)),
            read_failures: Arc::new(AtomicU64::new(0)),
            bytes_served: Arc::new(AtomicU64::new(0)),
            start_time: Instant::now(),
        }
    }

    pub fn increment_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_whole_hit(&self) {
        self.whole_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_chunked_hit(&self) {
        self.chunked_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_pass_through(&self) {
        self.pass_throughs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_range_request(&self) {
        self.range_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_unsatisfiable(&self) {
        self.unsatisfiable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_read_failure(&self) {
        self.read_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_served(&self, bytes: u64) {
        self.bytes_served.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn format_report(&self) -> String {
        let uptime_secs = self.start_time.elapsed().as_secs();
        let hours = uptime_secs / 3600;
        let minutes = (uptime_secs % 3600) / 60;
        let seconds = uptime_secs % 60;

        let requests = self.requests.load(Ordering::Relaxed);
        let hits =
            self.whole_hits.load(Ordering::Relaxed) + self.chunked_hits.load(Ordering::Relaxed);
        let hit_rate = if requests > 0 {
            (hits as f64 / requests as f64) * 100.0
        } else {
            0.0
        };
        let served_mb = self.bytes_served.load(Ordering::Relaxed) as f64 / (1024.0 * 1024.0);

        let mut report = format!(
            "Responder Stats [{}h {}m {}s] | Requests: {} | Hit Rate: {:.1}% | Whole: {} | Chunked: {} | Passed: {} | Range: {} | Served: {:.1} MB",
            hours,
            minutes,
            seconds,
            requests,
            hit_rate,
            self.whole_hits.load(Ordering::Relaxed),
            self.chunked_hits.load(Ordering::Relaxed),
            self.pass_throughs.load(Ordering::Relaxed),
            self.range_requests.load(Ordering::Relaxed),
            served_mb
        );

        let unsatisfiable = self.unsatisfiable.load(Ordering::Relaxed);
        let read_failures = self.read_failures.load(Ordering::Relaxed);
        if unsatisfiable > 0 || read_failures > 0 {
            report.push_str(&format!(
                "\n   416s: {} | Read failures: {}",
                unsatisfiable, read_failures
            ));
        }

        report
    }
}
