use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Latencies kept per link
const LATENCY_WINDOW: usize = 1000;

/// Ring of the most recent hook latencies
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    ring: Arc<Mutex<Ring>>,
}

#[derive(Debug)]
struct Ring {
    samples: Vec<Duration>,
    next: usize,
    limit: usize,
}

impl LatencyWindow {
    /// Window holding at most `limit` samples; older ones are overwritten
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            ring: Arc::new(Mutex::new(Ring {
                samples: Vec::with_capacity(limit),
                next: 0,
                limit,
            })),
        }
    }

    /// Add a sample, overwriting the oldest once full
    pub fn record(&self, latency: Duration) {
        let mut ring = self.ring.lock();
        if ring.samples.len() < ring.limit {
            ring.samples.push(latency);
        } else {
            let slot = ring.next;
            ring.samples[slot] = latency;
        }
        ring.next = (ring.next + 1) % ring.limit;
    }

    /// Nearest-rank percentile `p` (0.0..=1.0) in microseconds, 0 when empty
    pub fn percentile_us(&self, p: f64) -> f64 {
        let mut samples = self.ring.lock().samples.clone();
        if samples.is_empty() {
            return 0.0;
        }
        let rank = (samples.len() as f64 * p.clamp(0.0, 1.0)).ceil() as usize;
        let index = rank.saturating_sub(1).min(samples.len() - 1);
        let (_, nth, _) = samples.select_nth_unstable(index);
        nth.as_nanos() as f64 / 1000.0
    }

    /// Number of samples held
    pub fn len(&self) -> usize {
        self.ring.lock().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Counters for one link of a pipeline
///
/// Cloning is cheap and every clone shares the same counters, so the
/// pipeline keeps one handle while the link's worker thread records into
/// another.
#[derive(Debug, Clone)]
pub struct LinkMetrics {
    /// Envelopes crossing the link, accepted or forwarded
    processed: Arc<AtomicU64>,
    /// Envelopes the filter rejected (forwarded, or dropped at a sink)
    forwarded: Arc<AtomicU64>,
    /// Times the producer had to wait on a full bounded queue
    producer_blocks: Arc<AtomicU64>,
    /// Times the consumer had to wait on an empty bounded queue
    consumer_blocks: Arc<AtomicU64>,
    latencies: LatencyWindow,
    built_at: Instant,
}

impl LinkMetrics {
    /// Create zeroed counters; throughput is measured from now
    pub fn new() -> Self {
        Self {
            processed: Arc::new(AtomicU64::new(0)),
            forwarded: Arc::new(AtomicU64::new(0)),
            producer_blocks: Arc::new(AtomicU64::new(0)),
            consumer_blocks: Arc::new(AtomicU64::new(0)),
            latencies: LatencyWindow::new(LATENCY_WINDOW),
            built_at: Instant::now(),
        }
    }

    /// Record one envelope crossing the link, with how long the stage held it
    pub fn record_processed(&self, elapsed: Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.latencies.record(elapsed);
    }

    /// Record one envelope the filter rejected
    pub fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a producer wait on a full queue
    pub fn record_producer_block(&self) {
        self.producer_blocks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a consumer wait on an empty queue
    pub fn record_consumer_block(&self) {
        self.consumer_blocks.fetch_add(1, Ordering::Relaxed);
    }

    /// Get total envelopes crossing the link
    pub fn total_processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Get total envelopes the filter rejected
    pub fn total_forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Get how often the producer blocked
    pub fn producer_blocks(&self) -> u64 {
        self.producer_blocks.load(Ordering::Relaxed)
    }

    /// Get how often the consumer blocked
    pub fn consumer_blocks(&self) -> u64 {
        self.consumer_blocks.load(Ordering::Relaxed)
    }

    /// Processed envelopes per second since the link was built
    pub fn throughput_eps(&self) -> f64 {
        match self.built_at.elapsed().as_secs_f64() {
            secs if secs > 0.0 => self.total_processed() as f64 / secs,
            _ => 0.0,
        }
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_processed: self.total_processed(),
            total_forwarded: self.total_forwarded(),
            producer_blocks: self.producer_blocks(),
            consumer_blocks: self.consumer_blocks(),
            throughput_eps: self.throughput_eps(),
            latency_p50_us: self.latencies.percentile_us(0.50),
            latency_p95_us: self.latencies.percentile_us(0.95),
            latency_p99_us: self.latencies.percentile_us(0.99),
            elapsed: self.built_at.elapsed(),
        }
    }
}

impl Default for LinkMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of a link's counters
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub total_processed: u64,
    pub total_forwarded: u64,
    pub producer_blocks: u64,
    pub consumer_blocks: u64,
    pub throughput_eps: f64,
    pub latency_p50_us: f64,
    pub latency_p95_us: f64,
    pub latency_p99_us: f64,
    /// Time since the link was built
    pub elapsed: Duration,
}

impl MetricsSnapshot {
    /// One-line summary for logs
    pub fn format(&self) -> String {
        let mut line = format!(
            "Processed: {}, Forwarded: {}, Throughput: {:.2} env/s",
            self.total_processed, self.total_forwarded, self.throughput_eps
        );
        if self.producer_blocks > 0 || self.consumer_blocks > 0 {
            line.push_str(&format!(
                ", Blocked: {} producer / {} consumer",
                self.producer_blocks, self.consumer_blocks
            ));
        }
        line.push_str(&format!(
            ", Latency P50/P95/P99: {:.1}/{:.1}/{:.1}µs over {:.2}s",
            self.latency_p50_us,
            self.latency_p95_us,
            self.latency_p99_us,
            self.elapsed.as_secs_f64()
        ));
        line
    }
}
