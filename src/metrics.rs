//! Pipeline observability: latency histograms (p50/p95/p99) and event counters.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// A span measuring elapsed time from creation to explicit end.
pub struct TimingSpan {
    name: &'static str,
    start: Instant,
    registry: Arc<MetricsRegistry>,
}

impl TimingSpan {
    /// End the span, recording elapsed duration in milliseconds.
    pub fn finish(self) -> f64 {
        let elapsed_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        self.registry.record(self.name, elapsed_ms);
        elapsed_ms
    }
}

/// Fixed-capacity ring buffer for histogram samples.
struct SampleRing {
    samples: Vec<f64>,
    pos: usize,
    count: usize,
}

impl SampleRing {
    fn new(capacity: usize) -> Self {
        Self {
            samples: vec![0.0; capacity],
            pos: 0,
            count: 0,
        }
    }

    fn push(&mut self, value: f64) {
        let capacity = self.samples.len();
        self.samples[self.pos] = value;
        self.pos = (self.pos + 1) % capacity;
        if self.count < capacity {
            self.count += 1;
        }
    }

    fn percentile(&self, p: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.samples[..self.count].to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = ((p / 100.0) * (self.count as f64 - 1.0)).round() as usize;
        sorted[idx.min(self.count - 1)]
    }
}

#[derive(Default)]
struct Inner {
    histograms: HashMap<&'static str, SampleRing>,
    counters: HashMap<&'static str, u64>,
}

pub struct MetricsRegistry {
    inner: Mutex<Inner>,
    ring_capacity: usize,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            ring_capacity: 1024,
        }
    }

    /// Record a latency sample (milliseconds).
    pub fn record(&self, name: &'static str, value_ms: f64) {
        let mut inner = self.inner.lock();
        let capacity = self.ring_capacity;
        inner
            .histograms
            .entry(name)
            .or_insert_with(|| SampleRing::new(capacity))
            .push(value_ms);
        tracing::trace!(metric = name, value_ms, "metric_recorded");
    }

    pub fn incr(&self, name: &'static str) {
        *self.inner.lock().counters.entry(name).or_insert(0) += 1;
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.inner.lock().counters.get(name).copied().unwrap_or(0)
    }

    pub fn span(self: &Arc<Self>, name: &'static str) -> TimingSpan {
        TimingSpan {
            name,
            start: Instant::now(),
            registry: Arc::clone(self),
        }
    }

    pub fn percentile(&self, name: &str, p: f64) -> f64 {
        self.inner
            .lock()
            .histograms
            .get(name)
            .map(|ring| ring.percentile(p))
            .unwrap_or(0.0)
    }

    pub fn summary(&self) -> HashMap<String, MetricSummary> {
        let inner = self.inner.lock();
        inner
            .histograms
            .iter()
            .map(|(&name, ring)| {
                (
                    name.to_string(),
                    MetricSummary {
                        p50_ms: ring.percentile(50.0),
                        p95_ms: ring.percentile(95.0),
                        p99_ms: ring.percentile(99.0),
                        count: ring.count,
                    },
                )
            })
            .collect()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricSummary {
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub count: usize,
}

/// Well-known metric names.
pub mod metric_names {
    // histograms
    pub const QUEUE_WAIT: &str = "queue_wait";
    pub const PAGE_TRANSLATE: &str = "t_page_translate";
    pub const BACKEND_BATCH: &str = "t_backend_batch";
    pub const BACKEND_SINGLE: &str = "t_backend_single";
    pub const FACTORY_WAIT: &str = "t_factory_wait";

    // counters
    pub const TEXT_CACHE_HIT: &str = "text_cache_hit";
    pub const TEXT_CACHE_MISS: &str = "text_cache_miss";
    pub const SENSITIVE_REVALIDATE: &str = "sensitive_revalidate";
    pub const CONTENT_REJECTED: &str = "content_rejected";
    pub const BATCH_MISALIGNED: &str = "batch_misaligned";
    pub const PAGE_CACHE_HIT: &str = "page_cache_hit";
    pub const PAGE_FAILED: &str = "page_failed";
    pub const STALE_RESULT_DISCARDED: &str = "stale_result_discarded";
}
