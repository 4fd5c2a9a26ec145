use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Histogram bucket upper bounds, in milliseconds.
pub const RESPONSE_TIME_BUCKETS_MS: [u64; 6] = [10, 100, 500, 1000, 5000, 10000];

/// Live accepted connections for one listener. Incremented on accept,
/// decremented on close; hijacked connections decrement at tunnel
/// teardown instead of the normal close path.
#[derive(Debug, Default)]
pub struct InboundConnectionGauge {
    value: AtomicI64,
}

impl InboundConnectionGauge {
    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn current(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct HistogramCells {
    // One cell per bucket bound plus the +Inf overflow cell.
    buckets: [AtomicU64; RESPONSE_TIME_BUCKETS_MS.len() + 1],
    sum_ms: AtomicU64,
    count: AtomicU64,
}

impl HistogramCells {
    fn new() -> Self {
        Self {
            buckets: Default::default(),
            sum_ms: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    fn observe(&self, elapsed_ms: u64) {
        let index = RESPONSE_TIME_BUCKETS_MS
            .iter()
            .position(|bound| elapsed_ms <= *bound)
            .unwrap_or(RESPONSE_TIME_BUCKETS_MS.len());
        self.buckets[index].fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HistogramSnapshot {
    /// Non-cumulative per-bucket counts, final entry is the +Inf cell.
    pub bucket_counts: Vec<u64>,
    pub sum_ms: u64,
    pub count: u64,
}

/// Gauge + histogram registry behind the metrics exposition endpoint.
/// Labels are interned on first use; the label sets are small and closed
/// (listener addresses and the reason-code taxonomy).
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    gauges: Mutex<BTreeMap<String, Arc<InboundConnectionGauge>>>,
    histograms: Mutex<BTreeMap<String, Arc<HistogramCells>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gauge_for_listener(&self, listener: &str) -> Arc<InboundConnectionGauge> {
        let mut gauges = self.gauges.lock().expect("metrics registry poisoned");
        Arc::clone(
            gauges
                .entry(listener.to_string())
                .or_insert_with(|| Arc::new(InboundConnectionGauge::default())),
        )
    }

    /// Records one completed exchange. `error_code` is the wire reason
    /// code, empty string on success.
    pub fn observe_response(&self, error_code: &str, elapsed: Duration) {
        let cells = {
            let mut histograms = self.histograms.lock().expect("metrics registry poisoned");
            Arc::clone(
                histograms
                    .entry(error_code.to_string())
                    .or_insert_with(|| Arc::new(HistogramCells::new())),
            )
        };
        cells.observe(elapsed.as_millis().min(u128::from(u64::MAX)) as u64);
    }

    pub fn histogram_snapshot(&self, error_code: &str) -> HistogramSnapshot {
        let histograms = self.histograms.lock().expect("metrics registry poisoned");
        match histograms.get(error_code) {
            Some(cells) => HistogramSnapshot {
                bucket_counts: cells
                    .buckets
                    .iter()
                    .map(|cell| cell.load(Ordering::Relaxed))
                    .collect(),
                sum_ms: cells.sum_ms.load(Ordering::Relaxed),
                count: cells.count.load(Ordering::Relaxed),
            },
            None => HistogramSnapshot::default(),
        }
    }

    /// Prometheus text exposition of the registry, served by the external
    /// metrics collaborator.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        out.push_str("# HELP current_inbound_connections The number of current inbound proxy connections\n");
        out.push_str("# TYPE current_inbound_connections gauge\n");
        {
            let gauges = self.gauges.lock().expect("metrics registry poisoned");
            for (listener, gauge) in gauges.iter() {
                let _ = writeln!(
                    out,
                    "current_inbound_connections{{listener=\"{listener}\"}} {}",
                    gauge.current()
                );
            }
        }

        out.push_str("# HELP responses Response time histogram\n");
        out.push_str("# TYPE responses histogram\n");
        let histograms = self.histograms.lock().expect("metrics registry poisoned");
        for (error_code, cells) in histograms.iter() {
            let mut cumulative = 0_u64;
            for (bound, cell) in RESPONSE_TIME_BUCKETS_MS.iter().zip(cells.buckets.iter()) {
                cumulative += cell.load(Ordering::Relaxed);
                let _ = writeln!(
                    out,
                    "responses_bucket{{error_code=\"{error_code}\",le=\"{bound}\"}} {cumulative}"
                );
            }
            cumulative += cells.buckets[RESPONSE_TIME_BUCKETS_MS.len()].load(Ordering::Relaxed);
            let _ = writeln!(
                out,
                "responses_bucket{{error_code=\"{error_code}\",le=\"+Inf\"}} {cumulative}"
            );
            let _ = writeln!(
                out,
                "responses_sum{{error_code=\"{error_code}\"}} {}",
                cells.sum_ms.load(Ordering::Relaxed)
            );
            let _ = writeln!(
                out,
                "responses_count{{error_code=\"{error_code}\"}} {}",
                cells.count.load(Ordering::Relaxed)
            );
        }
        out
    }
}
