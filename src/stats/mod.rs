use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Ring capacity for each latency / traffic series.
const SERIES_CAPACITY: usize = 3000;

/// Process-wide counters and bounded time series, shared by every layer.
///
/// Counters are lock-free atomics; the sample rings are guarded by a mutex
/// each — writers hold it for a push, readers for a snapshot copy.
pub struct Stats {
    requests: AtomicU64,
    upstream_requests: AtomicU64,
    sessions_created: AtomicU64,
    adblocked: AtomicU64,
    upstream_errors: AtomicU64,
    other_errors: AtomicU64,
    clients_connected: AtomicI64,
    clients_serving: AtomicI64,

    overall_times: Mutex<TimeSeries>,
    upstream_times: Mutex<TimeSeries>,
    traffic: Mutex<TimeSeries>,

    started_at: Instant,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            upstream_requests: AtomicU64::new(0),
            sessions_created: AtomicU64::new(0),
            adblocked: AtomicU64::new(0),
            upstream_errors: AtomicU64::new(0),
            other_errors: AtomicU64::new(0),
            clients_connected: AtomicI64::new(0),
            clients_serving: AtomicI64::new(0),
            overall_times: Mutex::new(TimeSeries::new(SERIES_CAPACITY)),
            upstream_times: Mutex::new(TimeSeries::new(SERIES_CAPACITY)),
            traffic: Mutex::new(TimeSeries::new(SERIES_CAPACITY)),
            started_at: Instant::now(),
        }
    }

    pub fn new_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn new_upstream_request(&self) {
        self.upstream_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn new_session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn new_adblocked_request(&self) {
        self.adblocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn new_upstream_error(&self) {
        self.upstream_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn new_other_error(&self) {
        self.other_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_connected(&self, connected: bool) {
        let delta = if connected { 1 } else { -1 };
        self.clients_connected.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn client_serving(&self, serving: bool) {
        let delta = if serving { 1 } else { -1 };
        self.clients_serving.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn new_overall_time(&self, elapsed: Duration) {
        self.overall_times
            .lock()
            .expect("stats mutex poisoned")
            .add(elapsed.as_secs_f64());
    }

    pub fn new_upstream_time(&self, elapsed: Duration) {
        self.upstream_times
            .lock()
            .expect("stats mutex poisoned")
            .add(elapsed.as_secs_f64());
    }

    pub fn new_traffic(&self, bytes: u64) {
        self.traffic
            .lock()
            .expect("stats mutex poisoned")
            .add(bytes as f64);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests_number: self.requests.load(Ordering::Relaxed),
            upstream_requests: self.upstream_requests.load(Ordering::Relaxed),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            adblocked_requests: self.adblocked.load(Ordering::Relaxed),
            upstream_errors: self.upstream_errors.load(Ordering::Relaxed),
            other_errors: self.other_errors.load(Ordering::Relaxed),
            clients_connected: self.clients_connected.load(Ordering::Relaxed).max(0) as u64,
            clients_serving: self.clients_serving.load(Ordering::Relaxed).max(0) as u64,
            overall_times: self
                .overall_times
                .lock()
                .expect("stats mutex poisoned")
                .summary(),
            upstream_times: self
                .upstream_times
                .lock()
                .expect("stats mutex poisoned")
                .summary(),
            traffic: self.traffic.lock().expect("stats mutex poisoned").summary(),
            uptime: self.started_at.elapsed().as_secs(),
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    pub requests_number: u64,
    pub upstream_requests: u64,
    pub sessions_created: u64,
    pub adblocked_requests: u64,
    pub upstream_errors: u64,
    pub other_errors: u64,
    pub clients_connected: u64,
    pub clients_serving: u64,
    pub overall_times: SeriesSummary,
    pub upstream_times: SeriesSummary,
    pub traffic: SeriesSummary,
    pub uptime: u64,
}

#[derive(Debug, Default, Serialize)]
pub struct SeriesSummary {
    pub average: f64,
    pub minimal: f64,
    pub maximal: f64,
    pub median: f64,
    pub percentile_90: f64,
    pub standard_deviation: f64,
}

/// Fixed-capacity ring of samples; the oldest sample is evicted on overflow.
struct TimeSeries {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl TimeSeries {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn add(&mut self, sample: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    fn summary(&self) -> SeriesSummary {
        if self.samples.is_empty() {
            return SeriesSummary::default();
        }

        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let count = sorted.len();
        let sum: f64 = sorted.iter().sum();
        let average = sum / count as f64;
        let variance = sorted.iter().map(|s| (s - average).powi(2)).sum::<f64>() / count as f64;

        SeriesSummary {
            average,
            minimal: sorted[0],
            maximal: sorted[count - 1],
            median: percentile(&sorted, 0.5),
            percentile_90: percentile(&sorted, 0.9),
            standard_deviation: variance.sqrt(),
        }
    }
}

/// Nearest-rank percentile over an already sorted slice.
fn percentile(sorted: &[f64], rank: f64) -> f64 {
    let index = ((sorted.len() as f64 * rank).ceil() as usize)
        .saturating_sub(1)
        .min(sorted.len() - 1);
    sorted[index]
}
