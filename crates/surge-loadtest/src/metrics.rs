//! Process-wide metric sinks shared by every virtual user.
//!
//! Counters and rates are plain atomics; trends are HDR histograms behind a
//! `parking_lot` lock. Metrics are independent of each other: a snapshot taken
//! mid-run may observe one counter ahead of another.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use hdrhistogram::Histogram;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::endpoint::Category;

/// Highest latency the trends can represent, in microseconds (60s)
const MAX_TRACKABLE_US: u64 = 60_000_000;

// ============================================================================
// PRIMITIVES
// ============================================================================

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn merge(&self, other: &Counter) {
        self.add(other.get());
    }
}

/// Fraction of recorded samples that were `true`
#[derive(Debug, Default)]
pub struct Rate {
    hits: AtomicU64,
    total: AtomicU64,
}

impl Rate {
    pub fn add(&self, hit: bool) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> RateSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = self.total.load(Ordering::Relaxed);
        RateSnapshot {
            hits,
            total,
            rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    fn merge(&self, other: &Rate) {
        let s = other.snapshot();
        self.hits.fetch_add(s.hits, Ordering::Relaxed);
        self.total.fetch_add(s.total, Ordering::Relaxed);
    }
}

/// Latency distribution
#[derive(Debug)]
pub struct Trend {
    histogram: RwLock<Histogram<u64>>,
}

impl Default for Trend {
    fn default() -> Self {
        Self::new()
    }
}

impl Trend {
    pub fn new() -> Self {
        Self {
            // 1µs to 60s; the bounds are constants so construction cannot fail
            histogram: RwLock::new(
                Histogram::new_with_bounds(1, MAX_TRACKABLE_US, 3)
                    .expect("static histogram bounds are valid"),
            ),
        }
    }

    pub fn record(&self, latency: Duration) {
        let us = (latency.as_micros() as u64).min(MAX_TRACKABLE_US);
        if let Err(e) = self.histogram.write().record(us) {
            warn!("Failed to record latency: {}", e);
        }
    }

    pub fn snapshot(&self) -> TrendSnapshot {
        let hist = self.histogram.read();
        if hist.is_empty() {
            return TrendSnapshot::default();
        }
        let ms = |us: u64| us as f64 / 1000.0;
        TrendSnapshot {
            count: hist.len(),
            min_ms: ms(hist.min()),
            avg_ms: hist.mean() / 1000.0,
            med_ms: ms(hist.value_at_quantile(0.50)),
            p90_ms: ms(hist.value_at_quantile(0.90)),
            p95_ms: ms(hist.value_at_quantile(0.95)),
            p99_ms: ms(hist.value_at_quantile(0.99)),
            max_ms: ms(hist.max()),
        }
    }

    fn merge(&self, other: &Trend) {
        // Copy first so no two histogram locks are ever held together
        let theirs = other.histogram.read().clone();
        if let Err(e) = self.histogram.write().add(&theirs) {
            warn!("Failed to merge latency histogram: {}", e);
        }
    }
}

/// Dedicated latency trends exported for specific endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendKind {
    Login,
    Register,
}

// ============================================================================
// SINKS
// ============================================================================

/// Pass/fail tally of one endpoint's checks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckTally {
    pub passes: u64,
    pub fails: u64,
}

/// Requests attributed to one stage tag
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTally {
    pub requests: u64,
    pub rate_limited: u64,
}

/// Everything known about one issued request once its response is in
#[derive(Debug, Clone)]
pub struct ResponseRecord<'a> {
    pub endpoint: &'a str,
    pub category: Category,
    pub stage: &'a str,
    pub status: u16,
    pub latency: Duration,
    pub rate_limited: bool,
    pub check_passed: bool,
    pub trend: Option<TrendKind>,
}

/// The fixed set of accumulators written by every probe
#[derive(Debug, Default)]
pub struct MetricSinks {
    /// Probe checks that failed
    pub errors: Rate,
    /// Issued requests that were rate-limited
    pub rate_limit_errors: Rate,
    pub auth_rate_limited: Rate,
    pub read_rate_limited: Rate,
    pub write_rate_limited: Rate,

    pub login_duration: Trend,
    pub register_duration: Trend,

    pub auth_requests: Counter,
    pub read_requests: Counter,
    pub write_requests: Counter,
    pub rate_limit_hits: Counter,

    /// All issued requests
    pub http_reqs: Counter,
    pub http_req_duration: Trend,
    /// Status outside 2xx/3xx, including transport failures
    pub http_req_failed: Rate,

    pub iterations: Counter,
    pub dropped_iterations: Counter,

    pub checks: RwLock<HashMap<String, CheckTally>>,
    pub stages: RwLock<HashMap<String, StageTally>>,
}

impl MetricSinks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn category_requests(&self, category: Category) -> &Counter {
        match category {
            Category::Auth => &self.auth_requests,
            Category::Read => &self.read_requests,
            Category::Write => &self.write_requests,
        }
    }

    pub fn category_rate_limited(&self, category: Category) -> &Rate {
        match category {
            Category::Auth => &self.auth_rate_limited,
            Category::Read => &self.read_rate_limited,
            Category::Write => &self.write_rate_limited,
        }
    }

    pub fn trend(&self, kind: TrendKind) -> &Trend {
        match kind {
            TrendKind::Login => &self.login_duration,
            TrendKind::Register => &self.register_duration,
        }
    }

    /// Count a request that is about to be sent
    pub fn record_issued(&self, category: Category) {
        self.category_requests(category).add(1);
        self.http_reqs.add(1);
    }

    /// Record the classified response of an issued request
    pub fn record_response(&self, r: &ResponseRecord<'_>) {
        self.http_req_duration.record(r.latency);
        self.http_req_failed.add(!(200..400).contains(&r.status));

        if r.rate_limited {
            self.rate_limit_hits.add(1);
        }
        self.rate_limit_errors.add(r.rate_limited);
        self.category_rate_limited(r.category).add(r.rate_limited);

        self.errors.add(!r.check_passed);
        if let Some(kind) = r.trend {
            self.trend(kind).record(r.latency);
        }

        {
            let mut checks = self.checks.write();
            let tally = checks.entry(r.endpoint.to_string()).or_default();
            if r.check_passed {
                tally.passes += 1;
            } else {
                tally.fails += 1;
            }
        }

        let mut stages = self.stages.write();
        let tally = stages.entry(r.stage.to_string()).or_default();
        tally.requests += 1;
        if r.rate_limited {
            tally.rate_limited += 1;
        }
    }

    /// Fold another set of sinks into this one.
    ///
    /// Associative and commutative, so per-worker sinks can be combined in any order.
    /// Never holds a lock on both sides at once, so merging a set into itself
    /// or two sets into each other concurrently cannot deadlock.
    pub fn merge(&self, other: &MetricSinks) {
        self.errors.merge(&other.errors);
        self.rate_limit_errors.merge(&other.rate_limit_errors);
        self.auth_rate_limited.merge(&other.auth_rate_limited);
        self.read_rate_limited.merge(&other.read_rate_limited);
        self.write_rate_limited.merge(&other.write_rate_limited);
        self.login_duration.merge(&other.login_duration);
        self.register_duration.merge(&other.register_duration);
        self.auth_requests.merge(&other.auth_requests);
        self.read_requests.merge(&other.read_requests);
        self.write_requests.merge(&other.write_requests);
        self.rate_limit_hits.merge(&other.rate_limit_hits);
        self.http_reqs.merge(&other.http_reqs);
        self.http_req_duration.merge(&other.http_req_duration);
        self.http_req_failed.merge(&other.http_req_failed);
        self.iterations.merge(&other.iterations);
        self.dropped_iterations.merge(&other.dropped_iterations);

        let theirs = other.checks.read().clone();
        {
            let mut ours = self.checks.write();
            for (name, tally) in theirs {
                let entry = ours.entry(name).or_default();
                entry.passes += tally.passes;
                entry.fails += tally.fails;
            }
        }

        let theirs = other.stages.read().clone();
        let mut ours = self.stages.write();
        for (tag, tally) in theirs {
            let entry = ours.entry(tag).or_default();
            entry.requests += tally.requests;
            entry.rate_limited += tally.rate_limited;
        }
    }

    /// Point-in-time copy of every metric
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            errors: self.errors.snapshot(),
            rate_limit_errors: self.rate_limit_errors.snapshot(),
            auth_rate_limited: self.auth_rate_limited.snapshot(),
            read_rate_limited: self.read_rate_limited.snapshot(),
            write_rate_limited: self.write_rate_limited.snapshot(),
            login_duration: self.login_duration.snapshot(),
            register_duration: self.register_duration.snapshot(),
            auth_requests: self.auth_requests.get(),
            read_requests: self.read_requests.get(),
            write_requests: self.write_requests.get(),
            rate_limit_hits: self.rate_limit_hits.get(),
            http_reqs: self.http_reqs.get(),
            http_req_duration: self.http_req_duration.snapshot(),
            http_req_failed: self.http_req_failed.snapshot(),
            iterations: self.iterations.get(),
            dropped_iterations: self.dropped_iterations.get(),
            checks: self
                .checks
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            stages: self
                .stages
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        }
    }
}

// ============================================================================
// SNAPSHOTS
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RateSnapshot {
    pub hits: u64,
    pub total: u64,
    pub rate: f64,
}

/// Latency statistics in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrendSnapshot {
    pub count: u64,
    pub min_ms: f64,
    pub avg_ms: f64,
    pub med_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

/// Serializable copy of [`MetricSinks`]. Maps are ordered so the same
/// snapshot always serializes identically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub errors: RateSnapshot,
    pub rate_limit_errors: RateSnapshot,
    pub auth_rate_limited: RateSnapshot,
    pub read_rate_limited: RateSnapshot,
    pub write_rate_limited: RateSnapshot,
    pub login_duration: TrendSnapshot,
    pub register_duration: TrendSnapshot,
    pub auth_requests: u64,
    pub read_requests: u64,
    pub write_requests: u64,
    pub rate_limit_hits: u64,
    pub http_reqs: u64,
    pub http_req_duration: TrendSnapshot,
    pub http_req_failed: RateSnapshot,
    pub iterations: u64,
    pub dropped_iterations: u64,
    pub checks: BTreeMap<String, CheckTally>,
    pub stages: BTreeMap<String, StageTally>,
}
