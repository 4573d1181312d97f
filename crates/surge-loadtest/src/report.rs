//! End-of-run summary, thresholds and exports
//!
//! Everything here is a pure function of a [`MetricsSnapshot`]; rendering the
//! same snapshot twice produces identical output.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use prometheus::{Encoder, Gauge, GaugeVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{RateBudgets, Thresholds};
use crate::error::{LoadTestError, Result};
use crate::metrics::{CheckTally, MetricsSnapshot, StageTally, TrendSnapshot};
use crate::scheduler::StageReport;

// ============================================================================
// SUMMARY
// ============================================================================

/// Aggregated view of a finished run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_requests: u64,
    pub iterations: u64,
    pub dropped_iterations: u64,
    /// Share of responses outside 2xx/3xx
    pub failure_rate: f64,
    /// Share of calls whose checks failed
    pub error_rate: f64,
    pub avg_response_time_ms: f64,
    pub p95_response_time_ms: f64,
    pub max_response_time_ms: f64,
    pub rate_limit_hits: u64,
    pub rate_limit_percentage: f64,
    pub auth_requests: u64,
    pub read_requests: u64,
    pub write_requests: u64,
    /// Rate-limited share per category
    pub auth_rate_limited: f64,
    pub read_rate_limited: f64,
    pub write_rate_limited: f64,
    pub login_avg_ms: f64,
    pub register_avg_ms: f64,
    pub budgets: RateBudgets,
    pub checks: BTreeMap<String, CheckTally>,
    pub stages: BTreeMap<String, StageTally>,
}

/// The `rate_limit_analysis` block of the JSON artifact. Times are whole
/// milliseconds and the percentage keeps one decimal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitAnalysis {
    pub total_requests: u64,
    pub rate_limit_hits: u64,
    pub rate_limit_percentage: f64,
    pub auth_requests: u64,
    pub read_requests: u64,
    pub write_requests: u64,
    /// Milliseconds
    pub avg_response_time: f64,
    /// Milliseconds
    pub p95_response_time: f64,
}

/// JSON artifact written at the end of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryArtifact {
    pub summary: RunSummary,
    pub rate_limit_analysis: RateLimitAnalysis,
    pub thresholds: ThresholdReport,
    /// Every sink at full precision
    pub metrics: MetricsSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<RunInfo>,
}

/// When and how a run happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub seed: u64,
    /// RFC 3339, UTC
    pub started_at: String,
    pub finished_at: String,
    pub duration_secs: f64,
    pub authenticated: bool,
    pub login_attempts: u32,
    pub stages: Vec<StageReport>,
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

impl RunSummary {
    pub fn from_snapshot(snapshot: &MetricsSnapshot, budgets: &RateBudgets) -> Self {
        let total = snapshot.http_reqs;
        Self {
            total_requests: total,
            iterations: snapshot.iterations,
            dropped_iterations: snapshot.dropped_iterations,
            failure_rate: snapshot.http_req_failed.rate,
            error_rate: snapshot.errors.rate,
            avg_response_time_ms: snapshot.http_req_duration.avg_ms,
            p95_response_time_ms: snapshot.http_req_duration.p95_ms,
            max_response_time_ms: snapshot.http_req_duration.max_ms,
            rate_limit_hits: snapshot.rate_limit_hits,
            rate_limit_percentage: percent(snapshot.rate_limit_hits, total),
            auth_requests: snapshot.auth_requests,
            read_requests: snapshot.read_requests,
            write_requests: snapshot.write_requests,
            auth_rate_limited: snapshot.auth_rate_limited.rate,
            read_rate_limited: snapshot.read_rate_limited.rate,
            write_rate_limited: snapshot.write_rate_limited.rate,
            login_avg_ms: snapshot.login_duration.avg_ms,
            register_avg_ms: snapshot.register_duration.avg_ms,
            budgets: budgets.clone(),
            checks: snapshot.checks.clone(),
            stages: snapshot.stages.clone(),
        }
    }

    pub fn rate_limit_analysis(&self) -> RateLimitAnalysis {
        RateLimitAnalysis {
            total_requests: self.total_requests,
            rate_limit_hits: self.rate_limit_hits,
            rate_limit_percentage: (self.rate_limit_percentage * 10.0).round() / 10.0,
            auth_requests: self.auth_requests,
            read_requests: self.read_requests,
            write_requests: self.write_requests,
            avg_response_time: self.avg_response_time_ms.round(),
            p95_response_time: self.p95_response_time_ms.round(),
        }
    }

    pub fn artifact(&self, snapshot: &MetricsSnapshot, thresholds: ThresholdReport) -> SummaryArtifact {
        SummaryArtifact {
            summary: self.clone(),
            rate_limit_analysis: self.rate_limit_analysis(),
            thresholds,
            metrics: snapshot.clone(),
            run: None,
        }
    }

    /// Human-readable report
    pub fn render(&self) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail
        let _ = self.render_into(&mut out);
        out
    }

    fn render_into(&self, out: &mut String) -> std::fmt::Result {
        const RULE: &str = "╠══════════════════════════════════════════════════════════════╣";
        writeln!(out, "\n╔══════════════════════════════════════════════════════════════╗")?;
        writeln!(out, "║                SURGE API LOAD TEST RESULTS                   ║")?;
        writeln!(out, "{}", RULE)?;
        writeln!(out, "║ Total Requests:    {:>10}                                 ║", self.total_requests)?;
        writeln!(out, "║ Iterations:        {:>10}                                 ║", self.iterations)?;
        writeln!(out, "║ Dropped:           {:>10}                                 ║", self.dropped_iterations)?;
        writeln!(out, "║ Failure Rate:      {:>10.2}%                               ║", self.failure_rate * 100.0)?;
        writeln!(out, "║ Check Errors:      {:>10.2}%                               ║", self.error_rate * 100.0)?;
        writeln!(out, "{}", RULE)?;
        writeln!(out, "║ RATE LIMITING                                                ║")?;
        writeln!(out, "║   Hits:            {:>10}                                 ║", self.rate_limit_hits)?;
        writeln!(out, "║   Share:           {:>10.2}%                               ║", self.rate_limit_percentage)?;
        writeln!(
            out,
            "║   Auth:   {:>8} reqs {:>6.2}% limited  (budget {:>4}/min)  ║",
            self.auth_requests,
            self.auth_rate_limited * 100.0,
            self.budgets.auth_per_min
        )?;
        writeln!(
            out,
            "║   Read:   {:>8} reqs {:>6.2}% limited  (budget {:>4}/min)  ║",
            self.read_requests,
            self.read_rate_limited * 100.0,
            self.budgets.read_per_min
        )?;
        writeln!(
            out,
            "║   Write:  {:>8} reqs {:>6.2}% limited  (budget {:>4}/min)  ║",
            self.write_requests,
            self.write_rate_limited * 100.0,
            self.budgets.write_per_min
        )?;
        writeln!(out, "{}", RULE)?;
        writeln!(out, "║ LATENCY (milliseconds)                                       ║")?;
        writeln!(out, "║   avg:             {:>10.2}                                 ║", self.avg_response_time_ms)?;
        writeln!(out, "║   p95:             {:>10.2}                                 ║", self.p95_response_time_ms)?;
        writeln!(out, "║   max:             {:>10.2}                                 ║", self.max_response_time_ms)?;
        writeln!(out, "║   login avg:       {:>10.2}                                 ║", self.login_avg_ms)?;
        writeln!(out, "║   register avg:    {:>10.2}                                 ║", self.register_avg_ms)?;

        if !self.stages.is_empty() {
            writeln!(out, "{}", RULE)?;
            writeln!(out, "║ STAGES                                                       ║")?;
            for (tag, tally) in &self.stages {
                writeln!(
                    out,
                    "║   {:20}: {:>8} reqs {:>8} limited           ║",
                    tag, tally.requests, tally.rate_limited
                )?;
            }
        }

        let failing: Vec<_> = self.checks.iter().filter(|(_, t)| t.fails > 0).collect();
        if !failing.is_empty() {
            writeln!(out, "{}", RULE)?;
            writeln!(out, "║ FAILED CHECKS                                                ║")?;
            for (endpoint, tally) in failing {
                writeln!(
                    out,
                    "║   {:20}: {:>8} of {:>8}                       ║",
                    endpoint,
                    tally.fails,
                    tally.passes + tally.fails
                )?;
            }
        }

        writeln!(out, "╚══════════════════════════════════════════════════════════════╝")
    }

    pub fn print_report(&self) {
        println!("{}", self.render());
    }
}

/// Write the JSON artifact to `path`
pub fn write_artifact(path: &Path, artifact: &SummaryArtifact) -> Result<()> {
    let json = serde_json::to_string_pretty(artifact)?;
    std::fs::write(path, json).map_err(|source| LoadTestError::ArtifactWrite {
        path: path.display().to_string(),
        source,
    })?;
    info!("Summary written to {}", path.display());
    Ok(())
}

// ============================================================================
// THRESHOLDS
// ============================================================================

/// Outcome of every threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdReport {
    pub passes: bool,
    pub checks: Vec<ThresholdCheck>,
}

/// One threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdCheck {
    pub name: String,
    pub passed: bool,
    pub actual: String,
    pub expected: String,
}

impl ThresholdReport {
    fn push(&mut self, name: &str, passed: bool, actual: String, expected: String) {
        self.passes &= passed;
        self.checks.push(ThresholdCheck {
            name: name.to_string(),
            passed,
            actual,
            expected,
        });
    }

    pub fn print_report(&self) {
        println!("\n═══════════════════════════════════════════════════════════════");
        println!("                    THRESHOLDS");
        println!("═══════════════════════════════════════════════════════════════");

        for check in &self.checks {
            let status = if check.passed { "✅ PASS" } else { "❌ FAIL" };
            println!("\n  {} - {}", check.name, status);
            println!("    Actual:   {}", check.actual);
            println!("    Expected: {}", check.expected);
        }

        println!("\n═══════════════════════════════════════════════════════════════");
        if self.passes {
            println!("  OVERALL: ✅ ALL THRESHOLDS PASS");
        } else {
            println!("  OVERALL: ❌ SOME THRESHOLDS FAILED");
        }
        println!("═══════════════════════════════════════════════════════════════\n");
    }
}

/// Evaluate the run's pass/fail criteria
pub fn evaluate_thresholds(snapshot: &MetricsSnapshot, thresholds: &Thresholds) -> ThresholdReport {
    let mut report = ThresholdReport {
        passes: true,
        checks: Vec::new(),
    };

    let p95 = |name: &str, trend: &TrendSnapshot, max: f64, report: &mut ThresholdReport| {
        report.push(
            name,
            trend.p95_ms < max,
            format!("p(95)={:.2}ms", trend.p95_ms),
            format!("p(95)<{}", max),
        );
    };

    p95(
        "http_req_duration",
        &snapshot.http_req_duration,
        thresholds.http_req_duration_p95_ms,
        &mut report,
    );
    report.push(
        "http_req_failed",
        snapshot.http_req_failed.rate < thresholds.http_req_failed_rate,
        format!("rate={:.4}", snapshot.http_req_failed.rate),
        format!("rate<{}", thresholds.http_req_failed_rate),
    );
    report.push(
        "rate_limit_errors",
        snapshot.rate_limit_errors.rate < thresholds.rate_limit_errors_rate,
        format!("rate={:.4}", snapshot.rate_limit_errors.rate),
        format!("rate<{}", thresholds.rate_limit_errors_rate),
    );
    p95(
        "login_duration",
        &snapshot.login_duration,
        thresholds.login_duration_p95_ms,
        &mut report,
    );
    p95(
        "register_duration",
        &snapshot.register_duration,
        thresholds.register_duration_p95_ms,
        &mut report,
    );

    report
}

// ============================================================================
// PROMETHEUS EXPORT
// ============================================================================

/// Prometheus text exposition of a snapshot
pub fn prometheus_text(snapshot: &MetricsSnapshot) -> Result<String> {
    let registry = Registry::new();

    let counters = [
        ("surge_http_reqs_total", "Requests issued", snapshot.http_reqs),
        ("surge_iterations_total", "Completed iterations", snapshot.iterations),
        ("surge_dropped_iterations_total", "Iterations dropped for lack of VUs", snapshot.dropped_iterations),
        ("surge_rate_limit_hits_total", "Rate-limited responses", snapshot.rate_limit_hits),
        ("surge_auth_requests_total", "Requests against the auth budget", snapshot.auth_requests),
        ("surge_read_requests_total", "Requests against the read budget", snapshot.read_requests),
        ("surge_write_requests_total", "Requests against the write budget", snapshot.write_requests),
    ];
    for (name, help, value) in counters {
        let counter = IntCounter::new(name, help)?;
        counter.inc_by(value);
        registry.register(Box::new(counter))?;
    }

    let rates = [
        ("surge_errors_rate", "Share of calls failing their checks", snapshot.errors.rate),
        ("surge_rate_limit_errors_rate", "Share of calls rate limited", snapshot.rate_limit_errors.rate),
        ("surge_http_req_failed_rate", "Share of responses outside 2xx/3xx", snapshot.http_req_failed.rate),
        ("surge_auth_rate_limited_rate", "Share of auth calls rate limited", snapshot.auth_rate_limited.rate),
        ("surge_read_rate_limited_rate", "Share of read calls rate limited", snapshot.read_rate_limited.rate),
        ("surge_write_rate_limited_rate", "Share of write calls rate limited", snapshot.write_rate_limited.rate),
    ];
    for (name, help, value) in rates {
        let gauge = Gauge::new(name, help)?;
        gauge.set(value);
        registry.register(Box::new(gauge))?;
    }

    let trends = GaugeVec::new(
        Opts::new("surge_trend_milliseconds", "Latency trend statistics"),
        &["stat", "trend"],
    )?;
    for (trend, t) in [
        ("http_req_duration", &snapshot.http_req_duration),
        ("login_duration", &snapshot.login_duration),
        ("register_duration", &snapshot.register_duration),
    ] {
        for (stat, value) in [
            ("avg", t.avg_ms),
            ("med", t.med_ms),
            ("p90", t.p90_ms),
            ("p95", t.p95_ms),
            ("p99", t.p99_ms),
            ("max", t.max_ms),
        ] {
            trends.with_label_values(&[stat, trend]).set(value);
        }
    }
    registry.register(Box::new(trends))?;

    let checks = IntCounterVec::new(
        Opts::new("surge_checks_total", "Check verdicts per endpoint"),
        &["endpoint", "result"],
    )?;
    for (endpoint, tally) in &snapshot.checks {
        checks
            .with_label_values(&[endpoint.as_str(), "pass"])
            .inc_by(tally.passes);
        checks
            .with_label_values(&[endpoint.as_str(), "fail"])
            .inc_by(tally.fails);
    }
    registry.register(Box::new(checks))?;

    let stages = IntCounterVec::new(
        Opts::new("surge_stage_requests_total", "Requests per stage tag"),
        &["outcome", "stage"],
    )?;
    for (tag, tally) in &snapshot.stages {
        stages
            .with_label_values(&["issued", tag.as_str()])
            .inc_by(tally.requests);
        stages
            .with_label_values(&["rate_limited", tag.as_str()])
            .inc_by(tally.rate_limited);
    }
    registry.register(Box::new(stages))?;

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

/// Write the Prometheus export to `path`
pub fn write_prometheus(path: &Path, snapshot: &MetricsSnapshot) -> Result<()> {
    let text = prometheus_text(snapshot)?;
    std::fs::write(path, text).map_err(|source| LoadTestError::ArtifactWrite {
        path: path.display().to_string(),
        source,
    })
}
