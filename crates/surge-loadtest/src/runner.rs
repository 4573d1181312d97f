//! Wires configuration, session, probe, orchestrator and scheduler into a run

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::{LoadTestConfig, RunSettings};
use crate::endpoint::EndpointCatalog;
use crate::error::Result;
use crate::metrics::{MetricSinks, MetricsSnapshot};
use crate::orchestrator::IterationOrchestrator;
use crate::probe::EndpointProbe;
use crate::report::{
    evaluate_thresholds, write_artifact, write_prometheus, RunInfo, RunSummary, ThresholdReport,
};
use crate::scheduler::{StageReport, StageScheduler};
use crate::session::SessionBootstrapper;
use crate::transport::{HttpTransport, ReqwestTransport};

/// Everything a finished run produced
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub seed: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub authenticated: bool,
    pub login_attempts: u32,
    pub stages: Vec<StageReport>,
    pub snapshot: MetricsSnapshot,
    pub summary: RunSummary,
    pub thresholds: ThresholdReport,
}

impl RunOutcome {
    pub fn passed(&self) -> bool {
        self.thresholds.passes
    }

    pub fn run_info(&self) -> RunInfo {
        RunInfo {
            seed: self.seed,
            started_at: self.started_at.to_rfc3339(),
            finished_at: self.finished_at.to_rfc3339(),
            duration_secs: (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0,
            authenticated: self.authenticated,
            login_attempts: self.login_attempts,
            stages: self.stages.clone(),
        }
    }

    /// Write the JSON artifact and, when configured, the Prometheus dump
    pub fn write_outputs(&self, settings: &RunSettings) -> Result<()> {
        let mut artifact = self.summary.artifact(&self.snapshot, self.thresholds.clone());
        artifact.run = Some(self.run_info());
        write_artifact(Path::new(&settings.artifact_path), &artifact)?;
        if let Some(path) = &settings.prometheus_path {
            write_prometheus(Path::new(path), &self.snapshot)?;
            info!("Prometheus metrics written to {}", path);
        }
        Ok(())
    }
}

/// Main load test runner
pub struct LoadTestRunner {
    config: LoadTestConfig,
    transport: Arc<dyn HttpTransport>,
    sinks: Arc<MetricSinks>,
    seed: u64,
}

impl LoadTestRunner {
    /// Runner over a pooled HTTP client built from the config
    pub fn new(config: LoadTestConfig) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(&config.target)?);
        Self::with_transport(config, transport)
    }

    pub fn with_transport(
        config: LoadTestConfig,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self> {
        config.validate()?;
        let seed = config.run.seed.unwrap_or_else(rand::random);
        Ok(Self {
            config,
            transport,
            sinks: Arc::new(MetricSinks::new()),
            seed,
        })
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Bootstrap the session, run every stage, then summarize
    pub async fn run(&self) -> Result<RunOutcome> {
        let config = &self.config;
        let started_at = Utc::now();
        info!(
            "Starting load test against {} (seed {})",
            config.target.base_url, self.seed
        );

        let catalog = EndpointCatalog::standard().with_activation_overrides(&config.activation)?;

        let bootstrap = SessionBootstrapper::new(
            self.transport.as_ref(),
            &config.target.base_url,
            &config.credentials,
            &config.session,
        )
        .bootstrap()
        .await;
        if !bootstrap.session.is_authenticated() {
            warn!("Running without a session: iterations stop after the auth steps");
        }
        let authenticated = bootstrap.session.is_authenticated();

        let probe = EndpointProbe::new(
            self.transport.clone(),
            self.sinks.clone(),
            Arc::new(catalog),
            &config.target.base_url,
            config.credentials.clone(),
            config.backoff.clone(),
        );
        let orchestrator =
            IterationOrchestrator::new(Arc::new(probe), Arc::new(bootstrap.session));
        let scheduler = StageScheduler::new(Arc::new(orchestrator), self.sinks.clone(), self.seed);

        let stages = scheduler.run(&config.scenarios).await?;

        let snapshot = self.sinks.snapshot();
        let summary = RunSummary::from_snapshot(&snapshot, &config.budgets);
        let thresholds = evaluate_thresholds(&snapshot, &config.thresholds);
        info!(
            "Load test complete: {} requests, {} rate limited",
            summary.total_requests, summary.rate_limit_hits
        );

        Ok(RunOutcome {
            seed: self.seed,
            started_at,
            finished_at: Utc::now(),
            authenticated,
            login_attempts: bootstrap.attempts,
            stages,
            snapshot,
            summary,
            thresholds,
        })
    }

    /// Live view of the metrics while a run is in progress
    pub fn current_metrics(&self) -> MetricsSnapshot {
        self.sinks.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{ExecutorKind, StageDefinition};
    use crate::transport::mock::{Reply, ScriptedTransport};

    const BASE: &str = "http://api.test/api";

    fn config() -> LoadTestConfig {
        let mut config = LoadTestConfig::default();
        config.target.base_url = BASE.to_string();
        config.run.seed = Some(99);
        config.scenarios = vec![StageDefinition {
            name: "smoke".into(),
            tag: "smoke".into(),
            start_offset_secs: 0,
            graceful_stop_secs: 30,
            executor: ExecutorKind::ConstantVus {
                vus: 2,
                duration_secs: 60,
            },
        }];
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_with_session() {
        let transport =
            Arc::new(ScriptedTransport::new(BASE).always("/login", Reply::token("tok")));
        let runner = LoadTestRunner::with_transport(config(), transport.clone()).unwrap();

        let outcome = runner.run().await.unwrap();

        assert!(outcome.authenticated);
        assert_eq!(outcome.login_attempts, 1);
        assert_eq!(outcome.seed, 99);
        assert!(outcome.snapshot.iterations >= 2);
        assert!(outcome.snapshot.read_requests > 0);
        assert_eq!(outcome.summary.total_requests, outcome.snapshot.http_reqs);
        // Bootstrap login plus every probed call
        assert_eq!(transport.paths().len() as u64, outcome.snapshot.http_reqs + 1);
        assert!(transport
            .sent
            .lock()
            .iter()
            .skip(1)
            .filter(|r| r.url.contains("/users/"))
            .all(|r| r.bearer.as_deref() == Some("tok")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_without_session_only_hits_auth() {
        let transport =
            Arc::new(ScriptedTransport::new(BASE).always("/login", Reply::rate_limited()));
        let runner = LoadTestRunner::with_transport(config(), transport.clone()).unwrap();

        let outcome = runner.run().await.unwrap();

        assert!(!outcome.authenticated);
        assert_eq!(outcome.login_attempts, 3);
        assert_eq!(outcome.snapshot.read_requests, 0);
        assert_eq!(outcome.snapshot.write_requests, 0);
        assert!(transport
            .paths()
            .iter()
            .all(|p| p == "/login" || p == "/register"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_seed_reproduces_request_sequence() {
        let mut runs = Vec::new();
        for _ in 0..2 {
            let transport =
                Arc::new(ScriptedTransport::new(BASE).always("/login", Reply::token("tok")));
            let runner = LoadTestRunner::with_transport(config(), transport.clone()).unwrap();
            runner.run().await.unwrap();
            let mut paths = transport.paths();
            paths.sort();
            runs.push(paths);
        }
        assert_eq!(runs[0], runs[1]);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = config();
        config.activation.insert("products".into(), 2.0);
        let transport = Arc::new(ScriptedTransport::new(BASE));
        assert!(LoadTestRunner::with_transport(config, transport).is_err());
    }

    #[tokio::test]
    async fn test_unknown_activation_override_fails_before_traffic() {
        let mut config = config();
        config.activation.insert("nope".into(), 0.5);
        let transport = Arc::new(ScriptedTransport::new(BASE));
        let runner = LoadTestRunner::with_transport(config, transport.clone()).unwrap();

        assert!(runner.run().await.is_err());
        assert!(transport.paths().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config();
        config.run.artifact_path = dir.path().join("out.json").display().to_string();
        config.run.prometheus_path = Some(dir.path().join("metrics.prom").display().to_string());
        let settings = config.run.clone();
        let transport =
            Arc::new(ScriptedTransport::new(BASE).always("/login", Reply::token("tok")));
        let runner = LoadTestRunner::with_transport(config, transport).unwrap();

        let outcome = runner.run().await.unwrap();
        outcome.write_outputs(&settings).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("out.json")).unwrap())
                .unwrap();
        assert!(json.get("rate_limit_analysis").is_some());
        assert_eq!(json["run"]["seed"], 99);
        assert_eq!(json["run"]["stages"][0]["name"], "smoke");
        let prom = std::fs::read_to_string(dir.path().join("metrics.prom")).unwrap();
        assert!(prom.contains("surge_http_reqs_total"));
    }
}
