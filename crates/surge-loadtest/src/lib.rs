//! # Surge API Load Driver
//!
//! Rate-limit aware synthetic load for the investment platform REST API.
//! Virtual users walk a fixed user journey (register, login, browse, spin,
//! invest, ...) across concurrent traffic stages while the driver detects
//! rate-limit rejections, backs off per budget category and reports how the
//! API's limits held up.
//!
//! ## Features
//!
//! - **Stage Scheduling**: constant-VU, ramping-VU and constant-arrival-rate executors
//! - **Endpoint Table**: one parameterized probe for every API surface
//! - **Rate-Limit Handling**: classification, per-category backoff, no resubmission
//! - **Metrics Collection**: HDR histogram trends, rates and counters
//! - **Reporting**: console report, JSON artifact, thresholds, Prometheus text
//!
//! ## Usage
//!
//! ```bash
//! # Full run: smoke, load and rate-limit stress stages
//! cargo run --package surge-loadtest -- --target http://localhost:8080/api
//!
//! # Smoke stage only, reproducible
//! cargo run --package surge-loadtest -- smoke --seed 42
//!
//! # Show the resolved configuration
//! cargo run --package surge-loadtest -- check-config --config surge.toml
//! ```

pub mod classifier;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod generators;
pub mod metrics;
pub mod orchestrator;
pub mod probe;
pub mod report;
pub mod runner;
pub mod scheduler;
pub mod session;
pub mod transport;

pub use classifier::{is_rate_limited, retry_after};
pub use config::LoadTestConfig;
pub use endpoint::{Category, EndpointCatalog, EndpointId, EndpointSpec};
pub use error::{LoadTestError, Result};
pub use metrics::{MetricSinks, MetricsSnapshot};
pub use orchestrator::IterationOrchestrator;
pub use probe::{EndpointProbe, ProbeContext, ProbeOutcome};
pub use report::{evaluate_thresholds, RunInfo, RunSummary, SummaryArtifact, ThresholdReport};
pub use runner::{LoadTestRunner, RunOutcome};
pub use scheduler::{default_scenarios, StageDefinition, StageScheduler, Workload};
pub use session::{Session, SessionBootstrapper};
pub use transport::{HttpOutcome, HttpRequest, HttpTransport, ReqwestTransport};
