//! One virtual-user iteration: a fixed journey through the API with
//! think-time pauses between steps.

use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::config::Jitter;
use crate::endpoint::EndpointId;
use crate::probe::{EndpointProbe, ProbeContext, ProbeOutcome};
use crate::scheduler::{VuContext, Workload};
use crate::session::Session;

/// Steps after the session check, each followed by its pause
const JOURNEY: [(EndpointId, Jitter); 9] = [
    (EndpointId::Products, Jitter::new(0.5, 1.0)),
    (EndpointId::UserInfo, Jitter::new(0.5, 1.0)),
    (EndpointId::TeamInvited, Jitter::new(0.8, 1.0)),
    (EndpointId::SpinPrizeList, Jitter::new(0.7, 1.0)),
    (EndpointId::Tasks, Jitter::new(0.6, 1.0)),
    (EndpointId::Transactions, Jitter::new(1.0, 2.0)),
    (EndpointId::BankUpdate, Jitter::new(1.0, 2.0)),
    (EndpointId::CreateInvestment, Jitter::new(1.0, 2.0)),
    (EndpointId::ChangePassword, CLOSING),
];

/// Pause between the session check and the first read
const AFTER_AUTH: Jitter = Jitter::new(1.0, 2.0);

/// Closing pause; also taken by iterations that stop for lack of a session,
/// so a token-less VU never loops without yielding
const CLOSING: Jitter = Jitter::new(2.0, 3.0);

/// What one iteration did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IterationReport {
    /// Calls that were actually issued, in order (follow-ups nested)
    pub outcomes: Vec<ProbeOutcome>,
    /// The iteration stopped after the auth steps for lack of a token
    pub skipped_no_session: bool,
}

impl IterationReport {
    /// Issued calls including follow-ups
    pub fn request_count(&self) -> usize {
        self.outcomes
            .iter()
            .map(|o| {
                let mut n = 1;
                let mut next = o.follow_up.as_deref();
                while let Some(f) = next {
                    n += 1;
                    next = f.follow_up.as_deref();
                }
                n
            })
            .sum()
    }

    /// Whether this is the iteration that should tell the operator the VU
    /// has no token: the first one a VU runs
    pub fn announces_missing_session(&self, completed: u64) -> bool {
        self.skipped_no_session && completed == 0
    }
}

/// Drives the journey for every virtual user of a run
pub struct IterationOrchestrator {
    probe: Arc<EndpointProbe>,
    session: Arc<Session>,
}

impl IterationOrchestrator {
    pub fn new(probe: Arc<EndpointProbe>, session: Arc<Session>) -> Self {
        Self { probe, session }
    }

    pub async fn run_iteration<R: Rng + Send>(&self, stage: &str, rng: &mut R) -> IterationReport {
        let ctx = ProbeContext {
            session: &self.session,
            stage,
        };
        let mut report = IterationReport::default();

        for id in [EndpointId::Register, EndpointId::Login] {
            if let Some(outcome) = self.probe.probe(id, &ctx, rng).await {
                report.outcomes.push(outcome);
            }
        }

        if !self.session.is_authenticated() {
            debug!("No token available, skipping authenticated requests");
            report.skipped_no_session = true;
            sleep(CLOSING.sample(rng)).await;
            return report;
        }
        sleep(AFTER_AUTH.sample(rng)).await;

        for (id, pause) in JOURNEY {
            if let Some(outcome) = self.probe.probe(id, &ctx, rng).await {
                report.outcomes.push(outcome);
            }
            sleep(pause.sample(rng)).await;
        }

        report
    }
}

#[async_trait]
impl Workload for IterationOrchestrator {
    async fn iteration(&self, vu: &mut VuContext) {
        let report = self.run_iteration(&vu.tag, &mut vu.rng).await;
        if report.announces_missing_session(vu.iteration) {
            info!(
                "VU {} ({}) has no session token, authenticated requests are skipped",
                vu.id, vu.tag
            );
        }
        debug!(
            "VU {} iteration {} finished: {} requests",
            vu.id,
            vu.iteration,
            report.request_count()
        );
    }
}
