//! Stage scheduler and executors
//!
//! Every stage runs concurrently with the others, gated by its start offset.
//! Virtual users are tokio tasks; each owns a seeded random source and
//! repeatedly calls the [`Workload`] until its executor tells it to stop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::error::{LoadTestError, Result};
use crate::metrics::{Counter, MetricSinks};

/// How often a ramping stage re-evaluates its VU target
const RAMP_TICK: Duration = Duration::from_millis(500);

// ============================================================================
// STAGE DEFINITIONS
// ============================================================================

/// One traffic stage of a run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageDefinition {
    /// Unique name, used by `--scenario`
    pub name: String,

    /// Tag attached to every request of the stage
    pub tag: String,

    /// Delay from run start before the stage begins
    #[serde(default)]
    pub start_offset_secs: u64,

    /// Time running iterations get to finish once the stage ends
    #[serde(default = "default_graceful_stop_secs")]
    pub graceful_stop_secs: u64,

    pub executor: ExecutorKind,
}

fn default_graceful_stop_secs() -> u64 {
    30
}

/// Concurrency profile of a stage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ExecutorKind {
    /// Fixed number of VUs looping for a fixed time
    ConstantVus { vus: u64, duration_secs: u64 },

    /// VU count interpolated linearly between targets
    RampingVus {
        start_vus: u64,
        stages: Vec<RampStage>,
    },

    /// Fixed iteration start rate, independent of response times
    ConstantArrivalRate {
        /// Iterations started per `time_unit_secs`
        rate: u64,
        #[serde(default = "default_time_unit_secs")]
        time_unit_secs: u64,
        duration_secs: u64,
        pre_allocated_vus: u64,
        max_vus: u64,
    },
}

fn default_time_unit_secs() -> u64 {
    1
}

/// One segment of a ramping stage
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RampStage {
    pub duration_secs: u64,
    pub target: u64,
}

impl RampStage {
    pub const fn new(duration_secs: u64, target: u64) -> Self {
        Self {
            duration_secs,
            target,
        }
    }
}

impl ExecutorKind {
    /// Time during which the executor starts new iterations
    pub fn duration(&self) -> Duration {
        let secs = match self {
            Self::ConstantVus { duration_secs, .. } => *duration_secs,
            Self::RampingVus { stages, .. } => stages.iter().map(|s| s.duration_secs).sum(),
            Self::ConstantArrivalRate { duration_secs, .. } => *duration_secs,
        };
        Duration::from_secs(secs)
    }

    /// Most VUs the executor can have alive at once
    pub fn max_vus(&self) -> u64 {
        match self {
            Self::ConstantVus { vus, .. } => *vus,
            Self::RampingVus { start_vus, stages } => stages
                .iter()
                .map(|s| s.target)
                .fold(*start_vus, u64::max),
            Self::ConstantArrivalRate { max_vus, .. } => *max_vus,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ConstantVus { .. } => "constant-vus",
            Self::RampingVus { .. } => "ramping-vus",
            Self::ConstantArrivalRate { .. } => "constant-arrival-rate",
        }
    }
}

impl StageDefinition {
    pub fn start_offset(&self) -> Duration {
        Duration::from_secs(self.start_offset_secs)
    }

    pub fn graceful_stop(&self) -> Duration {
        Duration::from_secs(self.graceful_stop_secs)
    }

    /// Latest point, from run start, at which the stage can still be running
    pub fn end_offset(&self) -> Duration {
        self.start_offset() + self.executor.duration() + self.graceful_stop()
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| {
            Err(LoadTestError::InvalidConfig(format!(
                "scenario '{}': {}",
                self.name, msg
            )))
        };
        if self.name.trim().is_empty() {
            return Err(LoadTestError::InvalidConfig("scenario name is empty".into()));
        }
        if self.tag.trim().is_empty() {
            return invalid("tag is empty");
        }
        match &self.executor {
            ExecutorKind::ConstantVus { vus, duration_secs } => {
                if *vus == 0 {
                    return invalid("vus must be at least 1");
                }
                if *duration_secs == 0 {
                    return invalid("duration must be positive");
                }
            }
            ExecutorKind::RampingVus { stages, .. } => {
                if stages.is_empty() {
                    return invalid("ramping stage list is empty");
                }
            }
            ExecutorKind::ConstantArrivalRate {
                rate,
                time_unit_secs,
                duration_secs,
                pre_allocated_vus,
                max_vus,
            } => {
                if *rate == 0 || *time_unit_secs == 0 || *duration_secs == 0 {
                    return invalid("rate, time unit and duration must be positive");
                }
                if arrival_period(*rate, *time_unit_secs).is_none() {
                    return invalid("rate is too high for its time unit");
                }
                if *max_vus == 0 {
                    return invalid("max_vus must be at least 1");
                }
                if pre_allocated_vus > max_vus {
                    return invalid("pre_allocated_vus exceeds max_vus");
                }
            }
        }
        Ok(())
    }
}

/// Spacing between iteration starts, `None` when it would round to zero
pub fn arrival_period(rate: u64, time_unit_secs: u64) -> Option<Duration> {
    let rate = u32::try_from(rate).ok()?;
    Duration::from_secs(time_unit_secs)
        .checked_div(rate)
        .filter(|period| !period.is_zero())
}

/// The three stages of a full run: smoke, load and rate-limit stress
pub fn default_scenarios() -> Vec<StageDefinition> {
    vec![
        StageDefinition {
            name: "smoke".into(),
            tag: "smoke".into(),
            start_offset_secs: 0,
            graceful_stop_secs: default_graceful_stop_secs(),
            executor: ExecutorKind::ConstantVus {
                vus: 1,
                duration_secs: 60,
            },
        },
        StageDefinition {
            name: "load".into(),
            tag: "load".into(),
            start_offset_secs: 90,
            graceful_stop_secs: default_graceful_stop_secs(),
            executor: ExecutorKind::RampingVus {
                start_vus: 2,
                stages: vec![
                    RampStage::new(120, 5),
                    RampStage::new(300, 8),
                    RampStage::new(180, 12),
                    RampStage::new(120, 5),
                    RampStage::new(120, 0),
                ],
            },
        },
        StageDefinition {
            name: "rate_limit_stress".into(),
            tag: "rate_limit_stress".into(),
            start_offset_secs: 960,
            graceful_stop_secs: default_graceful_stop_secs(),
            executor: ExecutorKind::ConstantArrivalRate {
                rate: 20,
                time_unit_secs: 1,
                duration_secs: 120,
                pre_allocated_vus: 5,
                max_vus: 10,
            },
        },
    ]
}

/// VU target of a ramping stage `elapsed` after it started.
///
/// Linear inside each segment, truncated towards the segment's starting
/// value; zero-length segments jump straight to their target.
pub fn ramp_target(start_vus: u64, stages: &[RampStage], elapsed: Duration) -> u64 {
    let mut from = start_vus;
    let mut remaining = elapsed.as_secs_f64();
    for stage in stages {
        let length = stage.duration_secs as f64;
        if remaining < length {
            let t = remaining / length;
            let value = from as f64 + (stage.target as f64 - from as f64) * t;
            return if stage.target >= from {
                value.floor() as u64
            } else {
                value.ceil() as u64
            };
        }
        remaining -= length;
        from = stage.target;
    }
    from
}

// ============================================================================
// VIRTUAL USERS
// ============================================================================

/// State owned by one virtual user
pub struct VuContext {
    /// Index within its stage
    pub id: u64,
    /// Tag of the stage the VU belongs to
    pub tag: String,
    pub rng: ChaCha8Rng,
    /// Completed iterations so far
    pub iteration: u64,
}

impl VuContext {
    pub fn new(run_seed: u64, tag: &str, id: u64) -> Self {
        Self {
            id,
            tag: tag.to_string(),
            rng: ChaCha8Rng::seed_from_u64(derive_seed(run_seed, tag, id)),
            iteration: 0,
        }
    }
}

/// Seed of one VU's random source, stable for a given run seed
pub fn derive_seed(run_seed: u64, tag: &str, vu: u64) -> u64 {
    // FNV-1a over the tag, then mixed with the seed and VU index
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in tag.bytes() {
        h ^= u64::from(b);
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    let mut z = h ^ run_seed ^ vu.wrapping_mul(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// The function each VU runs once per iteration
#[async_trait]
pub trait Workload: Send + Sync + 'static {
    async fn iteration(&self, vu: &mut VuContext);
}

/// Per-stage tallies, folded into the run's sinks as they happen
#[derive(Default)]
struct StageCounters {
    iterations: Counter,
    dropped: Counter,
}

/// What a stage did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    pub name: String,
    pub tag: String,
    pub executor: String,
    pub iterations: u64,
    pub dropped_iterations: u64,
    /// Iterations cancelled when the graceful stop ran out
    pub interrupted: u64,
}

// ============================================================================
// SCHEDULER
// ============================================================================

/// Runs stages against a [`Workload`]
pub struct StageScheduler {
    workload: Arc<dyn Workload>,
    sinks: Arc<MetricSinks>,
    seed: u64,
}

impl StageScheduler {
    pub fn new(workload: Arc<dyn Workload>, sinks: Arc<MetricSinks>, seed: u64) -> Self {
        Self {
            workload,
            sinks,
            seed,
        }
    }

    /// Run every stage concurrently; returns once all of them have ended
    pub async fn run(&self, stages: &[StageDefinition]) -> Result<Vec<StageReport>> {
        for stage in stages {
            stage.validate()?;
        }
        if let Some(last) = stages.iter().map(|s| s.end_offset()).max() {
            info!(
                "Scheduling {} stage(s), up to {}s total",
                stages.len(),
                last.as_secs()
            );
        }
        join_all(stages.iter().map(|s| self.run_stage(s)))
            .await
            .into_iter()
            .collect()
    }

    async fn run_stage(&self, stage: &StageDefinition) -> Result<StageReport> {
        if !stage.start_offset().is_zero() {
            sleep(stage.start_offset()).await;
        }
        info!(
            "Stage {} starting ({}, up to {} VUs)",
            stage.name,
            stage.executor.name(),
            stage.executor.max_vus()
        );

        let counters = Arc::new(StageCounters::default());
        let mut tasks = JoinSet::new();
        match &stage.executor {
            ExecutorKind::ConstantVus { vus, duration_secs } => {
                let (active_tx, stop_tx) =
                    self.spawn_vus(stage, *vus, *vus, &counters, &mut tasks);
                sleep(Duration::from_secs(*duration_secs)).await;
                let _ = stop_tx.send(true);
                drop(active_tx);
            }
            ExecutorKind::RampingVus { start_vus, stages } => {
                let max = stage.executor.max_vus();
                let (active_tx, stop_tx) =
                    self.spawn_vus(stage, max, *start_vus, &counters, &mut tasks);
                let total = stage.executor.duration();
                let started = Instant::now();
                loop {
                    let elapsed = started.elapsed();
                    if elapsed >= total {
                        break;
                    }
                    let target = ramp_target(*start_vus, stages, elapsed);
                    let current = *active_tx.borrow();
                    if current != target {
                        debug!("Stage {} ramping to {} VUs", stage.name, target);
                        let _ = active_tx.send(target);
                    }
                    sleep(RAMP_TICK.min(total - elapsed)).await;
                }
                let _ = stop_tx.send(true);
            }
            ExecutorKind::ConstantArrivalRate {
                rate,
                time_unit_secs,
                duration_secs,
                pre_allocated_vus,
                max_vus,
            } => {
                let period = arrival_period(*rate, *time_unit_secs).ok_or_else(|| {
                    LoadTestError::Scheduler(format!(
                        "stage {}: {} iterations per {}s has no usable period",
                        stage.name, rate, time_unit_secs
                    ))
                })?;
                self.drive_arrivals(
                    stage,
                    ArrivalPlan {
                        rate: *rate,
                        period,
                        time_unit: Duration::from_secs(*time_unit_secs),
                        duration: Duration::from_secs(*duration_secs),
                        pre_allocated: *pre_allocated_vus,
                        max_vus: *max_vus,
                    },
                    &counters,
                    &mut tasks,
                )
                .await;
            }
        }

        let interrupted = finish_gracefully(&mut tasks, stage.graceful_stop()).await;
        if interrupted > 0 {
            warn!(
                "Stage {}: {} iteration(s) interrupted after graceful stop",
                stage.name, interrupted
            );
        }
        let report = StageReport {
            name: stage.name.clone(),
            tag: stage.tag.clone(),
            executor: stage.executor.name().to_string(),
            iterations: counters.iterations.get(),
            dropped_iterations: counters.dropped.get(),
            interrupted,
        };
        info!(
            "Stage {} finished: {} iterations, {} dropped",
            report.name, report.iterations, report.dropped_iterations
        );
        Ok(report)
    }

    /// Spawn `count` looping VUs; the first `active` of them start working
    fn spawn_vus(
        &self,
        stage: &StageDefinition,
        count: u64,
        active: u64,
        counters: &Arc<StageCounters>,
        tasks: &mut JoinSet<()>,
    ) -> (watch::Sender<u64>, watch::Sender<bool>) {
        let (active_tx, active_rx) = watch::channel(active);
        let (stop_tx, stop_rx) = watch::channel(false);
        for id in 0..count {
            let vu = VuContext::new(self.seed, &stage.tag, id);
            tasks.spawn(vu_loop(
                self.workload.clone(),
                vu,
                active_rx.clone(),
                stop_rx.clone(),
                self.sinks.clone(),
                counters.clone(),
            ));
        }
        (active_tx, stop_tx)
    }

    async fn drive_arrivals(
        &self,
        stage: &StageDefinition,
        plan: ArrivalPlan,
        counters: &Arc<StageCounters>,
        tasks: &mut JoinSet<()>,
    ) {
        let pool: Arc<Mutex<Vec<VuContext>>> = Arc::new(Mutex::new(
            (0..plan.pre_allocated)
                .map(|id| VuContext::new(self.seed, &stage.tag, id))
                .collect(),
        ));
        let mut allocated = plan.pre_allocated;
        let mut ticker = interval(plan.period);

        for _ in 0..plan.total_iterations() {
            ticker.tick().await;
            let idle = pool.lock().pop();
            let vu = match idle {
                Some(vu) => vu,
                None if allocated < plan.max_vus => {
                    allocated += 1;
                    debug!("Stage {} allocating VU {}", stage.name, allocated);
                    VuContext::new(self.seed, &stage.tag, allocated - 1)
                }
                None => {
                    counters.dropped.add(1);
                    self.sinks.dropped_iterations.add(1);
                    continue;
                }
            };

            let workload = self.workload.clone();
            let sinks = self.sinks.clone();
            let counters = counters.clone();
            let pool = pool.clone();
            tasks.spawn(async move {
                let mut vu = vu;
                workload.iteration(&mut vu).await;
                vu.iteration += 1;
                counters.iterations.add(1);
                sinks.iterations.add(1);
                pool.lock().push(vu);
            });
        }
    }
}

struct ArrivalPlan {
    rate: u64,
    /// Non-zero, checked by [`arrival_period`]
    period: Duration,
    time_unit: Duration,
    duration: Duration,
    pre_allocated: u64,
    max_vus: u64,
}

impl ArrivalPlan {
    fn total_iterations(&self) -> u64 {
        (self.rate as f64 * self.duration.as_secs_f64() / self.time_unit.as_secs_f64()).round()
            as u64
    }
}

async fn vu_loop(
    workload: Arc<dyn Workload>,
    mut vu: VuContext,
    mut active: watch::Receiver<u64>,
    mut stop: watch::Receiver<bool>,
    sinks: Arc<MetricSinks>,
    counters: Arc<StageCounters>,
) {
    loop {
        let stopped = *stop.borrow();
        if stopped {
            break;
        }
        let target = *active.borrow();
        if vu.id < target {
            workload.iteration(&mut vu).await;
            vu.iteration += 1;
            counters.iterations.add(1);
            sinks.iterations.add(1);
            continue;
        }
        // Idle until the ramp reaches this VU or the stage ends
        tokio::select! {
            changed = active.changed() => if changed.is_err() { break; },
            changed = stop.changed() => if changed.is_err() { break; },
        }
    }
}

/// Wait up to `grace` for running iterations, then cancel the rest.
/// Returns how many were cancelled.
async fn finish_gracefully(tasks: &mut JoinSet<()>, grace: Duration) -> u64 {
    let drained = timeout(grace, async {
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("VU task failed: {}", e);
            }
        }
    })
    .await;
    if drained.is_ok() {
        return 0;
    }
    let interrupted = tasks.len() as u64;
    tasks.shutdown().await;
    interrupted
}
