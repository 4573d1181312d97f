//! The parameterized endpoint probe
//!
//! One call path for every endpoint: gate, build, issue, classify, record,
//! then either back off (rate-limited) or run the endpoint's follow-up.
//! A rate-limited call is terminal; the backoff delays the caller's next
//! action and nothing is resubmitted.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::classifier::{is_rate_limited, retry_after};
use crate::config::{BackoffPolicy, Credentials};
use crate::endpoint::{Category, EndpointCatalog, EndpointId, EndpointSpec};
use crate::metrics::{MetricSinks, ResponseRecord};
use crate::session::Session;
use crate::transport::{HttpOutcome, HttpRequest, HttpTransport};

/// Per-call context supplied by the orchestrator
#[derive(Debug, Clone, Copy)]
pub struct ProbeContext<'a> {
    pub session: &'a Session,
    /// Tag of the stage that scheduled the iteration
    pub stage: &'a str,
}

/// Verdict of one issued call
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub endpoint: EndpointId,
    pub status: u16,
    pub latency: Duration,
    pub rate_limited: bool,
    /// All checks passed (a rate-limited answer counts as accepted)
    pub success: bool,
    /// Server wait hint on rejections
    pub retry_after: Option<Duration>,
    /// Pause applied after a rate-limited answer
    pub backoff: Option<Duration>,
    /// Nested call issued after this one, if any
    pub follow_up: Option<Box<ProbeOutcome>>,
}

/// Issues calls described by the endpoint table and records their outcomes
pub struct EndpointProbe {
    transport: Arc<dyn HttpTransport>,
    sinks: Arc<MetricSinks>,
    catalog: Arc<EndpointCatalog>,
    base_url: String,
    credentials: Credentials,
    backoff: BackoffPolicy,
}

impl EndpointProbe {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        sinks: Arc<MetricSinks>,
        catalog: Arc<EndpointCatalog>,
        base_url: &str,
        credentials: Credentials,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            transport,
            sinks,
            catalog,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            backoff,
        }
    }

    pub fn sinks(&self) -> &Arc<MetricSinks> {
        &self.sinks
    }

    /// Probe one endpoint and, when its trigger holds, its follow-up.
    ///
    /// Returns `None` when the activation gate skipped the call or the
    /// endpoint needs a token the session does not have.
    pub async fn probe<R: Rng + Send>(
        &self,
        id: EndpointId,
        ctx: &ProbeContext<'_>,
        rng: &mut R,
    ) -> Option<ProbeOutcome> {
        let spec = self.catalog.get(id);
        let mut outcome = self.issue(spec, ctx, rng, Duration::ZERO).await?;

        if let Some(follow_up) = spec.follow_up {
            if !outcome.rate_limited && follow_up.trigger.holds(outcome.status, outcome.success)
            {
                let target = self.catalog.get(follow_up.target);
                outcome.follow_up = self
                    .issue(target, ctx, rng, follow_up.delay)
                    .await
                    .map(Box::new);
            }
        }

        Some(outcome)
    }

    async fn issue<R: Rng + Send>(
        &self,
        spec: &EndpointSpec,
        ctx: &ProbeContext<'_>,
        rng: &mut R,
        delay: Duration,
    ) -> Option<ProbeOutcome> {
        if rng.gen::<f64>() >= spec.activation {
            return None;
        }
        let bearer = if spec.authenticated {
            match ctx.session.token() {
                Some(token) => Some(token.to_string()),
                None => {
                    debug!("Skipping {}: no session token", spec.name);
                    return None;
                }
            }
        } else {
            None
        };

        if !delay.is_zero() {
            sleep(delay).await;
        }

        let request = HttpRequest {
            method: spec.method,
            url: format!("{}{}", self.base_url, spec.render_path(rng)),
            bearer,
            body: spec.payload.map(|p| p.build(rng, &self.credentials)),
        };

        self.sinks.record_issued(spec.category);
        let start = Instant::now();
        let response = match self.transport.send(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!("{} failed: {}", spec.name, e);
                HttpOutcome::transport_failure(start.elapsed())
            }
        };

        let rate_limited = is_rate_limited(response.status, &response.body);
        let success = evaluate_checks(spec, &response, rate_limited);
        self.sinks.record_response(&ResponseRecord {
            endpoint: spec.name,
            category: spec.category,
            stage: ctx.stage,
            status: response.status,
            latency: response.latency,
            rate_limited,
            check_passed: success,
            trend: spec.trend,
        });

        let mut outcome = ProbeOutcome {
            endpoint: spec.id,
            status: response.status,
            latency: response.latency,
            rate_limited,
            success,
            retry_after: None,
            backoff: None,
            follow_up: None,
        };

        if rate_limited {
            let pause = self.backoff.for_category(spec.category).sample(rng);
            outcome.retry_after = retry_after(&response.headers, &response.body);
            if spec.category == Category::Auth {
                info!("{} rate limited - expected behavior", spec.name);
            } else {
                debug!(
                    "{} rate limited, backing off {}ms",
                    spec.name,
                    pause.as_millis()
                );
            }
            sleep(pause).await;
            outcome.backoff = Some(pause);
        } else if !success {
            debug!(
                "{} unexpected answer: {} in {}ms",
                spec.name,
                response.status,
                response.latency.as_millis()
            );
        }

        Some(outcome)
    }
}

/// Status, token and latency checks for one response
fn evaluate_checks(spec: &EndpointSpec, response: &HttpOutcome, rate_limited: bool) -> bool {
    let status_ok = rate_limited || spec.accepts(response.status);
    let token_ok = !spec.expects_token || rate_limited || response.access_token().is_some();
    let latency_ok = spec
        .max_latency
        .map_or(true, |max| response.latency < max);
    status_ok && token_ok && latency_ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{Reply, ScriptedTransport};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::collections::HashMap;

    const BASE: &str = "http://api.test/api";

    fn always_on() -> EndpointCatalog {
        let all: HashMap<String, f64> = EndpointCatalog::standard()
            .iter()
            .map(|s| (s.name.to_string(), 1.0))
            .collect();
        EndpointCatalog::standard()
            .with_activation_overrides(&all)
            .unwrap()
    }

    fn probe_with(
        transport: ScriptedTransport,
        catalog: EndpointCatalog,
    ) -> (EndpointProbe, Arc<ScriptedTransport>) {
        let transport = Arc::new(transport);
        let probe = EndpointProbe::new(
            transport.clone(),
            Arc::new(MetricSinks::new()),
            Arc::new(catalog),
            BASE,
            Credentials::default(),
            BackoffPolicy::default(),
        );
        (probe, transport)
    }

    fn ctx(session: &Session) -> ProbeContext<'_> {
        ProbeContext {
            session,
            stage: "load",
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transactions_success() {
        let (probe, transport) = probe_with(
            ScriptedTransport::new(BASE)
                .always("/users/transaction", Reply::status(200).latency_ms(150)),
            always_on(),
        );
        let session = Session::authenticated("tok");
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        let outcome = probe
            .probe(EndpointId::Transactions, &ctx(&session), &mut rng)
            .await
            .unwrap();

        assert!(outcome.success);
        assert!(!outcome.rate_limited);
        assert_eq!(outcome.latency, Duration::from_millis(150));
        assert_eq!(outcome.backoff, None);

        let s = probe.sinks().snapshot();
        assert_eq!(s.read_requests, 1);
        assert_eq!(s.rate_limit_hits, 0);
        assert_eq!(s.errors.hits, 0);
        assert_eq!(s.errors.total, 1);
        assert_eq!(s.login_duration.count, 0);

        let sent = transport.sent.lock();
        assert_eq!(sent[0].bearer.as_deref(), Some("tok"));
        assert!(sent[0].url.contains("/users/transaction?limit="));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spin_rate_limited_backs_off_in_write_window() {
        let (probe, _) = probe_with(
            ScriptedTransport::new(BASE).always("/users/spin", Reply::rate_limited()),
            always_on(),
        );
        let session = Session::authenticated("tok");
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let start = Instant::now();

        let outcome = probe
            .probe(EndpointId::Spin, &ctx(&session), &mut rng)
            .await
            .unwrap();

        assert!(outcome.rate_limited);
        assert!(outcome.success);
        assert_eq!(outcome.retry_after, Some(Duration::from_secs(30)));
        let backoff = outcome.backoff.unwrap();
        assert!(BackoffPolicy::default().write.contains(backoff));
        // timer wheel resolution is one millisecond
        let waited = start.elapsed();
        assert!(waited >= backoff && waited <= backoff + Duration::from_millis(1));
        assert!(outcome.follow_up.is_none());

        let s = probe.sinks().snapshot();
        assert_eq!(s.rate_limit_hits, 1);
        assert_eq!(s.write_requests, 1);
        assert_eq!(s.write_rate_limited.hits, 1);
        assert_eq!(s.errors.hits, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_primary_skips_follow_up() {
        let (probe, transport) = probe_with(
            ScriptedTransport::new(BASE).always("/spin-prize-list", Reply::rate_limited()),
            always_on(),
        );
        let session = Session::authenticated("tok");
        let mut rng = ChaCha8Rng::seed_from_u64(3);

        let outcome = probe
            .probe(EndpointId::SpinPrizeList, &ctx(&session), &mut rng)
            .await
            .unwrap();

        assert!(outcome.follow_up.is_none());
        assert!(BackoffPolicy::default().read.contains(outcome.backoff.unwrap()));
        assert_eq!(transport.paths(), vec!["/spin-prize-list"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_follow_up_runs_after_spacing() {
        let (probe, transport) = probe_with(ScriptedTransport::new(BASE), always_on());
        let session = Session::authenticated("tok");
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let start = Instant::now();

        let outcome = probe
            .probe(EndpointId::SpinPrizeList, &ctx(&session), &mut rng)
            .await
            .unwrap();

        let spin = outcome.follow_up.unwrap();
        assert_eq!(spin.endpoint, EndpointId::Spin);
        assert_eq!(start.elapsed(), Duration::from_secs(1));
        assert_eq!(transport.paths(), vec!["/spin-prize-list", "/users/spin"]);

        let s = probe.sinks().snapshot();
        assert_eq!(s.read_requests, 1);
        assert_eq!(s.write_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_payment_lookup_only_after_creation() {
        let (probe, transport) = probe_with(
            ScriptedTransport::new(BASE)
                .queue("/users/investments", vec![Reply::status(422), Reply::status(201)]),
            always_on(),
        );
        let session = Session::authenticated("tok");
        let mut rng = ChaCha8Rng::seed_from_u64(5);

        let rejected = probe
            .probe(EndpointId::CreateInvestment, &ctx(&session), &mut rng)
            .await
            .unwrap();
        assert!(rejected.success);
        assert!(rejected.follow_up.is_none());

        let created = probe
            .probe(EndpointId::CreateInvestment, &ctx(&session), &mut rng)
            .await
            .unwrap();
        let lookup = created.follow_up.unwrap();
        assert_eq!(lookup.endpoint, EndpointId::PaymentLookup);

        let paths = transport.paths();
        assert_eq!(paths.len(), 3);
        assert!(paths[2].starts_with("/users/payments/INV-"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gated_out_call_has_no_side_effects() {
        let mut zero = HashMap::new();
        zero.insert("products".to_string(), 0.0);
        let catalog = EndpointCatalog::standard()
            .with_activation_overrides(&zero)
            .unwrap();
        let (probe, transport) = probe_with(ScriptedTransport::new(BASE), catalog);
        let session = Session::authenticated("tok");
        let mut rng = ChaCha8Rng::seed_from_u64(6);

        for _ in 0..20 {
            assert!(probe
                .probe(EndpointId::Products, &ctx(&session), &mut rng)
                .await
                .is_none());
        }

        assert!(transport.paths().is_empty());
        assert_eq!(probe.sinks().snapshot().http_reqs, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_authenticated_endpoint_skipped_without_token() {
        let (probe, transport) = probe_with(ScriptedTransport::new(BASE), always_on());
        let session = Session::anonymous();
        let mut rng = ChaCha8Rng::seed_from_u64(7);

        assert!(probe
            .probe(EndpointId::UserInfo, &ctx(&session), &mut rng)
            .await
            .is_none());
        assert!(transport.paths().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_status_counts_as_error() {
        let (probe, _) = probe_with(
            ScriptedTransport::new(BASE).always("/products", Reply::status(500)),
            always_on(),
        );
        let session = Session::authenticated("tok");
        let mut rng = ChaCha8Rng::seed_from_u64(8);

        let outcome = probe
            .probe(EndpointId::Products, &ctx(&session), &mut rng)
            .await
            .unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.backoff, None);
        let s = probe.sinks().snapshot();
        assert_eq!(s.errors.hits, 1);
        assert_eq!(s.http_req_failed.hits, 1);
        assert_eq!(s.checks["products"].fails, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_response_fails_latency_check() {
        let (probe, _) = probe_with(
            ScriptedTransport::new(BASE).always("/users/info", Reply::status(200).latency_ms(450)),
            always_on(),
        );
        let session = Session::authenticated("tok");
        let mut rng = ChaCha8Rng::seed_from_u64(9);

        let outcome = probe
            .probe(EndpointId::UserInfo, &ctx(&session), &mut rng)
            .await
            .unwrap();
        assert!(!outcome.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_records_trend_and_requires_token() {
        let (probe, transport) = probe_with(
            ScriptedTransport::new(BASE)
                .queue("/login", vec![Reply::status(200), Reply::token("t")]),
            always_on(),
        );
        let session = Session::anonymous();
        let mut rng = ChaCha8Rng::seed_from_u64(10);

        let missing = probe
            .probe(EndpointId::Login, &ctx(&session), &mut rng)
            .await
            .unwrap();
        let ok = probe
            .probe(EndpointId::Login, &ctx(&session), &mut rng)
            .await
            .unwrap();

        assert!(!missing.success);
        assert!(ok.success);
        let s = probe.sinks().snapshot();
        assert_eq!(s.auth_requests, 2);
        assert_eq!(s.login_duration.count, 2);
        assert_eq!(transport.sent.lock()[0].bearer, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_is_recorded_as_status_zero() {
        let (probe, _) = probe_with(ScriptedTransport::unreachable(BASE), always_on());
        let session = Session::authenticated("tok");
        let mut rng = ChaCha8Rng::seed_from_u64(11);

        let outcome = probe
            .probe(EndpointId::Tasks, &ctx(&session), &mut rng)
            .await
            .unwrap();

        assert_eq!(outcome.status, 0);
        assert!(!outcome.success);
        assert!(!outcome.rate_limited);
        assert_eq!(probe.sinks().snapshot().read_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exactly_one_path_and_one_count_per_call() {
        let (probe, _) = probe_with(
            ScriptedTransport::new(BASE).queue(
                "/products",
                vec![
                    Reply::rate_limited(),
                    Reply::status(200),
                    Reply::status(500),
                    Reply::rate_limited(),
                ],
            ),
            always_on(),
        );
        let session = Session::authenticated("tok");
        let mut rng = ChaCha8Rng::seed_from_u64(12);

        for _ in 0..4 {
            let o = probe
                .probe(EndpointId::Products, &ctx(&session), &mut rng)
                .await
                .unwrap();
            assert_eq!(o.rate_limited, o.backoff.is_some());
        }
        let s = probe.sinks().snapshot();
        assert_eq!(s.read_requests, 4);
        assert_eq!(s.rate_limit_hits, 2);
    }
}
