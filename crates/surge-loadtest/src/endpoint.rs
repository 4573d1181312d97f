//! Static description of every API surface the driver exercises.
//!
//! One [`EndpointSpec`] per endpoint; the probe is generic over this table, so
//! rate-limit handling, counters and checks are identical for every entry.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::Credentials;
use crate::error::{LoadTestError, Result};
use crate::generators;
use crate::metrics::TrendKind;

// ============================================================================
// CLASSIFICATION
// ============================================================================

/// Rate budget an endpoint counts against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Auth,
    Read,
    Write,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Auth, Category::Read, Category::Write];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP methods used by the target API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
}

impl Method {
    pub fn as_reqwest(&self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
            Self::Put => reqwest::Method::PUT,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
        })
    }
}

/// Identity of an endpoint in the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointId {
    Register,
    Login,
    Products,
    UserInfo,
    TeamInvited,
    TeamLevel,
    SpinPrizeList,
    Spin,
    Tasks,
    Transactions,
    BankUpdate,
    CreateInvestment,
    PaymentLookup,
    ChangePassword,
}

// ============================================================================
// REQUEST BUILDERS
// ============================================================================

/// JSON body builders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    /// Fresh identity with the configured referral code
    Register,
    /// Fixed test credentials
    Login,
    /// `{}`
    EmptyObject,
    /// Random bank account for account id 1
    BankUpdate,
    /// Random product and amount, paid by QRIS
    Investment,
    /// Rotates the password to itself
    ChangePassword,
}

impl Payload {
    pub fn build<R: Rng + ?Sized>(&self, rng: &mut R, credentials: &Credentials) -> Value {
        match self {
            Self::Register => json!({
                "name": generators::display_name(rng),
                "number": generators::phone_number(rng),
                "password": credentials.password,
                "password_confirmation": credentials.password,
                "referral_code": credentials.referral_code,
            }),
            Self::Login => credentials.login_body(),
            Self::EmptyObject => json!({}),
            Self::BankUpdate => json!({
                "id": 1,
                "bank_id": generators::bank_id(rng),
                "account_number": generators::account_number(rng),
                "account_name": generators::account_name(rng),
            }),
            Self::Investment => json!({
                "product_id": generators::product_id(rng),
                "amount": generators::investment_amount(rng),
                "payment_method": "QRIS",
            }),
            Self::ChangePassword => json!({
                "current_password": credentials.password,
                "password": credentials.password,
                "confirmation_password": credentials.password,
            }),
        }
    }
}

/// Placeholders substituted into a path template
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathParams {
    /// `{level}`
    TeamLevel,
    /// `{limit}` and `{page}`
    Pagination,
    /// `{invoice_id}`
    Invoice,
}

impl PathParams {
    pub fn render<R: Rng + ?Sized>(&self, template: &str, rng: &mut R) -> String {
        match self {
            Self::TeamLevel => {
                template.replace("{level}", &generators::team_level(rng).to_string())
            }
            Self::Pagination => {
                let p = generators::pagination(rng);
                template
                    .replace("{limit}", &p.limit.to_string())
                    .replace("{page}", &p.page.to_string())
            }
            Self::Invoice => template.replace("{invoice_id}", &generators::invoice_id(rng)),
        }
    }
}

/// Condition on the primary response that allows a follow-up probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The primary call passed its checks
    Accepted,
    /// The primary call passed its checks with one of these statuses
    Status(&'static [u16]),
}

impl Trigger {
    pub fn holds(&self, status: u16, success: bool) -> bool {
        match self {
            Self::Accepted => success,
            Self::Status(codes) => success && codes.contains(&status),
        }
    }
}

/// Nested probe run after a successful, non-rate-limited primary call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FollowUp {
    pub target: EndpointId,
    pub trigger: Trigger,
    /// Fixed spacing before the follow-up is considered
    pub delay: Duration,
}

// ============================================================================
// ENDPOINT SPEC
// ============================================================================

/// Static configuration of one API surface
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointSpec {
    pub id: EndpointId,
    /// Stable name used in metrics and config overrides
    pub name: &'static str,
    pub method: Method,
    /// Path below the base URL, possibly with placeholders
    pub path: &'static str,
    /// Probability that an iteration issues this call
    pub activation: f64,
    pub category: Category,
    /// Sends the session's bearer token; skipped without one
    pub authenticated: bool,
    pub payload: Option<Payload>,
    pub params: Option<PathParams>,
    /// Statuses accepted as a correct answer (429 is always accepted)
    pub expected: &'static [u16],
    /// Latency expectation, checked but never enforced
    pub max_latency: Option<Duration>,
    /// A non-rate-limited response must carry `data.access_token`
    pub expects_token: bool,
    pub trend: Option<TrendKind>,
    pub follow_up: Option<FollowUp>,
}

impl EndpointSpec {
    fn new(
        id: EndpointId,
        name: &'static str,
        method: Method,
        path: &'static str,
        activation: f64,
        category: Category,
    ) -> Self {
        Self {
            id,
            name,
            method,
            path,
            activation,
            category,
            authenticated: category != Category::Auth,
            payload: None,
            params: None,
            expected: &[200],
            max_latency: None,
            expects_token: false,
            trend: None,
            follow_up: None,
        }
    }

    fn payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    fn params(mut self, params: PathParams) -> Self {
        self.params = Some(params);
        self
    }

    fn accepting(mut self, statuses: &'static [u16]) -> Self {
        self.expected = statuses;
        self
    }

    fn max_latency_ms(mut self, ms: u64) -> Self {
        self.max_latency = Some(Duration::from_millis(ms));
        self
    }

    fn issues_token(mut self, trend: TrendKind) -> Self {
        self.expects_token = true;
        self.trend = Some(trend);
        self
    }

    fn then(mut self, target: EndpointId, trigger: Trigger, delay: Duration) -> Self {
        self.follow_up = Some(FollowUp {
            target,
            trigger,
            delay,
        });
        self
    }

    /// Concrete path for one call, placeholders filled from `rng`
    pub fn render_path<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        match self.params {
            Some(params) => params.render(self.path, rng),
            None => self.path.to_string(),
        }
    }

    /// Whether a status counts as a correct answer
    pub fn accepts(&self, status: u16) -> bool {
        status == 429 || self.expected.contains(&status)
    }
}

/// The table of endpoints, keyed by [`EndpointId`]
#[derive(Debug, Clone)]
pub struct EndpointCatalog {
    specs: HashMap<EndpointId, EndpointSpec>,
}

impl EndpointCatalog {
    /// Default table for the target API
    pub fn standard() -> Self {
        use Category::*;
        use EndpointId::*;

        let specs = vec![
            EndpointSpec::new(Register, "register", Method::Post, "/register", 0.05, Auth)
                .payload(Payload::Register)
                .accepting(&[200, 201])
                .max_latency_ms(2000)
                .issues_token(TrendKind::Register),
            EndpointSpec::new(Login, "login", Method::Post, "/login", 0.03, Auth)
                .payload(Payload::Login)
                .max_latency_ms(1000)
                .issues_token(TrendKind::Login),
            EndpointSpec::new(Products, "products", Method::Get, "/products", 0.7, Read)
                .max_latency_ms(500),
            EndpointSpec::new(UserInfo, "user_info", Method::Get, "/users/info", 0.6, Read)
                .max_latency_ms(400),
            EndpointSpec::new(
                TeamInvited,
                "team_invited",
                Method::Get,
                "/users/team-invited",
                0.4,
                Read,
            )
            .then(TeamLevel, Trigger::Accepted, Duration::ZERO),
            EndpointSpec::new(
                TeamLevel,
                "team_level",
                Method::Get,
                "/users/team-invited/{level}",
                0.2,
                Read,
            )
            .params(PathParams::TeamLevel),
            EndpointSpec::new(
                SpinPrizeList,
                "spin_prize_list",
                Method::Get,
                "/spin-prize-list",
                0.3,
                Read,
            )
            .then(Spin, Trigger::Accepted, Duration::from_secs(1)),
            EndpointSpec::new(Spin, "spin", Method::Post, "/users/spin", 0.3, Write)
                .payload(Payload::EmptyObject)
                .accepting(&[200, 400, 403]),
            EndpointSpec::new(Tasks, "tasks", Method::Get, "/users/task", 0.4, Read),
            EndpointSpec::new(
                Transactions,
                "transactions",
                Method::Get,
                "/users/transaction?limit={limit}&page={page}",
                0.5,
                Read,
            )
            .params(PathParams::Pagination)
            .max_latency_ms(1000),
            EndpointSpec::new(BankUpdate, "bank_update", Method::Put, "/users/bank", 0.1, Write)
                .payload(Payload::BankUpdate)
                .accepting(&[200, 400, 422]),
            EndpointSpec::new(
                CreateInvestment,
                "create_investment",
                Method::Post,
                "/users/investments",
                0.08,
                Write,
            )
            .payload(Payload::Investment)
            .accepting(&[200, 201, 400, 422])
            .then(
                PaymentLookup,
                Trigger::Status(&[200, 201]),
                Duration::from_secs(2),
            ),
            EndpointSpec::new(
                PaymentLookup,
                "payment_lookup",
                Method::Get,
                "/users/payments/{invoice_id}",
                1.0,
                Read,
            )
            .params(PathParams::Invoice)
            .accepting(&[200, 404]),
            EndpointSpec::new(
                ChangePassword,
                "change_password",
                Method::Post,
                "/users/change-password",
                0.03,
                Write,
            )
            .payload(Payload::ChangePassword)
            .accepting(&[200, 400, 422]),
        ];

        Self {
            specs: specs.into_iter().map(|s| (s.id, s)).collect(),
        }
    }

    /// Replace activation probabilities by endpoint name
    pub fn with_activation_overrides(mut self, overrides: &HashMap<String, f64>) -> Result<Self> {
        for (name, probability) in overrides {
            if !(0.0..=1.0).contains(probability) {
                return Err(LoadTestError::InvalidConfig(format!(
                    "activation for '{}' must be within [0, 1], got {}",
                    name, probability
                )));
            }
            let spec = self
                .specs
                .values_mut()
                .find(|s| s.name == name.as_str())
                .ok_or_else(|| {
                    LoadTestError::InvalidConfig(format!("unknown endpoint '{}'", name))
                })?;
            spec.activation = *probability;
        }
        Ok(self)
    }

    pub fn get(&self, id: EndpointId) -> &EndpointSpec {
        // standard() registers every variant and overrides never remove entries
        &self.specs[&id]
    }

    pub fn iter(&self) -> impl Iterator<Item = &EndpointSpec> {
        self.specs.values()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

impl Default for EndpointCatalog {
    fn default() -> Self {
        Self::standard()
    }
}
