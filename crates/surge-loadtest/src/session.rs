//! Run-wide session bootstrap
//!
//! The token is acquired once before any virtual user starts and then shared
//! read-only for the whole run.

use std::time::Duration;

use serde::Serialize;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::classifier::{is_rate_limited, retry_after};
use crate::config::{Credentials, SessionSettings};
use crate::endpoint::Method;
use crate::transport::{HttpRequest, HttpTransport};

/// Credential shared by every virtual user. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Session {
    token: Option<String>,
}

impl Session {
    pub fn authenticated(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    /// Session with no token: authenticated probes are skipped
    pub fn anonymous() -> Self {
        Self { token: None }
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }
}

/// Result of a bootstrap: the session and how many logins it took
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bootstrap {
    pub session: Session,
    pub attempts: u32,
}

/// Logs in with the fixed test credentials, retrying through rate limits
pub struct SessionBootstrapper<'a> {
    transport: &'a dyn HttpTransport,
    login_url: String,
    credentials: &'a Credentials,
    settings: &'a SessionSettings,
}

impl<'a> SessionBootstrapper<'a> {
    pub fn new(
        transport: &'a dyn HttpTransport,
        base_url: &str,
        credentials: &'a Credentials,
        settings: &'a SessionSettings,
    ) -> Self {
        Self {
            transport,
            login_url: format!("{}/login", base_url.trim_end_matches('/')),
            credentials,
            settings,
        }
    }

    /// At most `max_attempts` logins. Never fails: exhaustion yields an
    /// anonymous session.
    pub async fn bootstrap(&self) -> Bootstrap {
        let request = HttpRequest {
            method: Method::Post,
            url: self.login_url.clone(),
            bearer: None,
            body: Some(self.credentials.login_body()),
        };
        let max_attempts = self.settings.max_attempts;
        let mut attempts = 0;

        while attempts < max_attempts {
            let outcome = match self.transport.send(&request).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("Setup login attempt {} failed: {}", attempts + 1, e);
                    attempts += 1;
                    if attempts < max_attempts {
                        sleep(Duration::from_secs(self.settings.retry_wait_secs)).await;
                    }
                    continue;
                }
            };

            if is_rate_limited(outcome.status, &outcome.body) {
                let hint = retry_after(&outcome.headers, &outcome.body);
                warn!(
                    "Rate limited on setup attempt {} (server hint: {:?}), waiting {}s",
                    attempts + 1,
                    hint,
                    self.settings.rate_limited_wait_secs
                );
                sleep(Duration::from_secs(self.settings.rate_limited_wait_secs)).await;
                attempts += 1;
                continue;
            }

            if outcome.status == 200 {
                if let Some(token) = outcome.access_token() {
                    info!("Token obtained for authenticated requests");
                    return Bootstrap {
                        session: Session::authenticated(token),
                        attempts: attempts + 1,
                    };
                }
            }

            warn!(
                "Setup login attempt {} returned {} without an access token",
                attempts + 1,
                outcome.status
            );
            attempts += 1;
            if attempts < max_attempts {
                sleep(Duration::from_secs(self.settings.retry_wait_secs)).await;
            }
        }

        warn!(
            "Failed to get token after {} attempts, authenticated requests will be skipped",
            attempts
        );
        Bootstrap {
            session: Session::anonymous(),
            attempts,
        }
    }
}
