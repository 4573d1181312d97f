//! HTTP primitive used by the bootstrapper and the probe

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, AUTHORIZATION};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::TargetSettings;
use crate::endpoint::Method;
use crate::error::{LoadTestError, Result};

/// A fully built request
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    /// Sent as `Authorization: Bearer {token}`
    pub bearer: Option<String>,
    /// Sent as JSON with `Content-Type: application/json`
    pub body: Option<Value>,
}

/// Status, headers, body text and wall-clock latency of one response
#[derive(Debug, Clone)]
pub struct HttpOutcome {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: String,
    pub latency: Duration,
}

impl HttpOutcome {
    /// Outcome recorded when no response arrived (status 0)
    pub fn transport_failure(latency: Duration) -> Self {
        Self {
            status: 0,
            headers: HeaderMap::new(),
            body: String::new(),
            latency,
        }
    }

    pub fn json(&self) -> Option<Value> {
        serde_json::from_str(&self.body).ok()
    }

    /// `data.access_token` when present as a string
    pub fn access_token(&self) -> Option<String> {
        self.json()?
            .pointer("/data/access_token")?
            .as_str()
            .map(str::to_string)
    }
}

/// Something that can issue an [`HttpRequest`]
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: &HttpRequest) -> Result<HttpOutcome>;
}

/// [`HttpTransport`] backed by a pooled `reqwest::Client`
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(settings: &TargetSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout())
            .pool_max_idle_per_host(settings.max_idle_per_host)
            .build()
            .map_err(|e| LoadTestError::Client(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpOutcome> {
        let mut builder = self
            .client
            .request(request.method.as_reqwest(), &request.url);
        if let Some(token) = &request.bearer {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let start = Instant::now();
        let response = builder
            .send()
            .await
            .map_err(|e| LoadTestError::Transport {
                url: request.url.clone(),
                message: e.to_string(),
            })?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        // The status is already in; a broken body must not hide it
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                warn!("{} -> {}: failed to read body: {}", request.url, status, e);
                String::new()
            }
        };
        let latency = start.elapsed();

        debug!(
            "{} {} -> {} in {}ms",
            request.method,
            request.url,
            status,
            latency.as_millis()
        );

        Ok(HttpOutcome {
            status,
            headers,
            body,
            latency,
        })
    }
}
