use std::time::{Duration, Instant};

use async_trait::async_trait;
use mockgate_core::security::ApiKey;
use mockgate_core::{Headers, UpstreamError};
use mockgate_store::BypassConfig;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{error, info, instrument};

use crate::headers::prepare_headers;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Where and how to forward a single request. Snapshotted from the bypass
/// config so a concurrent config change cannot affect an in-flight call.
#[derive(Clone, Debug)]
pub struct ForwardTarget {
    pub url: String,
    pub api_key: Option<ApiKey>,
    pub timeout: Duration,
}

impl From<&BypassConfig> for ForwardTarget {
    fn from(config: &BypassConfig) -> Self {
        Self {
            url: build_url(config),
            api_key: config.api_key.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

/// What the upstream answered.
#[derive(Clone, Debug)]
pub struct ForwardedResponse {
    pub body: Value,
    pub status_code: u16,
    pub elapsed: Duration,
}

#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(
        &self,
        target: &ForwardTarget,
        body: &Value,
        headers: &Headers,
    ) -> Result<ForwardedResponse, UpstreamError>;
}

/// Scheme, host and path from the config. Default ports are omitted.
pub fn build_url(config: &BypassConfig) -> String {
    let scheme = if config.use_https { "https" } else { "http" };
    let default_port = if config.use_https { 443 } else { 80 };
    if config.target_port == default_port {
        format!("{scheme}://{}{}", config.target_host, config.target_uri)
    } else {
        format!(
            "{scheme}://{}:{}{}",
            config.target_host, config.target_port, config.target_uri
        )
    }
}

pub struct HttpForwarder {
    client: Client,
}

impl HttpForwarder {
    pub fn new() -> Result<Self, UpstreamError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| UpstreamError::Unexpected(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    #[instrument(skip_all, fields(url = %target.url))]
    async fn forward(
        &self,
        target: &ForwardTarget,
        body: &Value,
        headers: &Headers,
    ) -> Result<ForwardedResponse, UpstreamError> {
        let mut req = self.client.post(&target.url).timeout(target.timeout);
        for (name, value) in prepare_headers(headers, target.api_key.as_ref()) {
            req = req.header(name, value);
        }
        req = req.json(body);

        let start = Instant::now();
        let resp = req.send().await.map_err(|e| classify(e, target))?;
        let status_code = resp.status().as_u16();
        let text = resp.text().await.map_err(|e| classify(e, target))?;
        let elapsed = start.elapsed();

        let body = serde_json::from_str(&text).unwrap_or_else(|_| {
            json!({
                "error": {
                    "message": text,
                    "type": "api_error",
                    "code": status_code,
                }
            })
        });

        info!(status = status_code, elapsed_ms = elapsed.as_millis() as u64, "upstream responded");
        Ok(ForwardedResponse {
            body,
            status_code,
            elapsed,
        })
    }
}

fn classify(e: reqwest::Error, target: &ForwardTarget) -> UpstreamError {
    let err = if e.is_timeout() {
        UpstreamError::Timeout(target.timeout)
    } else if e.is_connect() {
        UpstreamError::Connect {
            url: target.url.clone(),
            reason: e.to_string(),
        }
    } else {
        UpstreamError::Http(e.to_string())
    };
    error!(kind = err.error_kind(), error = %err, "forwarding failed");
    err
}
