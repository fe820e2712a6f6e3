//! Email gateway client
//!
//! HTTP JSON gateway (`POST <base>/smtp/email`) with a request timeout and an
//! in-process credential cache (credentials live in the runtime settings
//! document and rotate without a restart).

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use lc_common::GatewayCredentials;
use lc_store::SettingsCache;

#[derive(Error, Debug)]
pub enum GatewayError {
    /// 4xx-class: misconfiguration, never retried.
    #[error("Gateway rejected request: {0}")]
    Config(String),

    /// 429: bubble to queue retry.
    #[error("Gateway rate limited: {0}")]
    RateLimited(String),

    /// 5xx / connection problems: retried with backoff.
    #[error("Gateway unavailable: {0}")]
    Transient(String),

    #[error("Gateway timeout: {0}")]
    Timeout(String),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::RateLimited(_) | GatewayError::Transient(_) | GatewayError::Timeout(_)
        )
    }
}

#[derive(Debug, Clone)]
pub struct SendEmailRequest {
    pub to_email: String,
    pub to_name: Option<String>,
    pub subject: String,
    pub html_content: String,
    pub idempotency_key: String,
}

#[derive(Debug, Clone)]
pub struct GatewaySendResult {
    pub message_id: String,
}

/// Outbound dispatch seam; tests swap in a scripted double.
#[async_trait]
pub trait EmailGateway: Send + Sync {
    async fn send(&self, request: &SendEmailRequest)
        -> Result<GatewaySendResult, GatewayError>;
}

#[derive(Debug, Clone)]
pub struct HttpGatewayConfig {
    pub base_url: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub credential_cache_ttl: Duration,
}

impl Default for HttpGatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.brevo.com/v3".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            credential_cache_ttl: Duration::from_secs(60),
        }
    }
}

// Wire format.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SmtpEmailBody<'a> {
    sender: Party<'a>,
    to: Vec<Party<'a>>,
    subject: &'a str,
    html_content: &'a str,
}

#[derive(Serialize)]
struct Party<'a> {
    email: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SmtpEmailResponse {
    message_id: String,
}

pub struct HttpEmailGateway {
    client: reqwest::Client,
    config: HttpGatewayConfig,
    settings: Arc<SettingsCache>,
    credentials: RwLock<Option<(Instant, GatewayCredentials)>>,
}

impl HttpEmailGateway {
    pub fn new(config: HttpGatewayConfig, settings: Arc<SettingsCache>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            config,
            settings,
            credentials: RwLock::new(None),
        })
    }

    async fn credentials(&self) -> Result<GatewayCredentials, GatewayError> {
        if let Some((loaded_at, creds)) = self.credentials.read().as_ref() {
            if loaded_at.elapsed() < self.config.credential_cache_ttl {
                return Ok(creds.clone());
            }
        }

        let settings = self
            .settings
            .get()
            .await
            .map_err(|e| GatewayError::Transient(format!("settings unavailable: {e}")))?;
        let creds = settings.gateway;
        *self.credentials.write() = Some((Instant::now(), creds.clone()));
        debug!("Gateway credentials refreshed");
        Ok(creds)
    }
}

#[async_trait]
impl EmailGateway for HttpEmailGateway {
    async fn send(
        &self,
        request: &SendEmailRequest,
    ) -> Result<GatewaySendResult, GatewayError> {
        let creds = self.credentials().await?;

        let body = SmtpEmailBody {
            sender: Party {
                email: &creds.sender_email,
                name: Some(&creds.sender_name),
            },
            to: vec![Party {
                email: &request.to_email,
                name: request.to_name.as_deref(),
            }],
            subject: &request.subject,
            html_content: &request.html_content,
        };

        let response = self
            .client
            .post(format!("{}/smtp/email", self.config.base_url))
            .header("api-key", &creds.api_key)
            .header("X-Idempotency-Key", &request.idempotency_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout(e.to_string())
                } else {
                    GatewayError::Transient(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            let parsed: SmtpEmailResponse = response
                .json()
                .await
                .map_err(|e| GatewayError::Transient(format!("malformed response: {e}")))?;
            return Ok(GatewaySendResult {
                message_id: parsed.message_id,
            });
        }

        let detail = response.text().await.unwrap_or_default();
        warn!(status = %status, detail = %detail, "Gateway send failed");
        if status.as_u16() == 429 {
            Err(GatewayError::RateLimited(detail))
        } else if status.is_client_error() {
            Err(GatewayError::Config(format!("{status}: {detail}")))
        } else {
            Err(GatewayError::Transient(format!("{status}: {detail}")))
        }
    }
}
