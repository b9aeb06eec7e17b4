//! HTTPS client for the remote receiver registry.
//!
//! Thin wrapper over reqwest carrying the wire protocol: enrollment,
//! verification, signed status reports, and the health probe. Registrar and
//! Reporter each build their own client; they have different auth contexts
//! and never share connections.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// Default registry; custom destinations are treated as general-purpose
/// report servers.
pub const DEFAULT_REGISTRY_URL: &str = "https://satellite.blockstream.space/monitoring";

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Result type alias for registry calls
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors surfaced by the registry client
#[derive(Debug)]
pub enum RegistryError {
    /// Connection, TLS, or timeout failure; retryable
    Transport(String),

    /// The server answered with a non-success status; terminal with detail
    Rejected { status: u16, detail: String },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::Transport(msg) => write!(f, "registry unreachable: {}", msg),
            RegistryError::Rejected { status, detail } => {
                write!(f, "registry rejected request ({}): {}", status, detail)
            }
        }
    }
}

impl std::error::Error for RegistryError {}

impl From<reqwest::Error> for RegistryError {
    fn from(err: reqwest::Error) -> Self {
        RegistryError::Transport(err.to_string())
    }
}

impl RegistryError {
    pub fn is_transport(&self) -> bool {
        matches!(self, RegistryError::Transport(_))
    }
}

#[derive(Debug, Serialize)]
pub struct RegisterRequest {
    pub fingerprint: String,
    pub public_key: String,
    pub address: String,
    pub satellite: crate::config::Satellite,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterResponse {
    pub uuid: String,
    pub nonce: String,
}

#[derive(Debug, Serialize)]
struct VerifyRequest<'a> {
    uuid: &'a str,
    signed_code: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct VerifyResponse {
    pub password: String,
}

/// What gets posted to the registry on every report tick.
#[derive(Debug, Serialize)]
pub struct ReportEnvelope {
    pub uuid: String,
    pub metrics: crate::MetricRecord,
    pub signature: String,
    pub timestamp: String,
}

#[derive(Debug, Clone)]
pub struct RegistryClient {
    base_url: String,
    client: reqwest::Client,
}

impl RegistryClient {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .timeout(REQUEST_TIMEOUT)
                .build()?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Enroll this receiver. Idempotent on the server side: a known
    /// fingerprint still yields a uuid and a freshly-issued nonce.
    #[instrument(skip(self, request), fields(fingerprint = %request.fingerprint))]
    pub async fn register(&self, request: &RegisterRequest) -> RegistryResult<RegisterResponse> {
        let response = self
            .client
            .post(self.url("/register"))
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RegistryError::Rejected {
                status: status.as_u16(),
                detail: response.text().await.unwrap_or_default(),
            });
        }

        let parsed: RegisterResponse = response.json().await?;
        debug!("enrolled as {}", parsed.uuid);
        Ok(parsed)
    }

    /// Return the verification code under a detached signature.
    #[instrument(skip(self, signed_code))]
    pub async fn verify(&self, uuid: &str, signed_code: &str) -> RegistryResult<VerifyResponse> {
        let response = self
            .client
            .post(self.url("/verify"))
            .json(&VerifyRequest { uuid, signed_code })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RegistryError::Rejected {
                status: status.as_u16(),
                detail: response.text().await.unwrap_or_default(),
            });
        }

        Ok(response.json().await?)
    }

    /// Post one signed report. Returns the HTTP status; non-2xx statuses are
    /// the caller's policy decision, not an error here.
    #[instrument(skip_all, fields(uuid = %envelope.uuid))]
    pub async fn report(
        &self,
        envelope: &ReportEnvelope,
        password: &str,
    ) -> RegistryResult<u16> {
        let response = self
            .client
            .post(self.url("/report"))
            .basic_auth(&envelope.uuid, Some(password))
            .json(envelope)
            .send()
            .await?;

        Ok(response.status().as_u16())
    }

    /// Health-probe a report destination. A server is considered valid when
    /// its info document carries the `lightning-dir` and
    /// `num_active_channels` keys.
    #[instrument(skip(self))]
    pub async fn check_info(&self) -> RegistryResult<bool> {
        let response = self.client.get(self.url("/info")).send().await?;

        if !response.status().is_success() {
            return Ok(false);
        }

        let info: serde_json::Value = match response.json().await {
            Ok(info) => info,
            Err(_) => return Ok(false),
        };

        Ok(info.get("lightning-dir").is_some() && info.get("num_active_channels").is_some())
    }
}
