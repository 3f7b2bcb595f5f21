//! PAN-OS management API client.
//!
//! One client per firewall. Holds the cached API key; re-acquires it once
//! on expiry and otherwise surfaces errors to the worker.

pub mod parse;

pub use parse::{IdentityReading, MgmtCpuReading, SessionReading};

use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

/// Operational commands issued by the workers.
pub const CMD_SYSTEM_RESOURCES: &str = "<show><system><resources/></system></show>";
pub const CMD_RESOURCE_MONITOR: &str =
    "<show><running><resource-monitor><minute></minute></resource-monitor></running></show>";
pub const CMD_SESSION_INFO: &str = "<show><session><info/></session></show>";
pub const CMD_SYSTEM_INFO: &str = "<show><system><info/></system></show>";

/// Timeout for keygen requests.
const KEYGEN_TIMEOUT: Duration = Duration::from_secs(20);

/// Client error types.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("API key expired")]
    AuthExpired,
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("target unreachable: {0}")]
    Unreachable(String),
    #[error("API error: {0}")]
    Api(String),
    #[error("parse error: {0}")]
    Parse(String),
}

/// API client for a single firewall.
pub struct PanClient {
    base: String,
    http: reqwest::Client,
    api_key: Mutex<Option<String>>,
}

impl PanClient {
    /// Create a client for the given host.
    ///
    /// `https://` is assumed when the scheme is missing, matching how
    /// operators write bare management addresses in the config.
    pub fn new(host: &str, verify_ssl: bool) -> Result<Self, ClientError> {
        let mut base = host.trim_end_matches('/').to_string();
        if !base.starts_with("http") {
            base = format!("https://{}", base);
        }

        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!verify_ssl)
            .build()
            .map_err(|e| ClientError::Unreachable(e.to_string()))?;

        Ok(Self {
            base,
            http,
            api_key: Mutex::new(None),
        })
    }

    fn cached_key(&self) -> Option<String> {
        self.api_key.lock().unwrap().clone()
    }

    /// Drop the cached key so the next call must re-authenticate.
    pub fn invalidate_key(&self) {
        *self.api_key.lock().unwrap() = None;
    }

    /// Generate and cache an API key.
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<(), ClientError> {
        let url = format!("{}/api/", self.base);
        let resp = self
            .http
            .get(&url)
            .query(&[("type", "keygen"), ("user", username), ("password", password)])
            .timeout(KEYGEN_TIMEOUT)
            .send()
            .await
            .map_err(|e| map_transport_error(e, KEYGEN_TIMEOUT))?;

        let text = resp
            .text()
            .await
            .map_err(|e| ClientError::Unreachable(e.to_string()))?;

        match parse::parse_keygen(&text) {
            Ok(key) => {
                *self.api_key.lock().unwrap() = Some(key);
                Ok(())
            }
            Err(ClientError::AuthExpired) => {
                Err(ClientError::Auth("invalid credentials".to_string()))
            }
            Err(ClientError::Api(msg)) => Err(ClientError::Auth(msg)),
            Err(e) => Err(e),
        }
    }

    /// Execute an operational command and return the raw XML response.
    pub async fn op(&self, cmd: &str, timeout: Duration) -> Result<String, ClientError> {
        let key = self.cached_key().ok_or(ClientError::AuthExpired)?;

        let url = format!("{}/api/", self.base);
        let resp = self
            .http
            .get(&url)
            .query(&[("type", "op"), ("cmd", cmd), ("key", key.as_str())])
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_transport_error(e, timeout))?;

        if resp.status() == reqwest::StatusCode::FORBIDDEN
            || resp.status() == reqwest::StatusCode::UNAUTHORIZED
        {
            return Err(ClientError::AuthExpired);
        }
        if !resp.status().is_success() {
            return Err(ClientError::Api(format!("HTTP {}", resp.status())));
        }

        let text = resp
            .text()
            .await
            .map_err(|e| ClientError::Unreachable(e.to_string()))?;

        parse::check_response_status(&text)?;
        Ok(text)
    }

    /// Execute an operational command, re-authenticating once on key expiry.
    ///
    /// Exactly one retry; a second expiry surfaces as `AuthExpired`.
    pub async fn op_with_reauth(
        &self,
        cmd: &str,
        timeout: Duration,
        username: &str,
        password: &str,
    ) -> Result<String, ClientError> {
        match self.op(cmd, timeout).await {
            Err(ClientError::AuthExpired) => {
                tracing::debug!(base = %self.base, "API key expired, re-authenticating");
                self.invalidate_key();
                self.authenticate(username, password).await?;
                self.op(cmd, timeout).await
            }
            other => other,
        }
    }
}

fn map_transport_error(e: reqwest::Error, timeout: Duration) -> ClientError {
    if e.is_timeout() {
        ClientError::Timeout(timeout)
    } else {
        ClientError::Unreachable(e.to_string())
    }
}
