//! Control-plane HTTP client
//!
//! | Method | Path          | Operation                                    |
//! |--------|---------------|----------------------------------------------|
//! | GET    | `/agent/ping` | Report `ip_address`, receive desired rules   |
//! | GET    | `/agent/ping` | Connectivity check (no body)                 |
//! | POST   | `/agent/health` | Push a [`HealthReport`]                    |
//!
//! The ping request carries a JSON body on a GET, which is what the control
//! plane expects.

use crate::config::ApiSection;
use crate::core::desired::DesiredState;
use crate::core::error::{Error, Result, excerpt};
use crate::core::reconcile::RuleSource;
use crate::core::ufw::BoxFuture;
use crate::health::HealthReport;
use serde::Serialize;
use tracing::{debug, info};

const USER_AGENT: &str = concat!("fwsync/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Serialize)]
struct PingRequest<'a> {
    ip_address: &'a str,
}

/// Client for the agent endpoints of the control plane
#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    http: reqwest::Client,
    endpoint: String,
    bearer_token: Option<String>,
    public_ip: String,
}

impl ControlPlaneClient {
    /// Builds a client from the `api` config section.
    pub fn new(api: &ApiSection) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(api.timeout.get())
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            endpoint: api.endpoint.clone(),
            bearer_token: api.bearer_token.clone().filter(|t| !t.is_empty()),
            public_ip: api.public_ip.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The health endpoint sits next to the ping endpoint.
    pub fn health_endpoint(&self) -> String {
        self.endpoint.replacen("/agent/ping", "/agent/health", 1)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn fetch_error(endpoint: &str, message: impl Into<String>, status: Option<u16>) -> Error {
        Error::Fetch {
            endpoint: endpoint.to_string(),
            message: message.into(),
            status,
        }
    }

    /// Pings the control plane and returns the raw desired-state body.
    ///
    /// # Errors
    ///
    /// [`Error::Fetch`] on transport failure, timeout, or any status other
    /// than 200.
    pub async fn fetch_document(&self) -> Result<String> {
        debug!(endpoint = %self.endpoint, "fetching desired state");
        let request = self
            .http
            .get(&self.endpoint)
            .json(&PingRequest {
                ip_address: &self.public_ip,
            });

        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| Self::fetch_error(&self.endpoint, e.to_string(), None))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Self::fetch_error(&self.endpoint, format!("reading body: {e}"), Some(status.as_u16())))?;

        if status != reqwest::StatusCode::OK {
            return Err(Self::fetch_error(
                &self.endpoint,
                format!("status {}: {}", status.as_u16(), excerpt(&body)),
                Some(status.as_u16()),
            ));
        }
        Ok(body)
    }

    /// Checks that the endpoint answers with a status below 400.
    pub async fn health_check(&self) -> Result<()> {
        let response = self
            .authorize(self.http.get(&self.endpoint))
            .send()
            .await
            .map_err(|e| Self::fetch_error(&self.endpoint, e.to_string(), None))?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(Self::fetch_error(
                &self.endpoint,
                format!("health check failed with status {}", status.as_u16()),
                Some(status.as_u16()),
            ));
        }
        info!(endpoint = %self.endpoint, "control plane reachable");
        Ok(())
    }

    /// Posts a health report. 200 and 202 are accepted.
    pub async fn send_health(&self, report: &HealthReport) -> Result<()> {
        let endpoint = self.health_endpoint();
        let response = self
            .authorize(self.http.post(&endpoint).json(report))
            .send()
            .await
            .map_err(|e| Self::fetch_error(&endpoint, e.to_string(), None))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK && status != reqwest::StatusCode::ACCEPTED {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::fetch_error(
                &endpoint,
                format!("status {}: {}", status.as_u16(), excerpt(&body)),
                Some(status.as_u16()),
            ));
        }
        debug!(endpoint = %endpoint, status = %report.overall_status, "health report delivered");
        Ok(())
    }
}

impl RuleSource for ControlPlaneClient {
    fn fetch<'a>(&'a self) -> BoxFuture<'a, Result<DesiredState>> {
        Box::pin(async move {
            let body = self.fetch_document().await?;
            DesiredState::parse(&body)
        })
    }
}
