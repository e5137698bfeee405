//! Service discovery client.
//!
//! The agent registers its RPC and attach endpoints under per-instance
//! names and resolves the scheduler's address by service name. The
//! directory itself is an external collaborator; only registration and
//! lookup are consumed here.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Service name the scheduler registers under.
pub const SCHEDULER_SERVICE: &str = "hoist-scheduler";

/// Per-instance name for this host's RPC endpoint.
pub fn rpc_service_name(host_id: &str) -> String {
    format!("hoist-host-rpc.{host_id}")
}

/// Per-instance name for this host's attach endpoint.
pub fn attach_service_name(host_id: &str) -> String {
    format!("hoist-host-attach.{host_id}")
}

/// Errors from discovery operations.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("discovery API error {status}: {message}")]
    Api { status: u16, message: String },
}

/// Service directory interface.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Register a named endpoint served from this host on `port`.
    async fn register(&self, name: &str, port: u16) -> Result<(), DiscoveryError>;

    /// Resolve the online addresses of a service.
    async fn lookup(&self, service: &str) -> Result<Vec<String>, DiscoveryError>;
}

#[derive(Debug, Serialize)]
struct RegisterRequest {
    port: u16,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    addresses: Vec<String>,
}

/// Discovery client over the directory's HTTP API.
pub struct HttpDiscovery {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDiscovery {
    /// Create a new discovery client.
    pub fn new(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Discovery for HttpDiscovery {
    async fn register(&self, name: &str, port: u16) -> Result<(), DiscoveryError> {
        let url = format!("{}/v1/services/{}", self.base_url, name);
        debug!(name, port, "registering service");

        let response = self
            .client
            .post(&url)
            .json(&RegisterRequest { port })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DiscoveryError::Api {
                status: status.as_u16(),
                message: body,
            });
        }
        Ok(())
    }

    async fn lookup(&self, service: &str) -> Result<Vec<String>, DiscoveryError> {
        let url = format!("{}/v1/services/{}", self.base_url, service);
        debug!(service, "looking up service");

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DiscoveryError::Api {
                status: status.as_u16(),
                message: body,
            });
        }
        let lookup: LookupResponse = response.json().await?;
        Ok(lookup.addresses)
    }
}
