//! Scheduler RPC client for the host agent.
//!
//! Registration yields an unbounded stream of job assignments for the
//! lifetime of the connection; a second call removes stopped jobs from the
//! scheduler's assignment table. The orchestration core only depends on
//! the [`SchedulerClient`] trait; transport and encoding live here.

use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, error};

use crate::runtime::ContainerConfig;

/// Errors from scheduler RPC operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("scheduler API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("undecodable job assignment: {0}")]
    Decode(#[from] serde_json::Error),
}

/// One scheduling assignment: run this container workload on this host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Scheduler-issued job identifier.
    pub id: String,

    /// Execution specification for the container.
    pub config: ContainerConfig,

    /// Number of TCP ports the workload requires.
    #[serde(default)]
    pub tcp_ports: u16,
}

/// This host's registration record: identifier plus capacity map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostDescriptor {
    pub id: String,

    /// Resource name -> quantity, e.g. `memory` in megabytes.
    pub resources: HashMap<String, ResourceValue>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceValue {
    pub value: i64,
}

/// Unbounded stream of job assignments from the scheduler.
pub type JobStream = Pin<Box<dyn Stream<Item = Result<Job, SchedulerError>> + Send>>;

/// Scheduler RPC interface.
#[async_trait]
pub trait SchedulerClient: Send + Sync {
    /// Register this host and stream its job assignments.
    async fn register_host(&self, host: &HostDescriptor) -> Result<JobStream, SchedulerError>;

    /// Ask the scheduler to drop the given jobs from its assignment table.
    async fn remove_jobs(&self, job_ids: Vec<String>) -> Result<(), SchedulerError>;
}

#[derive(Debug, Serialize)]
struct RemoveJobsRequest {
    job_ids: Vec<String>,
}

/// Scheduler client speaking newline-delimited JSON over HTTP.
pub struct HttpSchedulerClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSchedulerClient {
    /// Create a new scheduler client.
    pub fn new(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl SchedulerClient for HttpSchedulerClient {
    async fn register_host(&self, host: &HostDescriptor) -> Result<JobStream, SchedulerError> {
        let url = format!("{}/v1/hosts", self.base_url);
        debug!(url = %url, host_id = %host.id, "registering host");

        let response = self.client.post(&url).json(host).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "host registration rejected");
            return Err(SchedulerError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        // Assignments arrive as one JSON object per line on the long-lived
        // response body.
        let mut chunks = Box::pin(response.bytes_stream());
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut buf: Vec<u8> = Vec::new();
            while let Some(chunk) = chunks.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(Err(SchedulerError::Http(e)));
                        return;
                    }
                };
                buf.extend_from_slice(&chunk);
                while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    let line = line.trim_ascii();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_slice::<Job>(line) {
                        Ok(job) => {
                            if tx.send(Ok(job)).is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(SchedulerError::Decode(e)));
                            return;
                        }
                    }
                }
            }
            debug!("scheduler assignment stream closed");
        });

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn remove_jobs(&self, job_ids: Vec<String>) -> Result<(), SchedulerError> {
        let url = format!("{}/v1/jobs/remove", self.base_url);
        debug!(count = job_ids.len(), "removing jobs from scheduler");

        let response = self
            .client
            .post(&url)
            .json(&RemoveJobsRequest { job_ids })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SchedulerError::Api {
                status: status.as_u16(),
                message: body,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_deserializes_without_port_count() {
        let job: Job =
            serde_json::from_str(r#"{"id":"job1","config":{"Image":"redis:latest"}}"#).unwrap();
        assert_eq!(job.id, "job1");
        assert_eq!(job.config.image, "redis:latest");
        assert_eq!(job.tcp_ports, 0);
    }

    #[test]
    fn test_job_roundtrip_with_ports() {
        let job: Job = serde_json::from_str(
            r#"{"id":"job2","config":{"Image":"web:v3"},"tcp_ports":1}"#,
        )
        .unwrap();
        assert_eq!(job.tcp_ports, 1);
    }

    #[test]
    fn test_host_descriptor_serializes_capacity() {
        let mut resources = HashMap::new();
        resources.insert("memory".to_string(), ResourceValue { value: 1024 });
        let host = HostDescriptor {
            id: "host-a".to_string(),
            resources,
        };
        let json = serde_json::to_string(&host).unwrap();
        assert!(json.contains(r#""memory":{"value":1024}"#));
    }
}
