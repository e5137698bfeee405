//! Job orchestration loop.
//!
//! Turns incoming scheduler assignments into running containers, one job
//! at a time: claim ports, register the job, create the container (pulling
//! the image once if it is absent), wait for attach readiness, start, and
//! mark the job running. Container creation and start are serialized across
//! jobs because the scheduler stream is consumed sequentially.
//!
//! Errors here are fatal: an agent that cannot create or start containers
//! cannot do its one job, so it exits and lets the supervisor restart it.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::ports::PortAllocator;
use crate::runtime::{ContainerRuntime, ExposedPort, HostConfig, RuntimeError};
use crate::scheduler::{Job, JobStream};
use crate::state::JobStateStore;

/// Drives the job lifecycle for one host.
pub struct Orchestrator {
    store: Arc<JobStateStore>,
    ports: Arc<PortAllocator>,
    runtime: Arc<dyn ContainerRuntime>,
}

impl Orchestrator {
    /// Create a new orchestrator.
    pub fn new(
        store: Arc<JobStateStore>,
        ports: Arc<PortAllocator>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            store,
            ports,
            runtime,
        }
    }

    /// Consume the scheduler's assignment stream until it ends.
    pub async fn run(&self, mut jobs: JobStream) -> Result<()> {
        while let Some(job) = jobs.next().await {
            let job = job.context("scheduler assignment stream failed")?;
            self.process(job).await?;
        }
        info!("scheduler assignment stream ended");
        Ok(())
    }

    /// Take one assignment through to a running container.
    async fn process(&self, mut job: Job) -> Result<()> {
        info!(job_id = %job.id, image = %job.config.image, "received job assignment");

        // Claim a port and inject it into the execution specification,
        // plus a matching host-level binding for container start.
        let mut host_config = None;
        if job.tcp_ports > 0 {
            let port = self.ports.claim().await;
            debug!(job_id = %job.id, port, "claimed port");
            job.config.env.push(format!("PORT={port}"));
            job.config
                .exposed_ports
                .insert(format!("{port}/tcp"), ExposedPort {});
            host_config = Some(HostConfig::with_tcp_port(port));
        }

        self.store.add_job(&job).await;

        let container_id = match self.runtime.create_container(&job.config).await {
            Ok(id) => id,
            Err(RuntimeError::ImageNotFound(image)) => {
                info!(job_id = %job.id, image = %image, "image not present locally, pulling");
                self.runtime
                    .pull_image(&image)
                    .await
                    .with_context(|| format!("pulling image {image}"))?;
                self.runtime
                    .create_container(&job.config)
                    .await
                    .with_context(|| format!("creating container for job {} after pull", job.id))?
            }
            Err(e) => {
                return Err(e).with_context(|| format!("creating container for job {}", job.id))
            }
        };

        if let Err(e) = self.store.set_container_id(&job.id, &container_id).await {
            warn!(job_id = %job.id, error = %e, "failed to record container id");
        }

        // The container must not start before a console consumer is ready.
        self.store.wait_attach(&job.id).await;

        self.runtime
            .start_container(&container_id, host_config.as_ref())
            .await
            .with_context(|| format!("starting container for job {}", job.id))?;

        if let Err(e) = self.store.set_status_running(&job.id).await {
            warn!(job_id = %job.id, error = %e, "failed to mark job running");
        }
        info!(job_id = %job.id, container_id = %container_id, "job running");
        Ok(())
    }
}
