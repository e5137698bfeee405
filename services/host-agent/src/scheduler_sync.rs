//! Forwards job stop transitions to the scheduler.
//!
//! Subscribes to every store event and issues one removal call per stopped
//! job so the scheduler can drop it from its assignment table. Removal
//! failures are logged and skipped; there is no retry or reconnect.

use std::sync::Arc;

use tracing::{error, info};

use crate::scheduler::SchedulerClient;
use crate::state::{EventKind, JobStateStore, ALL_TOPIC};

/// Run the scheduler syncer until the store drops the listener channel.
pub async fn run_scheduler_sync(store: Arc<JobStateStore>, scheduler: Arc<dyn SchedulerClient>) {
    let mut events = store.add_listener(ALL_TOPIC).await;
    info!("scheduler syncer started");

    while let Some(event) = events.recv().await {
        if event.kind != EventKind::Stop {
            continue;
        }
        info!(job_id = %event.job_id, "reporting stopped job to scheduler");
        if let Err(e) = scheduler.remove_jobs(vec![event.job_id.clone()]).await {
            error!(job_id = %event.job_id, error = %e, "failed to remove job from scheduler");
        }
    }
}
