//! Folds container runtime lifecycle events into job state.
//!
//! Consumes the daemon's live event stream; on a `die` event the
//! container's final inspection record supplies the exit code for the
//! terminal transition. The component ends when the stream does and is not
//! restarted here.

use std::sync::Arc;

use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use crate::runtime::ContainerRuntime;
use crate::state::JobStateStore;

/// Run the runtime event syncer until the event stream ends.
pub async fn run_runtime_sync(runtime: Arc<dyn ContainerRuntime>, store: Arc<JobStateStore>) {
    let mut events = match runtime.events().await {
        Ok(events) => events,
        Err(e) => {
            error!(error = %e, "failed to subscribe to runtime events");
            return;
        }
    };
    info!("runtime event syncer started");

    while let Some(event) = events.next().await {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                error!(error = %e, "runtime event stream failed");
                break;
            }
        };
        debug!(status = %event.status, container_id = %event.id, "runtime event");
        if event.status != "die" {
            continue;
        }

        match runtime.inspect_container(&event.id).await {
            Ok(details) => {
                if let Err(e) = store
                    .set_status_done(&event.id, details.state.exit_code)
                    .await
                {
                    warn!(container_id = %event.id, error = %e, "terminated container has no job record");
                }
            }
            Err(e) => {
                // The job stays non-terminal; the record is only moved by a
                // successful inspection.
                warn!(
                    container_id = %event.id,
                    error = %e,
                    "failed to inspect terminated container, job state unchanged"
                );
            }
        }
    }
    info!("runtime event stream ended");
}
