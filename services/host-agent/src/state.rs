//! In-memory job state store with transition broadcast.
//!
//! The store is the authoritative record of every job assigned to this
//! host. Three independently-changing views meet here: the scheduler's
//! assignment (written by the orchestrator), the container runtime's
//! lifecycle (written by the runtime syncer), and the local record itself.
//! All reads, writes, and listener registration go through the store's own
//! lock; no job data is shared outside it.
//!
//! Transitions are broadcast to registered listeners. Delivery is buffered
//! and non-blocking: emission pushes onto unbounded channels, so a slow
//! listener buffers without stalling the store, and events for a given job
//! reach each listener in the order the store applied the transitions.
//! Listeners present at emission time receive the event; late subscribers
//! miss history.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use crate::scheduler::Job;

/// Topic that receives every event regardless of job.
pub const ALL_TOPIC: &str = "all";

/// Errors from job state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("unknown job: {0}")]
    UnknownJob(String),

    #[error("container id already set for job {0}")]
    ContainerIdAlreadySet(String),
}

/// Lifecycle status of a job on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Assignment received, container not yet running.
    Created,
    /// Container started.
    Running,
    /// Container exited; exit code recorded.
    Done,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Created => write!(f, "created"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Done => write!(f, "done"),
        }
    }
}

/// The agent's local view of one scheduler assignment.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub job_id: String,
    /// Absent until container creation succeeds; immutable once set.
    pub container_id: Option<String>,
    pub status: JobStatus,
    /// Meaningful only once the status is [`JobStatus::Done`].
    pub exit_code: Option<i32>,
}

/// Kind of a broadcast state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Job registered in the store.
    Create,
    /// Container up and running.
    Start,
    /// Container exited.
    Stop,
}

/// Immutable notification of a job transition.
#[derive(Debug, Clone)]
pub struct StateEvent {
    pub job_id: String,
    pub kind: EventKind,
    pub exit_code: Option<i32>,
}

/// One-shot attach rendezvous per job.
enum AttachGate {
    /// The attach collaborator has signaled readiness.
    Released,
    /// Waiters parked until the release arrives.
    Waiting(Vec<oneshot::Sender<()>>),
}

struct Inner {
    jobs: HashMap<String, JobRecord>,
    listeners: HashMap<String, Vec<mpsc::UnboundedSender<StateEvent>>>,
    attach: HashMap<String, AttachGate>,
}

/// Job state store.
pub struct JobStateStore {
    inner: Mutex<Inner>,
}

impl JobStateStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                jobs: HashMap::new(),
                listeners: HashMap::new(),
                attach: HashMap::new(),
            }),
        }
    }

    /// Register a job in status `Created` and broadcast the transition.
    ///
    /// Re-adding a known job id is a programmer error (the orchestrator
    /// consumes the scheduler stream sequentially); the first record wins.
    pub async fn add_job(&self, job: &Job) {
        let mut inner = self.inner.lock().await;
        match inner.jobs.entry(job.id.clone()) {
            Entry::Occupied(_) => {
                debug_assert!(false, "job {} added twice", job.id);
                warn!(job_id = %job.id, "job already registered, keeping existing record");
                return;
            }
            Entry::Vacant(entry) => {
                entry.insert(JobRecord {
                    job_id: job.id.clone(),
                    container_id: None,
                    status: JobStatus::Created,
                    exit_code: None,
                });
            }
        }
        debug!(job_id = %job.id, "job registered");
        Self::emit(
            &mut inner,
            StateEvent {
                job_id: job.id.clone(),
                kind: EventKind::Create,
                exit_code: None,
            },
        );
    }

    /// Attach the resolved container identifier to an existing record.
    pub async fn set_container_id(
        &self,
        job_id: &str,
        container_id: &str,
    ) -> Result<(), StateError> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StateError::UnknownJob(job_id.to_string()))?;
        if record.container_id.is_some() {
            return Err(StateError::ContainerIdAlreadySet(job_id.to_string()));
        }
        record.container_id = Some(container_id.to_string());
        debug!(job_id, container_id, "container id recorded");
        Ok(())
    }

    /// Block until the attach-handshake collaborator has signaled readiness
    /// for this exact job id at least once.
    pub async fn wait_attach(&self, job_id: &str) {
        let rx = {
            let mut inner = self.inner.lock().await;
            match inner.attach.entry(job_id.to_string()) {
                Entry::Occupied(mut entry) => match entry.get_mut() {
                    AttachGate::Released => return,
                    AttachGate::Waiting(waiters) => {
                        let (tx, rx) = oneshot::channel();
                        waiters.push(tx);
                        rx
                    }
                },
                Entry::Vacant(entry) => {
                    let (tx, rx) = oneshot::channel();
                    entry.insert(AttachGate::Waiting(vec![tx]));
                    rx
                }
            }
        };
        // The sender is only dropped when the gate is released.
        let _ = rx.await;
    }

    /// Signal attach readiness for a job. Idempotent; releases before any
    /// waiter arrives are remembered.
    pub async fn release_attach(&self, job_id: &str) {
        let mut inner = self.inner.lock().await;
        match inner
            .attach
            .insert(job_id.to_string(), AttachGate::Released)
        {
            Some(AttachGate::Waiting(waiters)) => {
                debug!(job_id, waiters = waiters.len(), "attach released");
                for waiter in waiters {
                    let _ = waiter.send(());
                }
            }
            _ => debug!(job_id, "attach released"),
        }
    }

    /// Transition `Created -> Running` and broadcast the transition.
    pub async fn set_status_running(&self, job_id: &str) -> Result<(), StateError> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StateError::UnknownJob(job_id.to_string()))?;
        if record.status != JobStatus::Created {
            warn!(job_id, status = %record.status, "ignoring running transition");
            return Ok(());
        }
        record.status = JobStatus::Running;
        debug!(job_id, "job running");
        Self::emit(
            &mut inner,
            StateEvent {
                job_id: job_id.to_string(),
                kind: EventKind::Start,
                exit_code: None,
            },
        );
        Ok(())
    }

    /// Transition to terminal `Done`, record the exit code, and broadcast.
    ///
    /// Accepts either the job identifier or the recorded container
    /// identifier; the runtime syncer only knows the latter.
    pub async fn set_status_done(&self, id: &str, exit_code: i32) -> Result<(), StateError> {
        let mut inner = self.inner.lock().await;
        let job_id = if inner.jobs.contains_key(id) {
            id.to_string()
        } else {
            inner
                .jobs
                .values()
                .find(|r| r.container_id.as_deref() == Some(id))
                .map(|r| r.job_id.clone())
                .ok_or_else(|| StateError::UnknownJob(id.to_string()))?
        };

        let record = inner.jobs.get_mut(&job_id).expect("record resolved above");
        if record.status == JobStatus::Done {
            warn!(job_id = %job_id, "job already done, exit code unchanged");
            return Ok(());
        }
        record.status = JobStatus::Done;
        record.exit_code = Some(exit_code);
        debug!(job_id = %job_id, exit_code, "job done");
        Self::emit(
            &mut inner,
            StateEvent {
                job_id,
                kind: EventKind::Stop,
                exit_code: Some(exit_code),
            },
        );
        Ok(())
    }

    /// Register a listener under a topic and return its delivery channel.
    ///
    /// The `"all"` topic receives every event; any other topic receives
    /// events for the matching job id only. Listeners are independent and
    /// non-exclusive.
    pub async fn add_listener(&self, topic: &str) -> mpsc::UnboundedReceiver<StateEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().await;
        inner.listeners.entry(topic.to_string()).or_default().push(tx);
        rx
    }

    /// Snapshot of a job record.
    pub async fn get_job(&self, job_id: &str) -> Option<JobRecord> {
        let inner = self.inner.lock().await;
        inner.jobs.get(job_id).cloned()
    }

    /// Deliver an event to the `"all"` topic and the job's own topic,
    /// pruning listeners that have gone away.
    fn emit(inner: &mut Inner, event: StateEvent) {
        for topic in [ALL_TOPIC, event.job_id.as_str()] {
            if let Some(listeners) = inner.listeners.get_mut(topic) {
                listeners.retain(|tx| tx.send(event.clone()).is_ok());
            }
        }
    }
}

impl Default for JobStateStore {
    fn default() -> Self {
        Self::new()
    }
}
