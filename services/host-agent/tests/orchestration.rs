//! Integration tests for the job lifecycle.
//!
//! These tests drive the full flow from receiving an assignment to a
//! terminal job record:
//! 1. Orchestrator claims ports, creates and starts the container
//! 2. Runtime syncer folds `die` events into job state
//! 3. Scheduler syncer reports stopped jobs for removal
//!
//! Uses MockRuntime to simulate the container daemon.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use hoist_host_agent::orchestrator::Orchestrator;
use hoist_host_agent::ports::PortAllocator;
use hoist_host_agent::runtime::{ContainerEvent, ContainerRuntime, HostConfig, MockRuntime};
use hoist_host_agent::runtime_sync::run_runtime_sync;
use hoist_host_agent::scheduler::{
    HostDescriptor, Job, JobStream, SchedulerClient, SchedulerError,
};
use hoist_host_agent::scheduler_sync::run_scheduler_sync;
use hoist_host_agent::state::{EventKind, JobStateStore, JobStatus, ALL_TOPIC};

/// Scheduler client recording removal calls.
#[derive(Default)]
struct MockScheduler {
    removed: Mutex<Vec<Vec<String>>>,
}

impl MockScheduler {
    fn removed(&self) -> Vec<Vec<String>> {
        self.removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl SchedulerClient for MockScheduler {
    async fn register_host(&self, _host: &HostDescriptor) -> Result<JobStream, SchedulerError> {
        Ok(Box::pin(tokio_stream::empty::<Result<Job, SchedulerError>>()))
    }

    async fn remove_jobs(&self, job_ids: Vec<String>) -> Result<(), SchedulerError> {
        self.removed.lock().unwrap().push(job_ids);
        Ok(())
    }
}

fn test_job(id: &str, image: &str, tcp_ports: u16) -> Job {
    Job {
        id: id.to_string(),
        config: hoist_host_agent::runtime::ContainerConfig {
            image: image.to_string(),
            ..Default::default()
        },
        tcp_ports,
    }
}

fn job_stream(jobs: Vec<Job>) -> JobStream {
    Box::pin(tokio_stream::iter(
        jobs.into_iter().map(Ok::<Job, SchedulerError>),
    ))
}

struct Harness {
    store: Arc<JobStateStore>,
    runtime: Arc<MockRuntime>,
    orchestrator: Orchestrator,
}

fn harness() -> Harness {
    let store = Arc::new(JobStateStore::new());
    let ports = Arc::new(PortAllocator::start(55000, 65535));
    let runtime = Arc::new(MockRuntime::new());
    let orchestrator = Orchestrator::new(
        Arc::clone(&store),
        ports,
        Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
    );
    Harness {
        store,
        runtime,
        orchestrator,
    }
}

#[tokio::test]
async fn test_job_without_ports_runs_directly() {
    let h = harness();
    h.store.release_attach("job1").await;

    h.orchestrator
        .run(job_stream(vec![test_job("job1", "worker:v1", 0)]))
        .await
        .unwrap();

    // No port claim: the execution specification reaches the runtime untouched.
    let created = h.runtime.created();
    assert_eq!(created.len(), 1);
    assert!(created[0].1.env.is_empty());
    assert!(created[0].1.exposed_ports.is_empty());
    assert_eq!(h.runtime.pulled().len(), 0);

    let started = h.runtime.started();
    assert_eq!(started.len(), 1);
    assert!(started[0].1.is_none());

    let record = h.store.get_job("job1").await.unwrap();
    assert_eq!(record.status, JobStatus::Running);
    assert_eq!(record.container_id.as_deref(), Some(started[0].0.as_str()));
}

#[tokio::test]
async fn test_job_with_port_gets_env_exposure_and_binding() {
    let h = harness();
    h.store.release_attach("job1").await;

    h.orchestrator
        .run(job_stream(vec![test_job("job1", "web:v1", 1)]))
        .await
        .unwrap();

    // First claim returns the window's lower bound.
    let created = h.runtime.created();
    assert_eq!(created[0].1.env, vec!["PORT=55000".to_string()]);
    assert!(created[0].1.exposed_ports.contains_key("55000/tcp"));

    let started = h.runtime.started();
    assert_eq!(
        started[0].1,
        Some(HostConfig::with_tcp_port(55000)),
        "host binding must match the claimed port"
    );
}

#[tokio::test]
async fn test_ports_are_distinct_across_jobs() {
    let h = harness();
    h.store.release_attach("job1").await;
    h.store.release_attach("job2").await;

    h.orchestrator
        .run(job_stream(vec![
            test_job("job1", "web:v1", 1),
            test_job("job2", "web:v1", 1),
        ]))
        .await
        .unwrap();

    let created = h.runtime.created();
    assert_eq!(created[0].1.env, vec!["PORT=55000".to_string()]);
    assert_eq!(created[1].1.env, vec!["PORT=55001".to_string()]);
}

#[tokio::test]
async fn test_missing_image_is_pulled_then_retried() {
    let h = harness();
    h.store.release_attach("job1").await;
    h.runtime.mark_image_missing("redis:latest");

    h.orchestrator
        .run(job_stream(vec![test_job("job1", "redis:latest", 0)]))
        .await
        .unwrap();

    assert_eq!(h.runtime.pulled(), vec!["redis:latest".to_string()]);
    assert_eq!(h.runtime.create_attempts(), 2);
    let record = h.store.get_job("job1").await.unwrap();
    assert_eq!(record.status, JobStatus::Running);
}

#[tokio::test]
async fn test_second_creation_failure_is_fatal() {
    let h = harness();
    h.store.release_attach("job1").await;
    // Pull "succeeds" but the image never materializes, so the single
    // retry fails as well.
    h.runtime.mark_image_missing("redis:latest");
    h.runtime.pull_never_installs();

    let err = h
        .orchestrator
        .run(job_stream(vec![test_job("job1", "redis:latest", 0)]))
        .await
        .unwrap_err();

    // Exactly one pull and one retry; the error is the post-pull one.
    assert_eq!(h.runtime.pulled().len(), 1);
    assert_eq!(h.runtime.create_attempts(), 2);
    assert!(format!("{err:#}").contains("after pull"));

    // The job never reached Running.
    let record = h.store.get_job("job1").await.unwrap();
    assert_eq!(record.status, JobStatus::Created);
    assert_eq!(h.runtime.started().len(), 0);
}

#[tokio::test]
async fn test_pull_failure_is_fatal() {
    let h = harness();
    h.store.release_attach("job1").await;
    h.runtime.mark_image_missing("redis:latest");
    h.runtime.fail_pulls();

    let err = h
        .orchestrator
        .run(job_stream(vec![test_job("job1", "redis:latest", 0)]))
        .await
        .unwrap_err();

    assert!(format!("{err:#}").contains("pulling image"));
    assert_eq!(h.runtime.create_attempts(), 1);
}

#[tokio::test]
async fn test_container_does_not_start_before_attach_release() {
    let h = harness();
    let store = Arc::clone(&h.store);
    let runtime = Arc::clone(&h.runtime);

    let driver = tokio::spawn(async move {
        h.orchestrator
            .run(job_stream(vec![test_job("job1", "worker:v1", 0)]))
            .await
    });

    // Created but parked on the attach rendezvous: nothing started yet.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(runtime.created().len(), 1);
    assert_eq!(runtime.started().len(), 0);
    assert!(!driver.is_finished());

    store.release_attach("job1").await;
    timeout(Duration::from_secs(1), driver)
        .await
        .expect("orchestrator should finish after attach release")
        .unwrap()
        .unwrap();
    assert_eq!(runtime.started().len(), 1);
    assert_eq!(store.get_job("job1").await.unwrap().status, JobStatus::Running);
}

#[tokio::test]
async fn test_die_event_reaches_done_and_scheduler_removal() {
    let h = harness();
    let scheduler = Arc::new(MockScheduler::default());
    let mut events = h.store.add_listener(ALL_TOPIC).await;

    tokio::spawn(run_runtime_sync(
        Arc::clone(&h.runtime) as Arc<dyn ContainerRuntime>,
        Arc::clone(&h.store),
    ));
    tokio::spawn(run_scheduler_sync(
        Arc::clone(&h.store),
        Arc::clone(&scheduler) as Arc<dyn SchedulerClient>,
    ));

    h.store.release_attach("job1").await;
    h.orchestrator
        .run(job_stream(vec![test_job("job1", "worker:v1", 0)]))
        .await
        .unwrap();
    let container_id = h.runtime.started()[0].0.clone();

    h.runtime.set_exit_code(&container_id, 137);
    h.runtime.push_event(ContainerEvent {
        status: "die".to_string(),
        id: container_id.clone(),
        from: None,
        time: None,
    });

    // Create, Start, then exactly one Stop carrying the exit code.
    let mut kinds = Vec::new();
    for _ in 0..3 {
        let event = timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("event expected")
            .unwrap();
        if event.kind == EventKind::Stop {
            assert_eq!(event.exit_code, Some(137));
        }
        kinds.push(event.kind);
    }
    assert_eq!(kinds, vec![EventKind::Create, EventKind::Start, EventKind::Stop]);

    let record = h.store.get_job("job1").await.unwrap();
    assert_eq!(record.status, JobStatus::Done);
    assert_eq!(record.exit_code, Some(137));

    // Exactly one removal call for the stopped job.
    for _ in 0..100 {
        if !scheduler.removed().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(scheduler.removed(), vec![vec!["job1".to_string()]]);
}

#[tokio::test]
async fn test_failed_inspection_leaves_job_stuck() {
    let h = harness();
    let scheduler = Arc::new(MockScheduler::default());
    let mut events = h.store.add_listener(ALL_TOPIC).await;

    tokio::spawn(run_runtime_sync(
        Arc::clone(&h.runtime) as Arc<dyn ContainerRuntime>,
        Arc::clone(&h.store),
    ));
    tokio::spawn(run_scheduler_sync(
        Arc::clone(&h.store),
        Arc::clone(&scheduler) as Arc<dyn SchedulerClient>,
    ));

    h.store.release_attach("job1").await;
    h.orchestrator
        .run(job_stream(vec![test_job("job1", "worker:v1", 0)]))
        .await
        .unwrap();
    let container_id = h.runtime.started()[0].0.clone();

    // Drain the Create and Start events from the lifecycle above.
    assert_eq!(events.recv().await.unwrap().kind, EventKind::Create);
    assert_eq!(events.recv().await.unwrap().kind, EventKind::Start);

    // Container is gone before inspection: the event is dropped.
    h.runtime.fail_inspect(&container_id);
    h.runtime.push_event(ContainerEvent {
        status: "die".to_string(),
        id: container_id,
        from: None,
        time: None,
    });

    // No stop event, no removal, status unchanged from Running.
    let nothing = timeout(Duration::from_millis(200), events.recv()).await;
    assert!(nothing.is_err());
    assert_eq!(h.store.get_job("job1").await.unwrap().status, JobStatus::Running);
    assert!(scheduler.removed().is_empty());
}

#[tokio::test]
async fn test_non_die_events_are_ignored() {
    let h = harness();
    let mut events = h.store.add_listener(ALL_TOPIC).await;

    tokio::spawn(run_runtime_sync(
        Arc::clone(&h.runtime) as Arc<dyn ContainerRuntime>,
        Arc::clone(&h.store),
    ));

    h.store.release_attach("job1").await;
    h.orchestrator
        .run(job_stream(vec![test_job("job1", "worker:v1", 0)]))
        .await
        .unwrap();
    let container_id = h.runtime.started()[0].0.clone();

    assert_eq!(events.recv().await.unwrap().kind, EventKind::Create);
    assert_eq!(events.recv().await.unwrap().kind, EventKind::Start);

    for status in ["create", "start", "pause"] {
        h.runtime.push_event(ContainerEvent {
            status: status.to_string(),
            id: container_id.clone(),
            from: None,
            time: None,
        });
    }

    let nothing = timeout(Duration::from_millis(200), events.recv()).await;
    assert!(nothing.is_err());
    assert_eq!(h.store.get_job("job1").await.unwrap().status, JobStatus::Running);
}
