//! Container runtime interface and mock implementation.
//!
//! The runtime interface abstracts the lifecycle operations the agent
//! consumes from the local container daemon:
//! - Creating and starting containers
//! - Pulling images
//! - Inspecting exited containers for their exit code
//! - Subscribing to the live lifecycle event stream
//!
//! A mock implementation is provided for testing and development; the real
//! daemon client lives in [`docker`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::pin::Pin;
use std::sync::Mutex;

use async_trait::async_trait;
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

pub mod docker;

/// Errors from container runtime operations.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("runtime API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("request build error: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image pull failed: {0}")]
    Pull(String),

    #[error("event stream unavailable: {0}")]
    Events(String),
}

/// Execution specification for one container, in the daemon's wire shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    pub image: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub exposed_ports: BTreeMap<String, ExposedPort>,
}

/// Marker value for an exposed-port entry; serializes to `{}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ExposedPort {}

/// Host-level configuration supplied at container start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostConfig {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub port_bindings: BTreeMap<String, Vec<PortBinding>>,
}

impl HostConfig {
    /// A 1:1 binding of the given TCP port to the same host port.
    pub fn with_tcp_port(port: u16) -> Self {
        let mut port_bindings = BTreeMap::new();
        port_bindings.insert(
            format!("{port}/tcp"),
            vec![PortBinding {
                host_port: port.to_string(),
            }],
        );
        Self { port_bindings }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortBinding {
    pub host_port: String,
}

/// One entry from the daemon's lifecycle event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerEvent {
    /// Lifecycle status string; `"die"` marks container exit.
    pub status: String,

    /// Container identifier the event refers to.
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<i64>,
}

/// Final inspection record of a container.
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerDetails {
    #[serde(rename = "Id")]
    pub id: String,

    #[serde(rename = "State")]
    pub state: ContainerState,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerState {
    #[serde(rename = "Running")]
    pub running: bool,

    #[serde(rename = "ExitCode")]
    pub exit_code: i32,
}

/// Live lifecycle event stream from the runtime daemon.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<ContainerEvent, RuntimeError>> + Send>>;

/// Container runtime interface.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container from the given specification, returning its id.
    ///
    /// Fails with [`RuntimeError::ImageNotFound`] when the referenced image
    /// is not present locally.
    async fn create_container(&self, config: &ContainerConfig) -> Result<String, RuntimeError>;

    /// Pull an image by reference, streaming progress to the operator log.
    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Start a created container, with optional host port bindings.
    async fn start_container(
        &self,
        container_id: &str,
        host_config: Option<&HostConfig>,
    ) -> Result<(), RuntimeError>;

    /// Fetch the container's inspection record (exit code).
    async fn inspect_container(&self, container_id: &str) -> Result<ContainerDetails, RuntimeError>;

    /// Subscribe to the daemon's live lifecycle event stream.
    async fn events(&self) -> Result<EventStream, RuntimeError>;
}

type MockEventSender = mpsc::UnboundedSender<Result<ContainerEvent, RuntimeError>>;
type MockEventReceiver = mpsc::UnboundedReceiver<Result<ContainerEvent, RuntimeError>>;

struct MockInner {
    next_container: u64,
    create_attempts: u64,
    missing_images: HashSet<String>,
    pull_installs: bool,
    fail_pulls: bool,
    created: Vec<(String, ContainerConfig)>,
    pulled: Vec<String>,
    started: Vec<(String, Option<HostConfig>)>,
    exit_codes: HashMap<String, i32>,
    failing_inspects: HashSet<String>,
    events_tx: Option<MockEventSender>,
    events_rx: Option<MockEventReceiver>,
}

/// Mock runtime for testing and development.
pub struct MockRuntime {
    inner: Mutex<MockInner>,
}

impl MockRuntime {
    /// Create a new mock runtime.
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Mutex::new(MockInner {
                next_container: 0,
                create_attempts: 0,
                missing_images: HashSet::new(),
                pull_installs: true,
                fail_pulls: false,
                created: Vec::new(),
                pulled: Vec::new(),
                started: Vec::new(),
                exit_codes: HashMap::new(),
                failing_inspects: HashSet::new(),
                events_tx: Some(events_tx),
                events_rx: Some(events_rx),
            }),
        }
    }

    /// Mark an image as absent locally: creation fails until it is pulled.
    pub fn mark_image_missing(&self, image: &str) {
        self.inner
            .lock()
            .unwrap()
            .missing_images
            .insert(image.to_string());
    }

    /// Keep images missing even after a successful pull.
    pub fn pull_never_installs(&self) {
        self.inner.lock().unwrap().pull_installs = false;
    }

    /// Make every pull fail.
    pub fn fail_pulls(&self) {
        self.inner.lock().unwrap().fail_pulls = true;
    }

    /// Set the exit code inspection reports for a container.
    pub fn set_exit_code(&self, container_id: &str, exit_code: i32) {
        self.inner
            .lock()
            .unwrap()
            .exit_codes
            .insert(container_id.to_string(), exit_code);
    }

    /// Make inspection of a container fail, as if it were already removed.
    pub fn fail_inspect(&self, container_id: &str) {
        self.inner
            .lock()
            .unwrap()
            .failing_inspects
            .insert(container_id.to_string());
    }

    /// Inject a lifecycle event into the stream returned by [`events`].
    ///
    /// [`events`]: ContainerRuntime::events
    pub fn push_event(&self, event: ContainerEvent) {
        if let Some(tx) = &self.inner.lock().unwrap().events_tx {
            let _ = tx.send(Ok(event));
        }
    }

    /// End the event stream, as the daemon going away would.
    pub fn close_events(&self) {
        self.inner.lock().unwrap().events_tx = None;
    }

    /// Container configurations passed to `create_container`, in order.
    pub fn created(&self) -> Vec<(String, ContainerConfig)> {
        self.inner.lock().unwrap().created.clone()
    }

    /// Total creation attempts, successful or not.
    pub fn create_attempts(&self) -> u64 {
        self.inner.lock().unwrap().create_attempts
    }

    /// Images pulled, in order.
    pub fn pulled(&self) -> Vec<String> {
        self.inner.lock().unwrap().pulled.clone()
    }

    /// Containers started with their host configuration, in order.
    pub fn started(&self) -> Vec<(String, Option<HostConfig>)> {
        self.inner.lock().unwrap().started.clone()
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create_container(&self, config: &ContainerConfig) -> Result<String, RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.create_attempts += 1;
        if inner.missing_images.contains(&config.image) {
            return Err(RuntimeError::ImageNotFound(config.image.clone()));
        }
        let id = format!("container_{:08x}", inner.next_container);
        inner.next_container += 1;
        debug!(container_id = %id, image = %config.image, "[MOCK] container created");
        inner.created.push((id.clone(), config.clone()));
        Ok(id)
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_pulls {
            return Err(RuntimeError::Pull(format!("mock pull failure for {image}")));
        }
        info!(image, "[MOCK] image pulled");
        inner.pulled.push(image.to_string());
        if inner.pull_installs {
            inner.missing_images.remove(image);
        }
        Ok(())
    }

    async fn start_container(
        &self,
        container_id: &str,
        host_config: Option<&HostConfig>,
    ) -> Result<(), RuntimeError> {
        debug!(container_id, "[MOCK] container started");
        self.inner
            .lock()
            .unwrap()
            .started
            .push((container_id.to_string(), host_config.cloned()));
        Ok(())
    }

    async fn inspect_container(&self, container_id: &str) -> Result<ContainerDetails, RuntimeError> {
        let inner = self.inner.lock().unwrap();
        if inner.failing_inspects.contains(container_id) {
            return Err(RuntimeError::Api {
                status: 404,
                message: format!("no such container: {container_id}"),
            });
        }
        let exit_code = inner.exit_codes.get(container_id).copied().unwrap_or(0);
        Ok(ContainerDetails {
            id: container_id.to_string(),
            state: ContainerState {
                running: false,
                exit_code,
            },
        })
    }

    async fn events(&self) -> Result<EventStream, RuntimeError> {
        let rx = self
            .inner
            .lock()
            .unwrap()
            .events_rx
            .take()
            .ok_or_else(|| RuntimeError::Events("event stream already taken".to_string()))?;
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}
