//! Docker Engine API client over the local Unix socket.
//!
//! Implements [`ContainerRuntime`] against the daemon's HTTP API:
//! container create/start, image pull with streamed progress, container
//! inspection, and the `/events` lifecycle stream.
//!
//! Reference: https://docs.docker.com/engine/api/

use hyper::body::{Buf, HttpBody};
use hyper::{Body, Client, Method, Request, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

use super::{
    ContainerConfig, ContainerDetails, ContainerEvent, ContainerRuntime, EventStream, HostConfig,
    RuntimeError,
};
use async_trait::async_trait;

/// Container runtime client for the Docker daemon's Unix socket.
pub struct DockerRuntime {
    socket_path: String,
    client: Client<UnixConnector>,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct PullProgress {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    progress: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl DockerRuntime {
    /// Create a new client for the given daemon socket path.
    pub fn new(socket_path: &str) -> Self {
        Self {
            socket_path: socket_path.to_string(),
            client: Client::unix(),
        }
    }

    /// Verify the daemon is reachable.
    pub async fn ping(&self) -> Result<(), RuntimeError> {
        let uri = Uri::new(&self.socket_path, "/_ping");
        let response = self.client.get(uri.into()).await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(api_error(status, response.into_body()).await)
        }
    }

    async fn post(&self, path: &str, body: Option<Vec<u8>>) -> Result<hyper::Response<Body>, RuntimeError> {
        let uri = Uri::new(&self.socket_path, path);
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(body.map(Body::from).unwrap_or_else(Body::empty))?;
        Ok(self.client.request(request).await?)
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_container(&self, config: &ContainerConfig) -> Result<String, RuntimeError> {
        debug!(image = %config.image, "creating container");
        let body = serde_json::to_vec(config)?;
        let response = self.post("/containers/create", Some(body)).await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            // The daemon reports a missing image as 404 on create.
            return Err(RuntimeError::ImageNotFound(config.image.clone()));
        }
        if !status.is_success() {
            return Err(api_error(status, response.into_body()).await);
        }

        let body = hyper::body::aggregate(response.into_body()).await?;
        let created: CreateResponse = serde_json::from_reader(body.reader())?;
        debug!(container_id = %created.id, "container created");
        Ok(created.id)
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        info!(image, "pulling image");
        let path = format!("/images/create?fromImage={image}");
        let response = self.post(&path, None).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(api_error(status, response.into_body()).await);
        }

        // The daemon streams progress as newline-delimited JSON for the
        // duration of the pull; surface each line in the operator log.
        let mut body = response.into_body();
        let mut buf: Vec<u8> = Vec::new();
        while let Some(chunk) = body.data().await {
            buf.extend_from_slice(&chunk?);
            while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                log_pull_line(image, &line)?;
            }
        }
        if !buf.is_empty() {
            log_pull_line(image, &buf)?;
        }
        info!(image, "image pulled");
        Ok(())
    }

    async fn start_container(
        &self,
        container_id: &str,
        host_config: Option<&HostConfig>,
    ) -> Result<(), RuntimeError> {
        debug!(container_id, "starting container");
        let body = match host_config {
            Some(host_config) => Some(serde_json::to_vec(host_config)?),
            None => None,
        };
        let path = format!("/containers/{container_id}/start");
        let response = self.post(&path, body).await?;
        let status = response.status();
        // 304 means the container was already started.
        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            Ok(())
        } else {
            Err(api_error(status, response.into_body()).await)
        }
    }

    async fn inspect_container(&self, container_id: &str) -> Result<ContainerDetails, RuntimeError> {
        let path = format!("/containers/{container_id}/json");
        let uri = Uri::new(&self.socket_path, &path);
        let response = self.client.get(uri.into()).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(api_error(status, response.into_body()).await);
        }
        let body = hyper::body::aggregate(response.into_body()).await?;
        Ok(serde_json::from_reader(body.reader())?)
    }

    async fn events(&self) -> Result<EventStream, RuntimeError> {
        let uri = Uri::new(&self.socket_path, "/events");
        let response = self.client.get(uri.into()).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(api_error(status, response.into_body()).await);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut body = response.into_body();
        tokio::spawn(async move {
            let mut buf: Vec<u8> = Vec::new();
            while let Some(chunk) = body.data().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(Err(RuntimeError::Http(e)));
                        return;
                    }
                };
                buf.extend_from_slice(&chunk);
                match drain_events(&mut buf) {
                    Ok(events) => {
                        for event in events {
                            if tx.send(Ok(event)).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "undecodable runtime event payload");
                        let _ = tx.send(Err(RuntimeError::Json(e)));
                        return;
                    }
                }
            }
            debug!("runtime event stream closed by daemon");
        });

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

/// Decode every complete JSON event in `buf`, leaving any trailing partial
/// value in place for the next chunk.
fn drain_events(buf: &mut Vec<u8>) -> Result<Vec<ContainerEvent>, serde_json::Error> {
    let mut events = Vec::new();
    let mut consumed = 0;
    {
        let mut de = serde_json::Deserializer::from_slice(buf).into_iter::<ContainerEvent>();
        loop {
            match de.next() {
                Some(Ok(event)) => {
                    events.push(event);
                    consumed = de.byte_offset();
                }
                Some(Err(e)) if e.is_eof() => break,
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }
    }
    buf.drain(..consumed);
    Ok(events)
}

/// Surface one pull-progress line in the operator log; an in-stream error
/// fails the pull.
fn log_pull_line(image: &str, line: &[u8]) -> Result<(), RuntimeError> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    if line.is_empty() {
        return Ok(());
    }
    let progress: PullProgress = match serde_json::from_slice(line) {
        Ok(progress) => progress,
        Err(_) => {
            warn!(image, "unparseable pull progress line");
            return Ok(());
        }
    };
    if let Some(message) = progress.error {
        return Err(RuntimeError::Pull(message));
    }
    if let Some(status) = progress.status {
        info!(
            image,
            layer = progress.id.as_deref().unwrap_or_default(),
            progress = progress.progress.as_deref().unwrap_or_default(),
            "{status}"
        );
    }
    Ok(())
}

async fn api_error(status: StatusCode, body: Body) -> RuntimeError {
    let message = match hyper::body::aggregate(body).await {
        Ok(body) => String::from_utf8_lossy(body.chunk()).trim().to_string(),
        Err(_) => String::new(),
    };
    RuntimeError::Api {
        status: status.as_u16(),
        message,
    }
}
