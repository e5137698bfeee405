//! Attach-readiness listener.
//!
//! The attach protocol itself is handled by an external collaborator; the
//! agent only needs its readiness signal before starting a container. This
//! listener accepts an inbound connection, reads one job identifier line,
//! and releases the store's attach rendezvous for that job.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::state::JobStateStore;

/// Accept attach-readiness connections until the listener fails.
pub async fn run_attach_listener(addr: SocketAddr, store: Arc<JobStateStore>) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding attach listener on {addr}"))?;
    info!(%addr, "attach listener ready");

    loop {
        let (stream, peer) = listener
            .accept()
            .await
            .context("accepting attach connection")?;
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, store).await {
                warn!(%peer, error = %e, "attach connection failed");
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, store: Arc<JobStateStore>) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    let job_id = line.trim();
    if job_id.is_empty() {
        return Ok(());
    }
    debug!(job_id, "attach readiness signaled");
    store.release_attach(job_id).await;

    reader.into_inner().write_all(b"ok\n").await
}
