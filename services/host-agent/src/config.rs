//! Configuration for the host agent.

use anyhow::Result;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;

/// Host agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this host instance.
    pub host_id: String,

    /// Service discovery API URL.
    pub discovery_url: String,

    /// Unix socket path of the container runtime daemon.
    pub runtime_socket: String,

    /// Port the (external) RPC service is registered under.
    pub rpc_port: u16,

    /// Port the attach-handshake listener binds and registers under.
    pub attach_port: u16,

    /// Lower bound of the claimable TCP port window (inclusive).
    pub port_range_start: u16,

    /// Upper bound of the claimable TCP port window (exclusive).
    pub port_range_end: u16,

    /// Memory capacity advertised to the scheduler, in megabytes.
    pub memory_mb: i64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Host ID can be provided or auto-generated
        let host_id = std::env::var("HOIST_HOST_ID")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(generate_host_id);

        let discovery_url = std::env::var("HOIST_DISCOVERY_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:1111".to_string());

        let runtime_socket = std::env::var("HOIST_RUNTIME_SOCKET")
            .unwrap_or_else(|_| "/var/run/docker.sock".to_string());

        let rpc_port = env_port("HOIST_RPC_PORT", 1113);
        let attach_port = env_port("HOIST_ATTACH_PORT", 1114);

        let port_range_start = env_port("HOIST_PORT_RANGE_START", 55000);
        let port_range_end = env_port("HOIST_PORT_RANGE_END", 65535);
        if port_range_start >= port_range_end {
            anyhow::bail!(
                "invalid port window: {}..{}",
                port_range_start,
                port_range_end
            );
        }

        let memory_mb = std::env::var("HOIST_MEMORY_MB")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1024);

        Ok(Self {
            host_id,
            discovery_url,
            runtime_socket,
            rpc_port,
            attach_port,
            port_range_start,
            port_range_end,
            memory_mb,
        })
    }
}

fn env_port(var: &str, default: u16) -> u16 {
    std::env::var(var)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Generate a fresh host identifier: 16 random bytes, URL-safe base64
/// without padding.
pub fn generate_host_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
