use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use driftbox_shared::constants::{
    CLEANUP_INTERVAL_MS, DEFAULT_HOST, DEFAULT_PORT, MAX_FILE_SIZE_BYTES, MAX_TOTAL_BYTES,
    RPC_TIMEOUT_MS, SESSION_TTL_MS,
};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub session_ttl: Duration,
    pub max_file_size: u64,
    pub max_total_bytes: u64,
    pub cleanup_interval: Duration,
    pub rpc_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            session_ttl: Duration::from_millis(SESSION_TTL_MS),
            max_file_size: MAX_FILE_SIZE_BYTES,
            max_total_bytes: MAX_TOTAL_BYTES,
            cleanup_interval: Duration::from_millis(CLEANUP_INTERVAL_MS),
            rpc_timeout: Duration::from_millis(RPC_TIMEOUT_MS),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("HOST") {
            if !host.is_empty() {
                config.host = host;
            }
        }

        if let Ok(port) = std::env::var("PORT") {
            match port.parse::<u16>() {
                Ok(parsed) => config.port = parsed,
                Err(_) => tracing::warn!(value = %port, "Invalid PORT, using default"),
            }
        }

        if let Some(ms) = env_millis("SESSION_TTL_MS") {
            config.session_ttl = ms;
        }
        if let Some(ms) = env_millis("CLEANUP_INTERVAL_MS") {
            config.cleanup_interval = ms;
        }
        if let Some(ms) = env_millis("RPC_TIMEOUT_MS") {
            config.rpc_timeout = ms;
        }

        if let Some(bytes) = env_bytes("MAX_FILE_SIZE_BYTES") {
            config.max_file_size = bytes;
        }
        if let Some(bytes) = env_bytes("MAX_TOTAL_BYTES") {
            config.max_total_bytes = bytes;
        }

        config
    }

    /// Resolve the bind address, falling back to the default host when the
    /// configured one does not parse.
    pub fn bind_addr(&self) -> SocketAddr {
        let ip = self.host.parse::<IpAddr>().unwrap_or_else(|_| {
            tracing::warn!(value = %self.host, "Invalid HOST, using default");
            DEFAULT_HOST.parse().expect("default host parses")
        });
        SocketAddr::new(ip, self.port)
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    let raw = std::env::var(name).ok()?;
    match raw.parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "Invalid duration, using default");
            None
        }
    }
}

fn env_bytes(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.parse::<u64>() {
        Ok(bytes) => Some(bytes),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "Invalid byte count, using default");
            None
        }
    }
}
