//! Runtime configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// The environment variable prefix used for all config values.
pub const ENV_PREFIX: &str = "CLUSTER_ASSIGN_";

/// The default wait applied to each machine's chain of remote operations.
pub const DEFAULT_REMOTE_WAIT_SECONDS: u64 = 10;
/// The default request timeout pushed to token clients.
pub const DEFAULT_CLIENT_REQUEST_TIMEOUT_MS: u32 = 20;
/// The default idle seconds pushed to token servers along with their transport config.
pub const DEFAULT_SERVER_IDLE_SECONDS: u32 = 600;
/// The largest max allowed QPS value which will be pushed to a token server.
pub const DEFAULT_MAX_ALLOWED_QPS_CEILING: f64 = 200_000.0;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The number of seconds to wait on a single machine's chain of remote operations before
    /// recording the machine as failed.
    #[serde(default = "Config::default_remote_wait_seconds")]
    pub remote_wait_seconds: u64,
    /// The request timeout in milliseconds which token clients are configured to use when
    /// talking to their token server.
    #[serde(default = "Config::default_client_request_timeout_ms")]
    pub client_request_timeout_ms: u32,
    /// The idle seconds after which token servers close inactive client connections.
    #[serde(default = "Config::default_server_idle_seconds")]
    pub server_idle_seconds: u32,
    /// The inclusive upper bound of a `max_allowed_qps` value for it to be pushed to a server.
    ///
    /// Values above this ceiling cause the flow config push to be skipped entirely.
    #[serde(default = "Config::default_max_allowed_qps_ceiling")]
    pub max_allowed_qps_ceiling: f64,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment, where every value is optional
    /// and falls back to its default.
    pub fn new() -> Result<Self> {
        envy::prefixed(ENV_PREFIX).from_env().context("error building config from env")
    }

    /// The bounded wait applied to each machine's chain of remote operations.
    pub fn remote_wait(&self) -> Duration {
        Duration::from_secs(self.remote_wait_seconds)
    }

    fn default_remote_wait_seconds() -> u64 {
        DEFAULT_REMOTE_WAIT_SECONDS
    }

    fn default_client_request_timeout_ms() -> u32 {
        DEFAULT_CLIENT_REQUEST_TIMEOUT_MS
    }

    fn default_server_idle_seconds() -> u32 {
        DEFAULT_SERVER_IDLE_SECONDS
    }

    fn default_max_allowed_qps_ceiling() -> f64 {
        DEFAULT_MAX_ALLOWED_QPS_CEILING
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            remote_wait_seconds: DEFAULT_REMOTE_WAIT_SECONDS,
            client_request_timeout_ms: DEFAULT_CLIENT_REQUEST_TIMEOUT_MS,
            server_idle_seconds: DEFAULT_SERVER_IDLE_SECONDS,
            max_allowed_qps_ceiling: DEFAULT_MAX_ALLOWED_QPS_CEILING,
        }
    }
}
