//! Cluster assignment data models.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// The separator used by the command form of a machine ID, `host@commandPort`.
pub const SEP_COMMAND: char = '@';
/// The separator used by the serving form of a machine ID, `host:port`.
pub const SEP_SERVING: char = ':';

/// The identity of a machine, resolvable to a host & port pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MachineId {
    /// A machine addressed by its command port, `host@commandPort`.
    Command { host: String, port: u16 },
    /// A token server addressed by its serving port, `host:port`.
    ///
    /// This form is used to reference token servers which are not known machines of the app.
    Serving { host: String, port: u16 },
}

impl MachineId {
    /// Build the command form of a machine ID.
    pub fn command(host: impl Into<String>, port: u16) -> Self {
        Self::Command { host: host.into(), port }
    }

    /// The host of this machine.
    pub fn host(&self) -> &str {
        match self {
            Self::Command { host, .. } | Self::Serving { host, .. } => host.as_str(),
        }
    }

    /// The port of this machine, which is a command port or serving port depending on the form.
    pub fn port(&self) -> u16 {
        match self {
            Self::Command { port, .. } | Self::Serving { port, .. } => *port,
        }
    }
}

impl FromStr for MachineId {
    type Err = AppError;

    fn from_str(val: &str) -> AppResult<Self> {
        let invalid = || AppError::InvalidMachineId(val.to_string());
        let (host, port, is_command) = match val.rsplit_once(SEP_COMMAND) {
            Some((host, port)) => (host, port, true),
            None => val.rsplit_once(SEP_SERVING).map(|(host, port)| (host, port, false)).ok_or_else(invalid)?,
        };
        let host = host.trim();
        let port: u16 = port.trim().parse().map_err(|_| invalid())?;
        if host.is_empty() || port == 0 {
            return Err(invalid());
        }
        Ok(if is_command {
            Self::Command { host: host.into(), port }
        } else {
            Self::Serving { host: host.into(), port }
        })
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command { host, port } => write!(f, "{}{}{}", host, SEP_COMMAND, port),
            Self::Serving { host, port } => write!(f, "{}{}{}", host, SEP_SERVING, port),
        }
    }
}

/// The cluster role of a machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterRole {
    /// Standalone, the machine does not take part in the cluster.
    NotStarted,
    /// The machine forwards flow control checks to a token server.
    Client,
    /// The machine is the authoritative counter for a set of namespaces.
    Server,
}

impl ClusterRole {
    /// The code of this role as used by the remote command protocol.
    pub fn code(&self) -> i32 {
        match self {
            Self::NotStarted => -1,
            Self::Client => 0,
            Self::Server => 1,
        }
    }

    /// Resolve a role from its remote command protocol code.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(Self::NotStarted),
            0 => Some(Self::Client),
            1 => Some(Self::Server),
            _ => None,
        }
    }
}

impl fmt::Display for ClusterRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => f.write_str("NOT_STARTED"),
            Self::Client => f.write_str("CLIENT"),
            Self::Server => f.write_str("SERVER"),
        }
    }
}

/// A machine's report of its current cluster mode.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeReport {
    pub role: ClusterRole,
    /// The machine is able to report its token client state.
    pub client_available: bool,
    /// The machine is able to report its token server state.
    pub server_available: bool,
}

/// Token client config.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    pub server_host: String,
    pub server_port: u16,
    pub request_timeout_ms: u32,
}

impl ClientConfig {
    /// Check if this config points at the token server serving on the given host & port.
    pub fn targets(&self, host: &str, port: u16) -> bool {
        self.server_host == host && self.server_port == port
    }

    /// Validate this config before it is pushed to a machine.
    pub fn validate(&self) -> AppResult<()> {
        if self.server_host.trim().is_empty() {
            return Err(AppError::InvalidInput("client config server host cannot be blank".into()));
        }
        if self.server_port == 0 {
            return Err(AppError::InvalidInput("client config server port must be greater than 0".into()));
        }
        if self.request_timeout_ms == 0 {
            return Err(AppError::InvalidInput("client config request timeout must be greater than 0".into()));
        }
        Ok(())
    }
}

/// Token server transport config.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerTransportConfig {
    /// The port on which the token server listens for token clients.
    pub port: u16,
    /// The number of seconds after which idle client connections are closed.
    pub idle_seconds: u32,
}

impl ServerTransportConfig {
    /// Validate this config before it is pushed to a machine.
    pub fn validate(&self) -> AppResult<()> {
        if self.port == 0 || self.idle_seconds == 0 {
            return Err(AppError::InvalidInput("invalid transport config, port & idle seconds must be greater than 0".into()));
        }
        Ok(())
    }
}

/// Token server flow config.
///
/// Unset sampling fields are left untouched on the remote machine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerFlowConfig {
    pub max_allowed_qps: f64,
    #[serde(default)]
    pub sample_count: Option<u32>,
    #[serde(default)]
    pub interval_ms: Option<u32>,
}

impl ServerFlowConfig {
    /// A flow config which only updates the max allowed QPS of a server.
    pub fn with_max_allowed_qps(max_allowed_qps: f64) -> Self {
        Self {
            max_allowed_qps,
            sample_count: None,
            interval_ms: None,
        }
    }

    /// Validate this config as a complete flow config.
    pub fn validate(&self) -> AppResult<()> {
        let (sample_count, interval_ms) = match (self.sample_count, self.interval_ms) {
            (Some(sample_count), Some(interval_ms)) if sample_count > 0 && interval_ms > 0 => (sample_count, interval_ms),
            _ => return Err(AppError::InvalidInput("invalid flow config, sample count & interval must be greater than 0".into())),
        };
        if interval_ms % sample_count != 0 {
            return Err(AppError::InvalidInput(format!(
                "invalid flow config, interval {}ms is not divisible by sample count {}",
                interval_ms, sample_count
            )));
        }
        if !self.max_allowed_qps.is_finite() || self.max_allowed_qps < 0.0 {
            return Err(AppError::InvalidInput("invalid flow config, max allowed QPS cannot be negative".into()));
        }
        Ok(())
    }
}

/// Basic info reported by a token server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    /// The port on which the token server is serving token clients.
    pub port: u16,
    pub idle_seconds: u32,
    #[serde(default)]
    pub namespace_set: BTreeSet<String>,
    pub max_allowed_qps: f64,
    /// The token server is embedded in an app machine, rather than running standalone.
    #[serde(default)]
    pub embedded: bool,
}

/// The cluster state of a single machine.
///
/// A role's payload is `None` when the machine reported that sub-state as unavailable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MachineState {
    NotStarted,
    Client(Option<ClientConfig>),
    Server(Option<ServerInfo>),
}

impl MachineState {
    /// The role of the machine.
    pub fn role(&self) -> ClusterRole {
        match self {
            Self::NotStarted => ClusterRole::NotStarted,
            Self::Client(_) => ClusterRole::Client,
            Self::Server(_) => ClusterRole::Server,
        }
    }

    /// The machine's token client config, if it is a client which reported one.
    pub fn client_config(&self) -> Option<&ClientConfig> {
        match self {
            Self::Client(config) => config.as_ref(),
            _ => None,
        }
    }

    /// The machine's token server info, if it is a server which reported one.
    pub fn server_info(&self) -> Option<&ServerInfo> {
        match self {
            Self::Server(info) => info.as_ref(),
            _ => None,
        }
    }
}

/// A machine as known by the machine directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    pub host: String,
    pub command_port: u16,
    pub healthy: bool,
}

impl Machine {
    /// The command form ID of this machine.
    pub fn machine_id(&self) -> MachineId {
        MachineId::command(self.host.clone(), self.command_port)
    }
}

/// A machine paired with its current cluster state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatePair {
    pub host: String,
    pub command_port: u16,
    pub state: MachineState,
}

impl MachineStatePair {
    /// The command form ID of this machine.
    pub fn machine_id(&self) -> MachineId {
        MachineId::command(self.host.clone(), self.command_port)
    }
}

/// A token server along with the machines which are bound to it as token clients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterGroup {
    pub machine_id: String,
    pub host: String,
    /// The port on which the token server is serving token clients, if it reported one.
    pub port: Option<u16>,
    pub client_set: BTreeSet<String>,
}

/// A token server as seen in an app's cluster state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStateView {
    pub machine_id: String,
    pub host: String,
    pub command_port: u16,
    pub info: Option<ServerInfo>,
    pub client_set: BTreeSet<String>,
}

/// A token client as seen in an app's cluster state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStateView {
    pub machine_id: String,
    pub host: String,
    pub command_port: u16,
    pub config: Option<ClientConfig>,
}

/// A desired token server along with its config and the machines to bind to it as clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignMap {
    /// The ID of the token server machine, in command form for servers which belong to the app.
    pub machine_id: String,
    /// The host on which the token server serves token clients.
    pub host: String,
    /// The port on which the token server serves token clients.
    pub port: u16,
    /// The server is a machine of the app, and should be configured as a token server.
    #[serde(default)]
    pub belong_to_app: bool,
    /// The max allowed QPS of the token server.
    ///
    /// When unset or out of range, the flow config of the server is left untouched.
    #[serde(default)]
    pub max_allowed_qps: Option<f64>,
    #[serde(default)]
    pub namespace_set: BTreeSet<String>,
    #[serde(default)]
    pub client_set: BTreeSet<String>,
}

impl AssignMap {
    /// The flow config to push to this server, if its max allowed QPS is within `(0, ceiling]`.
    pub fn flow_config(&self, ceiling: f64) -> Option<ServerFlowConfig> {
        self.max_allowed_qps
            .filter(|qps| *qps > 0.0 && *qps <= ceiling)
            .map(ServerFlowConfig::with_max_allowed_qps)
    }
}

/// The outcome of an assignment or unbind operation.
///
/// Every machine which did not converge is listed by ID. Empty sets mean full convergence.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignResult {
    pub failed_server_set: BTreeSet<String>,
    pub failed_client_set: BTreeSet<String>,
}

impl AssignResult {
    /// Check if every machine converged.
    pub fn is_converged(&self) -> bool {
        self.failed_server_set.is_empty() && self.failed_client_set.is_empty()
    }

    /// Merge the failures of another result into this one.
    pub fn merge(&mut self, other: AssignResult) {
        self.failed_server_set.extend(other.failed_server_set);
        self.failed_client_set.extend(other.failed_client_set);
    }
}

/// A request to configure a single machine as a token client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientModifyRequest {
    pub app: String,
    pub host: String,
    pub command_port: u16,
    pub config: ClientConfig,
}

/// A request to configure a single machine as a token server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerModifyRequest {
    pub app: String,
    pub host: String,
    pub command_port: u16,
    pub transport: ServerTransportConfig,
    pub flow: ServerFlowConfig,
    pub namespace_set: BTreeSet<String>,
}

/// Validate that the given app name is not blank.
pub fn validate_app(app: &str) -> AppResult<()> {
    if app.trim().is_empty() {
        return Err(AppError::InvalidInput(crate::error::ERR_BLANK_APP.into()));
    }
    Ok(())
}
