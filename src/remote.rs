//! Collaborator interfaces consumed by the cluster assignment core.
//!
//! Both the machine directory and the remote command protocol live outside of this crate. They
//! are injected into the `StateAggregator` & `TopologyReconciler` as trait objects.

use std::collections::BTreeSet;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{ClientConfig, ClusterRole, Machine, ModeReport, ServerFlowConfig, ServerInfo, ServerTransportConfig};

/// A registry of the machines of each app, along with their liveness.
#[async_trait]
pub trait MachineDirectory: Send + Sync + 'static {
    /// List all known machines of the given app, healthy or not.
    ///
    /// An unknown app has no machines.
    async fn list_machines(&self, app: &str) -> Result<Vec<Machine>>;
}

/// A client of the remote command protocol exposed by each machine on its command port.
///
/// Every mutation is expected to be idempotent on the remote machine.
#[async_trait]
pub trait RemoteControl: Send + Sync + 'static {
    /// Change the cluster mode of the machine.
    async fn modify_mode(&self, host: &str, port: u16, role: ClusterRole) -> Result<()>;

    /// Push token client config to the machine.
    async fn modify_client_config(&self, app: &str, host: &str, port: u16, config: &ClientConfig) -> Result<()>;

    /// Push token server transport config to the machine.
    async fn modify_server_transport_config(&self, app: &str, host: &str, port: u16, config: &ServerTransportConfig) -> Result<()>;

    /// Push token server flow config to the machine.
    async fn modify_server_flow_config(&self, app: &str, host: &str, port: u16, config: &ServerFlowConfig) -> Result<()>;

    /// Push the set of namespaces which the token server owns to the machine.
    async fn modify_server_namespace_set(&self, app: &str, host: &str, port: u16, namespace_set: &BTreeSet<String>) -> Result<()>;

    /// Fetch the current cluster mode of the machine.
    async fn fetch_mode(&self, host: &str, port: u16) -> Result<ModeReport>;

    /// Fetch the token client config of the machine.
    async fn fetch_client_config(&self, host: &str, port: u16) -> Result<ClientConfig>;

    /// Fetch the basic info of the machine's token server.
    async fn fetch_server_info(&self, host: &str, port: u16) -> Result<ServerInfo>;
}
