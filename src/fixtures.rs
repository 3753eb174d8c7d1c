//! An in-memory fleet used for testing.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing_subscriber::prelude::*;

use crate::assign::TopologyReconciler;
use crate::config::Config;
use crate::models::{ClientConfig, ClusterRole, Machine, MachineId, ModeReport, ServerFlowConfig, ServerInfo, ServerTransportConfig};
use crate::remote::{MachineDirectory, RemoteControl};
use crate::state::StateAggregator;

/// The serving port reported by servers which never received transport config.
pub const DEFAULT_SERVING_PORT: u16 = 18730;

/// A remote operation of the fleet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    ModifyMode,
    ModifyClientConfig,
    ModifyTransport,
    ModifyFlow,
    ModifyNamespaceSet,
    FetchMode,
    FetchClientConfig,
    FetchServerInfo,
}

/// The state held by a single machine of the fleet.
#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    pub role: ClusterRole,
    pub client_config: Option<ClientConfig>,
    pub transport: Option<ServerTransportConfig>,
    pub flow: Option<ServerFlowConfig>,
    pub namespace_set: BTreeSet<String>,
}

impl Default for Node {
    fn default() -> Self {
        Self {
            role: ClusterRole::NotStarted,
            client_config: None,
            transport: None,
            flow: None,
            namespace_set: Default::default(),
        }
    }
}

/// An in-memory fleet of machines, acting as both the machine directory and the remote.
///
/// Every remote operation is recorded in the order it was received. Operations can be made to
/// fail or to hang per machine.
#[derive(Default)]
pub struct FakeFleet {
    inner: Mutex<FleetState>,
}

#[derive(Default)]
struct FleetState {
    apps: HashMap<String, Vec<Machine>>,
    nodes: HashMap<String, Node>,
    calls: Vec<(String, Op)>,
    failing: HashSet<(String, Op)>,
    hanging: HashSet<(String, Op)>,
}

impl FakeFleet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, FleetState> {
        self.inner.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Add a machine to the given app.
    pub fn add_machine(&self, app: &str, host: &str, port: u16, healthy: bool) -> String {
        let mut state = self.lock();
        let machine = Machine {
            host: host.into(),
            command_port: port,
            healthy,
        };
        let id = machine.machine_id().to_string();
        state.apps.entry(app.into()).or_default().push(machine);
        state.nodes.entry(id.clone()).or_default();
        id
    }

    /// Make the given machine a token server serving on the given port.
    pub fn set_server(&self, machine_id: &str, serving_port: u16) {
        let mut state = self.lock();
        let node = state.nodes.entry(machine_id.into()).or_default();
        node.role = ClusterRole::Server;
        node.transport = Some(ServerTransportConfig {
            port: serving_port,
            idle_seconds: 600,
        });
    }

    /// Make the given machine a token client of the server serving on the given address.
    pub fn set_client(&self, machine_id: &str, server_host: &str, server_port: u16) {
        let mut state = self.lock();
        let node = state.nodes.entry(machine_id.into()).or_default();
        node.role = ClusterRole::Client;
        node.client_config = Some(ClientConfig {
            server_host: server_host.into(),
            server_port,
            request_timeout_ms: 20,
        });
    }

    /// Make the given operation fail on the given machine.
    pub fn fail_on(&self, machine_id: &str, op: Op) {
        self.lock().failing.insert((machine_id.into(), op));
    }

    /// Make the given operation never complete on the given machine.
    pub fn hang_on(&self, machine_id: &str, op: Op) {
        self.lock().hanging.insert((machine_id.into(), op));
    }

    /// Clear all injected failures of the given machine.
    pub fn heal(&self, machine_id: &str) {
        let mut state = self.lock();
        state.failing.retain(|(id, _)| id != machine_id);
        state.hanging.retain(|(id, _)| id != machine_id);
    }

    /// A copy of the state of the given machine.
    pub fn node(&self, machine_id: &str) -> Node {
        self.lock().nodes.get(machine_id).cloned().unwrap_or_default()
    }

    pub fn role(&self, machine_id: &str) -> ClusterRole {
        self.node(machine_id).role
    }

    /// The number of times the given operation was received by the given machine.
    pub fn calls(&self, machine_id: &str, op: Op) -> usize {
        self.lock().calls.iter().filter(|(id, call)| id == machine_id && *call == op).count()
    }

    /// All operations received by the given machine, in order.
    pub fn ops(&self, machine_id: &str) -> Vec<Op> {
        self.lock().calls.iter().filter(|(id, _)| id == machine_id).map(|(_, op)| *op).collect()
    }

    /// Forget all recorded operations.
    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Record the operation, then apply `f` to the machine's node unless a failure was injected.
    async fn apply<T>(&self, host: &str, port: u16, op: Op, f: impl FnOnce(&mut Node) -> T) -> Result<T> {
        let id = MachineId::command(host, port).to_string();
        let hang = {
            let mut state = self.lock();
            state.calls.push((id.clone(), op));
            state.hanging.contains(&(id.clone(), op))
        };
        if hang {
            futures::future::pending::<()>().await;
        }

        let mut state = self.lock();
        if state.failing.contains(&(id.clone(), op)) {
            bail!("injected failure of {:?} on {}", op, id);
        }
        match state.nodes.get_mut(&id) {
            Some(node) => Ok(f(node)),
            None => bail!("connection refused by {}", id),
        }
    }
}

#[async_trait]
impl MachineDirectory for FakeFleet {
    async fn list_machines(&self, app: &str) -> Result<Vec<Machine>> {
        Ok(self.lock().apps.get(app).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl RemoteControl for FakeFleet {
    async fn modify_mode(&self, host: &str, port: u16, role: ClusterRole) -> Result<()> {
        self.apply(host, port, Op::ModifyMode, |node| node.role = role).await
    }

    async fn modify_client_config(&self, _app: &str, host: &str, port: u16, config: &ClientConfig) -> Result<()> {
        self.apply(host, port, Op::ModifyClientConfig, |node| node.client_config = Some(config.clone()))
            .await
    }

    async fn modify_server_transport_config(&self, _app: &str, host: &str, port: u16, config: &ServerTransportConfig) -> Result<()> {
        self.apply(host, port, Op::ModifyTransport, |node| node.transport = Some(config.clone()))
            .await
    }

    async fn modify_server_flow_config(&self, _app: &str, host: &str, port: u16, config: &ServerFlowConfig) -> Result<()> {
        self.apply(host, port, Op::ModifyFlow, |node| node.flow = Some(config.clone())).await
    }

    async fn modify_server_namespace_set(&self, _app: &str, host: &str, port: u16, namespace_set: &BTreeSet<String>) -> Result<()> {
        self.apply(host, port, Op::ModifyNamespaceSet, |node| node.namespace_set = namespace_set.clone())
            .await
    }

    async fn fetch_mode(&self, host: &str, port: u16) -> Result<ModeReport> {
        self.apply(host, port, Op::FetchMode, |node| ModeReport {
            role: node.role,
            client_available: node.role == ClusterRole::Client && node.client_config.is_some(),
            server_available: node.role == ClusterRole::Server,
        })
        .await
    }

    async fn fetch_client_config(&self, host: &str, port: u16) -> Result<ClientConfig> {
        let config = self.apply(host, port, Op::FetchClientConfig, |node| node.client_config.clone()).await?;
        config.ok_or_else(|| anyhow::anyhow!("no token client config on {}@{}", host, port))
    }

    async fn fetch_server_info(&self, host: &str, port: u16) -> Result<ServerInfo> {
        self.apply(host, port, Op::FetchServerInfo, |node| ServerInfo {
            port: node.transport.as_ref().map(|t| t.port).unwrap_or(DEFAULT_SERVING_PORT),
            idle_seconds: node.transport.as_ref().map(|t| t.idle_seconds).unwrap_or(600),
            namespace_set: node.namespace_set.clone(),
            max_allowed_qps: node.flow.as_ref().map(|f| f.max_allowed_qps).unwrap_or_default(),
            embedded: true,
        })
        .await
    }
}

/// A config suitable for tests, with a short remote wait.
pub fn test_config() -> Arc<Config> {
    Arc::new(Config {
        remote_wait_seconds: 1,
        ..Default::default()
    })
}

/// Build a reconciler backed by the given fleet.
pub fn reconciler(fleet: &Arc<FakeFleet>) -> TopologyReconciler {
    init_tracing();
    TopologyReconciler::new(test_config(), fleet.clone(), fleet.clone())
}

/// Build a state aggregator backed by the given fleet.
pub fn aggregator(fleet: &Arc<FakeFleet>) -> StateAggregator {
    init_tracing();
    StateAggregator::new(test_config(), fleet.clone(), fleet.clone())
}

/// Install a tracing subscriber filtered by `RUST_LOG`, if one is not already installed.
pub fn init_tracing() {
    let _res = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}
