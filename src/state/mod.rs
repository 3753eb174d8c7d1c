//! Cluster state aggregation.
//!
//! The state of a machine is composed from a chain of dependent remote reads. The mode of the
//! machine is fetched first, and depending on what the machine reports as available, its token
//! client config and token server info are then fetched in turn. Machines are queried in
//! parallel with each other, and the app-wide snapshot is best-effort: a machine which can not
//! be queried is left out of the snapshot, it never fails the snapshot as a whole.


use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use tokio::time::timeout;

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::futures::join_successes;
use crate::models::{
    validate_app, ClientModifyRequest, ClientStateView, ClusterGroup, ClusterRole, Machine, MachineId, MachineState, MachineStatePair,
    ServerModifyRequest, ServerStateView,
};
use crate::remote::{MachineDirectory, RemoteControl};

/// An aggregator of the cluster state of an app's machines.
#[derive(Clone)]
pub struct StateAggregator {
    /// Runtime config.
    config: Arc<Config>,
    /// The registry of the machines of each app.
    directory: Arc<dyn MachineDirectory>,
    /// The client used to query & command machines.
    remote: Arc<dyn RemoteControl>,
}

impl StateAggregator {
    /// Create a new instance.
    pub fn new(config: Arc<Config>, directory: Arc<dyn MachineDirectory>, remote: Arc<dyn RemoteControl>) -> Self {
        Self { config, directory, remote }
    }

    /// Fetch the cluster state of every healthy machine of the given app.
    ///
    /// An app without machines yields an empty snapshot. Machines which fail to report their
    /// state within the configured wait are left out of the snapshot.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn global_state(&self, app: &str) -> AppResult<Vec<MachineStatePair>> {
        validate_app(app)?;
        let machines = self.healthy_machines(app).await?;
        if machines.is_empty() {
            return Ok(vec![]);
        }

        let queries = machines
            .into_iter()
            .map(|machine| {
                let remote = self.remote.clone();
                let label = machine.machine_id().to_string();
                let query: BoxFuture<'static, Result<MachineStatePair>> = Box::pin(async move {
                    let state = fetch_machine_state(remote.as_ref(), &machine.host, machine.command_port).await?;
                    Ok::<_, anyhow::Error>(MachineStatePair {
                        host: machine.host,
                        command_port: machine.command_port,
                        state,
                    })
                });
                (label, query)
            })
            .collect();
        Ok(join_successes(self.config.remote_wait(), queries).await)
    }

    /// Fetch the cluster state of a single machine.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn machine_state(&self, host: &str, port: u16) -> AppResult<MachineState> {
        timeout(self.config.remote_wait(), fetch_machine_state(self.remote.as_ref(), host, port))
            .await
            .map_err(|_| AppError::Timeout(MachineId::command(host, port).to_string()))?
            .map_err(AppError::from)
    }

    /// Fetch the cluster group of the given token server machine.
    ///
    /// The machine must be a known, healthy machine of the app which is currently acting as a
    /// token server.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn group_for_machine(&self, app: &str, machine_id: &str) -> AppResult<ClusterGroup> {
        validate_app(app)?;
        let id: MachineId = machine_id.parse()?;
        let machines = self.healthy_machines(app).await?;
        if !machines.iter().any(|machine| machine.machine_id() == id) {
            return Err(AppError::MachineNotFound(machine_id.to_string()));
        }
        let states = self.global_state(app).await?;
        group_from_states(&id, &states).ok_or_else(|| AppError::NotAServer(machine_id.to_string()))
    }

    /// Fetch all token servers of the given app, along with their bound token clients.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn server_states(&self, app: &str) -> AppResult<Vec<ServerStateView>> {
        let states = self.global_state(app).await?;
        Ok(states
            .iter()
            .filter(|pair| pair.state.role() == ClusterRole::Server)
            .map(|pair| {
                let info = pair.state.server_info().cloned();
                let client_set = info
                    .as_ref()
                    .map(|info| bound_clients(&pair.host, info.port, &states))
                    .unwrap_or_default();
                ServerStateView {
                    machine_id: pair.machine_id().to_string(),
                    host: pair.host.clone(),
                    command_port: pair.command_port,
                    info,
                    client_set,
                }
            })
            .collect())
    }

    /// Fetch all token clients of the given app.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn client_states(&self, app: &str) -> AppResult<Vec<ClientStateView>> {
        let states = self.global_state(app).await?;
        Ok(states
            .into_iter()
            .filter(|pair| pair.state.role() == ClusterRole::Client)
            .map(|pair| ClientStateView {
                machine_id: pair.machine_id().to_string(),
                config: pair.state.client_config().cloned(),
                host: pair.host,
                command_port: pair.command_port,
            })
            .collect())
    }

    /// Configure a single machine as a token client.
    ///
    /// The request is validated before any remote call is issued. The client config is pushed
    /// first, and the mode of the machine is changed only once the config has been accepted.
    #[tracing::instrument(level = "debug", skip(self, request), fields(app = %request.app, host = %request.host, port = request.command_port))]
    pub async fn modify_client_config(&self, request: &ClientModifyRequest) -> AppResult<()> {
        validate_app(&request.app)?;
        request.config.validate()?;

        let (remote, req) = (self.remote.as_ref(), request);
        let chain = async move {
            remote
                .modify_client_config(&req.app, &req.host, req.command_port, &req.config)
                .await
                .context("error pushing token client config")?;
            remote
                .modify_mode(&req.host, req.command_port, ClusterRole::Client)
                .await
                .context("error changing mode to token client")
        };
        self.bounded(&request.host, request.command_port, chain).await
    }

    /// Configure a single machine as a token server.
    ///
    /// The request is validated before any remote call is issued. Config is pushed in order of
    /// namespace set, transport and flow, and the mode of the machine is changed last.
    #[tracing::instrument(level = "debug", skip(self, request), fields(app = %request.app, host = %request.host, port = request.command_port))]
    pub async fn modify_server_config(&self, request: &ServerModifyRequest) -> AppResult<()> {
        validate_app(&request.app)?;
        request.transport.validate()?;
        request.flow.validate()?;

        let (remote, req) = (self.remote.as_ref(), request);
        let chain = async move {
            remote
                .modify_server_namespace_set(&req.app, &req.host, req.command_port, &req.namespace_set)
                .await
                .context("error pushing token server namespace set")?;
            remote
                .modify_server_transport_config(&req.app, &req.host, req.command_port, &req.transport)
                .await
                .context("error pushing token server transport config")?;
            remote
                .modify_server_flow_config(&req.app, &req.host, req.command_port, &req.flow)
                .await
                .context("error pushing token server flow config")?;
            remote
                .modify_mode(&req.host, req.command_port, ClusterRole::Server)
                .await
                .context("error changing mode to token server")
        };
        self.bounded(&request.host, request.command_port, chain).await
    }

    /// List all known machines of the given app, healthy or not.
    pub(crate) async fn all_machines(&self, app: &str) -> AppResult<Vec<Machine>> {
        let machines = self
            .directory
            .list_machines(app)
            .await
            .with_context(|| format!("error listing machines of app {}", app))?;
        Ok(machines)
    }

    /// List the healthy machines of the given app.
    async fn healthy_machines(&self, app: &str) -> AppResult<Vec<Machine>> {
        let mut machines = self.all_machines(app).await?;
        machines.retain(|machine| machine.healthy);
        Ok(machines)
    }

    /// Await the given chain of remote operations for a single machine, bounded by the configured wait.
    async fn bounded(&self, host: &str, port: u16, chain: impl std::future::Future<Output = Result<()>>) -> AppResult<()> {
        timeout(self.config.remote_wait(), chain)
            .await
            .map_err(|_| AppError::Timeout(MachineId::command(host, port).to_string()))?
            .map_err(AppError::from)
    }
}

/// Fetch the cluster state of a single machine by chaining its dependent remote reads.
pub(crate) async fn fetch_machine_state(remote: &dyn RemoteControl, host: &str, port: u16) -> Result<MachineState> {
    let report = remote.fetch_mode(host, port).await.context("error fetching cluster mode")?;
    let client_config = if report.client_available {
        Some(remote.fetch_client_config(host, port).await.context("error fetching token client config")?)
    } else {
        None
    };
    let server_info = if report.server_available {
        Some(remote.fetch_server_info(host, port).await.context("error fetching token server info")?)
    } else {
        None
    };
    Ok(match report.role {
        ClusterRole::NotStarted => MachineState::NotStarted,
        ClusterRole::Client => MachineState::Client(client_config),
        ClusterRole::Server => MachineState::Server(server_info),
    })
}

/// Derive the cluster group of the given machine from a snapshot of its app's state.
///
/// Returns `None` if the machine is not in the snapshot, or is not a token server.
pub(crate) fn group_from_states(id: &MachineId, states: &[MachineStatePair]) -> Option<ClusterGroup> {
    let pair = states.iter().find(|pair| &pair.machine_id() == id)?;
    let info = match &pair.state {
        MachineState::Server(info) => info.as_ref(),
        _ => return None,
    };
    // A server which could not report its serving port has no clients which we can identify.
    let (port, client_set) = match info {
        Some(info) => (Some(info.port), bound_clients(&pair.host, info.port, states)),
        None => (None, BTreeSet::new()),
    };
    Some(ClusterGroup {
        machine_id: id.to_string(),
        host: pair.host.clone(),
        port,
        client_set,
    })
}

/// The IDs of all token clients in the snapshot which target the server serving on `host:port`.
pub(crate) fn bound_clients(host: &str, port: u16, states: &[MachineStatePair]) -> BTreeSet<String> {
    states
        .iter()
        .filter(|pair| pair.state.client_config().map(|config| config.targets(host, port)).unwrap_or(false))
        .map(|pair| pair.machine_id().to_string())
        .collect()
}
