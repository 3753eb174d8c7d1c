//! Token server & token client assignment.
//!
//! ## Reconciliation
//! An assignment is applied as a one-shot, best-effort reconciliation. Every machine named by
//! the desired topology gets its own task, which runs the ordered chain of remote operations for
//! that machine. Within a chain, each step is issued only once the prior step has succeeded, so a
//! machine always observes its mode change before the config which depends on it. Across
//! machines there is no ordering at all.
//!
//! A chain which errors or does not finish within the configured wait records its machine as
//! failed, and its remaining steps are never issued. Nothing is retried or rolled back. Steps
//! which were applied before a failure are left as-is on the remote machine, and will converge
//! when the caller re-submits the same topology for the failed machines. All remote operations
//! are idempotent, so re-submission never disturbs machines which already converged.
//!
//! ## Caller Contract
//! The servers & clients of the given assign maps and the remaining set must be disjoint. An
//! overlapping topology is not detected, and the resulting state of the overlapping machines is
//! undefined.


use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::futures::{Fanout, FailureSet};
use crate::models::{
    validate_app, AssignMap, AssignResult, ClientConfig, ClusterRole, MachineId, ServerFlowConfig, ServerTransportConfig,
};
use crate::remote::{MachineDirectory, RemoteControl};
use crate::state::StateAggregator;

pub(self) const METRIC_ASSIGN_REQUESTS: &str = "cluster_assign_requests_total";
pub(self) const METRIC_UNBIND_REQUESTS: &str = "cluster_assign_unbind_requests_total";
pub(self) const METRIC_FAILED_SERVERS: &str = "cluster_assign_failed_servers_total";
pub(self) const METRIC_FAILED_CLIENTS: &str = "cluster_assign_failed_clients_total";

/// A reconciler of the token server & token client topology of an app's machines.
#[derive(Clone)]
pub struct TopologyReconciler {
    /// Runtime config.
    config: Arc<Config>,
    /// The aggregator used to discover the current topology.
    state: StateAggregator,
    /// The client used to command machines.
    remote: Arc<dyn RemoteControl>,
}

impl TopologyReconciler {
    /// Create a new instance.
    pub fn new(config: Arc<Config>, directory: Arc<dyn MachineDirectory>, remote: Arc<dyn RemoteControl>) -> Self {
        metrics::register_counter!(METRIC_ASSIGN_REQUESTS, metrics::Unit::Count, "the number of assignments applied");
        metrics::register_counter!(METRIC_UNBIND_REQUESTS, metrics::Unit::Count, "the number of token server unbind requests");
        metrics::register_counter!(METRIC_FAILED_SERVERS, metrics::Unit::Count, "the number of token servers which failed to converge");
        metrics::register_counter!(METRIC_FAILED_CLIENTS, metrics::Unit::Count, "the number of token clients which failed to converge");
        let state = StateAggregator::new(config.clone(), directory, remote.clone());
        Self { config, state, remote }
    }

    /// The state aggregator used by this reconciler.
    pub fn state(&self) -> &StateAggregator {
        &self.state
    }

    /// Apply the given token server assignment to the app.
    ///
    /// Servers of the assign maps which belong to the app are switched to token server mode and
    /// configured, the clients of every assign map are switched to token client mode and pointed
    /// at their server, and the machines of `remaining_set` are switched out of the cluster. All
    /// machines are processed concurrently.
    ///
    /// Only structurally invalid input is rejected as an error. Machines which fail to converge
    /// are reported in the returned result.
    #[tracing::instrument(level = "debug", skip(self, assign_maps, remaining_set), fields(servers = assign_maps.len(), remaining = remaining_set.len()))]
    pub async fn apply_assignment(&self, app: &str, assign_maps: &[AssignMap], remaining_set: &BTreeSet<String>) -> AppResult<AssignResult> {
        validate_app(app)?;
        for map in assign_maps {
            if map.port == 0 {
                return Err(AppError::InvalidInput(format!("invalid serving port 0 for token server {}", map.machine_id)));
            }
        }
        metrics::increment_counter!(METRIC_ASSIGN_REQUESTS);

        let wait = self.config.remote_wait();
        let (failed_servers, failed_clients) = (FailureSet::new(), FailureSet::new());
        let mut servers = Fanout::new(wait, failed_servers.clone());
        let mut clients = Fanout::new(wait, failed_clients.clone());

        // Assign token servers and apply their config.
        for map in assign_maps.iter().filter(|map| map.belong_to_app) {
            let (host, port) = match map.machine_id.parse::<MachineId>() {
                Ok(MachineId::Command { host, port }) => (host, port),
                _ => {
                    tracing::warn!(machine_id = %map.machine_id, "token server has no command address, can not be assigned");
                    servers.fail(map.machine_id.clone());
                    continue;
                }
            };
            let transport = ServerTransportConfig {
                port: map.port,
                idle_seconds: self.config.server_idle_seconds,
            };
            let flow = map.flow_config(self.config.max_allowed_qps_ceiling);
            if flow.is_none() {
                tracing::debug!(machine_id = %map.machine_id, max_allowed_qps = ?map.max_allowed_qps, "max allowed QPS unset or out of range, flow config will not be pushed");
            }
            let chain = apply_server_chain(self.remote.clone(), app.to_string(), host.clone(), port, map.namespace_set.clone(), transport, flow);
            servers.spawn(MachineId::command(host, port).to_string(), chain);
        }

        // Assign token clients to their servers.
        for map in assign_maps {
            let client_config = ClientConfig {
                server_host: map.host.clone(),
                server_port: map.port,
                request_timeout_ms: self.config.client_request_timeout_ms,
            };
            for client in map.client_set.iter() {
                let (host, port) = match parse_command_id(client) {
                    Some(addr) => addr,
                    None => {
                        clients.fail(client.clone());
                        continue;
                    }
                };
                let chain = apply_client_chain(self.remote.clone(), app.to_string(), host.clone(), port, client_config.clone());
                clients.spawn(MachineId::command(host, port).to_string(), chain);
            }
        }

        // Switch all unassigned machines out of the cluster.
        self.spawn_not_started(remaining_set.iter().cloned(), &mut clients);

        servers.join().await;
        clients.join().await;

        let result = AssignResult {
            failed_server_set: failed_servers.to_set(),
            failed_client_set: failed_clients.to_set(),
        };
        metrics::counter!(METRIC_FAILED_SERVERS, result.failed_server_set.len() as u64);
        metrics::counter!(METRIC_FAILED_CLIENTS, result.failed_client_set.len() as u64);
        if result.is_converged() {
            tracing::info!(app, "assignment applied to all machines");
        } else {
            tracing::warn!(
                app,
                failed_servers = ?result.failed_server_set,
                failed_clients = ?result.failed_client_set,
                "assignment partially applied"
            );
        }
        Ok(result)
    }

    /// Unbind the given token server, switching it and all of its clients out of the cluster.
    ///
    /// A `host:port` reference, or a `host@port` ID which is not a machine of the app, is treated
    /// as a token server outside of the app, and all clients of the app pointing at it are
    /// switched out of the cluster.
    ///
    /// All failures are reported in the client set of the result. If the machines to unbind can
    /// not even be determined, the given ID itself is reported.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn unbind_server(&self, app: &str, machine_id: &str) -> AppResult<AssignResult> {
        validate_app(app)?;
        if machine_id.trim().is_empty() {
            return Err(AppError::InvalidInput("machine ID cannot be blank".into()));
        }
        let id: MachineId = machine_id.parse()?;
        metrics::increment_counter!(METRIC_UNBIND_REQUESTS);

        let failures = FailureSet::new();
        let members = match self.unbind_targets(app, &id).await {
            Ok(members) => members,
            Err(err) => {
                tracing::error!(error = ?err, %machine_id, "error determining machines to unbind");
                failures.insert(machine_id);
                return Ok(Self::unbind_result(failures));
            }
        };

        let mut fanout = Fanout::new(self.config.remote_wait(), failures.clone());
        self.spawn_not_started(members, &mut fanout);
        fanout.join().await;
        Ok(Self::unbind_result(failures))
    }

    /// Unbind each of the given token servers in turn, merging their results.
    ///
    /// An ID which can not be unbound at all is reported in the client set of the result.
    #[tracing::instrument(level = "debug", skip(self, machine_ids), fields(count = machine_ids.len()))]
    pub async fn unbind_servers(&self, app: &str, machine_ids: &BTreeSet<String>) -> AppResult<AssignResult> {
        validate_app(app)?;
        let mut result = AssignResult::default();
        for machine_id in machine_ids {
            match self.unbind_server(app, machine_id).await {
                Ok(res) => result.merge(res),
                Err(err) => {
                    tracing::warn!(error = ?err, %machine_id, "error unbinding token server");
                    result.failed_client_set.insert(machine_id.clone());
                }
            }
        }
        Ok(result)
    }

    /// Determine the IDs of all machines which must be switched out of the cluster to unbind
    /// the given token server.
    async fn unbind_targets(&self, app: &str, id: &MachineId) -> AppResult<Vec<String>> {
        let in_app = match id {
            MachineId::Command { .. } => self.state.all_machines(app).await?.iter().any(|machine| &machine.machine_id() == id),
            MachineId::Serving { .. } => false,
        };

        if !in_app {
            let states = self.state.global_state(app).await?;
            let members = states
                .iter()
                .filter(|pair| pair.state.client_config().map(|config| config.targets(id.host(), id.port())).unwrap_or(false))
                .map(|pair| pair.machine_id().to_string())
                .collect();
            return Ok(members);
        }

        let group = self.state.group_for_machine(app, &id.to_string()).await?;
        let mut members = Vec::with_capacity(group.client_set.len() + 1);
        members.push(group.machine_id);
        members.extend(group.client_set);
        Ok(members)
    }

    /// Spawn a chain switching each of the given machines out of the cluster.
    fn spawn_not_started(&self, machine_ids: impl IntoIterator<Item = String>, fanout: &mut Fanout) {
        for machine_id in machine_ids {
            let (host, port) = match parse_command_id(&machine_id) {
                Some(addr) => addr,
                None => {
                    fanout.fail(machine_id);
                    continue;
                }
            };
            let remote = self.remote.clone();
            let id = MachineId::command(host.clone(), port).to_string();
            fanout.spawn(id, async move {
                remote
                    .modify_mode(&host, port, ClusterRole::NotStarted)
                    .await
                    .context("error changing mode to not started")
            });
        }
    }

    fn unbind_result(failures: FailureSet) -> AssignResult {
        let result = AssignResult {
            failed_server_set: BTreeSet::new(),
            failed_client_set: failures.to_set(),
        };
        metrics::counter!(METRIC_FAILED_CLIENTS, result.failed_client_set.len() as u64);
        result
    }
}

/// Parse the given ID as the command address of a machine.
fn parse_command_id(machine_id: &str) -> Option<(String, u16)> {
    match machine_id.parse::<MachineId>() {
        Ok(MachineId::Command { host, port }) => Some((host, port)),
        Ok(MachineId::Serving { .. }) => {
            tracing::warn!(%machine_id, "machine ID has no command port, can not be commanded");
            None
        }
        Err(err) => {
            tracing::warn!(error = %err, "skipping unresolvable machine");
            None
        }
    }
}

/// The chain of remote operations which turns a machine into a configured token server.
async fn apply_server_chain(
    remote: Arc<dyn RemoteControl>, app: String, host: String, port: u16, namespace_set: BTreeSet<String>, transport: ServerTransportConfig,
    flow: Option<ServerFlowConfig>,
) -> Result<()> {
    remote
        .modify_mode(&host, port, ClusterRole::Server)
        .await
        .context("error changing mode to token server")?;
    remote
        .modify_server_namespace_set(&app, &host, port, &namespace_set)
        .await
        .context("error pushing token server namespace set")?;
    remote
        .modify_server_transport_config(&app, &host, port, &transport)
        .await
        .context("error pushing token server transport config")?;
    if let Some(flow) = flow {
        remote
            .modify_server_flow_config(&app, &host, port, &flow)
            .await
            .context("error pushing token server flow config")?;
    }
    Ok(())
}

/// The chain of remote operations which turns a machine into a token client of its server.
async fn apply_client_chain(remote: Arc<dyn RemoteControl>, app: String, host: String, port: u16, config: ClientConfig) -> Result<()> {
    remote
        .modify_mode(&host, port, ClusterRole::Client)
        .await
        .context("error changing mode to token client")?;
    remote
        .modify_client_config(&app, &host, port, &config)
        .await
        .context("error pushing token client config")
}
