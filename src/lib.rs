//! Token server & token client role assignment for rate-limiting clusters.
//!
//! For a given app, the `TopologyReconciler` decides which machines act as token servers and
//! which act as token clients, pushes that decision to every affected machine, and reports which
//! machines failed to apply it. The `StateAggregator` reads back the current cluster state of an
//! app's machines.
//!
//! The machine directory and the remote command protocol are external collaborators, injected
//! via the `MachineDirectory` and `RemoteControl` traits.

mod assign;
mod config;
mod error;
#[cfg(test)]
mod fixtures;
mod futures;
mod models;
mod remote;
mod state;

pub use crate::assign::TopologyReconciler;
pub use crate::config::Config;
pub use crate::error::{AppError, AppResult};
pub use crate::futures::{FailureSet, Fanout};
pub use crate::models::{
    AssignMap, AssignResult, ClientConfig, ClientModifyRequest, ClientStateView, ClusterGroup, ClusterRole, Machine, MachineId, MachineState,
    MachineStatePair, ModeReport, ServerFlowConfig, ServerInfo, ServerModifyRequest, ServerStateView, ServerTransportConfig,
};
pub use crate::remote::{MachineDirectory, RemoteControl};
pub use crate::state::StateAggregator;
pub use async_trait::async_trait;
