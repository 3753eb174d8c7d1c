//! Fan-out helpers for driving one task per machine.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dashmap::DashSet;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::error::ERR_JOIN_MACHINE_TASK;

/// A set of the IDs of machines which failed to converge.
///
/// Clones share the same underlying set, which is safe for concurrent insertion from any number
/// of machine tasks.
#[derive(Clone, Default)]
pub struct FailureSet {
    inner: Arc<DashSet<String>>,
}

impl FailureSet {
    /// Create a new instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the given machine as failed.
    pub fn insert(&self, machine_id: impl Into<String>) {
        self.inner.insert(machine_id.into());
    }

    pub fn contains(&self, machine_id: &str) -> bool {
        self.inner.contains(machine_id)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Snapshot the recorded failures as an ordered set.
    pub fn to_set(&self) -> BTreeSet<String> {
        self.inner.iter().map(|id| id.key().clone()).collect()
    }
}

/// A fan-out of per-machine chains of remote operations.
///
/// Each chain runs on its own task and is bounded by the fan-out's wait. A chain which errors or
/// times out records its machine into the fan-out's failure set. Steps of a chain which were not
/// yet issued when the chain failed are never issued.
pub struct Fanout {
    /// The bounded wait applied to each chain.
    wait: Duration,
    /// The set into which failed machines are recorded.
    failures: FailureSet,
    /// The spawned chains, keyed by machine ID.
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl Fanout {
    /// Create a new instance.
    pub fn new(wait: Duration, failures: FailureSet) -> Self {
        Self { wait, failures, tasks: vec![] }
    }

    /// Spawn the chain of remote operations for the given machine.
    pub fn spawn<F>(&mut self, machine_id: String, chain: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let (wait, failures, id) = (self.wait, self.failures.clone(), machine_id.clone());
        let handle = tokio::spawn(async move {
            match timeout(wait, chain).await {
                Ok(Ok(())) => tracing::debug!(machine_id = %id, "machine converged"),
                Ok(Err(err)) => {
                    tracing::warn!(error = ?err, machine_id = %id, "error applying remote operations to machine");
                    failures.insert(id);
                }
                Err(_elapsed) => {
                    tracing::warn!(machine_id = %id, wait = ?wait, "timeout applying remote operations to machine");
                    failures.insert(id);
                }
            }
        });
        self.tasks.push((machine_id, handle));
    }

    /// Record the given machine as failed without issuing any remote operations.
    pub fn fail(&self, machine_id: impl Into<String>) {
        self.failures.insert(machine_id);
    }

    /// The number of spawned chains.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every spawned chain to finish.
    ///
    /// All chains are already running concurrently, so joining them in order does not delay
    /// any one of them.
    pub async fn join(self) {
        for (machine_id, handle) in self.tasks {
            if let Err(err) = handle.await {
                tracing::error!(error = ?err, machine_id = %machine_id, "{}", ERR_JOIN_MACHINE_TASK);
                self.failures.insert(machine_id);
            }
        }
    }
}

/// Run each of the given labelled futures on its own task bounded by `wait`, returning the
/// output of every future which succeeded, in the given order.
///
/// Futures which error or time out are logged and dropped, they never fail the batch.
pub async fn join_successes<T>(wait: Duration, futs: Vec<(String, BoxFuture<'static, Result<T>>)>) -> Vec<T>
where
    T: Send + 'static,
{
    let handles: Vec<_> = futs
        .into_iter()
        .map(|(label, fut)| (label, tokio::spawn(timeout(wait, fut))))
        .collect();
    let mut outputs = Vec::with_capacity(handles.len());
    for (label, handle) in handles {
        match handle.await {
            Ok(Ok(Ok(output))) => outputs.push(output),
            Ok(Ok(Err(err))) => tracing::warn!(error = ?err, %label, "error from remote operation, dropping from batch"),
            Ok(Err(_elapsed)) => tracing::warn!(%label, wait = ?wait, "timeout from remote operation, dropping from batch"),
            Err(err) => tracing::error!(error = ?err, %label, "{}", ERR_JOIN_MACHINE_TASK),
        }
    }
    outputs
}
