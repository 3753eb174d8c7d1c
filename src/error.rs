//! Cluster assignment error abstractions.

use thiserror::Error;

// Error messages.
pub const ERR_BLANK_APP: &str = "app cannot be blank";
pub const ERR_JOIN_MACHINE_TASK: &str = "error joining machine task";

/// Application error variants.
#[derive(Debug, Error)]
pub enum AppError {
    /// The given input was invalid.
    #[error("validation error: {0}")]
    InvalidInput(String),
    /// The given machine ID could not be resolved to a host & command port.
    #[error("invalid machine ID {0:?}, expected `host@port` or `host:port`")]
    InvalidMachineId(String),
    /// The machine does not belong to the app, or is currently disconnected.
    #[error("machine {0} does not exist or is disconnected")]
    MachineNotFound(String),
    /// The machine is not currently acting as a token server.
    #[error("machine {0} is not a token server")]
    NotAServer(String),
    /// A remote operation did not complete within its bounded wait.
    #[error("timeout while waiting on remote operation for {0}")]
    Timeout(String),
    /// The remote machine returned an error, or some other internal error was hit.
    #[error("internal error: {0:#}")]
    Ise(anyhow::Error),
}

impl AppError {
    /// Check if this error was raised before any remote call was even attempted.
    pub fn is_lookup_failure(&self) -> bool {
        matches!(self, Self::InvalidMachineId(_) | Self::MachineNotFound(_) | Self::NotAServer(_))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        err.downcast::<Self>().unwrap_or_else(Self::Ise)
    }
}

/// A result type where the error is an `AppError`.
pub type AppResult<T> = ::std::result::Result<T, AppError>;
