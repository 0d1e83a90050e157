//! Crate-level error type for node and cluster lifecycle operations.

use thiserror::Error;

use crate::control::{ControlError, Endpoint};
use crate::poll::StabilizationTimeout;
use crate::sandbox::SandboxError;
use crate::ssh::SshError;

/// Errors surfaced while spawning, probing, or tearing down nodes.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ClusterError {
    /// Control-plane request failed.
    #[error(transparent)]
    Control(#[from] ControlError),
    /// A readiness or convergence poll ran out of time.
    #[error(transparent)]
    Stabilization(#[from] StabilizationTimeout),
    /// Remote host interaction failed.
    #[error(transparent)]
    Ssh(#[from] SshError),
    /// Local scratch space could not be prepared.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    /// A local engine process could not be started.
    #[error("failed to start {program}: {message}")]
    ProcessSpawn {
        /// Program that was launched.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Signalling or reaping a local process failed.
    #[error("failed to signal process {pid}: {message}")]
    Signal {
        /// Process identifier.
        pid: u32,
        /// Operating system error string.
        message: String,
    },
    /// An externally launched node still answered after shutdown.
    #[error("unable to terminate externally launched node at {endpoint}")]
    StillAlive {
        /// Endpoint that kept answering.
        endpoint: Endpoint,
    },
    /// The cluster request was malformed.
    #[error("invalid cluster request: {0}")]
    InvalidRequest(String),
}
