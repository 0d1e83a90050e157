//! Core library for the Corral cluster harness.
//!
//! The crate forms ad-hoc clusters of compute-engine nodes, either as child
//! processes of this machine or on remote hosts reached over one persistent
//! SSH session per host. It waits for every node's control plane, polls the
//! first node's membership view until the cluster has converged, and tears
//! everything down again, rolling back partial builds on failure.

pub mod cluster;
pub mod config;
pub mod control;
pub mod drain;
pub mod error;
pub mod identity;
pub mod node;
pub mod poll;
pub mod sandbox;
pub mod ssh;
pub mod test_support;

pub use cluster::{
    Cluster, ClusterBuilder, ClusterRequest, NodeSpawner, ProcessSpawner, TeardownReport,
};
pub use config::{ConfigError, CorralConfig};
pub use control::{CloudStatus, ControlClient, ControlError, Endpoint, TransportKind};
pub use drain::{DrainHandle, DrainSink, spawn_drain};
pub use error::ClusterError;
pub use node::{
    ExternalNode, LaunchCommand, LocalNode, NodeHandle, NodeOptions, NodeState, RemoteNode,
    Termination,
};
pub use poll::{ErrorContext, Poller, StabilizationTimeout, stabilize};
pub use sandbox::{Sandbox, SandboxError};
pub use ssh::{
    CommandOutput, CommandRunner, Host, HostSpec, Invocation, ProcessCommandRunner,
    RemoteChannel, SshConfig, SshError, upload_to_hosts,
};
