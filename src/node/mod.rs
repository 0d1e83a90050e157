//! Lifecycle of a single engine node.
//!
//! [`NodeHandle`] is a closed set of variants sharing one interface:
//! - [`LocalNode`]: a child process on this machine.
//! - [`RemoteNode`]: a process on a pseudo-terminal channel of a [`Host`].
//! - [`ExternalNode`]: an already running node this crate does not own.
//!
//! Control-plane calls go through a composed [`ControlClient`]. Termination
//! is idempotent: the first outcome is cached and returned on every later
//! call without sending further signals.
//!
//! [`Host`]: crate::ssh::Host

use std::fmt;
use std::io;
use std::time::Duration;

use camino::Utf8PathBuf;
use tracing::debug;

use crate::control::{CloudStatus, ControlClient, ControlError, Endpoint};
use crate::drain::DrainHandle;
use crate::error::ClusterError;
use crate::identity::{cloud_name, invoking_user};
use crate::poll::{ErrorContext, Poller, tolerate_startup};

mod external;
mod launch;
mod local;
mod remote;

pub use external::ExternalNode;
pub use launch::LaunchCommand;
pub use local::LocalNode;
pub use remote::RemoteNode;

/// Default engine program.
pub const DEFAULT_ENGINE_BIN: &str = "java";

/// Default engine artifact, relative to the working directory.
pub const DEFAULT_ENGINE_JAR: &str = "build/h2o.jar";

/// Default prefix of the run-scoped cloud name.
pub const DEFAULT_CLOUD_NAME_PREFIX: &str = "pytest";

/// Default budget for a node's control plane to start answering.
pub const DEFAULT_CONTROL_PLANE_TIMEOUT: Duration = Duration::from_secs(15);

/// Default delay between control-plane readiness probes.
pub const DEFAULT_CONTROL_PLANE_RETRY: Duration = Duration::from_millis(100);

/// Default wait after a shutdown request before forcing termination.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// How long to wait for a force-killed process to be reaped.
pub const KILL_REAP_TIMEOUT: Duration = Duration::from_millis(500);

/// Settings applied to every node a builder starts.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeOptions {
    /// Engine program (normally `java`).
    pub engine_bin: String,
    /// Local path of the engine artifact.
    pub jar: Utf8PathBuf,
    /// Capture output into sandbox files instead of inheriting our streams.
    pub capture_output: bool,
    /// Start the engine suspended with a debugger agent attached.
    pub use_debugger: bool,
    /// Port of the debugger agent.
    pub debug_port: u16,
    /// Keep native profiling enabled; when `false` `--nosigar` is passed.
    pub sigar: bool,
    /// Run-scoped cloud name passed as `--name`.
    pub cloud_name: String,
    /// Wait after a shutdown request before forcing termination.
    pub shutdown_grace: Duration,
    /// Budget for the control plane to start answering.
    pub control_plane_timeout: Duration,
    /// Delay between control-plane readiness probes.
    pub control_plane_retry: Duration,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            engine_bin: DEFAULT_ENGINE_BIN.to_owned(),
            jar: Utf8PathBuf::from(DEFAULT_ENGINE_JAR),
            capture_output: true,
            use_debugger: false,
            debug_port: 8000,
            sigar: false,
            cloud_name: cloud_name(DEFAULT_CLOUD_NAME_PREFIX, &invoking_user()),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            control_plane_timeout: DEFAULT_CONTROL_PLANE_TIMEOUT,
            control_plane_retry: DEFAULT_CONTROL_PLANE_RETRY,
        }
    }
}

/// Lifecycle state of a node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeState {
    /// Handle exists, nothing started yet.
    Created,
    /// Process or channel is being started.
    Spawning,
    /// Externally launched node found at its endpoint.
    Discovered,
    /// Node is running.
    Running,
    /// Termination is in progress.
    Terminating,
    /// Node has stopped or been released.
    Terminated,
}

/// How a node ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Termination {
    /// Process exited on its own with this code.
    Exited(i32),
    /// Process was stopped by this signal without being killed by us.
    Signalled(i32),
    /// Process had to be killed.
    ForceKilled,
    /// Remote channel was closed.
    ChannelClosed,
    /// External node stopped answering after shutdown.
    Released,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with status {code}"),
            Self::Signalled(signal) => write!(f, "stopped by signal {signal}"),
            Self::ForceKilled => f.write_str("force killed"),
            Self::ChannelClosed => f.write_str("channel closed"),
            Self::Released => f.write_str("released"),
        }
    }
}

/// State and collaborators shared by every node variant.
#[derive(Debug)]
pub(crate) struct NodeCore {
    pub(crate) endpoint: Endpoint,
    pub(crate) control: ControlClient,
    pub(crate) readiness: Poller,
    pub(crate) shutdown_grace: Duration,
    pub(crate) state: NodeState,
    pub(crate) termination: Option<Termination>,
}

impl NodeCore {
    pub(crate) fn new(endpoint: Endpoint, control: ControlClient, options: &NodeOptions) -> Self {
        Self {
            endpoint,
            control,
            readiness: Poller::new(options.control_plane_timeout, options.control_plane_retry),
            shutdown_grace: options.shutdown_grace,
            state: NodeState::Created,
            termination: None,
        }
    }

    /// Sends a best-effort shutdown request; failures are only logged.
    pub(crate) async fn request_shutdown(&self) {
        if let Err(err) = self.control.shutdown(&self.endpoint).await {
            debug!(endpoint = %self.endpoint, error = %err, "shutdown request failed");
        }
    }

    pub(crate) async fn answers(&self) -> bool {
        self.control.cloud_status(&self.endpoint).await.is_ok()
    }

    pub(crate) fn finish(&mut self, termination: Termination) -> Termination {
        self.termination = Some(termination);
        self.state = NodeState::Terminated;
        termination
    }

    pub(crate) async fn wait_for_control_plane(&self) -> Result<(), ClusterError> {
        let control = &self.control;
        let endpoint = &self.endpoint;
        let context = ErrorContext::from(format!("Waiting for the control plane at {endpoint}"));
        self.readiness
            .stabilize(
                move || async move {
                    tolerate_startup(control.cloud_status(endpoint).await).map_err(ClusterError::from)
                },
                &context,
            )
            .await
    }
}

/// One engine node, whatever its origin.
#[derive(Debug)]
pub enum NodeHandle {
    /// Child process on this machine.
    Local(LocalNode),
    /// Process on a remote host's channel.
    Remote(RemoteNode),
    /// Externally launched node.
    External(ExternalNode),
}

impl NodeHandle {
    fn core(&self) -> &NodeCore {
        match self {
            Self::Local(node) => &node.core,
            Self::Remote(node) => &node.core,
            Self::External(node) => &node.core,
        }
    }

    /// Returns the control-plane endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.core().endpoint
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> NodeState {
        self.core().state
    }

    /// Returns the cached termination outcome, if any.
    #[must_use]
    pub fn termination(&self) -> Option<Termination> {
        self.core().termination
    }

    /// Returns the control-plane client.
    #[must_use]
    pub fn control(&self) -> &ControlClient {
        &self.core().control
    }

    /// Returns a short label for the node's origin.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::Remote(_) => "remote",
            Self::External(_) => "external",
        }
    }

    /// Checks whether the node is still running.
    pub async fn is_alive(&mut self) -> bool {
        match self {
            Self::Local(node) => node.is_alive(),
            Self::Remote(node) => node.is_alive().await,
            Self::External(node) => node.is_alive().await,
        }
    }

    /// Stops the node and returns how it ended.
    ///
    /// Repeated calls return the first outcome without side effects.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] when the node cannot be stopped.
    pub async fn terminate(&mut self) -> Result<Termination, ClusterError> {
        match self {
            Self::Local(node) => node.terminate().await,
            Self::Remote(node) => node.terminate().await,
            Self::External(node) => node.terminate().await,
        }
    }

    /// Polls until the control plane answers a cluster-view query.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Stabilization`] when the budget runs out, and
    /// [`ClusterError::Control`] for failures other than connection refused
    /// or reset.
    pub async fn wait_for_control_plane(&self) -> Result<(), ClusterError> {
        self.core().wait_for_control_plane().await
    }

    /// Queries the node's cluster-membership view.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError`] when the request fails.
    pub async fn cloud_status(&self) -> Result<CloudStatus, ControlError> {
        let core = self.core();
        core.control.cloud_status(&core.endpoint).await
    }

    /// Waits for every output drain of the node to finish.
    ///
    /// External nodes have no drains and return an empty list.
    pub async fn await_drains(&mut self) -> Vec<io::Result<u64>> {
        let drains = match self {
            Self::Local(node) => std::mem::take(&mut node.drains),
            Self::Remote(node) => std::mem::take(&mut node.drains),
            Self::External(_) => Vec::new(),
        };
        wait_all(drains).await
    }
}

impl From<LocalNode> for NodeHandle {
    fn from(node: LocalNode) -> Self {
        Self::Local(node)
    }
}

impl From<RemoteNode> for NodeHandle {
    fn from(node: RemoteNode) -> Self {
        Self::Remote(node)
    }
}

impl From<ExternalNode> for NodeHandle {
    fn from(node: ExternalNode) -> Self {
        Self::External(node)
    }
}

async fn wait_all(drains: Vec<DrainHandle>) -> Vec<io::Result<u64>> {
    let mut results = Vec::with_capacity(drains.len());
    for drain in drains {
        results.push(drain.wait().await);
    }
    results
}
