//! Cluster formation, verification, and teardown.
//!
//! [`ClusterBuilder`] spawns every node, waits for node[0]'s control plane,
//! then polls node[0]'s membership view until it reports the full size. Any
//! failure on the way terminates every node spawned so far before the
//! original error is returned, so a failed build never leaks processes or
//! sessions. The resulting [`Cluster`] is an ordinary value owned by the
//! caller.
//!
//! Spawning drives blocking ssh sessions and file reads. On a multi-threaded
//! runtime that phase runs under [`tokio::task::block_in_place`]; on a
//! current-thread runtime it runs inline on the control thread.

use std::collections::HashSet;
use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{info, warn};
use uuid::Uuid;

use crate::control::{ControlClient, Endpoint};
use crate::error::ClusterError;
use crate::node::{LocalNode, NodeHandle, NodeOptions, RemoteNode, Termination};
use crate::poll::{ErrorContext, Poller};
use crate::sandbox::Sandbox;
use crate::ssh::{CommandRunner, Host, ProcessCommandRunner};


/// Default convergence budget for clusters of local nodes.
pub const DEFAULT_LOCAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default convergence budget when nodes run on remote hosts.
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(15);

/// Default delay between convergence probes.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Default first control-plane port.
pub const DEFAULT_BASE_PORT: u16 = 54321;

/// Default spacing between consecutive nodes' ports.
pub const DEFAULT_PORTS_PER_NODE: u16 = 3;

/// Shape of the cluster to build.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ClusterRequest {
    /// Nodes per host (or in total, for a local cluster).
    pub node_count: u32,
    /// Control-plane port of the first node.
    pub base_port: u16,
    /// Port spacing between consecutive nodes.
    pub ports_per_node: u16,
}

impl ClusterRequest {
    /// Creates a request.
    #[must_use]
    pub const fn new(node_count: u32, base_port: u16, ports_per_node: u16) -> Self {
        Self {
            node_count,
            base_port,
            ports_per_node,
        }
    }

    /// Checks the request describes at least one node on valid ports.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::InvalidRequest`] describing the problem.
    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.node_count == 0 {
            return Err(ClusterError::InvalidRequest(String::from(
                "node_count must be at least 1",
            )));
        }
        if self.base_port == 0 {
            return Err(ClusterError::InvalidRequest(String::from(
                "base_port must be non-zero",
            )));
        }
        if self.ports_per_node == 0 {
            return Err(ClusterError::InvalidRequest(String::from(
                "ports_per_node must be at least 1",
            )));
        }
        self.ports().map(|_| ())
    }

    /// Returns the control-plane port of every node on one host:
    /// `base_port + i * ports_per_node`.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::InvalidRequest`] when a port would exceed
    /// 65535.
    pub fn ports(&self) -> Result<Vec<u16>, ClusterError> {
        (0..self.node_count)
            .map(|index| {
                u16::try_from(index)
                    .ok()
                    .and_then(|step| step.checked_mul(self.ports_per_node))
                    .and_then(|offset| self.base_port.checked_add(offset))
                    .ok_or_else(|| {
                        ClusterError::InvalidRequest(format!(
                            "{} nodes spaced {} ports apart from {} exceed the port range",
                            self.node_count, self.ports_per_node, self.base_port
                        ))
                    })
            })
            .collect()
    }
}

impl Default for ClusterRequest {
    fn default() -> Self {
        Self::new(2, DEFAULT_BASE_PORT, DEFAULT_PORTS_PER_NODE)
    }
}

/// Produces node handles for a builder.
pub trait NodeSpawner {
    /// Starts a node on this machine listening on `port`.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] when the node cannot be started.
    fn spawn_local(&mut self, port: u16) -> Result<NodeHandle, ClusterError>;

    /// Starts a node on `host` listening on `port`.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] when the node cannot be started.
    fn spawn_remote<R: CommandRunner>(
        &mut self,
        host: &mut Host<R>,
        port: u16,
    ) -> Result<NodeHandle, ClusterError>;
}

/// Spawner that starts real engine processes.
#[derive(Clone, Debug)]
pub struct ProcessSpawner {
    options: NodeOptions,
    sandbox: Sandbox,
    control: ControlClient,
    bind_address: String,
    run_id: Uuid,
}

impl ProcessSpawner {
    /// Creates a spawner; local nodes listen on `bind_address`.
    #[must_use]
    pub fn new(
        options: NodeOptions,
        sandbox: Sandbox,
        control: ControlClient,
        bind_address: impl Into<String>,
    ) -> Self {
        Self {
            options,
            sandbox,
            control,
            bind_address: bind_address.into(),
            run_id: Uuid::new_v4(),
        }
    }

    /// Returns the identifier scoping remote scratch directories.
    #[must_use]
    pub const fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Returns the options applied to every node.
    #[must_use]
    pub const fn options(&self) -> &NodeOptions {
        &self.options
    }
}

impl NodeSpawner for ProcessSpawner {
    fn spawn_local(&mut self, port: u16) -> Result<NodeHandle, ClusterError> {
        let endpoint = Endpoint::new(self.bind_address.clone(), port);
        LocalNode::spawn(&self.options, endpoint, &self.sandbox, self.control.clone())
            .map(NodeHandle::from)
    }

    fn spawn_remote<R: CommandRunner>(
        &mut self,
        host: &mut Host<R>,
        port: u16,
    ) -> Result<NodeHandle, ClusterError> {
        RemoteNode::launch(
            host,
            &self.options,
            port,
            self.run_id,
            &self.sandbox,
            self.control.clone(),
        )
        .map(NodeHandle::from)
    }
}

/// Builds clusters and drives them to convergence.
#[derive(Debug)]
pub struct ClusterBuilder<S: NodeSpawner> {
    spawner: S,
    local_timeout: Duration,
    remote_timeout: Duration,
    retry_delay: Duration,
}

impl<S: NodeSpawner> ClusterBuilder<S> {
    /// Creates a builder with the default convergence budget.
    #[must_use]
    pub const fn new(spawner: S) -> Self {
        Self {
            spawner,
            local_timeout: DEFAULT_LOCAL_TIMEOUT,
            remote_timeout: DEFAULT_REMOTE_TIMEOUT,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Overrides the convergence budget for local clusters.
    #[must_use]
    pub const fn with_local_timeout(mut self, timeout: Duration) -> Self {
        self.local_timeout = timeout;
        self
    }

    /// Overrides the convergence budget for remote clusters.
    #[must_use]
    pub const fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    /// Overrides the delay between convergence probes.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Returns the spawner.
    #[must_use]
    pub const fn spawner(&self) -> &S {
        &self.spawner
    }

    /// Builds a cluster of local nodes.
    ///
    /// # Errors
    ///
    /// As for [`ClusterBuilder::build`].
    pub async fn build_local(&mut self, request: &ClusterRequest) -> Result<Cluster, ClusterError> {
        self.build::<ProcessCommandRunner>(request, &mut []).await
    }

    /// Builds a cluster and waits until node[0] reports every member.
    ///
    /// Without hosts, `node_count` local nodes are started. With hosts,
    /// `node_count` nodes are started on each host, after connecting it.
    /// Each host address may appear only once.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::InvalidRequest`] for an invalid shape or a
    /// repeated host, otherwise the first spawn, readiness, or convergence
    /// error, after terminating every node started so far.
    pub async fn build<R: CommandRunner>(
        &mut self,
        request: &ClusterRequest,
        hosts: &mut [Host<R>],
    ) -> Result<Cluster, ClusterError> {
        request.validate()?;
        ensure_distinct_hosts(hosts)?;
        let ports = request.ports()?;
        let total = ports.len().saturating_mul(hosts.len().max(1));
        info!(nodes = total, hosts = hosts.len(), base_port = request.base_port, "building cluster");

        let mut nodes = Vec::with_capacity(total);
        let spawned = run_blocking(|| self.spawn_all(&ports, hosts, &mut nodes));
        if let Err(err) = spawned {
            rollback(&mut nodes, &err).await;
            return Err(err);
        }

        let timeout = if hosts.is_empty() {
            self.local_timeout
        } else {
            self.remote_timeout
        };
        if let Err(err) = converge(&nodes, total, Poller::new(timeout, self.retry_delay)).await {
            rollback(&mut nodes, &err).await;
            return Err(err);
        }

        info!(nodes = total, "cluster formed");
        Ok(Cluster { nodes })
    }

    fn spawn_all<R: CommandRunner>(
        &mut self,
        ports: &[u16],
        hosts: &mut [Host<R>],
        nodes: &mut Vec<NodeHandle>,
    ) -> Result<(), ClusterError> {
        if hosts.is_empty() {
            for port in ports {
                nodes.push(self.spawner.spawn_local(*port)?);
            }
            return Ok(());
        }

        for host in hosts.iter_mut() {
            host.connect()?;
            for port in ports {
                nodes.push(self.spawner.spawn_remote(host, *port)?);
            }
        }
        Ok(())
    }
}

fn ensure_distinct_hosts<R: CommandRunner>(hosts: &[Host<R>]) -> Result<(), ClusterError> {
    let mut seen = HashSet::with_capacity(hosts.len());
    for host in hosts {
        if !seen.insert(host.address()) {
            return Err(ClusterError::InvalidRequest(format!(
                "host {} is listed more than once",
                host.address()
            )));
        }
    }
    Ok(())
}

fn run_blocking<T>(work: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(work)
        }
        _ => work(),
    }
}

async fn converge(nodes: &[NodeHandle], total: usize, poller: Poller) -> Result<(), ClusterError> {
    let leader = nodes
        .first()
        .ok_or_else(|| ClusterError::InvalidRequest(String::from("cluster has no nodes")))?;
    leader.wait_for_control_plane().await?;

    let observed = Arc::new(AtomicUsize::new(0));
    let reported = Arc::clone(&observed);
    let context = ErrorContext::computed(move |elapsed, retries| {
        format!(
            "Cluster of {total} nodes did not form after {:.2} seconds and {retries} retries; node[0] last reported cloud_size {}",
            elapsed.as_secs_f64(),
            reported.load(Ordering::SeqCst)
        )
    });

    let seen = &*observed;
    poller
        .stabilize(
            move || async move {
                let status = leader.cloud_status().await?;
                seen.store(status.cloud_size, Ordering::SeqCst);
                Ok::<bool, ClusterError>(status.cloud_size == total)
            },
            &context,
        )
        .await
}

async fn rollback<E: Display>(nodes: &mut Vec<NodeHandle>, cause: &E) {
    warn!(nodes = nodes.len(), error = %cause, "cluster build failed; terminating started nodes");
    for mut node in nodes.drain(..) {
        if let Err(err) = node.terminate().await {
            warn!(
                endpoint = %node.endpoint(),
                "{}",
                append_teardown_note(cause.to_string(), Some(&err))
            );
        }
    }
}

fn append_teardown_note<E: Display>(message: String, teardown_error: Option<&E>) -> String {
    if let Some(teardown) = teardown_error {
        format!("{message} (teardown also failed: {teardown})")
    } else {
        message
    }
}

/// Outcome of tearing a cluster down.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Nodes that stopped, with how they ended.
    pub stopped: Vec<(Endpoint, Termination)>,
    /// Nodes whose termination failed, with the error message.
    pub failed: Vec<(Endpoint, String)>,
}

impl TeardownReport {
    /// Returns `true` when every node stopped.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Ordered collection of nodes owned by the caller.
#[derive(Debug, Default)]
pub struct Cluster {
    nodes: Vec<NodeHandle>,
}

impl Cluster {
    /// Adopts already started nodes, for example externally launched ones.
    #[must_use]
    pub const fn from_nodes(nodes: Vec<NodeHandle>) -> Self {
        Self { nodes }
    }

    /// Returns the nodes in build order.
    #[must_use]
    pub fn nodes(&self) -> &[NodeHandle] {
        &self.nodes
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` when the cluster holds no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns node[0], whose view decides convergence.
    #[must_use]
    pub fn leader(&self) -> Option<&NodeHandle> {
        self.nodes.first()
    }

    /// Returns every node's control-plane endpoint.
    #[must_use]
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.nodes.iter().map(|node| node.endpoint().clone()).collect()
    }

    /// Queries every node and returns those whose `cloud_size` disagrees
    /// with the cluster size, with the size each reported.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Control`] when a node cannot be queried.
    pub async fn verify_membership(&self) -> Result<Vec<(Endpoint, usize)>, ClusterError> {
        let expected = self.nodes.len();
        let mut mismatched = Vec::new();
        for node in &self.nodes {
            let status = node.cloud_status().await?;
            if status.cloud_size != expected {
                mismatched.push((node.endpoint().clone(), status.cloud_size));
            }
        }
        Ok(mismatched)
    }

    /// Terminates every node in order and empties the cluster.
    ///
    /// Failures are logged and collected; they never stop the remaining
    /// nodes from being terminated. With `await_drains`, each node's output
    /// drains are awaited before it is reported stopped.
    pub async fn tear_down(&mut self, await_drains: bool) -> TeardownReport {
        let mut report = TeardownReport::default();
        for mut node in self.nodes.drain(..) {
            let endpoint = node.endpoint().clone();
            match node.terminate().await {
                Ok(termination) => {
                    if await_drains {
                        for result in node.await_drains().await {
                            if let Err(err) = result {
                                warn!(endpoint = %endpoint, error = %err, "output drain failed");
                            }
                        }
                    }
                    info!(endpoint = %endpoint, %termination, "node stopped");
                    report.stopped.push((endpoint, termination));
                }
                Err(err) => {
                    warn!(endpoint = %endpoint, error = %err, "failed to terminate node");
                    report.failed.push((endpoint, err.to_string()));
                }
            }
        }
        report
    }

    /// Releases the nodes without terminating them.
    #[must_use]
    pub fn into_nodes(self) -> Vec<NodeHandle> {
        self.nodes
    }
}
