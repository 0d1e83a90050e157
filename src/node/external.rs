//! Engine node launched outside this crate's control.

use tracing::info;

use crate::control::{ControlClient, Endpoint};
use crate::error::ClusterError;

use super::{NodeCore, NodeOptions, NodeState, Termination};

/// Node found at an endpoint; liveness is known only through the network.
#[derive(Debug)]
pub struct ExternalNode {
    pub(super) core: NodeCore,
}

impl ExternalNode {
    /// Wraps an endpoint without contacting it.
    #[must_use]
    pub fn new(endpoint: Endpoint, control: ControlClient, options: &NodeOptions) -> Self {
        let mut core = NodeCore::new(endpoint, control, options);
        core.state = NodeState::Discovered;
        Self { core }
    }

    /// Wraps an endpoint and confirms it answers a cluster-view query.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Control`] when the node does not answer.
    pub async fn discover(
        endpoint: Endpoint,
        control: ControlClient,
        options: &NodeOptions,
    ) -> Result<Self, ClusterError> {
        let mut node = Self::new(endpoint, control, options);
        node.core
            .control
            .cloud_status(&node.core.endpoint)
            .await?;
        node.core.state = NodeState::Running;
        info!(endpoint = %node.core.endpoint, "external node discovered");
        Ok(node)
    }

    /// Probes the control plane.
    pub async fn is_alive(&self) -> bool {
        self.core.termination.is_none() && self.core.answers().await
    }

    /// Requests shutdown and checks the node went away.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::StillAlive`] when the node still answers.
    pub async fn terminate(&mut self) -> Result<Termination, ClusterError> {
        if let Some(termination) = self.core.termination {
            return Ok(termination);
        }
        self.core.state = NodeState::Terminating;
        self.core.request_shutdown().await;
        if self.core.answers().await {
            self.core.state = NodeState::Running;
            return Err(ClusterError::StillAlive {
                endpoint: self.core.endpoint.clone(),
            });
        }
        info!(endpoint = %self.core.endpoint, "external node released");
        Ok(self.core.finish(Termination::Released))
    }
}
