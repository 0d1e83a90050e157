//! Engine node running on a remote host's pseudo-terminal channel.

use tracing::{debug, info};
use uuid::Uuid;

use crate::control::{ControlClient, Endpoint};
use crate::drain::{DrainHandle, DrainSink, spawn_drain};
use crate::error::ClusterError;
use crate::sandbox::Sandbox;
use crate::ssh::{CommandRunner, Host, RemoteChannel};

use super::{LaunchCommand, NodeCore, NodeOptions, NodeState, Termination};

/// Engine process tied to a remote channel; closing the channel stops it.
#[derive(Debug)]
pub struct RemoteNode {
    pub(super) core: NodeCore,
    pub(super) drains: Vec<DrainHandle>,
    channel: RemoteChannel,
    remote_jar: String,
    scratch: String,
}

impl RemoteNode {
    /// Starts an engine on `host` listening on `port`.
    ///
    /// The artifact is uploaded first (a cache hit when already present) and
    /// the scratch directory is `/tmp/ice.<port>.<run_id>`.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Ssh`] when the upload or launch fails, and
    /// [`ClusterError::Sandbox`] when capture files cannot be created.
    pub fn launch<R: CommandRunner>(
        host: &mut Host<R>,
        options: &NodeOptions,
        port: u16,
        run_id: Uuid,
        sandbox: &Sandbox,
        control: ControlClient,
    ) -> Result<Self, ClusterError> {
        let endpoint = Endpoint::new(host.address(), port);
        let mut core = NodeCore::new(endpoint, control, options);
        core.state = NodeState::Spawning;

        let remote_jar = host.upload_artifact(&options.jar, &mut |_, _| {})?;
        let scratch = format!("/tmp/ice.{port}.{}", run_id.simple());
        let launch = LaunchCommand::build(options, &core.endpoint, &remote_jar, &scratch);
        let mut channel = host.launch_remote(&launch.render())?;

        let name = format!("remote-node-{}-{port}", host.address());
        let (stdout_sink, stderr_sink) = if options.capture_output {
            let (_, stdout, stderr) = sandbox.create_capture_files(&name)?;
            (DrainSink::File(stdout), DrainSink::File(stderr))
        } else {
            (DrainSink::Stdout, DrainSink::Stderr)
        };
        let mut drains = Vec::with_capacity(2);
        if let Some(stdout) = channel.take_stdout() {
            drains.push(spawn_drain(format!("{name}-stdout"), stdout, stdout_sink));
        }
        if let Some(stderr) = channel.take_stderr() {
            drains.push(spawn_drain(format!("{name}-stderr"), stderr, stderr_sink));
        }

        core.state = NodeState::Running;
        info!(endpoint = %core.endpoint, host = %host.label(), "remote node started");
        Ok(Self {
            core,
            drains,
            channel,
            remote_jar,
            scratch,
        })
    }

    /// Returns the artifact path on the remote host.
    #[must_use]
    pub fn remote_jar(&self) -> &str {
        &self.remote_jar
    }

    /// Returns the remote scratch directory.
    #[must_use]
    pub fn scratch_dir(&self) -> &str {
        &self.scratch
    }

    /// Returns the process id of the local ssh client holding the channel.
    #[must_use]
    pub fn channel_pid(&self) -> Option<u32> {
        self.channel.pid()
    }

    /// Checks the channel, then probes the control plane.
    pub async fn is_alive(&mut self) -> bool {
        if self.core.termination.is_some() {
            return false;
        }
        if self.channel.is_closed() {
            let termination = self
                .channel
                .exit_code()
                .map_or(Termination::ChannelClosed, Termination::Exited);
            self.core.finish(termination);
            return false;
        }
        self.core.answers().await
    }

    /// Stops the engine by shutdown request, then by closing the channel.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Ssh`] when the channel cannot be closed.
    pub async fn terminate(&mut self) -> Result<Termination, ClusterError> {
        if let Some(termination) = self.core.termination {
            return Ok(termination);
        }
        self.core.state = NodeState::Terminating;

        if !self.channel.is_closed() {
            self.core.request_shutdown().await;
        }
        if self.channel.wait_closed(self.core.shutdown_grace).await {
            let termination = self
                .channel
                .exit_code()
                .map_or(Termination::ChannelClosed, Termination::Exited);
            debug!(endpoint = %self.core.endpoint, %termination, "remote node stopped after shutdown");
            return Ok(self.core.finish(termination));
        }

        self.channel.close().await?;
        info!(endpoint = %self.core.endpoint, "remote channel closed");
        Ok(self.core.finish(Termination::ChannelClosed))
    }
}
