//! Engine node running as a child process of this machine.

use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use camino::Utf8PathBuf;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::control::{ControlClient, Endpoint};
use crate::drain::{DrainHandle, DrainSink, spawn_drain};
use crate::error::ClusterError;
use crate::sandbox::{CapturePaths, Sandbox};

use super::{KILL_REAP_TIMEOUT, LaunchCommand, NodeCore, NodeOptions, NodeState, Termination};

/// Engine child process on this machine.
#[derive(Debug)]
pub struct LocalNode {
    pub(super) core: NodeCore,
    pub(super) drains: Vec<DrainHandle>,
    child: Child,
    pid: Option<u32>,
    scratch: Utf8PathBuf,
    capture: Option<CapturePaths>,
    launch: LaunchCommand,
}

impl LocalNode {
    /// Starts an engine serving `endpoint`.
    ///
    /// The working directory is `ice.<port>` inside the sandbox. With output
    /// capture enabled, stdout and stderr are drained into
    /// `local-node-<port>.stdout.log` and `.stderr.log`; otherwise the child
    /// inherits this process's streams.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Sandbox`] when scratch space cannot be created
    /// and [`ClusterError::ProcessSpawn`] when the process fails to start.
    pub fn spawn(
        options: &NodeOptions,
        endpoint: Endpoint,
        sandbox: &Sandbox,
        control: ControlClient,
    ) -> Result<Self, ClusterError> {
        let mut core = NodeCore::new(endpoint, control, options);
        core.state = NodeState::Spawning;

        let port = core.endpoint.port;
        let scratch = sandbox.scratch_dir(&format!("ice.{port}"))?;
        let launch = LaunchCommand::build(options, &core.endpoint, options.jar.as_str(), scratch.as_str());

        let mut command = Command::new(launch.program());
        command
            .args(launch.args())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let name = format!("local-node-{port}");
        let capture = if options.capture_output {
            let (paths, stdout, stderr) = sandbox.create_capture_files(&name)?;
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
            Some((paths, stdout, stderr))
        } else {
            command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            None
        };

        let mut child = command.spawn().map_err(|err| ClusterError::ProcessSpawn {
            program: launch.program().to_owned(),
            message: err.to_string(),
        })?;
        let pid = child.id();

        let mut drains = Vec::new();
        let capture = match capture {
            Some((paths, stdout_file, stderr_file)) => {
                if let Some(stdout) = child.stdout.take() {
                    drains.push(spawn_drain(format!("{name}-stdout"), stdout, DrainSink::File(stdout_file)));
                }
                if let Some(stderr) = child.stderr.take() {
                    drains.push(spawn_drain(format!("{name}-stderr"), stderr, DrainSink::File(stderr_file)));
                }
                Some(paths)
            }
            None => None,
        };

        let comment = match &capture {
            Some(paths) => format!(
                "PID {}, stdout {}, stderr {}",
                pid.unwrap_or_default(),
                paths.stdout,
                paths.stderr
            ),
            None => format!("PID {}", pid.unwrap_or_default()),
        };
        if let Err(err) = sandbox.record(&launch.render(), Some(&comment)) {
            warn!(error = %err, "failed to append to command log");
        }

        core.state = NodeState::Running;
        info!(endpoint = %core.endpoint, pid = pid.unwrap_or_default(), "local node started");
        Ok(Self {
            core,
            drains,
            child,
            pid,
            scratch,
            capture,
            launch,
        })
    }

    /// Returns the child's process identifier.
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns the node's working directory.
    #[must_use]
    pub const fn scratch_dir(&self) -> &Utf8PathBuf {
        &self.scratch
    }

    /// Returns the capture file paths when output is captured.
    #[must_use]
    pub const fn capture_paths(&self) -> Option<&CapturePaths> {
        self.capture.as_ref()
    }

    /// Returns the command the node was started with.
    #[must_use]
    pub const fn launch_command(&self) -> &LaunchCommand {
        &self.launch
    }

    /// Checks the child without touching the network.
    pub fn is_alive(&mut self) -> bool {
        if self.core.termination.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.core.finish(exit_termination(status));
                false
            }
            Ok(None) => true,
            Err(err) => {
                warn!(pid = self.pid.unwrap_or_default(), error = %err, "failed to poll child");
                false
            }
        }
    }

    /// Waits up to `timeout` for the process to exit.
    ///
    /// Returns the cached outcome immediately once known, and `None` if the
    /// process is still running when the timeout expires.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Signal`] when the child cannot be reaped.
    pub async fn wait(&mut self, timeout: Duration) -> Result<Option<Termination>, ClusterError> {
        if let Some(termination) = self.core.termination {
            return Ok(Some(termination));
        }
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => Ok(Some(self.core.finish(exit_termination(status)))),
            Ok(Err(err)) => Err(self.signal_error(&err.to_string())),
            Err(_) => Ok(None),
        }
    }

    /// Asks the engine for a thread dump (written to its stdout).
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Signal`] when the process cannot be signalled.
    pub fn stack_dump(&self) -> Result<(), ClusterError> {
        let pid = self.raw_pid()?;
        kill(pid, Signal::SIGQUIT).map_err(|err| self.signal_error(&err.to_string()))
    }

    /// Stops the engine.
    ///
    /// Sends a shutdown request, waits the grace period, then kills the
    /// process and sends `SIGTERM` if it still lingers.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Signal`] when the process cannot be killed.
    pub async fn terminate(&mut self) -> Result<Termination, ClusterError> {
        if let Some(termination) = self.core.termination {
            return Ok(termination);
        }
        self.core.state = NodeState::Terminating;

        if self.is_alive() {
            self.core.request_shutdown().await;
        }
        if let Some(termination) = self.wait(self.core.shutdown_grace).await? {
            debug!(endpoint = %self.core.endpoint, %termination, "local node stopped after shutdown");
            return Ok(termination);
        }

        if let Err(err) = self.child.start_kill() {
            return Err(self.signal_error(&err.to_string()));
        }
        if matches!(self.child.try_wait(), Ok(None)) {
            self.send_term()?;
        }
        match tokio::time::timeout(KILL_REAP_TIMEOUT, self.child.wait()).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => warn!(pid = self.pid.unwrap_or_default(), error = %err, "failed to reap child"),
            Err(_) => warn!(pid = self.pid.unwrap_or_default(), "child not reaped after kill"),
        }

        info!(endpoint = %self.core.endpoint, "local node force killed");
        Ok(self.core.finish(Termination::ForceKilled))
    }

    fn send_term(&self) -> Result<(), ClusterError> {
        let pid = self.raw_pid()?;
        match kill(pid, Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(self.signal_error(&err.to_string())),
        }
    }

    fn raw_pid(&self) -> Result<Pid, ClusterError> {
        let pid = self
            .pid
            .ok_or_else(|| self.signal_error("process has already been reaped"))?;
        let raw = i32::try_from(pid).map_err(|err| self.signal_error(&err.to_string()))?;
        Ok(Pid::from_raw(raw))
    }

    fn signal_error(&self, message: &str) -> ClusterError {
        ClusterError::Signal {
            pid: self.pid.unwrap_or_default(),
            message: message.to_owned(),
        }
    }
}

fn exit_termination(status: ExitStatus) -> Termination {
    match (status.code(), status.signal()) {
        (Some(code), _) => Termination::Exited(code),
        (None, Some(signal)) => Termination::Signalled(signal),
        (None, None) => Termination::ForceKilled,
    }
}
