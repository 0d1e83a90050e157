//! Persistent secure-shell sessions to remote hosts.
//!
//! A [`Host`] owns one OpenSSH control-master session for the run. Every
//! later command multiplexes over the control socket. Artifacts are uploaded
//! to a content-addressed path under `/tmp` and cached per host, so a file is
//! transferred to a host at most once per run. On slow links the artifact is
//! uploaded once and copied host-to-host from there.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::io;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::process::{Child, ChildStderr, ChildStdout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::identity::invoking_user;
use crate::sandbox::{Sandbox, open_file};

mod runner;
#[cfg(test)]
mod tests;

pub use runner::{CommandOutput, CommandRunner, Invocation, ProcessCommandRunner, copy_with_progress};

/// Environment variable `sshpass -e` reads the password from.
pub const SSHPASS_ENV: &str = "SSHPASS";

/// Errors raised while talking to remote hosts.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SshError {
    /// Raised when the persistent session cannot be established.
    #[error("failed to connect to {host}: {message}")]
    Connect {
        /// Host label (`user@address`).
        host: String,
        /// Error reported by ssh.
        message: String,
    },
    /// Raised when a remote command exits unsuccessfully.
    #[error("command on {host} failed with status {status:?}: {command}: {stderr}")]
    Command {
        /// Host label (`user@address`).
        host: String,
        /// Remote command that failed.
        command: String,
        /// Exit status, if one was reported.
        status: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },
    /// Raised when a local helper process cannot be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that was launched.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a session operation runs before `connect`.
    #[error("no open session to {host}")]
    NotConnected {
        /// Host label (`user@address`).
        host: String,
    },
    /// Raised when a local artifact cannot be read.
    #[error("failed to read artifact {path}: {message}")]
    Artifact {
        /// Local path of the artifact.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a host specification cannot be parsed.
    #[error("invalid host specification '{spec}': {reason}")]
    InvalidHostSpec {
        /// Input as given.
        spec: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Address and credentials of a remote host.
#[derive(Clone, Eq, PartialEq)]
pub struct HostSpec {
    /// Login user.
    pub user: String,
    /// Optional password; key-based authentication is used when absent.
    pub password: Option<String>,
    /// Host name or IP address.
    pub address: String,
}

impl HostSpec {
    /// Creates a specification using key-based authentication.
    #[must_use]
    pub fn new(user: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: None,
            address: address.into(),
        }
    }

    /// Adds a password.
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Returns `user@address`.
    #[must_use]
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.address)
    }
}

impl fmt::Debug for HostSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostSpec")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("address", &self.address)
            .finish()
    }
}

impl FromStr for HostSpec {
    type Err = SshError;

    /// Parses `user[:password]@address`.
    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| SshError::InvalidHostSpec {
            spec: spec.to_owned(),
            reason: reason.to_owned(),
        };
        let (credentials, address) = spec
            .rsplit_once('@')
            .ok_or_else(|| invalid("expected user[:password]@address"))?;
        if address.trim().is_empty() {
            return Err(invalid("address is empty"));
        }
        let (user, password) = match credentials.split_once(':') {
            Some((user, password)) => (user, Some(password.to_owned())),
            None => (credentials, None),
        };
        if user.trim().is_empty() {
            return Err(invalid("user is empty"));
        }
        Ok(Self {
            user: user.to_owned(),
            password,
            address: address.to_owned(),
        })
    }
}

/// Settings shared by all host sessions.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshConfig {
    /// Path to the `ssh` executable.
    pub ssh_bin: String,
    /// Path to the `sshpass` executable, used for password logins.
    pub sshpass_bin: String,
    /// Remote SSH port.
    pub port: u16,
    /// Whether to enforce host key checking.
    pub strict_host_key_checking: bool,
    /// Known hosts file override.
    pub known_hosts_file: String,
    /// Directory holding control-master sockets.
    pub control_dir: Utf8PathBuf,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            ssh_bin: String::from("ssh"),
            sshpass_bin: String::from("sshpass"),
            port: 22,
            strict_host_key_checking: false,
            known_hosts_file: String::from("/dev/null"),
            control_dir: Utf8PathBuf::from("/tmp"),
        }
    }
}

/// A remote host reached through one persistent session.
#[derive(Debug)]
pub struct Host<R: CommandRunner> {
    spec: HostSpec,
    config: SshConfig,
    runner: R,
    control_path: Utf8PathBuf,
    connected: bool,
    uploads: HashMap<String, String>,
    digests: HashMap<Utf8PathBuf, String>,
    user_salt: String,
    audit: Option<Sandbox>,
}

impl Host<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    #[must_use]
    pub fn with_process_runner(spec: HostSpec, config: SshConfig) -> Self {
        Self::new(spec, config, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> Host<R> {
    /// Creates a disconnected host handle.
    #[must_use]
    pub fn new(spec: HostSpec, config: SshConfig, runner: R) -> Self {
        let control_path = config
            .control_dir
            .join(format!("corral-{}.ctl", Uuid::new_v4().simple()));
        Self {
            spec,
            config,
            runner,
            control_path,
            connected: false,
            uploads: HashMap::new(),
            digests: HashMap::new(),
            user_salt: invoking_user(),
            audit: None,
        }
    }

    /// Records uploads and launches in the sandbox command log.
    #[must_use]
    pub fn with_audit(mut self, sandbox: Sandbox) -> Self {
        self.audit = Some(sandbox);
        self
    }

    /// Overrides the user name mixed into artifact digests.
    #[must_use]
    pub fn with_user_salt(mut self, user: impl Into<String>) -> Self {
        self.user_salt = user.into();
        self.digests.clear();
        self
    }

    /// Returns the host specification.
    #[must_use]
    pub const fn spec(&self) -> &HostSpec {
        &self.spec
    }

    /// Returns the host address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.spec.address
    }

    /// Returns `user@address`.
    #[must_use]
    pub fn label(&self) -> String {
        self.spec.destination()
    }

    /// Returns the control-master socket path.
    #[must_use]
    pub fn control_path(&self) -> &Utf8Path {
        &self.control_path
    }

    /// Returns `true` once `connect` has succeeded.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.connected
    }

    /// Returns the command runner.
    #[must_use]
    pub const fn runner(&self) -> &R {
        &self.runner
    }

    /// Returns the cached remote path for `digest`, if any.
    #[must_use]
    pub fn cached_upload(&self, digest: &str) -> Option<&str> {
        self.uploads.get(digest).map(String::as_str)
    }

    /// Returns the number of cached uploads.
    #[must_use]
    pub fn upload_count(&self) -> usize {
        self.uploads.len()
    }

    /// Opens the persistent session. Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Connect`] on authentication or network failure.
    pub fn connect(&mut self) -> Result<(), SshError> {
        if self.connected {
            return Ok(());
        }

        let control_path = format!("ControlPath={}", self.control_path);
        let mut ssh_args = self.common_options();
        ssh_args.extend(
            [
                "-M",
                "-N",
                "-f",
                "-o",
                control_path.as_str(),
                "-o",
                "ControlPersist=yes",
            ]
            .map(OsString::from),
        );
        ssh_args.push(OsString::from(self.spec.destination()));

        let invocation = match &self.spec.password {
            Some(password) => Invocation::new(&self.config.sshpass_bin)
                .arg("-e")
                .arg(&self.config.ssh_bin)
                .args(ssh_args)
                .env(SSHPASS_ENV, password.as_str()),
            None => Invocation::new(&self.config.ssh_bin).args(ssh_args),
        };

        let output = self
            .runner
            .run(&invocation)
            .map_err(|err| SshError::Connect {
                host: self.label(),
                message: err.to_string(),
            })?;
        if !output.is_success() {
            return Err(SshError::Connect {
                host: self.label(),
                message: output.stderr.trim().to_owned(),
            });
        }

        self.connected = true;
        info!(host = %self.label(), socket = %self.control_path, "ssh session established");
        Ok(())
    }

    /// Closes the persistent session.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Command`] when the control master refuses to exit.
    pub fn disconnect(&mut self) -> Result<(), SshError> {
        if !self.connected {
            return Ok(());
        }
        let invocation = Invocation::new(&self.config.ssh_bin)
            .arg("-S")
            .arg(self.control_path.as_str())
            .args(["-O", "exit"])
            .arg(self.spec.destination());
        self.connected = false;
        let output = self.runner.run(&invocation)?;
        if !output.is_success() {
            return Err(self.command_error("-O exit", &output));
        }
        debug!(host = %self.label(), "ssh session closed");
        Ok(())
    }

    /// Runs `command` on the host over the session.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::NotConnected`] before `connect`, and
    /// [`SshError::Command`] when the command exits unsuccessfully.
    pub fn exec(&self, command: &str) -> Result<CommandOutput, SshError> {
        let invocation = self.session_invocation(command)?;
        let output = self.runner.run(&invocation)?;
        if !output.is_success() {
            return Err(self.command_error(command, &output));
        }
        Ok(output)
    }

    /// Uploads `local` unless identical content is already on the host.
    ///
    /// The destination is `/tmp/<digest>-<basename>`, where the digest covers
    /// the file content and the invoking user. Each local path is hashed once
    /// per session, so the file is expected to stay unchanged for the run.
    /// Returns the remote path.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Artifact`] when the file cannot be read, and
    /// [`SshError::Command`] when the transfer fails.
    pub fn upload_artifact(
        &mut self,
        local: &Utf8Path,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<String, SshError> {
        let digest = self.digest(local)?;
        if let Some(cached) = self.uploads.get(&digest) {
            debug!(host = %self.label(), remote = %cached, "upload cache hit");
            return Ok(cached.clone());
        }

        let remote = remote_artifact_path(&digest, local);
        let partial = format!("{remote}.partial");
        let command = format!(
            "cat > {} && mv {} {}",
            quote(&partial),
            quote(&partial),
            quote(&remote)
        );
        let invocation = self.session_invocation(&command)?;

        let mut file = open_file(local).map_err(|err| artifact_error(local, &err))?;
        let total = file
            .metadata()
            .map_err(|err| artifact_error(local, &err))?
            .len();
        let output = self
            .runner
            .run_with_input(&invocation, &mut file, total, progress)?;
        if !output.is_success() {
            return Err(self.command_error(&command, &output));
        }

        self.audit(
            &format!("scp {local} {}:{remote}", self.spec.destination()),
            &format!("{total} bytes"),
        );
        info!(host = %self.label(), remote = %remote, bytes = total, "artifact uploaded");
        self.uploads.insert(digest, remote.clone());
        Ok(remote)
    }

    /// Uploads `local` to this host, then copies it host-to-host to `peers`.
    ///
    /// Nothing is sent from this machine to the peers; each peer records the
    /// pushed file in its own cache. Returns the remote path, which is the
    /// same on every host.
    ///
    /// # Errors
    ///
    /// Returns [`SshError`] when the upload or any push fails.
    pub fn propagate_artifact(
        &mut self,
        local: &Utf8Path,
        peers: &mut [Self],
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<String, SshError> {
        let remote = self.upload_artifact(local, progress)?;
        let digest = self.digest(local)?;

        for peer in peers.iter_mut() {
            if peer.cached_upload(&digest).is_some() {
                continue;
            }
            let command = format!(
                "scp -o BatchMode=yes -o StrictHostKeyChecking=no {} {}:{}",
                quote(&remote),
                peer.spec.destination(),
                quote(&remote)
            );
            self.exec(&command)?;
            self.audit(&command, &format!("on {}", self.label()));
            peer.record_digest(digest.clone(), remote.clone());
            info!(from = %self.label(), to = %peer.label(), remote = %remote, "artifact pushed");
        }
        Ok(remote)
    }

    /// Seeds the upload cache with a file placed on the host by other means.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Artifact`] when the local file cannot be hashed.
    pub fn record_upload(&mut self, local: &Utf8Path, remote: impl Into<String>) -> Result<(), SshError> {
        let digest = self.digest(local)?;
        self.record_digest(digest, remote.into());
        Ok(())
    }

    /// Starts `remote_command` on a pseudo-terminal channel.
    ///
    /// The remote process is tied to the channel: closing it hangs the
    /// process up.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::NotConnected`] before `connect`, and
    /// [`SshError::Spawn`] when the local ssh client cannot be started.
    pub fn launch_remote(&self, remote_command: &str) -> Result<RemoteChannel, SshError> {
        let invocation = self.launch_invocation(remote_command)?;
        let mut command = tokio::process::Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn().map_err(|err| SshError::Spawn {
            program: invocation.program.clone(),
            message: err.to_string(),
        })?;

        self.audit(&invocation.command_string(), &format!("PID {}", child.id().unwrap_or_default()));
        info!(host = %self.label(), command = %remote_command, "remote node launched");

        Ok(RemoteChannel {
            host: self.label(),
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
            child,
            exit_code: None,
            closed: false,
        })
    }

    /// Builds the local `ssh -tt` invocation for a launch.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::NotConnected`] before `connect`.
    pub fn launch_invocation(&self, remote_command: &str) -> Result<Invocation, SshError> {
        self.require_session()?;
        Ok(Invocation::new(&self.config.ssh_bin)
            .arg("-tt")
            .arg("-S")
            .arg(self.control_path.as_str())
            .arg(self.spec.destination())
            .arg(remote_command))
    }

    fn session_invocation(&self, command: &str) -> Result<Invocation, SshError> {
        self.require_session()?;
        Ok(Invocation::new(&self.config.ssh_bin)
            .arg("-S")
            .arg(self.control_path.as_str())
            .arg(self.spec.destination())
            .arg(command))
    }

    fn require_session(&self) -> Result<(), SshError> {
        if self.connected {
            Ok(())
        } else {
            Err(SshError::NotConnected { host: self.label() })
        }
    }

    fn common_options(&self) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-p"),
            OsString::from(self.config.port.to_string()),
        ];

        if self.spec.password.is_none() {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }

        if !self.config.strict_host_key_checking {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }

        if !self.config.known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.config.known_hosts_file
            )));
        }

        args
    }

    fn digest(&mut self, local: &Utf8Path) -> Result<String, SshError> {
        if let Some(digest) = self.digests.get(local) {
            return Ok(digest.clone());
        }
        let digest = artifact_digest(local, &self.user_salt)?;
        self.digests.insert(local.to_path_buf(), digest.clone());
        Ok(digest)
    }

    fn record_digest(&mut self, digest: String, remote: String) {
        self.uploads.entry(digest).or_insert(remote);
    }

    fn command_error(&self, command: &str, output: &CommandOutput) -> SshError {
        SshError::Command {
            host: self.label(),
            command: command.to_owned(),
            status: output.code,
            stderr: output.stderr.trim().to_owned(),
        }
    }

    fn audit(&self, command: &str, comment: &str) {
        let Some(sandbox) = &self.audit else {
            return;
        };
        if let Err(err) = sandbox.record(command, Some(comment)) {
            warn!(error = %err, "failed to append to command log");
        }
    }
}

/// Computes the content digest of `local` salted with `user`.
///
/// # Errors
///
/// Returns [`SshError::Artifact`] when the file cannot be read.
pub fn artifact_digest(local: &Utf8Path, user: &str) -> Result<String, SshError> {
    let mut file = open_file(local).map_err(|err| artifact_error(local, &err))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(|err| artifact_error(local, &err))?;
    hasher.update(user.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// Returns the remote destination for an artifact with `digest`.
#[must_use]
pub fn remote_artifact_path(digest: &str, local: &Utf8Path) -> String {
    let basename = local.file_name().unwrap_or("artifact");
    format!("/tmp/{digest}-{basename}")
}

/// Distributes `local` to every host and returns the remote path per host.
///
/// With `slow_link` the file is uploaded to the first host only and copied
/// host-to-host to the rest. `progress` receives the host label with each
/// `(bytes_sent, total)` update.
///
/// # Errors
///
/// Returns the first [`SshError`] encountered.
pub fn upload_to_hosts<R: CommandRunner>(
    hosts: &mut [Host<R>],
    local: &Utf8Path,
    slow_link: bool,
    progress: &mut dyn FnMut(&str, u64, u64),
) -> Result<Vec<String>, SshError> {
    if slow_link {
        let Some((first, rest)) = hosts.split_first_mut() else {
            return Ok(Vec::new());
        };
        let label = first.label();
        let remote = first.propagate_artifact(local, rest, &mut |sent, total| {
            progress(&label, sent, total);
        })?;
        return Ok(vec![remote; hosts.len()]);
    }

    let mut remotes = Vec::with_capacity(hosts.len());
    for host in hosts.iter_mut() {
        let label = host.label();
        let remote = host.upload_artifact(local, &mut |sent, total| {
            progress(&label, sent, total);
        })?;
        remotes.push(remote);
    }
    Ok(remotes)
}

/// Live pseudo-terminal channel running a remote command.
#[derive(Debug)]
pub struct RemoteChannel {
    host: String,
    child: Child,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    exit_code: Option<i32>,
    closed: bool,
}

impl RemoteChannel {
    /// Returns the host label the channel runs on.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the local ssh client's process id until it has been reaped.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Takes the channel's standard output for draining.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Takes the channel's standard error for draining.
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    /// Returns `true` once the channel has closed.
    pub fn is_closed(&mut self) -> bool {
        if self.closed {
            return true;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_code = status.code();
                self.closed = true;
                true
            }
            Ok(None) => false,
            Err(err) => {
                warn!(host = %self.host, error = %err, "failed to poll ssh channel");
                false
            }
        }
    }

    /// Returns the remote exit status once the channel has closed.
    #[must_use]
    pub const fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Waits up to `timeout` for the channel to close on its own.
    pub async fn wait_closed(&mut self, timeout: std::time::Duration) -> bool {
        if self.closed {
            return true;
        }
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.exit_code = status.code();
                self.closed = true;
                true
            }
            Ok(Err(err)) => {
                warn!(host = %self.host, error = %err, "failed to wait for ssh channel");
                false
            }
            Err(_) => false,
        }
    }

    /// Closes the channel, hanging up the remote process.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Spawn`] when the local ssh client cannot be
    /// killed or reaped.
    pub async fn close(&mut self) -> Result<Option<i32>, SshError> {
        if self.closed {
            return Ok(self.exit_code);
        }
        if let Err(err) = self.child.start_kill() {
            if err.kind() != io::ErrorKind::InvalidInput {
                return Err(SshError::Spawn {
                    program: String::from("ssh"),
                    message: err.to_string(),
                });
            }
        }
        let status = self.child.wait().await.map_err(|err| SshError::Spawn {
            program: String::from("ssh"),
            message: err.to_string(),
        })?;
        self.exit_code = status.code();
        self.closed = true;
        Ok(self.exit_code)
    }
}

fn quote(value: &str) -> String {
    shell_escape::unix::escape(value.into()).into_owned()
}

fn artifact_error(path: &Utf8Path, err: &io::Error) -> SshError {
    SshError::Artifact {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}
