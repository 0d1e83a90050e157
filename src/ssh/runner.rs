//! Command execution abstraction used by [`super::Host`].

use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::process::{Command, Stdio};

use super::SshError;

const CHUNK_SIZE: usize = 64 * 1024;

/// A program invocation: binary, arguments, and extra environment.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Invocation {
    /// Program to execute.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Extra environment variables. Never rendered in logs.
    pub envs: Vec<(String, String)>,
}

impl Invocation {
    /// Starts an invocation of `program` with no arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Adds an environment variable for the child only.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Renders the program and arguments for logs and assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len().saturating_add(1));
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        for (key, value) in &self.envs {
            command.env(key, value);
        }
        command
    }
}

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner {
    /// Runs the invocation to completion, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Spawn`] if the command cannot be started.
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput, SshError>;

    /// Runs the invocation while streaming `input` into its stdin.
    ///
    /// `progress` receives `(bytes_sent, total)` after every chunk.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Spawn`] if the command cannot be started or its
    /// stdin cannot be written.
    fn run_with_input(
        &self,
        invocation: &Invocation,
        input: &mut dyn Read,
        total: u64,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<CommandOutput, SshError>;
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput, SshError> {
        let output = invocation
            .command()
            .stdin(Stdio::null())
            .output()
            .map_err(|err| spawn_error(invocation, &err))?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn run_with_input(
        &self,
        invocation: &Invocation,
        input: &mut dyn Read,
        total: u64,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<CommandOutput, SshError> {
        let mut child = invocation
            .command()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| spawn_error(invocation, &err))?;

        if let Some(mut stdin) = child.stdin.take() {
            let streamed = copy_with_progress(input, &mut stdin, total, progress);
            drop(stdin);
            if let Err(err) = streamed {
                child.kill().ok();
                child.wait().ok();
                return Err(spawn_error(invocation, &err));
            }
        }

        let output = child
            .wait_with_output()
            .map_err(|err| spawn_error(invocation, &err))?;
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

fn spawn_error(invocation: &Invocation, err: &io::Error) -> SshError {
    SshError::Spawn {
        program: invocation.program.clone(),
        message: err.to_string(),
    }
}

/// Streams `input` to `sink` in fixed-size chunks, reporting progress.
///
/// # Errors
///
/// Returns any I/O error from reading or writing.
pub fn copy_with_progress(
    input: &mut dyn Read,
    sink: &mut dyn Write,
    total: u64,
    progress: &mut dyn FnMut(u64, u64),
) -> io::Result<u64> {
    let mut buffer = vec![0_u8; CHUNK_SIZE];
    let mut sent: u64 = 0;
    progress(sent, total);
    loop {
        let read = input.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        let chunk = buffer.get(..read).unwrap_or_default();
        sink.write_all(chunk)?;
        sent = sent.saturating_add(u64::try_from(read).unwrap_or(u64::MAX));
        progress(sent, total);
    }
    sink.flush()?;
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_string_omits_environment() {
        let invocation = Invocation::new("sshpass")
            .arg("-e")
            .args(["ssh", "alice@node-1"])
            .env("SSHPASS", "hunter2");
        assert_eq!(invocation.command_string(), "sshpass -e ssh alice@node-1");
    }

    #[test]
    fn copy_reports_progress_per_chunk() {
        let payload = vec![7_u8; CHUNK_SIZE.saturating_add(10)];
        let mut sink = Vec::new();
        let mut seen = Vec::new();
        let total = u64::try_from(payload.len()).unwrap_or_else(|err| panic!("len: {err}"));

        let sent = copy_with_progress(&mut payload.as_slice(), &mut sink, total, &mut |done, all| {
            seen.push((done, all));
        })
        .unwrap_or_else(|err| panic!("copy: {err}"));

        assert_eq!(sent, total);
        assert_eq!(sink.len(), payload.len());
        assert_eq!(seen.first(), Some(&(0, total)));
        assert_eq!(seen.last(), Some(&(total, total)));
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn process_runner_feeds_stdin() {
        let invocation = Invocation::new("sh").args(["-c", "wc -c"]);
        let mut input: &[u8] = b"twelve bytes";
        let output = ProcessCommandRunner
            .run_with_input(&invocation, &mut input, 12, &mut |_, _| {})
            .unwrap_or_else(|err| panic!("run: {err}"));
        assert!(output.is_success());
        assert_eq!(output.stdout.trim(), "12");
    }
}
