//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::io::Read;
use std::sync::{Arc, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;

use crate::control::Endpoint;
use crate::ssh::{CommandOutput, CommandRunner, Invocation, SshError, copy_with_progress};

type Shared<T> = Arc<std::sync::Mutex<T>>;

fn locked<T>(shared: &Shared<T>) -> std::sync::MutexGuard<'_, T> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Clones share state, so a test can keep one clone while a host owns the
/// other. Input streamed through `run_with_input` is captured per call.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Shared<VecDeque<CommandOutput>>,
    invocations: Shared<Vec<Invocation>>,
    inputs: Shared<Vec<Vec<u8>>>,
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<Invocation> {
        locked(&self.invocations).clone()
    }

    /// Returns the command strings of all invocations recorded so far.
    #[must_use]
    pub fn command_strings(&self) -> Vec<String> {
        self.invocations()
            .iter()
            .map(Invocation::command_string)
            .collect()
    }

    /// Returns the bytes streamed into each `run_with_input` call.
    #[must_use]
    pub fn inputs(&self) -> Vec<Vec<u8>> {
        locked(&self.inputs).clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes `count` successful exit statuses.
    pub fn push_successes(&self, count: usize) {
        for _ in 0..count {
            self.push_success();
        }
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        locked(&self.responses).push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }

    fn next_response(&self, invocation: &Invocation) -> Result<CommandOutput, SshError> {
        locked(&self.invocations).push(invocation.clone());
        locked(&self.responses)
            .pop_front()
            .ok_or_else(|| SshError::Spawn {
                program: invocation.program.clone(),
                message: String::from("no scripted response available"),
            })
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput, SshError> {
        self.next_response(invocation)
    }

    fn run_with_input(
        &self,
        invocation: &Invocation,
        input: &mut dyn Read,
        total: u64,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<CommandOutput, SshError> {
        let mut captured = Vec::new();
        copy_with_progress(input, &mut captured, total, progress).map_err(|err| {
            SshError::Spawn {
                program: invocation.program.clone(),
                message: err.to_string(),
            }
        })?;
        locked(&self.inputs).push(captured);
        self.next_response(invocation)
    }
}

#[derive(Debug, Default)]
struct PlaneState {
    cloud_size: usize,
    error: Option<String>,
    requests: Vec<String>,
    shut_down: bool,
    silent_after_shutdown: bool,
}

/// Minimal control-plane HTTP server answering `/Cloud.json` and
/// `/Shutdown.json`.
///
/// Every request path is recorded. The server stops when dropped.
#[derive(Debug)]
pub struct FakeControlPlane {
    endpoint: Endpoint,
    state: Shared<PlaneState>,
    task: JoinHandle<()>,
}

impl FakeControlPlane {
    /// Starts a server on an ephemeral loopback port.
    ///
    /// # Panics
    ///
    /// Panics when no loopback port can be bound.
    pub async fn start(cloud_size: usize) -> Self {
        Self::start_on(0, cloud_size).await
    }

    /// Starts a server on `port` (0 picks an ephemeral port).
    ///
    /// # Panics
    ///
    /// Panics when the port cannot be bound.
    pub async fn start_on(port: u16, cloud_size: usize) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .unwrap_or_else(|err| panic!("bind fake control plane: {err}"));
        let bound = listener
            .local_addr()
            .unwrap_or_else(|err| panic!("fake control plane address: {err}"))
            .port();
        let state = Arc::new(std::sync::Mutex::new(PlaneState {
            cloud_size,
            ..PlaneState::default()
        }));

        let accept_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let conn_state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    serve(socket, &conn_state).await.ok();
                });
            }
        });

        Self {
            endpoint: Endpoint::new("127.0.0.1", bound),
            state,
            task,
        }
    }

    /// Returns the endpoint the server listens on.
    #[must_use]
    pub const fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Changes the reported `cloud_size`.
    pub fn set_cloud_size(&self, cloud_size: usize) {
        locked(&self.state).cloud_size = cloud_size;
    }

    /// Makes `/Cloud.json` answer with an `error` field.
    pub fn set_error(&self, error: Option<&str>) {
        locked(&self.state).error = error.map(str::to_owned);
    }

    /// Drops connections without answering once `/Shutdown.json` was served.
    pub fn go_silent_after_shutdown(&self) {
        locked(&self.state).silent_after_shutdown = true;
    }

    /// Returns every request target received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<String> {
        locked(&self.state).requests.clone()
    }

    /// Counts requests whose path starts with `/<operation>`.
    #[must_use]
    pub fn request_count(&self, operation: &str) -> usize {
        let prefix = format!("/{operation}");
        locked(&self.state)
            .requests
            .iter()
            .filter(|target| target.starts_with(&prefix))
            .count()
    }
}

impl Drop for FakeControlPlane {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(mut socket: TcpStream, state: &Shared<PlaneState>) -> std::io::Result<()> {
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0_u8; 1024];
    while !buffer.windows(4).any(|window| window == b"\r\n\r\n") {
        let read = socket.read(&mut chunk).await?;
        if read == 0 {
            return Ok(());
        }
        buffer.extend_from_slice(chunk.get(..read).unwrap_or_default());
    }

    let head = String::from_utf8_lossy(&buffer);
    let target = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_owned();

    let (status, body) = {
        let mut plane = locked(state);
        plane.requests.push(target.clone());
        if plane.shut_down && plane.silent_after_shutdown {
            return Ok(());
        }
        if target.starts_with("/Cloud.json") {
            match &plane.error {
                Some(error) => ("200 OK", serde_json::json!({ "error": error })),
                None => (
                    "200 OK",
                    serde_json::json!({
                        "cloud_name": "fake",
                        "cloud_size": plane.cloud_size,
                        "consensus": true,
                    }),
                ),
            }
        } else if target.starts_with("/Shutdown.json") {
            plane.shut_down = true;
            ("200 OK", serde_json::json!({}))
        } else {
            ("404 Not Found", serde_json::json!({ "message": "unknown operation" }))
        }
    };

    let payload = body.to_string();
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{payload}",
        payload.len()
    );
    socket.write_all(response.as_bytes()).await?;
    socket.shutdown().await
}

/// Writes an executable stand-in for the engine binary into `dir`.
///
/// The script appends its arguments to `<script>.args`, prints a banner, and
/// sleeps so the process stays alive until killed.
///
/// # Panics
///
/// Panics when the script cannot be written.
#[must_use]
pub fn write_fake_engine(dir: &Utf8Path) -> Utf8PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-engine");
    let script = "#!/bin/sh\necho \"$@\" >> \"$0.args\"\necho \"fake engine started\"\nexec sleep 300\n";
    std::fs::write(&path, script).unwrap_or_else(|err| panic!("write fake engine: {err}"));
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .unwrap_or_else(|err| panic!("chmod fake engine: {err}"));
    path
}

/// Returns a loopback port nothing is listening on.
///
/// # Panics
///
/// Panics when no ephemeral port can be bound.
#[must_use]
pub fn unused_local_port() -> u16 {
    std::net::TcpListener::bind(("127.0.0.1", 0))
        .and_then(|listener| listener.local_addr())
        .unwrap_or_else(|err| panic!("reserve loopback port: {err}"))
        .port()
}

/// Returns `true` while a process with `pid` exists.
#[must_use]
pub fn process_exists(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    kill(Pid::from_raw(raw), None).is_ok()
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
