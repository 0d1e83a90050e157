//! Local scratch space and the command audit log.
//!
//! Every run owns a sandbox directory holding per-node working directories,
//! captured process output, and `commands.log`, an append-only record of each
//! launched command, upload, and control-plane request. The log is
//! informational only and never parsed back.

use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::OpenOptions;
use cap_std::{ambient_authority, fs_utf8::Dir};
use chrono::Local;
use thiserror::Error;

/// Default sandbox directory, relative to the working directory.
pub const DEFAULT_SANDBOX_DIR: &str = "sandbox";

/// File name of the command audit log inside the sandbox.
pub const COMMAND_LOG: &str = "commands.log";

/// Errors raised while preparing or writing to the sandbox.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SandboxError {
    /// Raised when a file system operation fails.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
}

/// Paths of the files receiving a node's captured output.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CapturePaths {
    /// File receiving standard output.
    pub stdout: Utf8PathBuf,
    /// File receiving standard error.
    pub stderr: Utf8PathBuf,
}

/// Scratch directory shared by all nodes of a run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Sandbox {
    root: Utf8PathBuf,
}

impl Sandbox {
    /// Removes any previous sandbox at `root` and recreates it empty.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Io`] when the directory cannot be removed or
    /// created.
    pub fn clean(root: impl Into<Utf8PathBuf>) -> Result<Self, SandboxError> {
        let sandbox = Self { root: root.into() };
        sandbox.remove_root()?;
        sandbox.create_root()?;
        Ok(sandbox)
    }

    /// Opens the sandbox at `root`, creating it when missing but keeping any
    /// existing content.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Io`] when the directory cannot be created.
    pub fn open(root: impl Into<Utf8PathBuf>) -> Result<Self, SandboxError> {
        let sandbox = Self { root: root.into() };
        sandbox.create_root()?;
        Ok(sandbox)
    }

    /// Returns the sandbox root directory.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Returns the path of the command audit log.
    #[must_use]
    pub fn command_log_path(&self) -> Utf8PathBuf {
        self.root.join(COMMAND_LOG)
    }

    /// Creates (if needed) and returns the working directory `name` inside
    /// the sandbox.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Io`] when the directory cannot be created.
    pub fn scratch_dir(&self, name: &str) -> Result<Utf8PathBuf, SandboxError> {
        let dir = self.open_root()?;
        dir.create_dir_all(name)
            .map_err(|err| io_error(&self.root.join(name), &err))?;
        Ok(self.root.join(name))
    }

    /// Names the capture files for a node labelled `name`.
    #[must_use]
    pub fn capture_paths(&self, name: &str) -> CapturePaths {
        CapturePaths {
            stdout: self.root.join(format!("{name}.stdout.log")),
            stderr: self.root.join(format!("{name}.stderr.log")),
        }
    }

    /// Creates both capture files for `name`, truncating previous content.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Io`] when either file cannot be created.
    pub fn create_capture_files(
        &self,
        name: &str,
    ) -> Result<(CapturePaths, std::fs::File, std::fs::File), SandboxError> {
        let paths = self.capture_paths(name);
        let dir = self.open_root()?;
        let stdout = dir
            .create(format!("{name}.stdout.log"))
            .map_err(|err| io_error(&paths.stdout, &err))?;
        let stderr = dir
            .create(format!("{name}.stderr.log"))
            .map_err(|err| io_error(&paths.stderr, &err))?;
        Ok((paths, stdout.into_std(), stderr.into_std()))
    }

    /// Appends one line to the command audit log.
    ///
    /// Lines take the form `<timestamp> -- <command>    #<comment>`.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Io`] when the log cannot be opened or written.
    pub fn record(&self, command: &str, comment: Option<&str>) -> Result<(), SandboxError> {
        let path = self.command_log_path();
        let dir = self.open_root()?;
        let mut options = OpenOptions::new();
        options.append(true).create(true);
        let mut file = dir
            .open_with(COMMAND_LOG, &options)
            .map_err(|err| io_error(&path, &err))?;

        let mut line = format!("{} -- {command}", Local::now().to_rfc3339());
        if let Some(note) = comment {
            line.push_str("    #");
            line.push_str(note);
        }
        writeln!(file, "{line}").map_err(|err| io_error(&path, &err))
    }

    fn open_root(&self) -> Result<Dir, SandboxError> {
        Dir::open_ambient_dir(&self.root, ambient_authority())
            .map_err(|err| io_error(&self.root, &err))
    }

    fn create_root(&self) -> Result<(), SandboxError> {
        Dir::create_ambient_dir_all(&self.root, ambient_authority())
            .map_err(|err| io_error(&self.root, &err))
    }

    fn remove_root(&self) -> Result<(), SandboxError> {
        let parent = self
            .root
            .parent()
            .filter(|parent| !parent.as_str().is_empty())
            .unwrap_or_else(|| Utf8Path::new("."));
        let Some(name) = self.root.file_name() else {
            return Err(SandboxError::Io {
                path: self.root.clone(),
                message: String::from("sandbox path is missing a directory name"),
            });
        };

        let parent_dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(io_error(parent, &err)),
        };
        match parent_dir.remove_dir_all(name) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error(&self.root, &err)),
        }
    }
}

/// Opens `path` for reading through a capability-scoped directory handle.
pub(crate) fn open_file(path: &Utf8Path) -> io::Result<cap_std::fs_utf8::File> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let name = path.file_name().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "path is missing a file name")
    })?;
    Dir::open_ambient_dir(parent, ambient_authority())?.open(name)
}

fn io_error(path: &Utf8Path, err: &io::Error) -> SandboxError {
    SandboxError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sandbox_root(tmp: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(tmp.path().join("sandbox"))
            .unwrap_or_else(|err| panic!("temp path should be utf8: {}", err.display()))
    }

    #[test]
    fn clean_discards_previous_content() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let root = sandbox_root(&tmp);
        let first = Sandbox::clean(root.clone()).unwrap_or_else(|err| panic!("clean: {err}"));
        first
            .scratch_dir("ice.54321")
            .unwrap_or_else(|err| panic!("scratch dir: {err}"));
        assert!(root.join("ice.54321").is_dir());

        Sandbox::clean(root.clone()).unwrap_or_else(|err| panic!("second clean: {err}"));
        assert!(root.is_dir());
        assert!(!root.join("ice.54321").exists());
    }

    #[test]
    fn record_appends_lines_with_comment() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let sandbox =
            Sandbox::clean(sandbox_root(&tmp)).unwrap_or_else(|err| panic!("clean: {err}"));

        sandbox
            .record("java -jar engine.jar", Some("PID 42"))
            .unwrap_or_else(|err| panic!("record: {err}"));
        sandbox
            .record("Sent http://127.0.0.1:54321/Cloud.json", None)
            .unwrap_or_else(|err| panic!("record: {err}"));

        let contents = std::fs::read_to_string(sandbox.command_log_path())
            .unwrap_or_else(|err| panic!("read log: {err}"));
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines.first().is_some_and(|line| line.ends_with(" -- java -jar engine.jar    #PID 42")));
        assert!(lines.get(1).is_some_and(|line| line.ends_with("Cloud.json")));
    }

    #[test]
    fn capture_paths_follow_node_name() {
        let sandbox = Sandbox {
            root: Utf8PathBuf::from("/tmp/sb"),
        };
        let paths = sandbox.capture_paths("local-node-54321");
        assert_eq!(paths.stdout, Utf8PathBuf::from("/tmp/sb/local-node-54321.stdout.log"));
        assert_eq!(paths.stderr, Utf8PathBuf::from("/tmp/sb/local-node-54321.stderr.log"));
    }
}
