//! Configuration loading via `ortho-config`.
//!
//! [`CorralConfig`] merges defaults, `corral.toml` discovery, and `CORRAL_*`
//! environment variables. Helpers turn the flat settings into the typed
//! option structs the node, session, and cluster layers consume.

use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::cluster::{ClusterBuilder, ClusterRequest, NodeSpawner};
use crate::identity::{cloud_name, invoking_user};
use crate::node::NodeOptions;
use crate::ssh::SshConfig;

/// Cluster, engine, and session settings loaded via `ortho-config`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "CORRAL",
    discovery(
        app_name = "corral",
        env_var = "CORRAL_CONFIG_PATH",
        config_file_name = "corral.toml",
        dotfile_name = ".corral.toml",
        project_file_name = "corral.toml"
    )
)]
#[expect(
    clippy::struct_excessive_bools,
    reason = "configuration struct with user-facing toggle settings that are naturally expressed as booleans"
)]
pub struct CorralConfig {
    /// Engine program started for every node.
    #[ortho_config(default = "java".to_owned())]
    pub engine_bin: String,
    /// Local path of the engine artifact.
    #[ortho_config(default = "build/h2o.jar".to_owned())]
    pub engine_jar: String,
    /// Scratch directory holding the command log, capture files, and local
    /// working directories. Recreated on every run.
    #[ortho_config(default = "sandbox".to_owned())]
    pub sandbox_dir: String,
    /// Prefix of the cloud name; the invoking user is appended.
    #[ortho_config(default = "pytest".to_owned())]
    pub cloud_name_prefix: String,
    /// Address local nodes listen on.
    #[ortho_config(default = "127.0.0.1".to_owned())]
    pub bind_address: String,
    /// Capture node output into sandbox files instead of this terminal.
    #[ortho_config(default = true)]
    pub capture_output: bool,
    /// Start engines suspended with a debugger agent attached.
    #[ortho_config(default = false)]
    pub use_debugger: bool,
    /// Port of the debugger agent.
    #[ortho_config(default = 8000)]
    pub debug_port: u16,
    /// Keep native profiling enabled in the engine.
    #[ortho_config(default = false)]
    pub sigar: bool,
    /// Nodes per host, or in total for a local cluster.
    #[ortho_config(default = 2)]
    pub node_count: u32,
    /// Control-plane port of the first node.
    #[ortho_config(default = 54321)]
    pub base_port: u16,
    /// Port spacing between consecutive nodes.
    #[ortho_config(default = 3)]
    pub ports_per_node: u16,
    /// Convergence budget for local clusters, in milliseconds.
    #[ortho_config(default = 10_000)]
    pub local_timeout_ms: u64,
    /// Convergence budget for remote clusters, in milliseconds.
    #[ortho_config(default = 15_000)]
    pub remote_timeout_ms: u64,
    /// Delay between convergence probes, in milliseconds.
    #[ortho_config(default = 250)]
    pub retry_delay_ms: u64,
    /// Budget for a node's control plane to start answering, in milliseconds.
    #[ortho_config(default = 15_000)]
    pub control_plane_timeout_ms: u64,
    /// Delay between control-plane readiness probes, in milliseconds.
    #[ortho_config(default = 100)]
    pub control_plane_retry_ms: u64,
    /// Wait after a shutdown request before forcing termination, in
    /// milliseconds.
    #[ortho_config(default = 1_000)]
    pub shutdown_grace_ms: u64,
    /// Per-request control-plane timeout, in milliseconds.
    #[ortho_config(default = 10_000)]
    pub request_timeout_ms: u64,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `sshpass` executable, used for password logins.
    #[ortho_config(default = "sshpass".to_owned())]
    pub sshpass_bin: String,
    /// Remote SSH port.
    #[ortho_config(default = 22)]
    pub ssh_port: u16,
    /// Whether to enforce host key checking; disabled for throwaway hosts.
    #[ortho_config(default = false)]
    pub ssh_strict_host_key_checking: bool,
    /// Known hosts file override.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub ssh_known_hosts_file: String,
    /// Password applied to hosts whose specification carries none.
    pub ssh_password: Option<String>,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn guidance(&self) -> String {
        format!(
            "set {} or add {} to corral.toml",
            self.env_var, self.toml_key
        )
    }
}

impl CorralConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: {}",
                metadata.description,
                metadata.guidance()
            )));
        }
        Ok(())
    }

    fn require_positive(value: u64, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value == 0 {
            return Err(ConfigError::InvalidValue(format!(
                "{} must be greater than zero: {}",
                metadata.description,
                metadata.guidance()
            )));
        }
        Ok(())
    }

    /// Loads configuration using the `ortho-config` derive. Values merge
    /// defaults, configuration files, environment variables, and CLI flags in
    /// that order of precedence.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the loader fails to merge sources.
    pub fn load_from_sources() -> Result<Self, ConfigError> {
        Self::load().map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("corral")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and `corral.toml` key that supply the value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required string is blank
    /// and [`ConfigError::InvalidValue`] when a count, port, or duration is
    /// zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            (
                &self.engine_bin,
                FieldMetadata::new("engine program", "CORRAL_ENGINE_BIN", "engine_bin"),
            ),
            (
                &self.engine_jar,
                FieldMetadata::new("engine artifact", "CORRAL_ENGINE_JAR", "engine_jar"),
            ),
            (
                &self.sandbox_dir,
                FieldMetadata::new("sandbox directory", "CORRAL_SANDBOX_DIR", "sandbox_dir"),
            ),
            (
                &self.cloud_name_prefix,
                FieldMetadata::new(
                    "cloud name prefix",
                    "CORRAL_CLOUD_NAME_PREFIX",
                    "cloud_name_prefix",
                ),
            ),
            (
                &self.bind_address,
                FieldMetadata::new("bind address", "CORRAL_BIND_ADDRESS", "bind_address"),
            ),
            (
                &self.ssh_bin,
                FieldMetadata::new("ssh program", "CORRAL_SSH_BIN", "ssh_bin"),
            ),
            (
                &self.sshpass_bin,
                FieldMetadata::new("sshpass program", "CORRAL_SSHPASS_BIN", "sshpass_bin"),
            ),
            (
                &self.ssh_known_hosts_file,
                FieldMetadata::new(
                    "known hosts file",
                    "CORRAL_SSH_KNOWN_HOSTS_FILE",
                    "ssh_known_hosts_file",
                ),
            ),
        ];
        for (value, metadata) in &required {
            Self::require_field(value, metadata)?;
        }

        let positive = [
            (
                u64::from(self.node_count),
                FieldMetadata::new("node count", "CORRAL_NODE_COUNT", "node_count"),
            ),
            (
                u64::from(self.base_port),
                FieldMetadata::new("base port", "CORRAL_BASE_PORT", "base_port"),
            ),
            (
                u64::from(self.ports_per_node),
                FieldMetadata::new("ports per node", "CORRAL_PORTS_PER_NODE", "ports_per_node"),
            ),
            (
                u64::from(self.ssh_port),
                FieldMetadata::new("ssh port", "CORRAL_SSH_PORT", "ssh_port"),
            ),
            (
                self.local_timeout_ms,
                FieldMetadata::new("local timeout", "CORRAL_LOCAL_TIMEOUT_MS", "local_timeout_ms"),
            ),
            (
                self.remote_timeout_ms,
                FieldMetadata::new(
                    "remote timeout",
                    "CORRAL_REMOTE_TIMEOUT_MS",
                    "remote_timeout_ms",
                ),
            ),
            (
                self.retry_delay_ms,
                FieldMetadata::new("retry delay", "CORRAL_RETRY_DELAY_MS", "retry_delay_ms"),
            ),
            (
                self.control_plane_timeout_ms,
                FieldMetadata::new(
                    "control-plane timeout",
                    "CORRAL_CONTROL_PLANE_TIMEOUT_MS",
                    "control_plane_timeout_ms",
                ),
            ),
            (
                self.control_plane_retry_ms,
                FieldMetadata::new(
                    "control-plane retry delay",
                    "CORRAL_CONTROL_PLANE_RETRY_MS",
                    "control_plane_retry_ms",
                ),
            ),
            (
                self.request_timeout_ms,
                FieldMetadata::new(
                    "request timeout",
                    "CORRAL_REQUEST_TIMEOUT_MS",
                    "request_timeout_ms",
                ),
            ),
        ];
        for (value, metadata) in &positive {
            Self::require_positive(*value, metadata)?;
        }
        Ok(())
    }

    /// Builds the options applied to every node, scoping the cloud name to
    /// the invoking user.
    #[must_use]
    pub fn node_options(&self) -> NodeOptions {
        NodeOptions {
            engine_bin: self.engine_bin.clone(),
            jar: Utf8PathBuf::from(&self.engine_jar),
            capture_output: self.capture_output,
            use_debugger: self.use_debugger,
            debug_port: self.debug_port,
            sigar: self.sigar,
            cloud_name: cloud_name(&self.cloud_name_prefix, &invoking_user()),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            control_plane_timeout: Duration::from_millis(self.control_plane_timeout_ms),
            control_plane_retry: Duration::from_millis(self.control_plane_retry_ms),
        }
    }

    /// Builds the session settings shared by every host.
    #[must_use]
    pub fn ssh_config(&self) -> SshConfig {
        SshConfig {
            ssh_bin: self.ssh_bin.clone(),
            sshpass_bin: self.sshpass_bin.clone(),
            port: self.ssh_port,
            strict_host_key_checking: self.ssh_strict_host_key_checking,
            known_hosts_file: self.ssh_known_hosts_file.clone(),
            ..SshConfig::default()
        }
    }

    /// Builds the default cluster shape.
    #[must_use]
    pub const fn cluster_request(&self) -> ClusterRequest {
        ClusterRequest::new(self.node_count, self.base_port, self.ports_per_node)
    }

    /// Returns the per-request control-plane timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Applies the configured convergence budget to `builder`.
    #[must_use]
    pub const fn configure_builder<S: NodeSpawner>(&self, builder: ClusterBuilder<S>) -> ClusterBuilder<S> {
        builder
            .with_local_timeout(Duration::from_millis(self.local_timeout_ms))
            .with_remote_timeout(Duration::from_millis(self.remote_timeout_ms))
            .with_retry_delay(Duration::from_millis(self.retry_delay_ms))
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a configuration value is out of range.
    #[error("invalid configuration value: {0}")]
    InvalidValue(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;

    #[fixture]
    fn defaults() -> CorralConfig {
        CorralConfig {
            engine_bin: String::from("java"),
            engine_jar: String::from("build/h2o.jar"),
            sandbox_dir: String::from("sandbox"),
            cloud_name_prefix: String::from("pytest"),
            bind_address: String::from("127.0.0.1"),
            capture_output: true,
            use_debugger: false,
            debug_port: 8000,
            sigar: false,
            node_count: 2,
            base_port: 54321,
            ports_per_node: 3,
            local_timeout_ms: 10_000,
            remote_timeout_ms: 15_000,
            retry_delay_ms: 250,
            control_plane_timeout_ms: 15_000,
            control_plane_retry_ms: 100,
            shutdown_grace_ms: 1_000,
            request_timeout_ms: 10_000,
            ssh_bin: String::from("ssh"),
            sshpass_bin: String::from("sshpass"),
            ssh_port: 22,
            ssh_strict_host_key_checking: false,
            ssh_known_hosts_file: String::from("/dev/null"),
            ssh_password: None,
        }
    }

    #[rstest]
    fn defaults_validate(defaults: CorralConfig) {
        assert_eq!(defaults.validate(), Ok(()));
    }

    #[rstest]
    fn blank_engine_names_its_environment_variable(mut defaults: CorralConfig) {
        defaults.engine_bin = String::from("  ");
        let err = defaults.validate().expect_err("blank engine should fail");
        assert_eq!(
            err,
            ConfigError::MissingField(String::from(
                "missing engine program: set CORRAL_ENGINE_BIN or add engine_bin to corral.toml"
            ))
        );
    }

    #[rstest]
    fn zero_node_count_is_rejected(mut defaults: CorralConfig) {
        defaults.node_count = 0;
        let err = defaults.validate().expect_err("zero nodes should fail");
        let ConfigError::InvalidValue(message) = err else {
            panic!("expected invalid value, got {err:?}");
        };
        assert!(message.contains("CORRAL_NODE_COUNT"));
    }

    #[rstest]
    fn node_options_carry_engine_settings(mut defaults: CorralConfig) {
        defaults.sigar = true;
        defaults.shutdown_grace_ms = 250;
        let options = defaults.node_options();
        assert_eq!(options.engine_bin, "java");
        assert_eq!(options.jar, Utf8PathBuf::from("build/h2o.jar"));
        assert!(options.sigar);
        assert_eq!(options.shutdown_grace, Duration::from_millis(250));
        assert!(options.cloud_name.starts_with("pytest-"));
    }

    #[rstest]
    fn ssh_config_maps_session_settings(mut defaults: CorralConfig) {
        defaults.ssh_port = 2222;
        let config = defaults.ssh_config();
        assert_eq!(config.port, 2222);
        assert_eq!(config.known_hosts_file, "/dev/null");
        assert!(!config.strict_host_key_checking);
    }

    #[rstest]
    fn cluster_request_uses_port_layout(defaults: CorralConfig) {
        assert_eq!(defaults.cluster_request(), ClusterRequest::new(2, 54321, 3));
    }
}
