//! Tests for layered configuration loading and validation.

use std::time::Duration;

use corral::config::ConfigError;
use corral::test_support::EnvGuard;
use corral::{ClusterRequest, CorralConfig};

#[tokio::test]
async fn defaults_apply_when_nothing_is_configured() {
    let _guard = EnvGuard::set_vars(&[]).await;
    let config = CorralConfig::load_without_cli_args()
        .unwrap_or_else(|err| panic!("config should load with defaults: {err}"));

    assert_eq!(config.engine_bin, "java");
    assert_eq!(config.engine_jar, "build/h2o.jar");
    assert_eq!(config.cluster_request(), ClusterRequest::new(2, 54321, 3));
    assert_eq!(config.request_timeout(), Duration::from_secs(10));
    assert!(config.capture_output);
    assert!(config.ssh_password.is_none());
    assert_eq!(config.validate(), Ok(()));
}

#[tokio::test]
async fn environment_overrides_defaults() {
    let _guard = EnvGuard::set_vars(&[
        ("CORRAL_NODE_COUNT", "5"),
        ("CORRAL_BASE_PORT", "60000"),
        ("CORRAL_ENGINE_BIN", "/opt/jdk/bin/java"),
        ("CORRAL_SSH_PASSWORD", "hunter2"),
    ])
    .await;

    let config = CorralConfig::load_without_cli_args()
        .unwrap_or_else(|err| panic!("config should load with env overrides: {err}"));

    assert_eq!(config.cluster_request(), ClusterRequest::new(5, 60000, 3));
    assert_eq!(config.node_options().engine_bin, "/opt/jdk/bin/java");
    assert_eq!(config.ssh_password.as_deref(), Some("hunter2"));
}

#[tokio::test]
async fn blank_values_fail_validation_with_guidance() {
    let _guard = EnvGuard::set_vars(&[("CORRAL_SANDBOX_DIR", " ")]).await;
    let config = CorralConfig::load_without_cli_args()
        .unwrap_or_else(|err| panic!("config should load: {err}"));

    let error = config.validate().expect_err("blank sandbox must be rejected");
    let ConfigError::MissingField(ref message) = error else {
        panic!("expected MissingField error, got {error:?}");
    };
    assert!(
        message.contains("CORRAL_SANDBOX_DIR"),
        "error should mention env var: {message}"
    );
    assert!(
        message.contains("corral.toml"),
        "error should mention config file: {message}"
    );
}

#[tokio::test]
async fn zero_durations_fail_validation() {
    let _guard = EnvGuard::set_vars(&[("CORRAL_RETRY_DELAY_MS", "0")]).await;
    let config = CorralConfig::load_without_cli_args()
        .unwrap_or_else(|err| panic!("config should load: {err}"));

    let error = config.validate().expect_err("zero retry delay must be rejected");
    assert!(
        matches!(error, ConfigError::InvalidValue(ref message) if message.contains("CORRAL_RETRY_DELAY_MS")),
        "unexpected error: {error}"
    );
}
