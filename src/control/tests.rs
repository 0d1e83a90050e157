//! Unit tests for the control-plane client.

use std::time::Duration;

use camino::Utf8PathBuf;
use rstest::rstest;
use tempfile::TempDir;

use super::*;
use crate::test_support::{FakeControlPlane, unused_local_port};

fn client() -> ControlClient {
    ControlClient::new(Duration::from_secs(2)).unwrap_or_else(|err| panic!("client: {err}"))
}

#[test]
fn endpoint_renders_urls() {
    let endpoint = Endpoint::new("10.0.0.5", 54321);
    assert_eq!(endpoint.to_string(), "http://10.0.0.5:54321/");
    assert_eq!(endpoint.url(CLOUD_OPERATION), "http://10.0.0.5:54321/Cloud.json");
}

#[rstest]
#[case(TransportKind::Refused, true)]
#[case(TransportKind::Reset, true)]
#[case(TransportKind::Timeout, false)]
#[case(TransportKind::Other, false)]
fn only_refusal_and_reset_are_startup_transients(#[case] kind: TransportKind, #[case] expected: bool) {
    assert_eq!(kind.is_startup_transient(), expected);
}

#[tokio::test]
async fn cloud_status_reads_size_and_keeps_other_fields() {
    let plane = FakeControlPlane::start(3).await;
    let status = client()
        .cloud_status(plane.endpoint())
        .await
        .unwrap_or_else(|err| panic!("cloud status: {err}"));

    assert_eq!(status.cloud_size, 3);
    assert_eq!(status.extra.get("cloud_name"), Some(&Value::from("fake")));
    assert_eq!(status.extra.get("consensus"), Some(&Value::Bool(true)));
}

#[tokio::test]
async fn error_field_is_a_control_plane_failure() {
    let plane = FakeControlPlane::start(3).await;
    plane.set_error(Some("cloud is locked"));

    let err = client()
        .cloud_status(plane.endpoint())
        .await
        .expect_err("error field should fail the request");

    let ControlError::ControlPlane { operation, message, .. } = err else {
        panic!("expected control-plane error, got {err:?}");
    };
    assert_eq!(operation, CLOUD_OPERATION);
    assert_eq!(message, "cloud is locked");
}

#[tokio::test]
async fn unknown_operation_fails_on_status() {
    let plane = FakeControlPlane::start(1).await;
    let err = client()
        .request(plane.endpoint(), "Bogus.json", &[])
        .await
        .expect_err("404 should fail the request");
    assert!(matches!(err, ControlError::ControlPlane { .. }));
}

#[tokio::test]
async fn refused_connection_is_classified() {
    let endpoint = Endpoint::new("127.0.0.1", unused_local_port());
    let err = client()
        .cloud_status(&endpoint)
        .await
        .expect_err("nothing listens on the port");
    assert_eq!(err.transport_kind(), Some(TransportKind::Refused));
}

#[tokio::test]
async fn requests_are_audited_with_query_parameters() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = Utf8PathBuf::from_path_buf(tmp.path().join("sandbox"))
        .unwrap_or_else(|path| panic!("temp path should be utf8: {}", path.display()));
    let sandbox = Sandbox::clean(root).unwrap_or_else(|err| panic!("sandbox: {err}"));
    let plane = FakeControlPlane::start(1).await;
    let audited = client().with_audit(sandbox.clone());

    audited
        .request(plane.endpoint(), CLOUD_OPERATION, &[("quiet", String::from("true"))])
        .await
        .unwrap_or_else(|err| panic!("request: {err}"));
    audited
        .shutdown(plane.endpoint())
        .await
        .unwrap_or_else(|err| panic!("shutdown: {err}"));

    let log = std::fs::read_to_string(sandbox.command_log_path())
        .unwrap_or_else(|err| panic!("command log: {err}"));
    let expected = format!("Sent {}?quiet=true", plane.endpoint().url(CLOUD_OPERATION));
    assert!(log.contains(&expected), "log was: {log}");
    assert!(log.contains(&format!("Sent {}", plane.endpoint().url(SHUTDOWN_OPERATION))));
    assert_eq!(plane.requests(), ["/Cloud.json?quiet=true", "/Shutdown.json"]);
}
