//! Unit tests for host sessions, uploads, and propagation.

use camino::{Utf8Path, Utf8PathBuf};
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::test_support::ScriptedRunner;

struct Workspace {
    _tmp: TempDir,
    jar: Utf8PathBuf,
}

#[fixture]
fn workspace() -> Workspace {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let dir = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .unwrap_or_else(|path| panic!("temp path should be utf8: {}", path.display()));
    let jar = dir.join("h2o.jar");
    std::fs::write(&jar, b"PK\x03\x04 fake jar content").unwrap_or_else(|err| panic!("write jar: {err}"));
    Workspace { _tmp: tmp, jar }
}

fn host(address: &str, runner: &ScriptedRunner) -> Host<ScriptedRunner> {
    Host::new(HostSpec::new("alice", address), SshConfig::default(), runner.clone())
        .with_user_salt("alice")
}

fn connected(address: &str, runner: &ScriptedRunner) -> Host<ScriptedRunner> {
    runner.push_success();
    let mut host = host(address, runner);
    host.connect()
        .unwrap_or_else(|err| panic!("connect {address}: {err}"));
    host
}

fn no_progress() -> impl FnMut(u64, u64) {
    |_, _| {}
}

#[rstest]
#[case("alice@10.0.0.5", "alice", None, "10.0.0.5")]
#[case("bob:s3cret@node-2", "bob", Some("s3cret"), "node-2")]
#[case("carol:pa:ss@node-3", "carol", Some("pa:ss"), "node-3")]
fn host_spec_parses_user_password_and_address(
    #[case] input: &str,
    #[case] user: &str,
    #[case] password: Option<&str>,
    #[case] address: &str,
) {
    let spec: HostSpec = input
        .parse()
        .unwrap_or_else(|err| panic!("parse {input}: {err}"));
    assert_eq!(spec.user, user);
    assert_eq!(spec.password.as_deref(), password);
    assert_eq!(spec.address, address);
}

#[rstest]
#[case("node-without-user")]
#[case("@node-1")]
#[case("alice@")]
fn host_spec_rejects_malformed_input(#[case] input: &str) {
    let err = input
        .parse::<HostSpec>()
        .expect_err("malformed spec should be rejected");
    assert!(matches!(err, SshError::InvalidHostSpec { .. }));
}

#[test]
fn host_spec_debug_redacts_password() {
    let spec = HostSpec::new("bob", "node-2").with_password("s3cret");
    let rendered = format!("{spec:?}");
    assert!(!rendered.contains("s3cret"));
    assert!(rendered.contains("<redacted>"));
}

#[test]
fn connect_starts_control_master_with_key_auth() {
    let runner = ScriptedRunner::new();
    let host = connected("10.0.0.5", &runner);

    let invocations = runner.invocations();
    let [invocation] = invocations.as_slice() else {
        panic!("expected one invocation, got {invocations:?}");
    };
    assert_eq!(invocation.program, "ssh");
    assert!(invocation.envs.is_empty());
    let command = invocation.command_string();
    assert!(command.contains("-o BatchMode=yes"));
    assert!(command.contains("-o StrictHostKeyChecking=no"));
    assert!(command.contains("-o UserKnownHostsFile=/dev/null"));
    assert!(command.contains(&format!(
        "-M -N -f -o ControlPath={} -o ControlPersist=yes alice@10.0.0.5",
        host.control_path()
    )));
    assert!(host.is_connected());
}

#[test]
fn connect_with_password_uses_sshpass_environment() {
    let runner = ScriptedRunner::new();
    runner.push_success();
    let spec = HostSpec::new("bob", "node-2").with_password("s3cret");
    let mut host = Host::new(spec, SshConfig::default(), runner.clone());
    host.connect().unwrap_or_else(|err| panic!("connect: {err}"));

    let invocations = runner.invocations();
    let invocation = invocations
        .first()
        .unwrap_or_else(|| panic!("missing invocation"));
    assert_eq!(invocation.program, "sshpass");
    assert!(invocation.command_string().starts_with("sshpass -e ssh -p 22"));
    assert!(!invocation.command_string().contains("s3cret"));
    assert!(!invocation.command_string().contains("BatchMode"));
    assert_eq!(
        invocation.envs,
        vec![(String::from(SSHPASS_ENV), String::from("s3cret"))]
    );
}

#[test]
fn connect_failure_is_reported_as_connect_error() {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(255), "", "Permission denied (publickey).\n");
    let mut host = host("10.0.0.5", &runner);

    let err = host.connect().expect_err("connect should fail");
    assert_eq!(
        err,
        SshError::Connect {
            host: String::from("alice@10.0.0.5"),
            message: String::from("Permission denied (publickey)."),
        }
    );
    assert!(!host.is_connected());
}

#[rstest]
fn upload_requires_a_session(workspace: Workspace) {
    let runner = ScriptedRunner::new();
    let mut host = host("10.0.0.5", &runner);
    let err = host
        .upload_artifact(&workspace.jar, &mut no_progress())
        .expect_err("upload without session should fail");
    assert!(matches!(err, SshError::NotConnected { .. }));
}

#[rstest]
fn upload_uses_content_addressed_destination(workspace: Workspace) {
    let runner = ScriptedRunner::new();
    let mut host = connected("10.0.0.5", &runner);
    runner.push_success();

    let mut updates = Vec::new();
    let remote = host
        .upload_artifact(&workspace.jar, &mut |sent, total| updates.push((sent, total)))
        .unwrap_or_else(|err| panic!("upload: {err}"));

    let digest = artifact_digest(&workspace.jar, "alice").unwrap_or_else(|err| panic!("digest: {err}"));
    assert_eq!(digest.len(), 64);
    assert_eq!(remote, format!("/tmp/{digest}-h2o.jar"));
    assert_eq!(host.cached_upload(&digest), Some(remote.as_str()));

    let total = 21;
    assert_eq!(updates.first(), Some(&(0, total)));
    assert_eq!(updates.last(), Some(&(total, total)));
    assert_eq!(
        runner.inputs(),
        vec![b"PK\x03\x04 fake jar content".to_vec()]
    );
    let command = runner
        .command_strings()
        .pop()
        .unwrap_or_else(|| panic!("missing upload invocation"));
    assert!(command.starts_with(&format!("ssh -S {} alice@10.0.0.5 cat > ", host.control_path())));
    assert!(command.ends_with(&format!("&& mv {remote}.partial {remote}")));
}

#[rstest]
fn repeated_upload_transfers_once(workspace: Workspace) {
    let runner = ScriptedRunner::new();
    let mut host = connected("10.0.0.5", &runner);
    runner.push_success();

    let first = host
        .upload_artifact(&workspace.jar, &mut no_progress())
        .unwrap_or_else(|err| panic!("first upload: {err}"));
    let second = host
        .upload_artifact(&workspace.jar, &mut no_progress())
        .unwrap_or_else(|err| panic!("second upload: {err}"));

    assert_eq!(first, second);
    assert_eq!(runner.inputs().len(), 1);
    assert_eq!(runner.invocations().len(), 2);
    assert_eq!(host.upload_count(), 1);
}

#[rstest]
fn artifact_is_hashed_once_per_session(workspace: Workspace) {
    let runner = ScriptedRunner::new();
    let mut host = connected("10.0.0.5", &runner);
    runner.push_success();

    let first = host
        .upload_artifact(&workspace.jar, &mut no_progress())
        .unwrap_or_else(|err| panic!("first upload: {err}"));
    std::fs::remove_file(&workspace.jar).unwrap_or_else(|err| panic!("remove jar: {err}"));
    let second = host
        .upload_artifact(&workspace.jar, &mut no_progress())
        .unwrap_or_else(|err| panic!("upload after removal: {err}"));

    assert_eq!(first, second);
    assert_eq!(runner.invocations().len(), 2);
}

#[rstest]
fn changing_the_salt_forgets_memoised_digests(workspace: Workspace) {
    let runner = ScriptedRunner::new();
    runner.push_successes(3);
    let mut session = host("10.0.0.5", &runner);
    session.connect().unwrap_or_else(|err| panic!("connect: {err}"));

    let alice = session
        .upload_artifact(&workspace.jar, &mut no_progress())
        .unwrap_or_else(|err| panic!("upload as alice: {err}"));
    let mut resalted = session.with_user_salt("bob");
    let bob = resalted
        .upload_artifact(&workspace.jar, &mut no_progress())
        .unwrap_or_else(|err| panic!("upload as bob: {err}"));

    assert_ne!(alice, bob);
    assert_eq!(runner.inputs().len(), 2);
}

#[rstest]
fn digest_depends_on_content_and_user(workspace: Workspace) {
    let alice = artifact_digest(&workspace.jar, "alice").unwrap_or_else(|err| panic!("digest: {err}"));
    let bob = artifact_digest(&workspace.jar, "bob").unwrap_or_else(|err| panic!("digest: {err}"));
    assert_ne!(alice, bob);

    let copy = workspace
        .jar
        .parent()
        .unwrap_or_else(|| Utf8Path::new("."))
        .join("copy.jar");
    std::fs::copy(&workspace.jar, &copy).unwrap_or_else(|err| panic!("copy: {err}"));
    let same = artifact_digest(&copy, "alice").unwrap_or_else(|err| panic!("digest: {err}"));
    assert_eq!(alice, same);
}

#[rstest]
fn failed_upload_is_not_cached(workspace: Workspace) {
    let runner = ScriptedRunner::new();
    let mut host = connected("10.0.0.5", &runner);
    runner.push_failure(1);

    let err = host
        .upload_artifact(&workspace.jar, &mut no_progress())
        .expect_err("upload should fail");
    assert!(matches!(err, SshError::Command { status: Some(1), .. }));
    assert_eq!(host.upload_count(), 0);
}

#[rstest]
fn propagation_copies_host_to_host(workspace: Workspace) {
    let source_runner = ScriptedRunner::new();
    let mut source = connected("10.0.0.1", &source_runner);
    source_runner.push_successes(3);

    let peer_runners = [ScriptedRunner::new(), ScriptedRunner::new()];
    let mut peers = vec![
        host("10.0.0.2", &peer_runners[0]),
        host("10.0.0.3", &peer_runners[1]),
    ];

    let remote = source
        .propagate_artifact(&workspace.jar, &mut peers, &mut no_progress())
        .unwrap_or_else(|err| panic!("propagate: {err}"));

    let digest = artifact_digest(&workspace.jar, "alice").unwrap_or_else(|err| panic!("digest: {err}"));
    for (peer, runner) in peers.iter().zip(&peer_runners) {
        assert!(runner.invocations().is_empty(), "peer {} was contacted directly", peer.label());
        assert_eq!(peer.cached_upload(&digest), Some(remote.as_str()));
    }

    let commands = source_runner.command_strings();
    assert_eq!(commands.len(), 4);
    assert_eq!(source_runner.inputs().len(), 1);
    let pushes: Vec<&String> = commands
        .iter()
        .filter(|command| command.contains(" scp "))
        .collect();
    assert_eq!(pushes.len(), 2);
    assert!(pushes.iter().any(|command| command.ends_with(&format!("alice@10.0.0.2:{remote}"))));
    assert!(pushes.iter().any(|command| command.ends_with(&format!("alice@10.0.0.3:{remote}"))));
}

#[rstest]
fn upload_to_hosts_on_slow_link_uploads_once(workspace: Workspace) {
    let runners = [ScriptedRunner::new(), ScriptedRunner::new(), ScriptedRunner::new()];
    let mut hosts = vec![
        connected("10.0.0.1", &runners[0]),
        host("10.0.0.2", &runners[1]),
        host("10.0.0.3", &runners[2]),
    ];
    runners[0].push_successes(3);

    let mut labels = Vec::new();
    let remotes = upload_to_hosts(&mut hosts, &workspace.jar, true, &mut |label, _, _| {
        labels.push(label.to_owned());
    })
    .unwrap_or_else(|err| panic!("distribute: {err}"));

    assert_eq!(remotes.len(), 3);
    assert!(remotes.windows(2).all(|pair| pair.first() == pair.last()));
    assert!(labels.iter().all(|label| label == "alice@10.0.0.1"));
    assert!(runners[1].invocations().is_empty());
    assert!(runners[2].invocations().is_empty());
}

#[rstest]
fn upload_to_hosts_on_fast_link_uploads_everywhere(workspace: Workspace) {
    let runners = [ScriptedRunner::new(), ScriptedRunner::new()];
    let mut hosts = vec![connected("10.0.0.1", &runners[0]), connected("10.0.0.2", &runners[1])];
    for runner in &runners {
        runner.push_success();
    }

    let remotes = upload_to_hosts(&mut hosts, &workspace.jar, false, &mut |_, _, _| {})
        .unwrap_or_else(|err| panic!("distribute: {err}"));

    assert_eq!(remotes.len(), 2);
    for runner in &runners {
        assert_eq!(runner.inputs().len(), 1);
    }
}

#[rstest]
fn record_upload_seeds_the_cache(workspace: Workspace) {
    let runner = ScriptedRunner::new();
    let mut host = connected("10.0.0.5", &runner);
    host.record_upload(&workspace.jar, "/opt/engine/h2o.jar")
        .unwrap_or_else(|err| panic!("record: {err}"));

    let remote = host
        .upload_artifact(&workspace.jar, &mut no_progress())
        .unwrap_or_else(|err| panic!("upload: {err}"));
    assert_eq!(remote, "/opt/engine/h2o.jar");
    assert!(runner.inputs().is_empty());
}

#[test]
fn launch_invocation_allocates_a_terminal_on_the_session() {
    let runner = ScriptedRunner::new();
    let host = connected("10.0.0.5", &runner);
    let invocation = host
        .launch_invocation("java -ea -jar /tmp/x-h2o.jar --port=54321")
        .unwrap_or_else(|err| panic!("launch invocation: {err}"));
    assert_eq!(
        invocation.command_string(),
        format!(
            "ssh -tt -S {} alice@10.0.0.5 java -ea -jar /tmp/x-h2o.jar --port=54321",
            host.control_path()
        )
    );
}

#[test]
fn disconnect_exits_the_control_master() {
    let runner = ScriptedRunner::new();
    let mut host = connected("10.0.0.5", &runner);
    runner.push_success();
    host.disconnect().unwrap_or_else(|err| panic!("disconnect: {err}"));

    assert!(!host.is_connected());
    let last = runner
        .command_strings()
        .pop()
        .unwrap_or_else(|| panic!("missing disconnect invocation"));
    assert_eq!(
        last,
        format!("ssh -S {} -O exit alice@10.0.0.5", host.control_path())
    );
}
