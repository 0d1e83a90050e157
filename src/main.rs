//! Binary entry point for the Corral CLI.

use std::io::{self, Write};
use std::process;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use corral::{
    ClusterBuilder, ClusterError, ClusterRequest, ControlClient, ControlError, CorralConfig,
    Endpoint, ExternalNode, Host, HostSpec, NodeHandle, ProcessCommandRunner, ProcessSpawner,
    Sandbox, SandboxError, SshError, upload_to_hosts,
};

mod cli;

use cli::{Cli, Command, NodeAddress, UpCommand, UploadCommand};

const PROGRESS_SLOTS: u64 = 10;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error(transparent)]
    Ssh(#[from] SshError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("failed to wait for Ctrl-C: {0}")]
    Signal(String),
    #[error("teardown failed for {0} node(s)")]
    Teardown(usize),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let exit_code = match dispatch(cli.command).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "corral=debug" } else { "corral=info" })
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(io::stderr))
        .with(filter)
        .init();
}

async fn dispatch(command: Command) -> Result<(), CliError> {
    let config = load_config()?;
    match command {
        Command::Up(args) => up(&config, &args).await,
        Command::Status(args) => status(&config, &args).await,
        Command::Shutdown(args) => shutdown(&config, &args).await,
        Command::Upload(args) => upload(&config, &args),
    }
}

fn load_config() -> Result<CorralConfig, CliError> {
    let config =
        CorralConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    config
        .validate()
        .map_err(|err| CliError::Config(err.to_string()))?;
    Ok(config)
}

async fn up(config: &CorralConfig, args: &UpCommand) -> Result<(), CliError> {
    let request = cluster_request(config, args);
    let sandbox = Sandbox::clean(config.sandbox_dir.as_str())?;
    let control = ControlClient::new(config.request_timeout())?.with_audit(sandbox.clone());
    let mut hosts = connect_hosts(config, &args.hosts, Some(&sandbox))?;

    if args.slow_link && !hosts.is_empty() {
        let jar = Utf8PathBuf::from(&config.engine_jar);
        upload_to_hosts(&mut hosts, &jar, true, &mut progress_printer(&jar))?;
    }

    let spawner = ProcessSpawner::new(
        config.node_options(),
        sandbox,
        control,
        config.bind_address.clone(),
    );
    let mut builder = config.configure_builder(ClusterBuilder::new(spawner));
    let built = builder.build(&request, &mut hosts).await;
    let mut cluster = match built {
        Ok(cluster) => cluster,
        Err(err) => {
            disconnect_hosts(&mut hosts);
            return Err(err.into());
        }
    };

    let mut stdout = io::stdout();
    for node in cluster.nodes() {
        writeln!(stdout, "{} {}", node.kind(), node.endpoint()).ok();
    }
    info!(nodes = cluster.len(), "cluster is up; press Ctrl-C to tear it down");

    let held = tokio::signal::ctrl_c()
        .await
        .map_err(|err| CliError::Signal(err.to_string()));
    let report = cluster.tear_down(true).await;
    disconnect_hosts(&mut hosts);
    held?;

    if report.is_clean() {
        Ok(())
    } else {
        Err(CliError::Teardown(report.failed.len()))
    }
}

fn cluster_request(config: &CorralConfig, args: &UpCommand) -> ClusterRequest {
    let defaults = config.cluster_request();
    ClusterRequest::new(
        args.nodes.unwrap_or(defaults.node_count),
        args.base_port.unwrap_or(defaults.base_port),
        args.ports_per_node.unwrap_or(defaults.ports_per_node),
    )
}

fn external_node(config: &CorralConfig, args: &NodeAddress) -> Result<NodeHandle, CliError> {
    let control = ControlClient::new(config.request_timeout())?;
    let endpoint = Endpoint::new(args.address.clone(), args.port);
    Ok(ExternalNode::new(endpoint, control, &config.node_options()).into())
}

async fn status(config: &CorralConfig, args: &NodeAddress) -> Result<(), CliError> {
    let node = external_node(config, args)?;
    let reported = node.cloud_status().await?;
    writeln!(
        io::stdout(),
        "{} cloud_size={}",
        node.endpoint(),
        reported.cloud_size
    )
    .ok();
    Ok(())
}

async fn shutdown(config: &CorralConfig, args: &NodeAddress) -> Result<(), CliError> {
    let mut node = external_node(config, args)?;
    let termination = node.terminate().await?;
    writeln!(io::stdout(), "{} {termination}", node.endpoint()).ok();
    Ok(())
}

fn upload(config: &CorralConfig, args: &UploadCommand) -> Result<(), CliError> {
    let file = Utf8PathBuf::from(args.file.as_deref().unwrap_or(&config.engine_jar));
    let mut hosts = connect_hosts(config, &args.hosts, None)?;
    let uploaded = upload_to_hosts(
        &mut hosts,
        &file,
        args.slow_link,
        &mut progress_printer(&file),
    );
    disconnect_hosts(&mut hosts);

    let mut stdout = io::stdout();
    for (host, remote) in hosts.iter().zip(uploaded?) {
        writeln!(stdout, "{} {remote}", host.label()).ok();
    }
    Ok(())
}

fn connect_hosts(
    config: &CorralConfig,
    specs: &[String],
    audit: Option<&Sandbox>,
) -> Result<Vec<Host<ProcessCommandRunner>>, CliError> {
    let mut hosts = Vec::with_capacity(specs.len());
    for raw in specs {
        let mut spec: HostSpec = raw.parse()?;
        if spec.password.is_none() {
            spec.password.clone_from(&config.ssh_password);
        }
        let mut host = Host::with_process_runner(spec, config.ssh_config());
        if let Some(sandbox) = audit {
            host = host.with_audit(sandbox.clone());
        }
        if let Err(err) = host.connect() {
            disconnect_hosts(&mut hosts);
            return Err(err.into());
        }
        hosts.push(host);
    }
    Ok(hosts)
}

fn disconnect_hosts(hosts: &mut [Host<ProcessCommandRunner>]) {
    for host in hosts {
        if let Err(err) = host.disconnect() {
            warn!(host = %host.label(), error = %err, "failed to close session");
        }
    }
}

fn progress_printer(file: &Utf8Path) -> impl FnMut(&str, u64, u64) + use<> {
    let name = file.file_name().unwrap_or(file.as_str()).to_owned();
    move |_host: &str, sent: u64, total: u64| {
        let mut stderr = io::stderr();
        write!(stderr, "\r{}", render_progress(&name, sent, total)).ok();
        if sent >= total {
            writeln!(stderr).ok();
        }
    }
}

fn render_progress(file: &str, sent: u64, total: u64) -> String {
    let filled = sent
        .saturating_mul(PROGRESS_SLOTS)
        .checked_div(total)
        .unwrap_or(PROGRESS_SLOTS)
        .min(PROGRESS_SLOTS);
    let percent = sent
        .saturating_mul(100)
        .checked_div(total)
        .unwrap_or(100)
        .min(100);
    let bar: String = (0..PROGRESS_SLOTS)
        .map(|slot| if slot < filled { '#' } else { ' ' })
        .collect();
    format!("Uploading {file} [{bar}] {percent}%")
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(0, 100, "Uploading h2o.jar [          ] 0%")]
    #[case(40, 100, "Uploading h2o.jar [####      ] 40%")]
    #[case(100, 100, "Uploading h2o.jar [##########] 100%")]
    #[case(0, 0, "Uploading h2o.jar [##########] 100%")]
    fn progress_bar_has_ten_slots(#[case] sent: u64, #[case] total: u64, #[case] expected: &str) {
        assert_eq!(render_progress("h2o.jar", sent, total), expected);
    }

    #[test]
    fn command_line_flags_override_configured_shape() {
        let Cli { command, .. } =
            Cli::parse_from(["corral", "up", "--nodes", "4", "--base-port", "60000"]);
        let Command::Up(args) = command else {
            panic!("expected up subcommand");
        };
        let config = CorralConfig::load_without_cli_args()
            .unwrap_or_else(|err| panic!("config: {err}"));
        let request = cluster_request(&config, &args);
        assert_eq!(request.node_count, 4);
        assert_eq!(request.base_port, 60000);
        assert_eq!(request.ports_per_node, config.ports_per_node);
    }

    #[test]
    fn hosts_and_verbose_flag_parse() {
        let cli = Cli::parse_from([
            "corral",
            "-v",
            "upload",
            "--host",
            "alice@10.0.0.5",
            "--host",
            "bob:secret@10.0.0.6",
            "--slow-link",
        ]);
        assert!(cli.verbose);
        let Command::Upload(args) = cli.command else {
            panic!("expected upload subcommand");
        };
        assert_eq!(args.hosts.len(), 2);
        assert!(args.slow_link);
        assert!(args.file.is_none());
    }

    #[test]
    fn write_error_writes_cli_error() {
        let mut buf = Vec::new();
        write_error(&mut buf, &CliError::Teardown(2));
        let rendered = String::from_utf8(buf).unwrap_or_else(|err| panic!("utf8: {err}"));
        assert_eq!(rendered, "teardown failed for 2 node(s)\n");
    }
}
