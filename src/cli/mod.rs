//! Command-line interface definitions for the `corral` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser, Subcommand};

/// Top-level CLI for the `corral` binary.
#[derive(Debug, Parser)]
#[command(
    name = "corral",
    about = "Form, verify, and tear down ad-hoc clusters of engine nodes",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Log at debug level (`RUST_LOG` still takes precedence).
    #[arg(long, short, global = true)]
    pub(crate) verbose: bool,
    /// Operation to perform.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands of the `corral` binary.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Build a cluster, hold it until Ctrl-C, then tear it down.
    #[command(name = "up")]
    Up(UpCommand),
    /// Print the cluster size reported by a running node.
    #[command(name = "status")]
    Status(NodeAddress),
    /// Ask a running node to shut its cluster down.
    #[command(name = "shutdown")]
    Shutdown(NodeAddress),
    /// Distribute the engine artifact to remote hosts.
    #[command(name = "upload")]
    Upload(UploadCommand),
}

/// Arguments for the `corral up` subcommand.
#[derive(Debug, Args)]
pub(crate) struct UpCommand {
    /// Nodes per host, or in total when no host is given.
    #[arg(long, value_name = "N")]
    pub(crate) nodes: Option<u32>,
    /// Control-plane port of the first node.
    #[arg(long, value_name = "PORT")]
    pub(crate) base_port: Option<u16>,
    /// Port spacing between consecutive nodes.
    #[arg(long, value_name = "K")]
    pub(crate) ports_per_node: Option<u16>,
    /// Remote host as `user[:password]@address`; repeat for several hosts.
    #[arg(long = "host", value_name = "SPEC")]
    pub(crate) hosts: Vec<String>,
    /// Upload the artifact once and copy it host-to-host.
    #[arg(long)]
    pub(crate) slow_link: bool,
}

/// Address of an already running node.
#[derive(Debug, Args)]
pub(crate) struct NodeAddress {
    /// Address the node's control plane listens on.
    #[arg(long, value_name = "ADDRESS", default_value = "127.0.0.1")]
    pub(crate) address: String,
    /// Control-plane port.
    #[arg(long, value_name = "PORT")]
    pub(crate) port: u16,
}

/// Arguments for the `corral upload` subcommand.
#[derive(Debug, Args)]
pub(crate) struct UploadCommand {
    /// Remote host as `user[:password]@address`; repeat for several hosts.
    #[arg(long = "host", value_name = "SPEC", required = true)]
    pub(crate) hosts: Vec<String>,
    /// Upload once and copy host-to-host.
    #[arg(long)]
    pub(crate) slow_link: bool,
    /// File to distribute; defaults to the configured engine artifact.
    #[arg(long, value_name = "PATH")]
    pub(crate) file: Option<String>,
}
