//! Engine launch command line.

use std::borrow::Cow;

use crate::control::Endpoint;

use super::NodeOptions;

/// Program and arguments that start one engine node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LaunchCommand {
    program: String,
    args: Vec<String>,
}

impl LaunchCommand {
    /// Builds the command for a node serving `endpoint`.
    ///
    /// `jar` and `scratch` are paths as seen by the machine running the
    /// node.
    #[must_use]
    pub fn build(options: &NodeOptions, endpoint: &Endpoint, jar: &str, scratch: &str) -> Self {
        let mut args = Vec::with_capacity(10);
        if options.use_debugger {
            args.push(format!(
                "-agentlib:jdwp=transport=dt_socket,server=y,suspend=y,address={}",
                options.debug_port
            ));
        }
        args.push(String::from("-ea"));
        args.push(String::from("-jar"));
        args.push(jar.to_owned());
        args.push(format!("--port={}", endpoint.port));
        args.push(format!("--ip={}", endpoint.address));
        args.push(format!("--ice_root={scratch}"));
        args.push(format!("--name={}", options.cloud_name));
        if !options.sigar {
            args.push(String::from("--nosigar"));
        }

        Self {
            program: options.engine_bin.clone(),
            args,
        }
    }

    /// Returns the program to execute.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Returns the program arguments.
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Renders the command as a single shell-escaped line.
    #[must_use]
    pub fn render(&self) -> String {
        std::iter::once(&self.program)
            .chain(&self.args)
            .map(|part| shell_escape::unix::escape(Cow::Borrowed(part.as_str())))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
