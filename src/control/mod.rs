//! Typed client for a node's control-plane HTTP endpoint.
//!
//! Requests are single-shot; retry policy lives in [`crate::poll`]. A body
//! carrying an `error` field is a control-plane failure even when the HTTP
//! status reports success. Transport failures are classified so callers can
//! treat connection refusal during startup as expected.

use std::error::Error as _;
use std::fmt;
use std::io;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::sandbox::Sandbox;

#[cfg(test)]
mod tests;

/// Operation reporting the node's view of cluster membership.
pub const CLOUD_OPERATION: &str = "Cloud.json";

/// Operation asking the cluster to shut down.
pub const SHUTDOWN_OPERATION: &str = "Shutdown.json";

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Address and port identifying one node's control plane.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Endpoint {
    /// Host name or IP address the node listens on.
    pub address: String,
    /// Control-plane TCP port.
    pub port: u16,
}

impl Endpoint {
    /// Creates an endpoint from an address and port.
    #[must_use]
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// Returns the URL of `operation` on this endpoint.
    #[must_use]
    pub fn url(&self, operation: &str) -> String {
        format!("http://{}:{}/{operation}", self.address, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http://{}:{}/", self.address, self.port)
    }
}

/// Broad classes of transport failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransportKind {
    /// Nothing listens on the port yet.
    Refused,
    /// The peer reset or aborted the connection.
    Reset,
    /// The request did not complete in time.
    Timeout,
    /// Any other transport failure.
    Other,
}

impl TransportKind {
    /// Returns `true` for failures that are normal while a node boots.
    #[must_use]
    pub const fn is_startup_transient(self) -> bool {
        matches!(self, Self::Refused | Self::Reset)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Refused => "connection refused",
            Self::Reset => "connection reset",
            Self::Timeout => "timeout",
            Self::Other => "transport failure",
        };
        f.write_str(label)
    }
}

/// Errors raised by control-plane requests.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ControlError {
    /// Raised when the HTTP client cannot be constructed.
    #[error("failed to build control-plane client: {message}")]
    Client {
        /// Error reported by the HTTP stack.
        message: String,
    },
    /// Raised when the request never produced a response.
    #[error("{operation} request to {url} failed ({kind}): {message}")]
    Transport {
        /// Operation that was attempted.
        operation: String,
        /// URL the request targeted.
        url: String,
        /// Classification of the failure.
        kind: TransportKind,
        /// Error reported by the HTTP stack.
        message: String,
    },
    /// Raised when the node answered but reported a failure.
    #[error("{operation} on {url} reported an error: {message}")]
    ControlPlane {
        /// Operation that was attempted.
        operation: String,
        /// URL the request targeted.
        url: String,
        /// Error text reported by the node.
        message: String,
    },
    /// Raised when the response body is not the expected JSON.
    #[error("{operation} on {url} returned an unreadable body: {message}")]
    Decode {
        /// Operation that was attempted.
        operation: String,
        /// URL the request targeted.
        url: String,
        /// Parser error message.
        message: String,
    },
}

impl ControlError {
    /// Returns the transport classification when this is a transport error.
    #[must_use]
    pub const fn transport_kind(&self) -> Option<TransportKind> {
        match self {
            Self::Transport { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Cluster-membership view reported by `Cloud.json`.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct CloudStatus {
    /// Number of nodes this node believes are in its cluster.
    pub cloud_size: usize,
    /// Remaining fields, kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Single-shot HTTP client for node control planes.
#[derive(Clone, Debug)]
pub struct ControlClient {
    http: reqwest::Client,
    audit: Option<Sandbox>,
}

impl ControlClient {
    /// Builds a client whose requests give up after `request_timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::Client`] when the HTTP stack cannot be
    /// initialised.
    pub fn new(request_timeout: Duration) -> Result<Self, ControlError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| ControlError::Client {
                message: err.to_string(),
            })?;
        Ok(Self { http, audit: None })
    }

    /// Records every issued request in the sandbox command log.
    #[must_use]
    pub fn with_audit(mut self, sandbox: Sandbox) -> Self {
        self.audit = Some(sandbox);
        self
    }

    /// Issues `operation` with query `params` and returns the parsed body.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::Transport`] when no response arrives,
    /// [`ControlError::ControlPlane`] when the body carries an `error` field
    /// or the status is not a success, and [`ControlError::Decode`] when the
    /// body is not JSON.
    pub async fn request(
        &self,
        endpoint: &Endpoint,
        operation: &str,
        params: &[(&str, String)],
    ) -> Result<Value, ControlError> {
        let url = endpoint.url(operation);
        let response = self
            .http
            .get(&url)
            .query(params)
            .send()
            .await
            .map_err(|err| transport_error(operation, &url, &err))?;

        let resolved = response.url().to_string();
        self.audit(&resolved);

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| transport_error(operation, &resolved, &err))?;
        let value: Value = serde_json::from_str(&body).map_err(|err| ControlError::Decode {
            operation: operation.to_owned(),
            url: resolved.clone(),
            message: err.to_string(),
        })?;

        if let Some(reported) = value.get("error") {
            let message = reported
                .as_str()
                .map_or_else(|| reported.to_string(), str::to_owned);
            return Err(ControlError::ControlPlane {
                operation: operation.to_owned(),
                url: resolved,
                message,
            });
        }
        if !status.is_success() {
            return Err(ControlError::ControlPlane {
                operation: operation.to_owned(),
                url: resolved,
                message: format!("HTTP status {status}"),
            });
        }

        debug!(operation, url = %resolved, "control-plane request succeeded");
        Ok(value)
    }

    /// Queries the node's cluster-membership view.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError`] as described for [`ControlClient::request`],
    /// or [`ControlError::Decode`] when `cloud_size` is missing.
    pub async fn cloud_status(&self, endpoint: &Endpoint) -> Result<CloudStatus, ControlError> {
        let value = self.request(endpoint, CLOUD_OPERATION, &[]).await?;
        serde_json::from_value(value).map_err(|err| ControlError::Decode {
            operation: CLOUD_OPERATION.to_owned(),
            url: endpoint.url(CLOUD_OPERATION),
            message: err.to_string(),
        })
    }

    /// Asks the node to shut its cluster down.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError`] as described for [`ControlClient::request`].
    pub async fn shutdown(&self, endpoint: &Endpoint) -> Result<Value, ControlError> {
        self.request(endpoint, SHUTDOWN_OPERATION, &[]).await
    }

    fn audit(&self, url: &str) {
        let Some(sandbox) = &self.audit else {
            return;
        };
        if let Err(err) = sandbox.record(&format!("Sent {url}"), None) {
            warn!(error = %err, "failed to append to command log");
        }
    }
}

fn transport_error(operation: &str, url: &str, err: &reqwest::Error) -> ControlError {
    ControlError::Transport {
        operation: operation.to_owned(),
        url: url.to_owned(),
        kind: classify(err),
        message: err.to_string(),
    }
}

fn classify(err: &reqwest::Error) -> TransportKind {
    if err.is_timeout() {
        return TransportKind::Timeout;
    }

    let mut cause = err.source();
    while let Some(current) = cause {
        if let Some(io_err) = current.downcast_ref::<io::Error>() {
            return match io_err.kind() {
                io::ErrorKind::ConnectionRefused => TransportKind::Refused,
                io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe => TransportKind::Reset,
                io::ErrorKind::TimedOut => TransportKind::Timeout,
                _ => TransportKind::Other,
            };
        }
        cause = current.source();
    }
    TransportKind::Other
}
