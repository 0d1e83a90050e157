//! Bounded-timeout polling used by readiness and convergence checks.
//!
//! The poller evaluates a predicate until it reports `true`, sleeping between
//! attempts, and gives up with [`StabilizationTimeout`] once the budget is
//! spent. Predicate errors are never swallowed; callers decide which failures
//! count as "not yet" by mapping them to `Ok(false)` (see
//! [`tolerate_startup`]).

use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

use crate::control::ControlError;

/// Produces a diagnostic from the elapsed time and retry count.
pub type ContextFn = dyn Fn(Duration, u32) -> String + Send + Sync;

/// Diagnostic attached to a [`StabilizationTimeout`].
pub enum ErrorContext {
    /// Fixed description of what was being waited for.
    Static(String),
    /// Message computed when the timeout fires.
    Computed(Box<ContextFn>),
}

impl ErrorContext {
    /// Wraps a closure computing the message at timeout.
    #[must_use]
    pub fn computed(render: impl Fn(Duration, u32) -> String + Send + Sync + 'static) -> Self {
        Self::Computed(Box::new(render))
    }

    /// Renders the diagnostic for the given elapsed time and retry count.
    #[must_use]
    pub fn render(&self, elapsed: Duration, retries: u32) -> String {
        match self {
            Self::Static(what) => format!(
                "{what} failed after {:.2} seconds having retried {retries} times",
                elapsed.as_secs_f64()
            ),
            Self::Computed(render) => render(elapsed, retries),
        }
    }
}

impl fmt::Debug for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(what) => f.debug_tuple("Static").field(what).finish(),
            Self::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

impl From<&str> for ErrorContext {
    fn from(value: &str) -> Self {
        Self::Static(value.to_owned())
    }
}

impl From<String> for ErrorContext {
    fn from(value: String) -> Self {
        Self::Static(value)
    }
}

/// Raised when a predicate never held within the polling budget.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{context}")]
pub struct StabilizationTimeout {
    /// Wall-clock time spent polling.
    pub elapsed: Duration,
    /// Number of sleeps between failed attempts.
    pub retries: u32,
    /// Rendered diagnostic.
    pub context: String,
}

/// Polling budget: total timeout and delay between attempts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Poller {
    timeout: Duration,
    retry_delay: Duration,
}

impl Poller {
    /// Creates a poller with the given budget.
    #[must_use]
    pub const fn new(timeout: Duration, retry_delay: Duration) -> Self {
        Self {
            timeout,
            retry_delay,
        }
    }

    /// Returns the total polling budget.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns the delay between attempts.
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// Evaluates `predicate` until it returns `Ok(true)`.
    ///
    /// # Errors
    ///
    /// Propagates the first predicate error unchanged, and returns
    /// [`StabilizationTimeout`] (converted into `E`) once the elapsed time
    /// reaches the timeout.
    pub async fn stabilize<F, Fut, E>(&self, mut predicate: F, context: &ErrorContext) -> Result<(), E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, E>>,
        E: From<StabilizationTimeout>,
    {
        let start = Instant::now();
        let mut retries: u32 = 0;

        while start.elapsed() < self.timeout {
            if predicate().await? {
                debug!(retries, elapsed_ms = start.elapsed().as_millis(), "predicate held");
                return Ok(());
            }
            sleep(self.retry_delay).await;
            retries = retries.saturating_add(1);
        }

        let elapsed = start.elapsed();
        Err(E::from(StabilizationTimeout {
            elapsed,
            retries,
            context: context.render(elapsed, retries),
        }))
    }
}

/// Polls `predicate` with an ad-hoc budget. See [`Poller::stabilize`].
///
/// # Errors
///
/// As for [`Poller::stabilize`].
pub async fn stabilize<F, Fut, E>(
    predicate: F,
    context: &ErrorContext,
    timeout: Duration,
    retry_delay: Duration,
) -> Result<(), E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
    E: From<StabilizationTimeout>,
{
    Poller::new(timeout, retry_delay)
        .stabilize(predicate, context)
        .await
}

/// Maps a control-plane result onto a readiness answer.
///
/// Success means ready. Connection refused or reset means the node is still
/// booting. Every other failure is returned so the poll aborts.
///
/// # Errors
///
/// Returns the original [`ControlError`] when it is not a startup transient.
pub fn tolerate_startup<T>(result: Result<T, ControlError>) -> Result<bool, ControlError> {
    match result {
        Ok(_) => Ok(true),
        Err(err)
            if err
                .transport_kind()
                .is_some_and(|kind| kind.is_startup_transient()) =>
        {
            Ok(false)
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use rstest::rstest;

    use super::*;
    use crate::control::TransportKind;

    #[derive(Debug, Error, PartialEq)]
    enum ProbeError {
        #[error(transparent)]
        Timeout(#[from] StabilizationTimeout),
        #[error("probe exploded")]
        Exploded,
    }

    fn transport(kind: TransportKind) -> ControlError {
        ControlError::Transport {
            operation: String::from("Cloud.json"),
            url: String::from("http://127.0.0.1:1/Cloud.json"),
            kind,
            message: String::from("simulated"),
        }
    }

    #[tokio::test]
    async fn returns_once_predicate_holds_after_k_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let poller = Poller::new(Duration::from_secs(5), Duration::from_millis(5));

        let result: Result<(), ProbeError> = poller
            .stabilize(
                || {
                    let calls = Arc::clone(&calls);
                    async move { Ok(calls.fetch_add(1, Ordering::SeqCst).saturating_add(1) >= 4) }
                },
                &ErrorContext::from("counter"),
            )
            .await;

        assert_eq!(result, Ok(()));
        assert!(calls.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test]
    async fn times_out_with_elapsed_and_retry_count() {
        let timeout = Duration::from_millis(200);
        let delay = Duration::from_millis(20);

        let result: Result<(), ProbeError> = stabilize(
            || async { Ok(false) },
            &ErrorContext::from("never"),
            timeout,
            delay,
        )
        .await;

        let Err(ProbeError::Timeout(err)) = result else {
            panic!("expected a stabilization timeout, got {result:?}");
        };
        assert!(err.elapsed >= timeout);
        assert!(err.retries >= 1);
        assert!(err.retries <= 11, "retries {} exceeds budget", err.retries);
        assert!(err.context.starts_with("never failed after "));
        assert!(err.context.ends_with(&format!("having retried {} times", err.retries)));
    }

    #[tokio::test]
    async fn computed_context_sees_final_counts() {
        let context = ErrorContext::computed(|_, retries| format!("gave up after {retries}"));
        let result: Result<(), ProbeError> = stabilize(
            || async { Ok(false) },
            &context,
            Duration::from_millis(30),
            Duration::from_millis(10),
        )
        .await;

        let Err(ProbeError::Timeout(err)) = result else {
            panic!("expected a stabilization timeout, got {result:?}");
        };
        assert_eq!(err.context, format!("gave up after {}", err.retries));
    }

    #[tokio::test]
    async fn predicate_errors_abort_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<(), ProbeError> = stabilize(
            || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ProbeError::Exploded)
                }
            },
            &ErrorContext::from("exploding"),
            Duration::from_secs(5),
            Duration::from_millis(5),
        )
        .await;

        assert_eq!(result, Err(ProbeError::Exploded));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[rstest]
    #[case(TransportKind::Refused, true)]
    #[case(TransportKind::Reset, true)]
    #[case(TransportKind::Timeout, false)]
    #[case(TransportKind::Other, false)]
    fn tolerate_startup_classifies_transport_errors(
        #[case] kind: TransportKind,
        #[case] tolerated: bool,
    ) {
        let outcome = tolerate_startup::<()>(Err(transport(kind)));
        assert_eq!(outcome.is_ok(), tolerated);
        if tolerated {
            assert_eq!(outcome, Ok(false));
        }
    }

    #[test]
    fn tolerate_startup_surfaces_control_plane_errors() {
        let err = ControlError::ControlPlane {
            operation: String::from("Cloud.json"),
            url: String::from("http://127.0.0.1:1/Cloud.json"),
            message: String::from("bad"),
        };
        assert_eq!(tolerate_startup::<()>(Err(err.clone())), Err(err));
        assert_eq!(tolerate_startup(Ok(7)), Ok(true));
    }
}
