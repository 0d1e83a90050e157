//! Background copying of process output into a sink.
//!
//! Each stream gets its own task. Output is diagnostic only, so there is no
//! coordination with the producer beyond what the pipe provides. The returned
//! [`DrainHandle`] is the completion signal teardown can optionally await.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Destination for drained bytes.
#[derive(Debug)]
pub enum DrainSink {
    /// A capture file; closed when the drain finishes.
    File(std::fs::File),
    /// This process's standard output.
    Stdout,
    /// This process's standard error.
    Stderr,
}

/// Supervised drain task for one stream.
#[derive(Debug)]
pub struct DrainHandle {
    label: String,
    task: JoinHandle<io::Result<u64>>,
}

impl DrainHandle {
    /// Returns the label given at spawn time.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Returns `true` once the source reached end of stream.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the drain to finish and returns the number of bytes copied.
    ///
    /// # Errors
    ///
    /// Returns the I/O error that stopped the copy, or an error describing a
    /// panicked or cancelled task.
    pub async fn wait(self) -> io::Result<u64> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(io::Error::other(format!(
                "drain task {} did not complete: {err}",
                self.label
            ))),
        }
    }
}

/// Starts copying `source` into `sink` on a background task.
pub fn spawn_drain<R>(label: impl Into<String>, source: R, sink: DrainSink) -> DrainHandle
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let label = label.into();
    let task_label = label.clone();
    let task = tokio::spawn(async move {
        let result = match sink {
            DrainSink::File(file) => copy_all(source, tokio::fs::File::from_std(file)).await,
            DrainSink::Stdout => copy_all(source, tokio::io::stdout()).await,
            DrainSink::Stderr => copy_all(source, tokio::io::stderr()).await,
        };
        match &result {
            Ok(bytes) => debug!(label = %task_label, bytes, "drain finished"),
            Err(err) => warn!(label = %task_label, error = %err, "drain stopped early"),
        }
        result
    });
    DrainHandle { label, task }
}

async fn copy_all<R, W>(mut source: R, mut sink: W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::io::copy(&mut source, &mut sink).await?;
    sink.flush().await?;
    Ok(copied)
}
