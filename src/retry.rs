//! Retry logic with a fixed delay
//!
//! Network-class failures of a single entry are retried in place, up to a
//! configured number of times, waiting a fixed delay between attempts. The
//! wait is cut short when the job is cancelled.
//!
//! # Example
//!
//! ```no_run
//! use tokio_util::sync::CancellationToken;
//! use zipstream::config::RetryConfig;
//! use zipstream::retry::download_with_retry;
//!
//! # async fn example() -> zipstream::Result<()> {
//! let config = RetryConfig::default();
//! let cancel = CancellationToken::new();
//! let bytes = download_with_retry(&config, &cancel, || async {
//!     // Your operation here
//!     Ok::<_, zipstream::Error>(42u64)
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::error::{Error, Result};

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (timeouts, dropped connections, server busy) should
/// return `true`. Structural and integrity failures should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Network(e) => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
            // Short reads and dropped streams surface as I/O errors
            Error::Io(e) => !matches!(
                e.kind(),
                std::io::ErrorKind::PermissionDenied
                    | std::io::ErrorKind::InvalidInput
                    | std::io::ErrorKind::InvalidData
                    | std::io::ErrorKind::Unsupported
                    | std::io::ErrorKind::StorageFull
            ),
            Error::HttpStatus(status) => matches!(status, 408 | 429 | 500..=599),
            Error::ArchiveStructure(_)
            | Error::LocalHeaderMismatch { .. }
            | Error::Checksum { .. }
            | Error::SizeMismatch { .. }
            | Error::UnsupportedFeature(_)
            | Error::RemoteContentChanged
            | Error::Cancelled
            | Error::Config { .. }
            | Error::InvalidEntryName(_)
            | Error::JobInProgress
            | Error::RangeNotSupported(_) => false,
        }
    }
}

/// Execute an async operation, retrying transient failures
///
/// The operation runs once, then up to `config.max_attempts` more times
/// while it keeps failing with a retryable error. Cancellation is checked
/// before every attempt and during every wait.
///
/// # Returns
///
/// The successful result, the first non-retryable error, the last error
/// after all retry attempts are exhausted, or [`Error::Cancelled`].
pub async fn download_with_retry<F, Fut, T>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempts = attempt + 1, "operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                attempt += 1;

                tracing::warn!(
                    error = %e,
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = config.delay.as_millis(),
                    "operation failed, retrying"
                );

                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(config.delay) => {}
                }
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::warn!(
                        error = %e,
                        attempts = attempt + 1,
                        "operation failed after all retry attempts exhausted"
                    );
                }
                return Err(e);
            }
        }
    }
}
