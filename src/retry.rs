//! Read retries for upstream failures

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::Result;

pub const READ_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 100;

/// Retry `op` with exponential backoff while it fails with a retryable
/// error. Only for reads: writes surface their first failure.
pub async fn read_with_backoff<T, F, Fut>(what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Err(e) if e.is_retryable() && attempt < READ_ATTEMPTS => {
                let delay = Duration::from_millis(BACKOFF_BASE_MS * 2u64.pow(attempt - 1));
                warn!(
                    "Read of {} failed (attempt {}/{}), retrying in {:?}: {}",
                    what, attempt, READ_ATTEMPTS, delay, e
                );
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}
