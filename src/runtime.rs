//! Small helpers around the tokio runtime used by the engine tasks.

use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Spawns an async task that runs in the background without a join handle.
///
/// Falls back to a lazily created single-threaded runtime when called outside
/// a tokio context, so library entry points never panic on `Handle::current`.
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    use std::sync::LazyLock;
    use tokio::runtime::{Builder, Handle, Runtime};

    static BACKGROUND_RUNTIME: LazyLock<Runtime> = LazyLock::new(|| {
        Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build background tokio runtime")
    });

    if let Ok(handle) = Handle::try_current() {
        handle.spawn(future);
    } else {
        let _ = BACKGROUND_RUNTIME.spawn(future);
    }
}

/// Timeout error returned when an operation exceeds the allotted duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutError;

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation timed out")
    }
}

impl std::error::Error for TimeoutError {}

/// Runs the future and resolves with `TimeoutError` if it does not complete
/// within the duration. A zero duration disables the timeout.
pub async fn with_timeout<F, T>(future: F, duration: Duration) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    if duration.is_zero() {
        return Ok(future.await);
    }

    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn with_timeout_passes_through_fast_futures() {
        let value = with_timeout(async { 7 }, Duration::from_secs(1)).await;
        assert_eq!(value, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn with_timeout_fires_on_slow_futures() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            7
        };
        let value = with_timeout(slow, Duration::from_millis(10)).await;
        assert_eq!(value, Err(TimeoutError));
    }
}
