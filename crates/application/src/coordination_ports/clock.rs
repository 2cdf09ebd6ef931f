use std::time::Duration;

use async_trait::async_trait;

/// Time source shared by every polling loop.
///
/// Loops never call `tokio::time` directly so tests can drive them on
/// virtual time.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current time in unix seconds.
    fn now_unix(&self) -> i64;

    /// Suspends the caller for `duration`.
    async fn sleep(&self, duration: Duration);
}
