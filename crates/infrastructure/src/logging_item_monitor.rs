//! Monitor that only reports items to tracing output. Used when no
//! monitoring backend is configured.

use async_trait::async_trait;
use fleetward_application::ItemMonitor;
use fleetward_core::AppResult;
use fleetward_domain::WorkItemSummary;
use tracing::info;

/// Development monitor that logs each check.
#[derive(Clone, Default)]
pub struct LoggingItemMonitor;

impl LoggingItemMonitor {
    /// Creates a new logging monitor.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ItemMonitor for LoggingItemMonitor {
    async fn check(&self, item: &WorkItemSummary) -> AppResult<()> {
        info!(
            item_id = %item.id,
            partition_key = %item.partition_key,
            bucket = item.bucket,
            state = item.state.as_str(),
            "monitor check"
        );

        Ok(())
    }
}
