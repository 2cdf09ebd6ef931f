use async_trait::async_trait;
use fleetward_core::AppResult;
use fleetward_domain::{WorkItem, WorkItemState, WorkItemSummary};

/// What a handler asks the worker to do with its item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// End the lease and move to the given state. A non-terminal state
    /// hands the next phase to whichever worker claims it.
    Transition(WorkItemState),
    /// Keep the state and hold the item back for an extended window.
    RetryLater,
    /// Remove the document.
    Delete,
}

/// External domain logic run for one claimed item.
#[async_trait]
pub trait WorkItemHandler: Send + Sync {
    /// Processes the item according to its current state.
    async fn handle(&self, item: WorkItem) -> AppResult<HandlerOutcome>;
}

/// External per-item monitoring check.
#[async_trait]
pub trait ItemMonitor: Send + Sync {
    /// Runs one monitoring pass over the item.
    async fn check(&self, item: &WorkItemSummary) -> AppResult<()>;
}
