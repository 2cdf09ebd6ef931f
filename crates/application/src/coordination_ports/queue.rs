use async_trait::async_trait;
use fleetward_core::AppResult;
use fleetward_domain::{WorkItem, WorkItemState};

/// How a released item becomes claimable again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleasePolicy {
    /// Expiry is cleared; the item is claimable on the next poll.
    Immediate,
    /// Expiry is stamped to a multiple of the lease TTL; the item is
    /// claimable only once that window passes.
    RetryLater,
}

/// Final write performed when a worker gives up its lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseCompletion {
    /// State to move to.
    pub state: WorkItemState,
    /// State recorded as the failure origin.
    pub failed_state: Option<WorkItemState>,
    /// Release policy.
    pub policy: ReleasePolicy,
}

impl LeaseCompletion {
    /// Moves to `state` and releases immediately.
    #[must_use]
    pub fn transition(state: WorkItemState) -> Self {
        Self {
            state,
            failed_state: None,
            policy: ReleasePolicy::Immediate,
        }
    }

    /// Fails an item that was being processed in `processing_state`.
    #[must_use]
    pub fn failed(processing_state: WorkItemState) -> Self {
        Self {
            state: WorkItemState::Failed,
            failed_state: Some(processing_state),
            policy: ReleasePolicy::Immediate,
        }
    }

    /// Keeps `state` and holds the item back.
    #[must_use]
    pub fn retry_later(state: WorkItemState) -> Self {
        Self {
            state,
            failed_state: None,
            policy: ReleasePolicy::RetryLater,
        }
    }
}

/// Narrow queue interface handed to worker pools.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Queue kind used in logs.
    fn kind(&self) -> &str;

    /// Claims one eligible, unleased item, or returns `None`.
    async fn dequeue(&self) -> AppResult<Option<WorkItem>>;

    /// Extends the caller's lease on an item.
    async fn renew_lease(&self, id: &str) -> AppResult<WorkItem>;

    /// Writes the completion and drops the caller's lease.
    async fn end_lease(&self, id: &str, completion: LeaseCompletion) -> AppResult<WorkItem>;

    /// Deletes an item the caller still holds.
    async fn delete(&self, id: &str) -> AppResult<()>;

    /// Counts claimable items whose lease has expired.
    async fn queue_length(&self) -> AppResult<usize>;
}
