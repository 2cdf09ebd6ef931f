use async_trait::async_trait;
use fleetward_core::{AppError, AppResult};
use fleetward_domain::{Document, DocumentQuery, PreCommitHook, WorkItem, WorkItemState};
use tracing::{debug, info};

use crate::coordination_ports::{LeaseCompletion, ReleasePolicy, WorkQueue};
use crate::document_service::query_all;
use crate::lease_service::LeaseManager;

/// Settings for one queue kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkQueueConfig {
    /// Queue kind used in logs.
    pub kind: String,
    /// States eligible for dequeue.
    pub claimable_states: Vec<WorkItemState>,
    /// `RetryLater` releases hold the item back for this many lease TTLs.
    pub retry_later_multiplier: i64,
}

impl WorkQueueConfig {
    /// Config for a queue of `kind` over the default claimable states.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            claimable_states: WorkItemState::CLAIMABLE.to_vec(),
            retry_later_multiplier: 10,
        }
    }

    /// Validates queue settings.
    pub fn validate(&self) -> AppResult<()> {
        if self.kind.trim().is_empty() {
            return Err(AppError::Validation(
                "queue kind must not be empty".to_owned(),
            ));
        }

        if self.claimable_states.is_empty() {
            return Err(AppError::Validation(format!(
                "queue '{}' must have at least one claimable state",
                self.kind
            )));
        }

        if let Some(state) = self
            .claimable_states
            .iter()
            .find(|state| state.is_terminal())
        {
            return Err(AppError::Validation(format!(
                "queue '{}' cannot claim terminal state '{}'",
                self.kind,
                state.as_str()
            )));
        }

        if self.retry_later_multiplier < 1 {
            return Err(AppError::Validation(format!(
                "queue '{}' retry-later multiplier must be at least 1",
                self.kind
            )));
        }

        Ok(())
    }
}

/// Claim-and-skip queue over a work item collection.
#[derive(Clone)]
pub struct DocumentWorkQueue {
    kind: String,
    claimable: DocumentQuery,
    retry_later_multiplier: i64,
    leases: LeaseManager<WorkItem>,
}

impl DocumentWorkQueue {
    /// Creates a queue claiming on behalf of the lease manager's holder.
    pub fn new(config: WorkQueueConfig, leases: LeaseManager<WorkItem>) -> AppResult<Self> {
        config.validate()?;

        Ok(Self {
            kind: config.kind,
            claimable: DocumentQuery::Claimable {
                states: config.claimable_states,
            },
            retry_later_multiplier: config.retry_later_multiplier,
            leases,
        })
    }

    fn release_hook(&self, policy: ReleasePolicy) -> Option<PreCommitHook> {
        match policy {
            ReleasePolicy::Immediate => None,
            ReleasePolicy::RetryLater => Some(PreCommitHook::StampLeaseExpiry {
                ttl_seconds: self
                    .leases
                    .ttl_seconds()
                    .saturating_mul(self.retry_later_multiplier),
            }),
        }
    }
}

#[async_trait]
impl WorkQueue for DocumentWorkQueue {
    fn kind(&self) -> &str {
        self.kind.as_str()
    }

    async fn dequeue(&self) -> AppResult<Option<WorkItem>> {
        let mut continuation = None;

        loop {
            let page = self
                .leases
                .store()
                .query(&self.claimable, continuation)
                .await?;

            for candidate in page.documents {
                let candidate_id = candidate.id().to_owned();
                match self
                    .leases
                    .commit_claim(candidate, WorkItem::record_dequeue)
                    .await?
                {
                    Some(claimed) => {
                        info!(
                            kind = %self.kind,
                            item_id = %claimed.id(),
                            holder_id = %self.leases.holder_id(),
                            state = %claimed.state().as_str(),
                            dequeues = claimed.dequeue_count(),
                            "dequeued work item"
                        );
                        return Ok(Some(claimed));
                    }
                    None => {
                        debug!(
                            kind = %self.kind,
                            item_id = %candidate_id,
                            "candidate already claimed"
                        );
                    }
                }
            }

            match page.continuation {
                Some(next) => continuation = Some(next),
                None => return Ok(None),
            }
        }
    }

    async fn renew_lease(&self, id: &str) -> AppResult<WorkItem> {
        self.leases.renew(id).await
    }

    async fn end_lease(&self, id: &str, completion: LeaseCompletion) -> AppResult<WorkItem> {
        let hook = self.release_hook(completion.policy);

        self.leases
            .patch_with_lease(id, hook, |item| {
                item.end_lease(completion.state, completion.failed_state);
                if completion.policy == ReleasePolicy::Immediate {
                    item.lease_mut().clear();
                }
                Ok(())
            })
            .await
    }

    async fn delete(&self, id: &str) -> AppResult<()> {
        self.leases.delete_with_lease(id).await
    }

    async fn queue_length(&self) -> AppResult<usize> {
        let claimable = query_all(self.leases.store().as_ref(), &self.claimable).await?;
        Ok(claimable.len())
    }
}
