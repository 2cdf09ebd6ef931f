use std::sync::Arc;
use std::time::Duration;

use fleetward_core::{AppError, AppResult};
use fleetward_domain::{Document, WorkItem, WorkItemState};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{InFlightPermit, WorkerPoolConfig};
use crate::coordination_ports::{
    Clock, HandlerOutcome, LeaseCompletion, WorkItemHandler, WorkQueue,
};

/// One claimed item, processed from dispatch to its final write.
pub(super) struct WorkUnit {
    pub(super) queue: Arc<dyn WorkQueue>,
    pub(super) handler: Arc<dyn WorkItemHandler>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) config: WorkerPoolConfig,
    pub(super) item: WorkItem,
}

enum Completion {
    EndLease(LeaseCompletion),
    Delete,
}

impl WorkUnit {
    pub(super) async fn run(self, _permit: InFlightPermit) {
        let item_id = self.item.id().to_owned();
        let state = self.item.state();

        if self.item.is_poisoned(self.config.max_dequeues) {
            let poison = AppError::PoisonItem(format!(
                "{item_id} dequeued {} times",
                self.item.dequeue_count()
            ));
            warn!(
                kind = %self.queue.kind(),
                item_id = %item_id,
                error = %poison,
                "failing poison item without dispatch"
            );
            self.finish(&item_id, Completion::EndLease(LeaseCompletion::failed(state)))
                .await;
            return;
        }

        let stop_renewal = CancellationToken::new();
        let lease_lost = CancellationToken::new();
        let renewal = tokio::spawn(renew_until_stopped(
            Arc::clone(&self.queue),
            Arc::clone(&self.clock),
            item_id.clone(),
            self.config.renew_interval,
            stop_renewal.clone(),
            lease_lost.clone(),
        ));

        let handler = Arc::clone(&self.handler);
        let item = self.item.clone();
        let dispatch = tokio::spawn(async move { handler.handle(item).await });
        let abort_dispatch = dispatch.abort_handle();

        let handled = tokio::select! {
            joined = dispatch => Some(joined),
            () = lease_lost.cancelled() => {
                abort_dispatch.abort();
                None
            }
        };

        let completion = match handled {
            Some(joined) => self.completion_for(&item_id, state, joined),
            None => None,
        };

        let completion = match completion {
            Some(Completion::Delete) if !self.config.delete_grace.is_zero() => {
                tokio::select! {
                    () = lease_lost.cancelled() => None,
                    () = self.clock.sleep(self.config.delete_grace) => Some(Completion::Delete),
                }
            }
            other => other,
        };

        stop_renewal.cancel();
        if let Err(join_error) = renewal.await {
            error!(item_id = %item_id, error = %join_error, "lease renewal task failed");
        }

        match completion {
            Some(completion) if !lease_lost.is_cancelled() => {
                self.finish(&item_id, completion).await;
            }
            _ => {
                warn!(
                    kind = %self.queue.kind(),
                    item_id = %item_id,
                    "lease lost during processing, abandoning item"
                );
            }
        }
    }

    fn completion_for(
        &self,
        item_id: &str,
        state: WorkItemState,
        joined: Result<AppResult<HandlerOutcome>, JoinError>,
    ) -> Option<Completion> {
        match joined {
            Ok(Ok(HandlerOutcome::Transition(next_state))) => {
                Some(Completion::EndLease(LeaseCompletion::transition(next_state)))
            }
            Ok(Ok(HandlerOutcome::RetryLater)) => {
                Some(Completion::EndLease(LeaseCompletion::retry_later(state)))
            }
            Ok(Ok(HandlerOutcome::Delete)) => Some(Completion::Delete),
            Ok(Err(error)) => {
                warn!(
                    kind = %self.queue.kind(),
                    item_id = %item_id,
                    state = %state.as_str(),
                    error = %error,
                    "handler failed"
                );
                Some(Completion::EndLease(LeaseCompletion::failed(state)))
            }
            Err(join_error) if join_error.is_cancelled() => None,
            Err(join_error) => {
                error!(
                    kind = %self.queue.kind(),
                    item_id = %item_id,
                    state = %state.as_str(),
                    error = %join_error,
                    "handler panicked"
                );
                Some(Completion::EndLease(LeaseCompletion::failed(state)))
            }
        }
    }

    async fn finish(&self, item_id: &str, completion: Completion) {
        let result = match completion {
            Completion::EndLease(completion) => self
                .queue
                .end_lease(item_id, completion)
                .await
                .map(|item| {
                    info!(
                        kind = %self.queue.kind(),
                        item_id = %item_id,
                        state = %item.state().as_str(),
                        "work item released"
                    );
                }),
            Completion::Delete => self.queue.delete(item_id).await.map(|()| {
                info!(kind = %self.queue.kind(), item_id = %item_id, "work item deleted");
            }),
        };

        if let Err(error) = result {
            warn!(
                kind = %self.queue.kind(),
                item_id = %item_id,
                error = %error,
                "failed to complete work item, leaving it to lease expiry"
            );
        }
    }
}

async fn renew_until_stopped(
    queue: Arc<dyn WorkQueue>,
    clock: Arc<dyn Clock>,
    item_id: String,
    interval: Duration,
    stop: CancellationToken,
    lease_lost: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = stop.cancelled() => return,
            () = clock.sleep(interval) => {}
        }

        match queue.renew_lease(&item_id).await {
            Ok(item) => {
                debug!(
                    item_id = %item_id,
                    lease_expires = item.lease().expires_at(),
                    "lease renewed"
                );
            }
            Err(error) if error.is_lost_lease() || error.is_not_found() => {
                warn!(item_id = %item_id, error = %error, "lease lost");
                lease_lost.cancel();
                return;
            }
            Err(error) => {
                warn!(item_id = %item_id, error = %error, "failed to renew lease, retrying");
            }
        }
    }
}
