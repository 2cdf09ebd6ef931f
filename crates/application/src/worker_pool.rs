//! Bounded-concurrency scheduler polling work queues.

use std::sync::Arc;
use std::time::Duration;

use fleetward_core::{AppError, AppResult};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::coordination_ports::{Clock, WorkItemHandler, WorkQueue};

mod execution;
mod gate;

pub use gate::{ConcurrencyGate, InFlightPermit};

use execution::WorkUnit;

/// Timing and threshold settings for work units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Sleep between polls that found no work.
    pub poll_interval: Duration,
    /// Interval between lease renewals of an in-flight item.
    pub renew_interval: Duration,
    /// Lease TTL in seconds; bounds `renew_interval`.
    pub lease_seconds: i64,
    /// Items claimed more often than this are failed without dispatch.
    pub max_dequeues: u32,
    /// Wait before deleting an item so change-feed readers see `Deleting`.
    pub delete_grace: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            renew_interval: Duration::from_secs(10),
            lease_seconds: 60,
            max_dequeues: 5,
            delete_grace: Duration::ZERO,
        }
    }
}

impl WorkerPoolConfig {
    /// Validates pool settings.
    pub fn validate(&self) -> AppResult<()> {
        if self.poll_interval.is_zero() {
            return Err(AppError::Validation(
                "poll interval must be greater than zero".to_owned(),
            ));
        }

        if self.lease_seconds <= 0 {
            return Err(AppError::Validation(
                "lease seconds must be greater than zero".to_owned(),
            ));
        }

        let max_renew_seconds = u64::try_from(self.lease_seconds / 3).unwrap_or_default();
        if self.renew_interval.is_zero()
            || self.renew_interval > Duration::from_secs(max_renew_seconds)
        {
            return Err(AppError::Validation(format!(
                "renew interval must be between 1s and a third of the lease ({max_renew_seconds}s)"
            )));
        }

        Ok(())
    }
}

#[derive(Clone)]
struct QueueLane {
    queue: Arc<dyn WorkQueue>,
    handler: Arc<dyn WorkItemHandler>,
}

/// Polls its queues in turn and runs each claimed item as an independent
/// unit, bounded by a gate that may be shared with other pools.
#[derive(Clone)]
pub struct WorkerPool {
    config: WorkerPoolConfig,
    gate: Arc<ConcurrencyGate>,
    clock: Arc<dyn Clock>,
    lanes: Vec<QueueLane>,
}

impl WorkerPool {
    /// Creates a pool without queues.
    pub fn new(
        config: WorkerPoolConfig,
        gate: Arc<ConcurrencyGate>,
        clock: Arc<dyn Clock>,
    ) -> AppResult<Self> {
        config.validate()?;

        Ok(Self {
            config,
            gate,
            clock,
            lanes: Vec::new(),
        })
    }

    /// Registers a queue kind and the handler for its items.
    #[must_use]
    pub fn with_queue(
        mut self,
        queue: Arc<dyn WorkQueue>,
        handler: Arc<dyn WorkItemHandler>,
    ) -> Self {
        self.lanes.push(QueueLane { queue, handler });
        self
    }

    /// Runs until `stop` fires, then waits for in-flight units to finish.
    ///
    /// Stopping only prevents new claims. Units already running keep their
    /// leases and complete normally.
    pub async fn run(&self, stop: CancellationToken) {
        let kinds: Vec<&str> = self.lanes.iter().map(|lane| lane.queue.kind()).collect();
        info!(
            kinds = ?kinds,
            max_in_flight = self.gate.max_in_flight(),
            "worker pool started"
        );

        let mut units = JoinSet::new();
        let mut next_lane = 0_usize;
        loop {
            while let Some(joined) = units.try_join_next() {
                log_unit_exit(joined);
            }

            let Some(permit) = self.gate.wait_for_slot(&stop).await else {
                break;
            };

            if self.claim_next(permit, &mut next_lane, &mut units).await {
                continue;
            }
            self.log_backlog().await;

            tokio::select! {
                biased;
                () = stop.cancelled() => break,
                () = self.clock.sleep(self.config.poll_interval) => {}
            }
        }

        info!(in_flight = units.len(), "worker pool draining");
        while let Some(joined) = units.join_next().await {
            log_unit_exit(joined);
        }
        info!("worker pool stopped");
    }

    /// Polls each lane once, starting at `next_lane`, and spawns the first
    /// claim. The lane after a successful one starts the next pass, so a
    /// backlog in one queue kind never starves the others.
    async fn claim_next(
        &self,
        permit: InFlightPermit,
        next_lane: &mut usize,
        units: &mut JoinSet<()>,
    ) -> bool {
        let lane_count = self.lanes.len();
        for offset in 0..lane_count {
            let index = (*next_lane + offset) % lane_count;
            let lane = &self.lanes[index];
            match lane.queue.dequeue().await {
                Ok(Some(item)) => {
                    let unit = WorkUnit {
                        queue: Arc::clone(&lane.queue),
                        handler: Arc::clone(&lane.handler),
                        clock: Arc::clone(&self.clock),
                        config: self.config,
                        item,
                    };
                    units.spawn(unit.run(permit));
                    *next_lane = (index + 1) % lane_count;
                    return true;
                }
                Ok(None) => {}
                Err(error) => {
                    warn!(
                        kind = %lane.queue.kind(),
                        error = %error,
                        "failed to dequeue work item"
                    );
                }
            }
        }

        false
    }

    async fn log_backlog(&self) {
        for lane in &self.lanes {
            match lane.queue.queue_length().await {
                Ok(0) => {}
                Ok(backlog) => {
                    debug!(kind = %lane.queue.kind(), backlog, "claimable items left unclaimed");
                }
                Err(error) => {
                    warn!(
                        kind = %lane.queue.kind(),
                        error = %error,
                        "failed to read queue length"
                    );
                }
            }
        }
    }
}

fn log_unit_exit(joined: Result<(), JoinError>) {
    if let Err(join_error) = joined {
        error!(error = %join_error, "work unit terminated abnormally");
    }
}
