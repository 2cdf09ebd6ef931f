//! Heartbeats, leader election, bucket balancing and follower reconciliation.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use fleetward_core::{AppError, AppResult, HolderId};
use fleetward_domain::{
    BUCKET_ASSIGNMENT_ID, BucketAssignment, DEFAULT_BUCKET_COUNT, Document, DocumentQuery,
    HolderRegistration, PreCommitHook, WorkItem, balance,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordination_ports::{ChangeEvent, Clock, DocumentStore};
use crate::document_service::{create_if_absent, patch_with_retry, query_all};
use crate::lease_service::LeaseManager;
use crate::monitor_cache::{MonitorCache, MonitorCacheStats};

/// Coordinator cadence and sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Interval between heartbeat, election and reconciliation passes.
    pub tick_interval: Duration,
    /// Lifetime of a holder registration without a heartbeat.
    pub heartbeat_ttl_seconds: i64,
    /// Lifetime of the leader lease without a renewal.
    pub leader_lease_seconds: i64,
    /// Number of monitoring buckets.
    pub bucket_count: usize,
    /// Interval between change-feed passes.
    pub change_feed_interval: Duration,
    /// Changes requested per change-feed page.
    pub change_feed_page_size: usize,
    /// How long deletion records stay readable through the change feed.
    pub tombstone_retention: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(10),
            heartbeat_ttl_seconds: 60,
            leader_lease_seconds: 60,
            bucket_count: DEFAULT_BUCKET_COUNT,
            change_feed_interval: Duration::from_secs(10),
            change_feed_page_size: 100,
            tombstone_retention: Duration::from_secs(3600),
        }
    }
}

impl CoordinatorConfig {
    /// Validates coordinator settings.
    pub fn validate(&self) -> AppResult<()> {
        if self.tick_interval.is_zero() || self.change_feed_interval.is_zero() {
            return Err(AppError::Validation(
                "coordinator intervals must be greater than zero".to_owned(),
            ));
        }

        if self.bucket_count == 0 || self.change_feed_page_size == 0 {
            return Err(AppError::Validation(
                "bucket count and change feed page size must be greater than zero".to_owned(),
            ));
        }

        if self.tombstone_retention < self.change_feed_interval.saturating_mul(3) {
            return Err(AppError::Validation(
                "tombstone retention must cover at least three change feed intervals".to_owned(),
            ));
        }

        let shortest_ttl = self.heartbeat_ttl_seconds.min(self.leader_lease_seconds);
        let shortest_ttl = u64::try_from(shortest_ttl).unwrap_or_default();
        if self.tick_interval.saturating_mul(3) > Duration::from_secs(shortest_ttl) {
            return Err(AppError::Validation(format!(
                "tick interval must be at most a third of the heartbeat and leader TTLs ({shortest_ttl}s)"
            )));
        }

        Ok(())
    }
}

/// Document collections the coordinator works on.
#[derive(Clone)]
pub struct CoordinatorStores {
    /// Holder heartbeats.
    pub registrations: Arc<dyn DocumentStore<HolderRegistration>>,
    /// Bucket assignment singleton.
    pub assignments: Arc<dyn DocumentStore<BucketAssignment>>,
    /// Work items, read through the change feed.
    pub items: Arc<dyn DocumentStore<WorkItem>>,
}

/// Per-process coordination loop.
///
/// Every process heartbeats and follows the published assignment; the one
/// holding the assignment lease also rebalances and publishes it.
pub struct Coordinator {
    holder_id: HolderId,
    config: CoordinatorConfig,
    clock: Arc<dyn Clock>,
    registrations: Arc<dyn DocumentStore<HolderRegistration>>,
    items: Arc<dyn DocumentStore<WorkItem>>,
    leadership: LeaseManager<BucketAssignment>,
    cache: Arc<MonitorCache>,
    is_leader: AtomicBool,
    feed_cursor: Mutex<Option<String>>,
    last_change_feed_at: AtomicI64,
}

impl Coordinator {
    /// Creates a coordinator for `holder_id`.
    pub fn new(
        holder_id: HolderId,
        config: CoordinatorConfig,
        stores: CoordinatorStores,
        cache: Arc<MonitorCache>,
        clock: Arc<dyn Clock>,
    ) -> AppResult<Self> {
        config.validate()?;

        let leadership =
            LeaseManager::new(stores.assignments, holder_id, config.leader_lease_seconds);

        Ok(Self {
            holder_id,
            config,
            clock,
            registrations: stores.registrations,
            items: stores.items,
            leadership,
            cache,
            is_leader: AtomicBool::new(false),
            feed_cursor: Mutex::new(None),
            last_change_feed_at: AtomicI64::new(0),
        })
    }

    /// Process holder id.
    #[must_use]
    pub fn holder_id(&self) -> HolderId {
        self.holder_id
    }

    /// Returns true while this process believes it leads.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Time of the last complete change-feed pass, if any.
    #[must_use]
    pub fn last_change_feed_at(&self) -> Option<i64> {
        match self.last_change_feed_at.load(Ordering::SeqCst) {
            0 => None,
            at => Some(at),
        }
    }

    /// Local cache counters.
    #[must_use]
    pub fn cache_stats(&self) -> MonitorCacheStats {
        self.cache.stats()
    }

    /// Creates the assignment singleton unless it already exists.
    pub async fn initialize(&self) -> AppResult<()> {
        create_if_absent(
            self.leadership.store().as_ref(),
            BucketAssignment::new(self.config.bucket_count),
        )
        .await
    }

    /// Writes or renews this process's registration.
    pub async fn heartbeat(&self) -> AppResult<()> {
        let hook = Some(PreCommitHook::StampLeaseExpiry {
            ttl_seconds: self.config.heartbeat_ttl_seconds,
        });
        let holder_id = self.holder_id;
        let registration_id = holder_id.to_string();

        let renewed = patch_with_retry(
            self.registrations.as_ref(),
            registration_id.as_str(),
            hook,
            |registration| {
                registration.lease_mut().claim(holder_id);
                Ok(())
            },
        )
        .await;

        match renewed {
            Ok(_) => Ok(()),
            Err(error) if error.is_not_found() => {
                info!(holder_id = %holder_id, "registering holder");
                match self
                    .registrations
                    .create(HolderRegistration::new(holder_id), hook)
                    .await
                {
                    Ok(_) => Ok(()),
                    Err(error) if error.is_already_exists() => Ok(()),
                    Err(error) => Err(error),
                }
            }
            Err(error) => Err(error),
        }
    }

    /// Runs one election and, when leading, one rebalance.
    pub async fn coordinate(&self) -> AppResult<()> {
        if !self.is_leader() {
            if self
                .leadership
                .try_acquire(BUCKET_ASSIGNMENT_ID)
                .await?
                .is_none()
            {
                return Ok(());
            }

            info!(holder_id = %self.holder_id, "acquired bucket assignment leadership");
            self.is_leader.store(true, Ordering::SeqCst);
        }

        let live_holders: BTreeSet<HolderId> =
            query_all(self.registrations.as_ref(), &DocumentQuery::LeaseUnexpired)
                .await?
                .iter()
                .map(HolderRegistration::holder_id)
                .collect();
        let continuation = self.feed_cursor.lock().await.clone();
        let bucket_count = self.config.bucket_count;
        let mut moved = 0_usize;

        let published = self
            .leadership
            .patch_with_lease(
                BUCKET_ASSIGNMENT_ID,
                Some(self.leadership.renew_hook()),
                |assignment| {
                    let balanced = balance(assignment.buckets(), &live_holders, bucket_count);
                    moved = assignment
                        .buckets()
                        .iter()
                        .zip(&balanced)
                        .filter(|(before, after)| before != after)
                        .count()
                        + bucket_count.saturating_sub(assignment.buckets().len());
                    assignment.set_buckets(balanced);
                    assignment.set_continuation(continuation.clone());
                    Ok(())
                },
            )
            .await;

        match published {
            Ok(_) => {
                if moved > 0 {
                    info!(
                        holder_id = %self.holder_id,
                        live_holders = live_holders.len(),
                        moved_buckets = moved,
                        "published bucket assignment"
                    );
                }
            }
            Err(error) if error.is_lost_lease() => {
                warn!(holder_id = %self.holder_id, "lost bucket assignment leadership");
                self.is_leader.store(false, Ordering::SeqCst);
                return Ok(());
            }
            Err(error) => return Err(error),
        }

        self.prune_expired_registrations().await?;
        self.purge_tombstones().await
    }

    async fn purge_tombstones(&self) -> AppResult<()> {
        let retention =
            i64::try_from(self.config.tombstone_retention.as_secs()).unwrap_or(i64::MAX);
        let cutoff = self.items.server_time().await?.saturating_sub(retention);

        let items = self.items.purge_deleted(cutoff).await?;
        let registrations = self.registrations.purge_deleted(cutoff).await?;
        if items > 0 || registrations > 0 {
            debug!(items, registrations, "purged expired tombstones");
        }
        Ok(())
    }

    async fn prune_expired_registrations(&self) -> AppResult<()> {
        let expired =
            query_all(self.registrations.as_ref(), &DocumentQuery::LeaseExpired).await?;

        for registration in expired {
            match self.registrations.delete(&registration).await {
                Ok(()) => {
                    info!(
                        holder_id = %registration.holder_id(),
                        "pruned expired holder registration"
                    );
                }
                Err(error) if error.is_version_conflict() || error.is_not_found() => {
                    debug!(
                        holder_id = %registration.holder_id(),
                        "registration changed while pruning"
                    );
                }
                Err(error) => return Err(error),
            }
        }

        Ok(())
    }

    /// Reads the published assignment and reconciles local monitors.
    pub async fn refresh_buckets(&self) -> AppResult<()> {
        let assignment = self.leadership.store().get(BUCKET_ASSIGNMENT_ID).await?;
        let owned: BTreeSet<u32> = assignment
            .buckets_for(self.holder_id)
            .into_iter()
            .collect();
        self.cache.set_owned_buckets(owned);
        Ok(())
    }

    /// Reads the item change feed to exhaustion into the local cache.
    ///
    /// Returns the number of changes applied.
    pub async fn consume_change_feed(&self) -> AppResult<usize> {
        let mut cursor = self.feed_cursor.lock().await;
        let mut applied = 0_usize;

        loop {
            let page = self
                .items
                .change_feed(cursor.clone(), self.config.change_feed_page_size)
                .await?;
            if page.continuation.is_some() {
                *cursor = page.continuation;
            }
            if page.changes.is_empty() {
                break;
            }

            applied = applied.saturating_add(page.changes.len());
            for change in page.changes {
                match change {
                    ChangeEvent::Upserted(item) => self.cache.upsert(item.summary()),
                    ChangeEvent::Deleted { id } => self.cache.evict(id.as_str()),
                }
            }
        }

        self.last_change_feed_at
            .store(self.clock.now_unix(), Ordering::SeqCst);
        if applied > 0 {
            debug!(applied, "consumed item change feed");
        }
        Ok(applied)
    }

    /// One heartbeat, election and reconciliation pass.
    ///
    /// Each step logs its own failure so one broken step never skips the
    /// others.
    pub async fn tick(&self) {
        if let Err(error) = self.heartbeat().await {
            warn!(holder_id = %self.holder_id, error = %error, "heartbeat failed");
        }

        if let Err(error) = self.coordinate().await {
            warn!(holder_id = %self.holder_id, error = %error, "bucket coordination failed");
        }

        if let Err(error) = self.refresh_buckets().await {
            warn!(holder_id = %self.holder_id, error = %error, "bucket refresh failed");
        }
    }

    /// Runs the tick and change-feed loops until `stop` fires.
    pub async fn run(&self, stop: CancellationToken) {
        info!(
            holder_id = %self.holder_id,
            bucket_count = self.config.bucket_count,
            "coordinator started"
        );

        tokio::join!(self.run_ticks(&stop), self.run_change_feed(&stop));

        if self.is_leader() {
            match self.leadership.release(BUCKET_ASSIGNMENT_ID).await {
                Ok(_) => {
                    info!(holder_id = %self.holder_id, "released bucket assignment leadership");
                }
                Err(error) => {
                    warn!(
                        holder_id = %self.holder_id,
                        error = %error,
                        "failed to release leadership"
                    );
                }
            }
            self.is_leader.store(false, Ordering::SeqCst);
        }

        self.cache.shutdown().await;
        info!(holder_id = %self.holder_id, "coordinator stopped");
    }

    async fn run_ticks(&self, stop: &CancellationToken) {
        let mut initialized = false;

        loop {
            if !initialized {
                match self.initialize().await {
                    Ok(()) => initialized = true,
                    Err(error) => {
                        warn!(error = %error, "failed to create bucket assignment");
                    }
                }
            }

            if initialized {
                self.tick().await;
            }

            tokio::select! {
                biased;
                () = stop.cancelled() => return,
                () = self.clock.sleep(self.config.tick_interval) => {}
            }
        }
    }

    async fn run_change_feed(&self, stop: &CancellationToken) {
        loop {
            if let Err(error) = self.consume_change_feed().await {
                warn!(error = %error, "change feed pass failed");
            }

            tokio::select! {
                biased;
                () = stop.cancelled() => return,
                () = self.clock.sleep(self.config.change_feed_interval) => {}
            }
        }
    }
}
