//! Local cache of work item summaries and the per-item monitors it drives.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use fleetward_core::{AppError, AppResult};
use fleetward_domain::WorkItemSummary;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::coordination_ports::{Clock, ItemMonitor};

/// Per-item monitoring cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Interval between checks of one item.
    pub interval: Duration,
    /// Upper bound on a single check.
    pub check_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            check_timeout: Duration::from_secs(50),
        }
    }
}

impl MonitorConfig {
    /// Validates monitor settings.
    pub fn validate(&self) -> AppResult<()> {
        if self.interval.is_zero() || self.check_timeout.is_zero() {
            return Err(AppError::Validation(
                "monitor interval and check timeout must be greater than zero".to_owned(),
            ));
        }

        if self.check_timeout > self.interval {
            return Err(AppError::Validation(
                "monitor check timeout must not exceed the monitor interval".to_owned(),
            ));
        }

        Ok(())
    }
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorCacheStats {
    /// Summaries held in the cache.
    pub cached_items: usize,
    /// Items with a running monitor.
    pub monitored_items: usize,
    /// Buckets owned by this process.
    pub owned_buckets: usize,
}

struct MonitorHandle {
    stop: CancellationToken,
    updates: watch::Sender<WorkItemSummary>,
    task: JoinHandle<()>,
}

struct CacheEntry {
    summary: WorkItemSummary,
    monitor: Option<MonitorHandle>,
}

#[derive(Default)]
struct CacheState {
    owned_buckets: BTreeSet<u32>,
    entries: HashMap<String, CacheEntry>,
}

/// Shared cache of item summaries and bucket ownership.
///
/// Every read and write happens under one lock. Monitor tasks never touch
/// the cache: they receive summary updates over a watch channel and stop
/// through the token captured when they were started.
pub struct MonitorCache {
    monitor: Arc<dyn ItemMonitor>,
    clock: Arc<dyn Clock>,
    config: MonitorConfig,
    state: Mutex<CacheState>,
}

impl MonitorCache {
    /// Creates an empty cache owning no buckets.
    pub fn new(
        monitor: Arc<dyn ItemMonitor>,
        clock: Arc<dyn Clock>,
        config: MonitorConfig,
    ) -> AppResult<Self> {
        config.validate()?;

        Ok(Self {
            monitor,
            clock,
            config,
            state: Mutex::new(CacheState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts or refreshes one summary, starting or stopping its monitor.
    pub fn upsert(&self, summary: WorkItemSummary) {
        let mut state = self.lock();
        let owned = state.owned_buckets.contains(&summary.bucket);
        let id = summary.id.clone();

        let entry = state.entries.entry(id).or_insert_with(|| CacheEntry {
            summary: summary.clone(),
            monitor: None,
        });
        entry.summary = summary;
        if let Some(handle) = &entry.monitor {
            handle.updates.send_replace(entry.summary.clone());
        }
        self.reconcile_entry(entry, owned);
    }

    /// Drops one summary and stops its monitor.
    pub fn evict(&self, id: &str) {
        let removed = self.lock().entries.remove(id);
        if let Some(CacheEntry {
            monitor: Some(handle),
            ..
        }) = removed
        {
            stop_monitor(id, handle);
        }
    }

    /// Replaces the owned bucket set and reconciles every cached item.
    ///
    /// Returns true when the set changed.
    pub fn set_owned_buckets(&self, owned_buckets: BTreeSet<u32>) -> bool {
        let mut state = self.lock();
        let changed = state.owned_buckets != owned_buckets;
        if changed {
            info!(
                owned_buckets = owned_buckets.len(),
                "owned bucket set changed"
            );
            state.owned_buckets = owned_buckets;
        }

        let CacheState {
            owned_buckets,
            entries,
        } = &mut *state;
        for entry in entries.values_mut() {
            let owned = owned_buckets.contains(&entry.summary.bucket);
            self.reconcile_entry(entry, owned);
        }

        changed
    }

    /// Current owned bucket set.
    #[must_use]
    pub fn owned_buckets(&self) -> BTreeSet<u32> {
        self.lock().owned_buckets.clone()
    }

    /// Returns true when a monitor runs for `id`.
    #[must_use]
    pub fn is_monitoring(&self, id: &str) -> bool {
        self.lock()
            .entries
            .get(id)
            .is_some_and(|entry| entry.monitor.is_some())
    }

    /// Returns true when `id` is cached.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.lock().entries.contains_key(id)
    }

    /// Cache counters.
    #[must_use]
    pub fn stats(&self) -> MonitorCacheStats {
        let state = self.lock();
        MonitorCacheStats {
            cached_items: state.entries.len(),
            monitored_items: state
                .entries
                .values()
                .filter(|entry| entry.monitor.is_some())
                .count(),
            owned_buckets: state.owned_buckets.len(),
        }
    }

    /// Stops every monitor and waits for the tasks to exit.
    pub async fn shutdown(&self) {
        let handles: Vec<MonitorHandle> = self
            .lock()
            .entries
            .values_mut()
            .filter_map(|entry| entry.monitor.take())
            .collect();

        let mut tasks = Vec::with_capacity(handles.len());
        for handle in handles {
            handle.stop.cancel();
            tasks.push(handle.task);
        }
        for task in tasks {
            if let Err(join_error) = task.await
                && !join_error.is_cancelled()
            {
                error!(error = %join_error, "monitor task terminated abnormally");
            }
        }
    }

    fn reconcile_entry(&self, entry: &mut CacheEntry, bucket_owned: bool) {
        let wanted = bucket_owned && entry.summary.is_monitorable();

        match (wanted, entry.monitor.is_some()) {
            (true, false) => {
                entry.monitor = Some(self.start_monitor(entry.summary.clone()));
            }
            (false, true) => {
                if let Some(handle) = entry.monitor.take() {
                    stop_monitor(&entry.summary.id, handle);
                }
            }
            _ => {}
        }
    }

    fn start_monitor(&self, summary: WorkItemSummary) -> MonitorHandle {
        debug!(item_id = %summary.id, bucket = summary.bucket, "starting item monitor");
        let stop = CancellationToken::new();
        let (updates, receiver) = watch::channel(summary);
        let task = tokio::spawn(monitor_item(
            Arc::clone(&self.monitor),
            Arc::clone(&self.clock),
            self.config,
            receiver,
            stop.clone(),
        ));

        MonitorHandle {
            stop,
            updates,
            task,
        }
    }
}

fn stop_monitor(id: &str, handle: MonitorHandle) {
    debug!(item_id = %id, "stopping item monitor");
    handle.stop.cancel();
}

async fn monitor_item(
    monitor: Arc<dyn ItemMonitor>,
    clock: Arc<dyn Clock>,
    config: MonitorConfig,
    mut updates: watch::Receiver<WorkItemSummary>,
    stop: CancellationToken,
) {
    loop {
        let summary = updates.borrow_and_update().clone();
        let item_id = summary.id.clone();
        let check_monitor = Arc::clone(&monitor);
        let mut check = tokio::spawn(async move { check_monitor.check(&summary).await });

        tokio::select! {
            biased;
            () = stop.cancelled() => {
                check.abort();
                return;
            }
            () = clock.sleep(config.check_timeout) => {
                check.abort();
                warn!(item_id = %item_id, "monitor check timed out");
            }
            joined = &mut check => match joined {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    warn!(item_id = %item_id, error = %error, "monitor check failed");
                }
                Err(join_error) => {
                    error!(item_id = %item_id, error = %join_error, "monitor check panicked");
                }
            },
        }

        tokio::select! {
            biased;
            () = stop.cancelled() => return,
            () = clock.sleep(config.interval) => {}
        }
    }
}
