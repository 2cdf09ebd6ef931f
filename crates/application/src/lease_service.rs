use std::sync::Arc;

use fleetward_core::{AppError, AppResult, HolderId};
use fleetward_domain::{Document, PreCommitHook};
use tracing::debug;

use crate::coordination_ports::DocumentStore;
use crate::document_service::patch_with_retry;

/// Acquire, renew and release of the lease embedded in documents of one
/// collection, on behalf of one holder.
#[derive(Clone)]
pub struct LeaseManager<D: Document> {
    store: Arc<dyn DocumentStore<D>>,
    holder_id: HolderId,
    ttl_seconds: i64,
}

impl<D: Document> LeaseManager<D> {
    /// Creates a lease manager.
    #[must_use]
    pub fn new(
        store: Arc<dyn DocumentStore<D>>,
        holder_id: HolderId,
        ttl_seconds: i64,
    ) -> Self {
        Self {
            store,
            holder_id,
            ttl_seconds,
        }
    }

    /// Holder this manager acts for.
    #[must_use]
    pub fn holder_id(&self) -> HolderId {
        self.holder_id
    }

    /// Lease duration in seconds.
    #[must_use]
    pub fn ttl_seconds(&self) -> i64 {
        self.ttl_seconds
    }

    /// Underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn DocumentStore<D>> {
        &self.store
    }

    /// Hook stamping a fresh expiry at commit time.
    #[must_use]
    pub fn renew_hook(&self) -> PreCommitHook {
        PreCommitHook::StampLeaseExpiry {
            ttl_seconds: self.ttl_seconds,
        }
    }

    /// Tries to take the lease on one document.
    ///
    /// Returns `Ok(None)` when another holder has an unexpired lease or wins
    /// the write race. Neither case is an error. Expiry is compared with the
    /// store clock that stamped it.
    pub async fn try_acquire(&self, id: &str) -> AppResult<Option<D>> {
        let document = self.store.get(id).await?;
        let server_now = self.store.server_time().await?;
        if !document.lease().is_available_to(self.holder_id, server_now) {
            debug!(
                document_id = %id,
                holder_id = %self.holder_id,
                "lease held by another holder"
            );
            return Ok(None);
        }

        self.commit_claim(document, |_| {}).await
    }

    /// Writes a claim on an already-read document.
    ///
    /// `prepare` may apply further changes to the same write, such as
    /// counting a dequeue. A version conflict means another holder won.
    pub async fn commit_claim<F>(&self, mut document: D, prepare: F) -> AppResult<Option<D>>
    where
        F: FnOnce(&mut D) + Send,
    {
        let id = document.id().to_owned();
        document.lease_mut().claim(self.holder_id);
        prepare(&mut document);

        match self.store.replace(document, Some(self.renew_hook())).await {
            Ok(claimed) => Ok(Some(claimed)),
            Err(error) if error.is_version_conflict() => {
                debug!(
                    document_id = %id,
                    holder_id = %self.holder_id,
                    "lost lease claim race"
                );
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }

    /// Extends a held lease. Fails `LostLease` when another holder owns it.
    pub async fn renew(&self, id: &str) -> AppResult<D> {
        self.patch_with_lease(id, Some(self.renew_hook()), |_| Ok(()))
            .await
    }

    /// Clears owner and expiry of a held lease.
    pub async fn release(&self, id: &str) -> AppResult<D> {
        self.patch_with_lease(id, None, |document| {
            document.lease_mut().clear();
            Ok(())
        })
        .await
    }

    /// Patches a document only while this holder owns its lease.
    ///
    /// Ownership is re-checked on every read of the retry loop, so a lease
    /// lost between attempts aborts with `LostLease` and nothing is written.
    pub async fn patch_with_lease<F>(
        &self,
        id: &str,
        hook: Option<PreCommitHook>,
        mut mutate: F,
    ) -> AppResult<D>
    where
        F: FnMut(&mut D) -> AppResult<()> + Send,
    {
        let holder_id = self.holder_id;
        patch_with_retry(self.store.as_ref(), id, hook, |document| {
            if !document.lease().is_held_by(holder_id) {
                return Err(AppError::LostLease(document.id().to_owned()));
            }
            mutate(document)
        })
        .await
    }

    /// Deletes a document only while this holder owns its lease.
    pub async fn delete_with_lease(&self, id: &str) -> AppResult<()> {
        loop {
            let document = self.store.get(id).await?;
            if !document.lease().is_held_by(self.holder_id) {
                return Err(AppError::LostLease(id.to_owned()));
            }

            match self.store.delete(&document).await {
                Err(error) if error.is_version_conflict() => {
                    debug!(document_id = %id, "delete lost optimistic race, retrying");
                    tokio::task::yield_now().await;
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use fleetward_core::{AppError, HolderId};
    use fleetward_domain::{Document, WorkItem, WorkItemState};

    use super::LeaseManager;
    use crate::coordination_ports::{Clock, DocumentStore};
    use crate::test_support::{FakeDocumentStore, TestClock, work_item};

    struct Fixture {
        store: Arc<FakeDocumentStore<WorkItem>>,
        clock: Arc<TestClock>,
    }

    impl Fixture {
        async fn with_item() -> Self {
            let clock = Arc::new(TestClock::default());
            let store = Arc::new(FakeDocumentStore::new(clock.clone()));
            let created = store
                .create(work_item("cluster-a", WorkItemState::Pending), None)
                .await;
            assert!(created.is_ok());
            Self { store, clock }
        }

        fn manager(&self, holder_id: HolderId) -> LeaseManager<WorkItem> {
            LeaseManager::new(self.store.clone(), holder_id, 60)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_stamps_owner_and_server_expiry() {
        let fixture = Fixture::with_item().await;
        let holder_id = HolderId::new();
        let manager = fixture.manager(holder_id);
        let now = fixture.clock.now_unix();

        let acquired = manager.try_acquire("cluster-a").await;
        let acquired = acquired.unwrap_or_else(|_| unreachable!());
        let item = acquired.unwrap_or_else(|| unreachable!());

        assert!(item.lease().is_held_by(holder_id));
        assert_eq!(item.lease().expires_at(), now + 60);
    }

    #[tokio::test(start_paused = true)]
    async fn contended_lease_is_not_acquired() {
        let fixture = Fixture::with_item().await;
        let first = fixture.manager(HolderId::new());
        let second = fixture.manager(HolderId::new());

        assert!(matches!(first.try_acquire("cluster-a").await, Ok(Some(_))));
        assert!(matches!(second.try_acquire("cluster-a").await, Ok(None)));
    }

    #[tokio::test(start_paused = true)]
    async fn lost_claim_race_is_not_an_error() {
        let fixture = Fixture::with_item().await;
        fixture.store.inject_conflicts(1).await;

        let acquired = fixture.manager(HolderId::new()).try_acquire("cluster-a").await;
        assert!(matches!(acquired, Ok(None)));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_can_be_taken_over() {
        let fixture = Fixture::with_item().await;
        let first = fixture.manager(HolderId::new());
        let second_id = HolderId::new();
        let second = fixture.manager(second_id);

        assert!(matches!(first.try_acquire("cluster-a").await, Ok(Some(_))));
        tokio::time::advance(Duration::from_secs(61)).await;

        let taken = second.try_acquire("cluster-a").await;
        assert!(matches!(taken, Ok(Some(ref item)) if item.lease().is_held_by(second_id)));
        assert!(matches!(first.renew("cluster-a").await, Err(AppError::LostLease(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn renew_only_moves_expiry_forward() {
        let fixture = Fixture::with_item().await;
        let manager = fixture.manager(HolderId::new());
        let acquired = manager.try_acquire("cluster-a").await;
        let mut last_expiry = acquired
            .ok()
            .flatten()
            .map(|item| item.lease().expires_at())
            .unwrap_or_default();

        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(10)).await;
            let renewed = manager.renew("cluster-a").await;
            let expiry = renewed
                .map(|item| item.lease().expires_at())
                .unwrap_or_else(|_| unreachable!());
            assert!(expiry > last_expiry);
            last_expiry = expiry;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn renew_by_non_holder_fails_lost_lease() {
        let fixture = Fixture::with_item().await;
        let owner = fixture.manager(HolderId::new());
        assert!(matches!(owner.try_acquire("cluster-a").await, Ok(Some(_))));

        let intruder = fixture.manager(HolderId::new());
        assert!(matches!(intruder.renew("cluster-a").await, Err(AppError::LostLease(_))));
        assert!(matches!(intruder.release("cluster-a").await, Err(AppError::LostLease(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn release_makes_document_claimable_again() {
        let fixture = Fixture::with_item().await;
        let owner = fixture.manager(HolderId::new());
        assert!(matches!(owner.try_acquire("cluster-a").await, Ok(Some(_))));

        let released = owner.release("cluster-a").await;
        assert!(matches!(released, Ok(ref item) if item.lease().owner().is_none()));

        let next = fixture.manager(HolderId::new());
        assert!(matches!(next.try_acquire("cluster-a").await, Ok(Some(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn delete_requires_ownership() {
        let fixture = Fixture::with_item().await;
        let owner = fixture.manager(HolderId::new());
        let intruder = fixture.manager(HolderId::new());
        assert!(matches!(owner.try_acquire("cluster-a").await, Ok(Some(_))));

        assert!(matches!(
            intruder.delete_with_lease("cluster-a").await,
            Err(AppError::LostLease(_))
        ));
        assert!(owner.delete_with_lease("cluster-a").await.is_ok());
        assert!(matches!(
            fixture.store.get("cluster-a").await,
            Err(AppError::NotFound(_))
        ));
    }
}
