use async_trait::async_trait;
use fleetward_core::AppResult;
use fleetward_domain::{Document, DocumentQuery, PreCommitHook};

/// One page of query results.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentPage<D> {
    /// Documents in store order.
    pub documents: Vec<D>,
    /// Cursor for the next page, `None` when exhausted.
    pub continuation: Option<String>,
}

/// One mutation observed through the change feed.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent<D> {
    /// Document created or replaced; carries the state after the write.
    Upserted(D),
    /// Document removed.
    Deleted {
        /// Id of the removed document.
        id: String,
    },
}

/// One page of the change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeFeedPage<D> {
    /// Changes ordered by write time. Empty once the feed is drained.
    pub changes: Vec<ChangeEvent<D>>,
    /// Cursor to resume from.
    pub continuation: Option<String>,
}

/// Optimistic-concurrency document store for one collection.
#[async_trait]
pub trait DocumentStore<D: Document>: Send + Sync {
    /// Creates a document, failing `AlreadyExists` when the id is taken.
    async fn create(&self, document: D, hook: Option<PreCommitHook>) -> AppResult<D>;

    /// Reads one document with its version, failing `NotFound`.
    async fn get(&self, id: &str) -> AppResult<D>;

    /// Replaces a document when its version still matches, failing
    /// `VersionConflict` otherwise. The hook runs before the check.
    async fn replace(&self, document: D, hook: Option<PreCommitHook>) -> AppResult<D>;

    /// Deletes a document when its version still matches.
    async fn delete(&self, document: &D) -> AppResult<()>;

    /// Runs one page of a query.
    async fn query(
        &self,
        query: &DocumentQuery,
        continuation: Option<String>,
    ) -> AppResult<DocumentPage<D>>;

    /// Reads changes after `continuation`, at least once each.
    async fn change_feed(
        &self,
        continuation: Option<String>,
        max_items: usize,
    ) -> AppResult<ChangeFeedPage<D>>;

    /// Current unix time on the store's clock, the clock lease hooks stamp
    /// expiries with. Lease expiry must be judged against this, never a
    /// caller clock.
    async fn server_time(&self) -> AppResult<i64>;

    /// Drops deletion records written before `deleted_before` (store time).
    ///
    /// A change-feed cursor older than the cutoff may miss those deletions.
    /// Returns the number of records dropped.
    async fn purge_deleted(&self, deleted_before: i64) -> AppResult<usize>;
}
