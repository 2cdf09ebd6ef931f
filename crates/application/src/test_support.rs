use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleetward_core::{AppError, AppResult};
use fleetward_domain::{
    Document, DocumentQuery, PreCommitHook, VersionToken, WorkItem, WorkItemInput, WorkItemState,
};
use serde_json::json;
use tokio::sync::Mutex;

use crate::coordination_ports::{ChangeEvent, ChangeFeedPage, Clock, DocumentPage, DocumentStore};

const TEST_EPOCH: i64 = 1_700_000_000;

/// Clock on tokio time; under `start_paused` it advances only virtually.
pub(crate) struct TestClock {
    origin: tokio::time::Instant,
    offset_seconds: i64,
}

impl Default for TestClock {
    fn default() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
            offset_seconds: 0,
        }
    }
}

impl TestClock {
    /// Clock reading `offset_seconds` ahead of a default one.
    pub(crate) fn ahead_by(offset_seconds: i64) -> Self {
        Self {
            offset_seconds,
            ..Self::default()
        }
    }
}

#[async_trait]
impl Clock for TestClock {
    fn now_unix(&self) -> i64 {
        TEST_EPOCH
            + self.offset_seconds
            + i64::try_from(self.origin.elapsed().as_secs()).unwrap_or(i64::MAX / 2)
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

struct FakeStoreState<D> {
    documents: BTreeMap<String, D>,
    next_version: u64,
    changes: Vec<ChangeEvent<D>>,
    conflicts_remaining: usize,
    replace_calls: usize,
    purge_cutoffs: Vec<i64>,
}

pub(crate) struct FakeDocumentStore<D> {
    clock: Arc<dyn Clock>,
    page_size: usize,
    state: Mutex<FakeStoreState<D>>,
}

impl<D> Default for FakeDocumentStore<D> {
    fn default() -> Self {
        Self::new(Arc::new(TestClock::default()))
    }
}

impl<D> FakeDocumentStore<D> {
    pub(crate) fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            page_size: 100,
            state: Mutex::new(FakeStoreState {
                documents: BTreeMap::new(),
                next_version: 1,
                changes: Vec::new(),
                conflicts_remaining: 0,
                replace_calls: 0,
                purge_cutoffs: Vec::new(),
            }),
        }
    }

    pub(crate) fn with_page_size(page_size: usize) -> Self {
        let mut store = Self::default();
        store.page_size = page_size;
        store
    }

    pub(crate) async fn inject_conflicts(&self, count: usize) {
        self.state.lock().await.conflicts_remaining = count;
    }

    pub(crate) async fn replace_calls(&self) -> usize {
        self.state.lock().await.replace_calls
    }

    pub(crate) async fn purge_cutoffs(&self) -> Vec<i64> {
        self.state.lock().await.purge_cutoffs.clone()
    }
}

impl<D: Document> FakeStoreState<D> {
    fn commit(&mut self, mut document: D, hook: Option<PreCommitHook>, now: i64) -> D {
        if let Some(hook) = hook {
            hook.apply(&mut document, now);
        }
        document.set_version(Some(VersionToken::new(self.next_version.to_string())));
        self.next_version += 1;
        self.documents
            .insert(document.id().to_owned(), document.clone());
        self.changes.push(ChangeEvent::Upserted(document.clone()));
        document
    }
}

#[async_trait]
impl<D: Document> DocumentStore<D> for FakeDocumentStore<D> {
    async fn create(&self, document: D, hook: Option<PreCommitHook>) -> AppResult<D> {
        let mut state = self.state.lock().await;
        if state.documents.contains_key(document.id()) {
            return Err(AppError::AlreadyExists(document.id().to_owned()));
        }
        Ok(state.commit(document, hook, self.clock.now_unix()))
    }

    async fn get(&self, id: &str) -> AppResult<D> {
        self.state
            .lock()
            .await
            .documents
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(id.to_owned()))
    }

    async fn replace(&self, document: D, hook: Option<PreCommitHook>) -> AppResult<D> {
        let mut state = self.state.lock().await;
        state.replace_calls += 1;
        if state.conflicts_remaining > 0 {
            state.conflicts_remaining -= 1;
            return Err(AppError::VersionConflict(document.id().to_owned()));
        }

        let current = state
            .documents
            .get(document.id())
            .ok_or_else(|| AppError::NotFound(document.id().to_owned()))?;
        if current.version() != document.version() {
            return Err(AppError::VersionConflict(document.id().to_owned()));
        }

        Ok(state.commit(document, hook, self.clock.now_unix()))
    }

    async fn delete(&self, document: &D) -> AppResult<()> {
        let mut state = self.state.lock().await;
        let current = state
            .documents
            .get(document.id())
            .ok_or_else(|| AppError::NotFound(document.id().to_owned()))?;
        if current.version() != document.version() {
            return Err(AppError::VersionConflict(document.id().to_owned()));
        }

        state.documents.remove(document.id());
        state.changes.push(ChangeEvent::Deleted {
            id: document.id().to_owned(),
        });
        Ok(())
    }

    async fn query(
        &self,
        query: &DocumentQuery,
        continuation: Option<String>,
    ) -> AppResult<DocumentPage<D>> {
        let offset = continuation
            .map(|value| value.parse::<usize>().unwrap_or_default())
            .unwrap_or_default();
        let now = self.clock.now_unix();
        let state = self.state.lock().await;
        let matching: Vec<D> = state
            .documents
            .values()
            .filter(|document| query.matches(*document, now))
            .cloned()
            .collect();

        let end = (offset + self.page_size).min(matching.len());
        let documents = matching.get(offset..end).map(<[D]>::to_vec).unwrap_or_default();
        let continuation = (end < matching.len()).then(|| end.to_string());
        Ok(DocumentPage {
            documents,
            continuation,
        })
    }

    async fn change_feed(
        &self,
        continuation: Option<String>,
        max_items: usize,
    ) -> AppResult<ChangeFeedPage<D>> {
        let offset = continuation
            .map(|value| value.parse::<usize>().unwrap_or_default())
            .unwrap_or_default();
        let state = self.state.lock().await;
        let end = (offset + max_items).min(state.changes.len());
        let changes = state
            .changes
            .get(offset..end)
            .map(<[ChangeEvent<D>]>::to_vec)
            .unwrap_or_default();
        Ok(ChangeFeedPage {
            changes,
            continuation: Some(end.max(offset).to_string()),
        })
    }

    async fn server_time(&self) -> AppResult<i64> {
        Ok(self.clock.now_unix())
    }

    // Cursors are offsets into the full history, so nothing is dropped.
    async fn purge_deleted(&self, deleted_before: i64) -> AppResult<usize> {
        self.state.lock().await.purge_cutoffs.push(deleted_before);
        Ok(0)
    }
}

pub(crate) fn work_item(id: &str, state: WorkItemState) -> WorkItem {
    WorkItem::new(WorkItemInput {
        id: id.to_owned(),
        partition_key: "sub-1".to_owned(),
        state,
        bucket: 0,
        payload: json!({"name": id}),
    })
    .unwrap_or_else(|_| unreachable!())
}

pub(crate) fn work_item_in_bucket(id: &str, state: WorkItemState, bucket: u32) -> WorkItem {
    WorkItem::new(WorkItemInput {
        id: id.to_owned(),
        partition_key: "sub-1".to_owned(),
        state,
        bucket,
        payload: json!({"name": id}),
    })
    .unwrap_or_else(|_| unreachable!())
}
