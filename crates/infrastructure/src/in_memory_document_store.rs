use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use fleetward_application::{ChangeEvent, ChangeFeedPage, Clock, DocumentPage, DocumentStore};
use fleetward_core::{AppError, AppResult};
use fleetward_domain::{Document, DocumentQuery, PreCommitHook, VersionToken};
use rand::Rng;
use serde_json::Value;
use tokio::sync::Mutex;

const DEFAULT_PAGE_SIZE: usize = 100;

struct StoredDocument {
    body: Value,
    version: u64,
    change_seq: u64,
}

enum FeedEntry {
    Upserted(String),
    Deleted(String),
}

struct Tombstone {
    change_seq: u64,
    deleted_at: i64,
}

#[derive(Default)]
struct StoreState {
    documents: BTreeMap<String, StoredDocument>,
    tombstones: HashMap<String, Tombstone>,
    feed: BTreeMap<u64, FeedEntry>,
    next_seq: u64,
}

impl StoreState {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn record_upsert(&mut self, id: &str, body: Value, previous_seq: Option<u64>) -> u64 {
        if let Some(previous_seq) = previous_seq {
            self.feed.remove(&previous_seq);
        }
        if let Some(tombstone) = self.tombstones.remove(id) {
            self.feed.remove(&tombstone.change_seq);
        }

        let change_seq = self.next_seq();
        let version = change_seq;
        self.feed
            .insert(change_seq, FeedEntry::Upserted(id.to_owned()));
        self.documents.insert(
            id.to_owned(),
            StoredDocument {
                body,
                version,
                change_seq,
            },
        );
        version
    }
}

/// Process-local document store for one collection.
///
/// Documents are kept as JSON so they go through the same serialized layout
/// as a remote store. The change feed keeps only the latest change per id
/// plus tombstones for deletions until they are purged. Conflict injection
/// makes replaces fail at random, for exercising retry paths.
pub struct InMemoryDocumentStore<D> {
    clock: Arc<dyn Clock>,
    page_size: usize,
    conflict_rate: f64,
    state: Mutex<StoreState>,
    marker: PhantomData<fn() -> D>,
}

impl<D: Document> InMemoryDocumentStore<D> {
    /// Creates an empty store stamping lease hooks with `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            page_size: DEFAULT_PAGE_SIZE,
            conflict_rate: 0.0,
            state: Mutex::new(StoreState::default()),
            marker: PhantomData,
        }
    }

    /// Sets the query page size.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Makes each replace fail with a version conflict with probability
    /// `rate`.
    #[must_use]
    pub fn with_conflict_rate(mut self, rate: f64) -> Self {
        self.conflict_rate = rate.clamp(0.0, 0.95);
        self
    }

    fn encode(&self, mut document: D, hook: Option<PreCommitHook>) -> AppResult<Value> {
        if let Some(hook) = hook {
            hook.apply(&mut document, self.clock.now_unix());
        }

        serde_json::to_value(&document).map_err(|error| {
            AppError::Internal(format!(
                "failed to serialize document '{}': {error}",
                document.id()
            ))
        })
    }

    fn decode(id: &str, stored: &StoredDocument) -> AppResult<D> {
        let mut document: D = serde_json::from_value(stored.body.clone()).map_err(|error| {
            AppError::Internal(format!("failed to deserialize document '{id}': {error}"))
        })?;
        document.set_version(Some(VersionToken::new(stored.version.to_string())));
        Ok(document)
    }

    fn inject_conflict(&self) -> bool {
        self.conflict_rate > 0.0 && rand::thread_rng().gen_bool(self.conflict_rate)
    }
}

fn parse_cursor(continuation: Option<String>) -> AppResult<u64> {
    continuation.map_or(Ok(0), |value| {
        value
            .parse::<u64>()
            .map_err(|_| AppError::Validation(format!("invalid continuation token '{value}'")))
    })
}

fn expected_version(id: &str, version: Option<&VersionToken>) -> AppResult<u64> {
    version
        .ok_or_else(|| AppError::Validation(format!("document '{id}' was never read")))?
        .as_str()
        .parse::<u64>()
        .map_err(|_| AppError::Validation(format!("document '{id}' has a foreign version token")))
}

#[async_trait]
impl<D: Document> DocumentStore<D> for InMemoryDocumentStore<D> {
    async fn create(&self, document: D, hook: Option<PreCommitHook>) -> AppResult<D> {
        let id = document.id().to_owned();
        let body = self.encode(document, hook)?;

        let mut state = self.state.lock().await;
        if state.documents.contains_key(&id) {
            return Err(AppError::AlreadyExists(id));
        }

        state.record_upsert(&id, body, None);
        let stored = state
            .documents
            .get(&id)
            .ok_or_else(|| AppError::Internal(format!("document '{id}' vanished on create")))?;
        Self::decode(&id, stored)
    }

    async fn get(&self, id: &str) -> AppResult<D> {
        let state = self.state.lock().await;
        let stored = state
            .documents
            .get(id)
            .ok_or_else(|| AppError::NotFound(id.to_owned()))?;
        Self::decode(id, stored)
    }

    async fn replace(&self, document: D, hook: Option<PreCommitHook>) -> AppResult<D> {
        let id = document.id().to_owned();
        let expected = expected_version(&id, document.version())?;
        let body = self.encode(document, hook)?;

        let mut state = self.state.lock().await;
        let (current_version, current_seq) = state
            .documents
            .get(&id)
            .map(|stored| (stored.version, stored.change_seq))
            .ok_or_else(|| AppError::NotFound(id.clone()))?;

        if current_version != expected || self.inject_conflict() {
            return Err(AppError::VersionConflict(id));
        }

        state.record_upsert(&id, body, Some(current_seq));
        let stored = state
            .documents
            .get(&id)
            .ok_or_else(|| AppError::Internal(format!("document '{id}' vanished on replace")))?;
        Self::decode(&id, stored)
    }

    async fn delete(&self, document: &D) -> AppResult<()> {
        let id = document.id();
        let expected = expected_version(id, document.version())?;

        let mut state = self.state.lock().await;
        let current = state
            .documents
            .get(id)
            .ok_or_else(|| AppError::NotFound(id.to_owned()))?;
        if current.version != expected {
            return Err(AppError::VersionConflict(id.to_owned()));
        }

        let previous_seq = current.change_seq;
        state.documents.remove(id);
        state.feed.remove(&previous_seq);
        let tombstone_seq = state.next_seq();
        state
            .feed
            .insert(tombstone_seq, FeedEntry::Deleted(id.to_owned()));
        state.tombstones.insert(
            id.to_owned(),
            Tombstone {
                change_seq: tombstone_seq,
                deleted_at: self.clock.now_unix(),
            },
        );
        Ok(())
    }

    async fn query(
        &self,
        query: &DocumentQuery,
        continuation: Option<String>,
    ) -> AppResult<DocumentPage<D>> {
        let now = self.clock.now_unix();
        let state = self.state.lock().await;

        let mut documents = Vec::new();
        let mut last_id = None;
        let start = continuation.unwrap_or_default();
        let range = state
            .documents
            .range::<str, _>((
                std::ops::Bound::Excluded(start.as_str()),
                std::ops::Bound::Unbounded,
            ));

        for (id, stored) in range {
            if documents.len() == self.page_size {
                break;
            }

            let document = Self::decode(id, stored)?;
            if query.matches(&document, now) {
                documents.push(document);
            }
            last_id = Some(id.clone());
        }

        let exhausted = last_id.as_ref().is_none_or(|last| {
            state
                .documents
                .range::<str, _>((
                    std::ops::Bound::Excluded(last.as_str()),
                    std::ops::Bound::Unbounded,
                ))
                .next()
                .is_none()
        });

        Ok(DocumentPage {
            documents,
            continuation: if exhausted { None } else { last_id },
        })
    }

    async fn change_feed(
        &self,
        continuation: Option<String>,
        max_items: usize,
    ) -> AppResult<ChangeFeedPage<D>> {
        let cursor = parse_cursor(continuation)?;
        let state = self.state.lock().await;

        let mut changes = Vec::new();
        let mut last_seq = cursor;
        for (seq, entry) in state.feed.range(cursor.saturating_add(1)..).take(max_items.max(1)) {
            let change = match entry {
                FeedEntry::Upserted(id) => {
                    let stored = state.documents.get(id).ok_or_else(|| {
                        AppError::Internal(format!("change feed entry for missing '{id}'"))
                    })?;
                    ChangeEvent::Upserted(Self::decode(id, stored)?)
                }
                FeedEntry::Deleted(id) => ChangeEvent::Deleted { id: id.clone() },
            };
            changes.push(change);
            last_seq = *seq;
        }

        Ok(ChangeFeedPage {
            changes,
            continuation: Some(last_seq.to_string()),
        })
    }

    async fn server_time(&self) -> AppResult<i64> {
        Ok(self.clock.now_unix())
    }

    async fn purge_deleted(&self, deleted_before: i64) -> AppResult<usize> {
        let mut state = self.state.lock().await;
        let expired: Vec<(String, u64)> = state
            .tombstones
            .iter()
            .filter(|(_, tombstone)| tombstone.deleted_at < deleted_before)
            .map(|(id, tombstone)| (id.clone(), tombstone.change_seq))
            .collect();

        for (id, change_seq) in &expired {
            state.tombstones.remove(id);
            state.feed.remove(change_seq);
        }
        Ok(expired.len())
    }
}
