use std::fmt::{Display, Formatter};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::lease::Lease;
use crate::work_item::WorkItemState;

/// Opaque version token returned by every store read.
///
/// Writes must carry the token they read; the store rejects a write whose
/// token no longer matches server-side state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionToken(String);

impl VersionToken {
    /// Wraps a store-issued token.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the raw token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for VersionToken {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.0.as_str())
    }
}

/// Document persisted in the coordination store.
///
/// Every coordinated document embeds a [`Lease`], so the same lease
/// primitive serves work items, holder heartbeats and leader election.
pub trait Document: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Stable document id, unique within its collection.
    fn id(&self) -> &str;

    /// Partition key used by partitioned stores.
    fn partition_key(&self) -> &str;

    /// Version token of the last read, `None` for unsaved documents.
    fn version(&self) -> Option<&VersionToken>;

    /// Replaces the version token. Only store implementations call this.
    fn set_version(&mut self, version: Option<VersionToken>);

    /// Embedded lease.
    fn lease(&self) -> &Lease;

    /// Mutable embedded lease.
    fn lease_mut(&mut self) -> &mut Lease;

    /// Queue state for dequeue queries. Documents that are not queue items
    /// return `None` and never match [`DocumentQuery::Claimable`].
    fn queue_state(&self) -> Option<WorkItemState> {
        None
    }
}

/// Server-side pre-commit hooks the store runs before validating a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreCommitHook {
    /// Stamps `leaseExpires = server_now + ttl_seconds`.
    StampLeaseExpiry {
        /// Lease duration in seconds.
        ttl_seconds: i64,
    },
}

impl PreCommitHook {
    /// Applies the hook to a document about to be committed.
    pub fn apply<D: Document>(&self, document: &mut D, server_now: i64) {
        match self {
            Self::StampLeaseExpiry { ttl_seconds } => document
                .lease_mut()
                .set_expires_at(server_now.saturating_add(*ttl_seconds)),
        }
    }
}

/// Enumerated store queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentQuery {
    /// Every document in the collection.
    All,
    /// Queue items in one of `states` whose lease expired before now.
    Claimable {
        /// States eligible for dequeue.
        states: Vec<WorkItemState>,
    },
    /// Documents whose lease is still running.
    LeaseUnexpired,
    /// Documents whose lease has run out.
    LeaseExpired,
}

impl DocumentQuery {
    /// Evaluates the predicate against one document at server time `now`.
    #[must_use]
    pub fn matches<D: Document>(&self, document: &D, now: i64) -> bool {
        match self {
            Self::All => true,
            Self::Claimable { states } => {
                document
                    .queue_state()
                    .is_some_and(|state| states.contains(&state))
                    && document.lease().expires_at() < now
            }
            Self::LeaseUnexpired => document.lease().is_active(now),
            Self::LeaseExpired => !document.lease().is_active(now),
        }
    }
}
