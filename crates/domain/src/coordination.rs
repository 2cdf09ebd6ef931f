use fleetward_core::HolderId;
use serde::{Deserialize, Serialize};

use crate::document::{Document, VersionToken};
use crate::lease::Lease;

/// Fixed id of the bucket assignment singleton.
pub const BUCKET_ASSIGNMENT_ID: &str = "master";

/// Default number of monitoring buckets.
pub const DEFAULT_BUCKET_COUNT: usize = 256;

/// Heartbeat document proving one holder is alive.
///
/// The embedded lease doubles as the registration TTL: each heartbeat
/// re-stamps it, and a registration whose lease ran out belongs to a dead
/// holder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HolderRegistration {
    id: String,
    holder_id: HolderId,
    #[serde(flatten)]
    lease: Lease,
    #[serde(skip)]
    version: Option<VersionToken>,
}

impl HolderRegistration {
    /// Creates a registration owned by `holder_id`.
    #[must_use]
    pub fn new(holder_id: HolderId) -> Self {
        let mut lease = Lease::default();
        lease.claim(holder_id);

        Self {
            id: holder_id.to_string(),
            holder_id,
            lease,
            version: None,
        }
    }

    /// Registered holder.
    #[must_use]
    pub fn holder_id(&self) -> HolderId {
        self.holder_id
    }
}

impl Document for HolderRegistration {
    fn id(&self) -> &str {
        self.id.as_str()
    }

    fn partition_key(&self) -> &str {
        self.id.as_str()
    }

    fn version(&self) -> Option<&VersionToken> {
        self.version.as_ref()
    }

    fn set_version(&mut self, version: Option<VersionToken>) {
        self.version = version;
    }

    fn lease(&self) -> &Lease {
        &self.lease
    }

    fn lease_mut(&mut self) -> &mut Lease {
        &mut self.lease
    }
}

/// Singleton mapping each monitoring bucket to its holder.
///
/// Only the holder of the embedded lease (the leader) mutates `buckets`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketAssignment {
    id: String,
    #[serde(flatten)]
    lease: Lease,
    buckets: Vec<Option<HolderId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    continuation: Option<String>,
    #[serde(skip)]
    version: Option<VersionToken>,
}

impl BucketAssignment {
    /// Creates an unassigned singleton with `bucket_count` slots.
    #[must_use]
    pub fn new(bucket_count: usize) -> Self {
        Self {
            id: BUCKET_ASSIGNMENT_ID.to_owned(),
            lease: Lease::default(),
            buckets: vec![None; bucket_count],
            continuation: None,
            version: None,
        }
    }

    /// Slot holders in bucket order.
    #[must_use]
    pub fn buckets(&self) -> &[Option<HolderId>] {
        &self.buckets
    }

    /// Replaces the slot holders.
    pub fn set_buckets(&mut self, buckets: Vec<Option<HolderId>>) {
        self.buckets = buckets;
    }

    /// Bucket indices assigned to `holder_id`.
    #[must_use]
    pub fn buckets_for(&self, holder_id: HolderId) -> Vec<u32> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, holder)| **holder == Some(holder_id))
            .filter_map(|(index, _)| u32::try_from(index).ok())
            .collect()
    }

    /// Change-feed cursor last published by the leader.
    #[must_use]
    pub fn continuation(&self) -> Option<&str> {
        self.continuation.as_deref()
    }

    /// Records the leader's change-feed cursor.
    pub fn set_continuation(&mut self, continuation: Option<String>) {
        self.continuation = continuation;
    }
}

impl Document for BucketAssignment {
    fn id(&self) -> &str {
        self.id.as_str()
    }

    fn partition_key(&self) -> &str {
        self.id.as_str()
    }

    fn version(&self) -> Option<&VersionToken> {
        self.version.as_ref()
    }

    fn set_version(&mut self, version: Option<VersionToken>) {
        self.version = version;
    }

    fn lease(&self) -> &Lease {
        &self.lease
    }

    fn lease_mut(&mut self) -> &mut Lease {
        &mut self.lease
    }
}
