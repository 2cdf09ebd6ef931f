use fleetward_core::{AppError, AppResult, NonEmptyString};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::{Document, VersionToken};
use crate::lease::Lease;

/// Lifecycle state of one work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkItemState {
    /// Created upstream, waiting for provisioning.
    Pending,
    /// Provisioned resource with an update in flight.
    Active,
    /// Resource being torn down.
    Deleting,
    /// Last operation finished successfully.
    Succeeded,
    /// Last operation failed.
    Failed,
}

impl WorkItemState {
    /// States a worker may claim.
    pub const CLAIMABLE: [Self; 3] = [Self::Pending, Self::Active, Self::Deleting];

    /// Returns stable storage value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Active => "Active",
            Self::Deleting => "Deleting",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
        }
    }

    /// Parses storage value.
    pub fn parse(value: &str) -> AppResult<Self> {
        match value {
            "Pending" => Ok(Self::Pending),
            "Active" => Ok(Self::Active),
            "Deleting" => Ok(Self::Deleting),
            "Succeeded" => Ok(Self::Succeeded),
            "Failed" => Ok(Self::Failed),
            _ => Err(AppError::Validation(format!(
                "unknown work item state '{value}'"
            ))),
        }
    }

    /// Returns true when no further queue processing is expected.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Input for creating a new work item.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItemInput {
    /// Stable item id.
    pub id: String,
    /// Partition key, typically the owning subscription.
    pub partition_key: String,
    /// Initial state.
    pub state: WorkItemState,
    /// Monitoring bucket in `[0, bucket_count)`.
    pub bucket: u32,
    /// Domain payload handed to handlers and monitors.
    pub payload: Value,
}

/// Queued unit of work persisted in the document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    id: String,
    partition_key: String,
    state: WorkItemState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failed_state: Option<WorkItemState>,
    #[serde(flatten)]
    lease: Lease,
    #[serde(rename = "dequeues", default)]
    dequeue_count: u32,
    bucket: u32,
    #[serde(default)]
    payload: Value,
    #[serde(skip)]
    version: Option<VersionToken>,
}

impl WorkItem {
    /// Creates a validated, unleased work item.
    pub fn new(input: WorkItemInput) -> AppResult<Self> {
        let id = NonEmptyString::new(input.id)?;
        let partition_key = NonEmptyString::new(input.partition_key)?;

        Ok(Self {
            id: id.into(),
            partition_key: partition_key.into(),
            state: input.state,
            failed_state: None,
            lease: Lease::default(),
            dequeue_count: 0,
            bucket: input.bucket,
            payload: input.payload,
            version: None,
        })
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> WorkItemState {
        self.state
    }

    /// State the item was in when it last failed.
    #[must_use]
    pub fn failed_state(&self) -> Option<WorkItemState> {
        self.failed_state
    }

    /// Number of claims since the last successful lease end.
    #[must_use]
    pub fn dequeue_count(&self) -> u32 {
        self.dequeue_count
    }

    /// Monitoring bucket.
    #[must_use]
    pub fn bucket(&self) -> u32 {
        self.bucket
    }

    /// Domain payload.
    #[must_use]
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Counts one more claim.
    pub fn record_dequeue(&mut self) {
        self.dequeue_count = self.dequeue_count.saturating_add(1);
    }

    /// Returns true once the item was claimed more than `max_dequeues` times.
    #[must_use]
    pub fn is_poisoned(&self, max_dequeues: u32) -> bool {
        self.dequeue_count > max_dequeues
    }

    /// Moves to `next_state` and drops ownership.
    ///
    /// The dequeue counter survives failures so the poison threshold keeps
    /// counting; any other outcome resets it. Expiry is left to the caller
    /// so a release can either clear it or stamp a retry-later window.
    pub fn end_lease(&mut self, next_state: WorkItemState, failed_state: Option<WorkItemState>) {
        self.state = next_state;
        self.failed_state = failed_state;
        self.lease.disown();

        if next_state != WorkItemState::Failed {
            self.dequeue_count = 0;
        }
    }

    /// Returns a cache summary of this item.
    #[must_use]
    pub fn summary(&self) -> WorkItemSummary {
        WorkItemSummary {
            id: self.id.clone(),
            partition_key: self.partition_key.clone(),
            bucket: self.bucket,
            state: self.state,
            failed_state: self.failed_state,
            payload: self.payload.clone(),
        }
    }
}

impl Document for WorkItem {
    fn id(&self) -> &str {
        self.id.as_str()
    }

    fn partition_key(&self) -> &str {
        self.partition_key.as_str()
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

    fn queue_state(&self) -> Option<WorkItemState> {
        Some(self.state)
    }
}

/// Local cache view of a work item, populated from the change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItemSummary {
    /// Item id.
    pub id: String,
    /// Partition key.
    pub partition_key: String,
    /// Monitoring bucket.
    pub bucket: u32,
    /// Current state.
    pub state: WorkItemState,
    /// State at last failure.
    pub failed_state: Option<WorkItemState>,
    /// Domain payload.
    pub payload: Value,
}

impl WorkItemSummary {
    /// Returns true when the resource exists and should be monitored.
    ///
    /// Items still being created or torn down, including ones that failed
    /// during creation or deletion, have nothing to monitor.
    #[must_use]
    pub fn is_monitorable(&self) -> bool {
        match self.state {
            WorkItemState::Pending | WorkItemState::Deleting => false,
            WorkItemState::Failed => !matches!(
                self.failed_state,
                Some(WorkItemState::Pending | WorkItemState::Deleting)
            ),
            WorkItemState::Active | WorkItemState::Succeeded => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{WorkItem, WorkItemInput, WorkItemState};
    use crate::document::Document;

    fn pending_item() -> WorkItem {
        WorkItem::new(WorkItemInput {
            id: "cluster-a".to_owned(),
            partition_key: "sub-1".to_owned(),
            state: WorkItemState::Pending,
            bucket: 5,
            payload: json!({"region": "westeurope"}),
        })
        .unwrap_or_else(|_| unreachable!())
    }

    #[test]
    fn work_item_requires_id() {
        let item = WorkItem::new(WorkItemInput {
            id: " ".to_owned(),
            partition_key: "sub-1".to_owned(),
            state: WorkItemState::Pending,
            bucket: 0,
            payload: json!({}),
        });

        assert!(item.is_err());
    }

    #[test]
    fn state_storage_values_round_trip() {
        for state in [
            WorkItemState::Pending,
            WorkItemState::Active,
            WorkItemState::Deleting,
            WorkItemState::Succeeded,
            WorkItemState::Failed,
        ] {
            assert!(matches!(WorkItemState::parse(state.as_str()), Ok(parsed) if parsed == state));
        }
        assert!(WorkItemState::parse("Creating").is_err());
    }

    #[test]
    fn poison_threshold_is_strictly_greater() {
        let mut item = pending_item();
        for _ in 0..5 {
            item.record_dequeue();
        }
        assert!(!item.is_poisoned(5));

        item.record_dequeue();
        assert!(item.is_poisoned(5));
    }

    #[test]
    fn end_lease_keeps_dequeues_only_on_failure() {
        let mut item = pending_item();
        item.record_dequeue();
        item.record_dequeue();

        let mut failed = item.clone();
        failed.end_lease(WorkItemState::Failed, Some(WorkItemState::Pending));
        assert_eq!(failed.dequeue_count(), 2);
        assert_eq!(failed.failed_state(), Some(WorkItemState::Pending));

        item.end_lease(WorkItemState::Succeeded, None);
        assert_eq!(item.dequeue_count(), 0);
        assert!(item.lease().owner().is_none());
    }

    #[test]
    fn work_item_serializes_persisted_field_layout() {
        let mut item = pending_item();
        item.record_dequeue();
        let value = serde_json::to_value(&item).unwrap_or_default();

        assert_eq!(value["id"], json!("cluster-a"));
        assert_eq!(value["partitionKey"], json!("sub-1"));
        assert_eq!(value["state"], json!("Pending"));
        assert_eq!(value["dequeues"], json!(1));
        assert_eq!(value["bucket"], json!(5));
        assert_eq!(value["leaseExpires"], json!(0));
        assert!(value.get("leaseOwner").is_none());
    }

    #[test]
    fn monitorable_excludes_creation_and_deletion() {
        let mut summary = pending_item().summary();
        assert!(!summary.is_monitorable());

        summary.state = WorkItemState::Succeeded;
        assert!(summary.is_monitorable());

        summary.state = WorkItemState::Failed;
        summary.failed_state = Some(WorkItemState::Deleting);
        assert!(!summary.is_monitorable());

        summary.failed_state = Some(WorkItemState::Active);
        assert!(summary.is_monitorable());
    }
}
