//! Coordination documents, leases and the bucket balancer.

#![forbid(unsafe_code)]

mod bucket;
mod coordination;
mod document;
mod lease;
mod work_item;

pub use bucket::balance;
pub use coordination::{
    BUCKET_ASSIGNMENT_ID, BucketAssignment, DEFAULT_BUCKET_COUNT, HolderRegistration,
};
pub use document::{Document, DocumentQuery, PreCommitHook, VersionToken};
pub use lease::Lease;
pub use work_item::{WorkItem, WorkItemInput, WorkItemState, WorkItemSummary};
