//! Application services and ports.

#![forbid(unsafe_code)]

mod coordination_ports;
mod coordinator_service;
mod document_service;
mod lease_service;
mod monitor_cache;
mod work_queue_service;
mod worker_pool;

#[cfg(test)]
mod test_support;

pub use coordination_ports::{
    ChangeEvent, ChangeFeedPage, Clock, DocumentPage, DocumentStore, HandlerOutcome, ItemMonitor,
    LeaseCompletion, ReleasePolicy, WorkItemHandler, WorkQueue,
};
pub use coordinator_service::{Coordinator, CoordinatorConfig, CoordinatorStores};
pub use document_service::{create_if_absent, patch_with_retry, query_all};
pub use lease_service::LeaseManager;
pub use monitor_cache::{MonitorCache, MonitorCacheStats, MonitorConfig};
pub use work_queue_service::{DocumentWorkQueue, WorkQueueConfig};
pub use worker_pool::{ConcurrencyGate, InFlightPermit, WorkerPool, WorkerPoolConfig};
