//! Infrastructure adapters for application ports.

#![forbid(unsafe_code)]

mod http_work_item_handler;
mod in_memory_document_store;
mod logging_item_monitor;
mod manual_clock;
mod postgres_document_store;
mod system_clock;

pub use http_work_item_handler::HttpWorkItemHandler;
pub use in_memory_document_store::InMemoryDocumentStore;
pub use logging_item_monitor::LoggingItemMonitor;
pub use manual_clock::ManualClock;
pub use postgres_document_store::PostgresDocumentStore;
pub use system_clock::SystemClock;
