mod clock;
mod handler;
mod queue;
mod store;

pub use clock::Clock;
pub use handler::{HandlerOutcome, ItemMonitor, WorkItemHandler};
pub use queue::{LeaseCompletion, ReleasePolicy, WorkQueue};
pub use store::{ChangeEvent, ChangeFeedPage, DocumentPage, DocumentStore};
