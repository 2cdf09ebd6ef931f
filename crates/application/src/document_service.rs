//! Optimistic-concurrency helpers layered over [`DocumentStore`].

use fleetward_core::AppResult;
use fleetward_domain::{Document, DocumentQuery, PreCommitHook};
use tracing::debug;

use crate::coordination_ports::DocumentStore;

/// Read, mutate and replace one document until the write lands.
///
/// Version conflicts restart the cycle from a fresh read, indefinitely.
/// Any error returned by `mutate` (such as a lost lease) aborts at once
/// without writing.
pub async fn patch_with_retry<D, F>(
    store: &dyn DocumentStore<D>,
    id: &str,
    hook: Option<PreCommitHook>,
    mut mutate: F,
) -> AppResult<D>
where
    D: Document,
    F: FnMut(&mut D) -> AppResult<()> + Send,
{
    let mut conflicts = 0_u32;

    loop {
        let mut document = store.get(id).await?;
        mutate(&mut document)?;

        match store.replace(document, hook).await {
            Err(error) if error.is_version_conflict() => {
                conflicts = conflicts.saturating_add(1);
                debug!(document_id = %id, conflicts, "patch lost optimistic race, retrying");
                tokio::task::yield_now().await;
            }
            result => return result,
        }
    }
}

/// Collects every page of a query.
pub async fn query_all<D: Document>(
    store: &dyn DocumentStore<D>,
    query: &DocumentQuery,
) -> AppResult<Vec<D>> {
    let mut documents = Vec::new();
    let mut continuation = None;

    loop {
        let page = store.query(query, continuation).await?;
        documents.extend(page.documents);

        match page.continuation {
            Some(next) => continuation = Some(next),
            None => return Ok(documents),
        }
    }
}

/// Creates a document, treating an existing one as success.
pub async fn create_if_absent<D: Document>(
    store: &dyn DocumentStore<D>,
    document: D,
) -> AppResult<()> {
    match store.create(document, None).await {
        Ok(_) => Ok(()),
        Err(error) if error.is_already_exists() => Ok(()),
        Err(error) => Err(error),
    }
}
