use fleetward_application::{ChangeEvent, DocumentStore, query_all};
use fleetward_core::{AppError, HolderId};
use fleetward_domain::{
    Document, DocumentQuery, PreCommitHook, WorkItem, WorkItemInput, WorkItemState,
};
use serde_json::json;
use sqlx::PgPool;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;

use super::PostgresDocumentStore;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

async fn test_pool() -> Option<PgPool> {
    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        return None;
    };

    let pool = match PgPoolOptions::new()
        .max_connections(4)
        .connect(database_url.as_str())
        .await
    {
        Ok(pool) => pool,
        Err(error) => panic!("failed to connect to DATABASE_URL in test: {error}"),
    };

    if let Err(error) = MIGRATOR.run(&pool).await {
        panic!("failed to run migrations for postgres document store tests: {error}");
    }

    Some(pool)
}

fn store(pool: &PgPool) -> PostgresDocumentStore<WorkItem> {
    PostgresDocumentStore::new(pool.clone(), format!("test-{}", HolderId::new()))
}

fn item(id: &str, state: WorkItemState) -> WorkItem {
    WorkItem::new(WorkItemInput {
        id: id.to_owned(),
        partition_key: "sub-1".to_owned(),
        state,
        bucket: 3,
        payload: json!({"resourceId": id}),
    })
    .unwrap_or_else(|_| unreachable!())
}

#[tokio::test]
async fn writes_are_guarded_by_version() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = store(&pool);

    let created = store.create(item("cluster-a", WorkItemState::Pending), None).await;
    let created = created.unwrap_or_else(|_| unreachable!());
    assert!(matches!(
        store.create(item("cluster-a", WorkItemState::Pending), None).await,
        Err(AppError::AlreadyExists(_))
    ));

    let replaced = store.replace(created.clone(), None).await;
    assert!(replaced.is_ok());
    assert!(matches!(
        store.replace(created.clone(), None).await,
        Err(AppError::VersionConflict(_))
    ));
    assert!(matches!(store.delete(&created).await, Err(AppError::VersionConflict(_))));

    let current = replaced.unwrap_or_else(|_| unreachable!());
    assert!(store.delete(&current).await.is_ok());
    assert!(matches!(store.get("cluster-a").await, Err(AppError::NotFound(_))));
    assert!(matches!(
        store.replace(current, None).await,
        Err(AppError::NotFound(_))
    ));

    assert!(store.create(item("cluster-a", WorkItemState::Active), None).await.is_ok());
}

#[tokio::test]
async fn lease_hook_uses_database_time() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = store(&pool);

    let before = store.server_time().await.unwrap_or_else(|_| unreachable!());
    let created = store
        .create(
            item("cluster-a", WorkItemState::Pending),
            Some(PreCommitHook::StampLeaseExpiry { ttl_seconds: 60 }),
        )
        .await;
    let after = store.server_time().await.unwrap_or_else(|_| unreachable!());

    let expires_at = created.map(|item| item.lease().expires_at()).unwrap_or_default();
    assert!(expires_at >= before + 60);
    assert!(expires_at <= after + 60);
}

#[tokio::test]
async fn claimable_query_filters_state_and_lease() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = store(&pool).with_page_size(1);

    assert!(store.create(item("cluster-a", WorkItemState::Pending), None).await.is_ok());
    assert!(store.create(item("cluster-b", WorkItemState::Succeeded), None).await.is_ok());
    assert!(store
        .create(
            item("cluster-c", WorkItemState::Active),
            Some(PreCommitHook::StampLeaseExpiry { ttl_seconds: 600 }),
        )
        .await
        .is_ok());

    let claimable = query_all(
        &store,
        &DocumentQuery::Claimable {
            states: WorkItemState::CLAIMABLE.to_vec(),
        },
    )
    .await;
    let ids: Vec<String> = claimable
        .unwrap_or_default()
        .iter()
        .map(|item| item.id().to_owned())
        .collect();
    assert_eq!(ids, vec!["cluster-a".to_owned()]);

    let unexpired = query_all(&store, &DocumentQuery::LeaseUnexpired).await;
    assert_eq!(unexpired.map(|items| items.len()).unwrap_or_default(), 1);
    let all = query_all(&store, &DocumentQuery::All).await;
    assert_eq!(all.map(|items| items.len()).unwrap_or_default(), 3);
}

#[tokio::test]
async fn change_feed_reports_latest_state_and_deletions() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = store(&pool);

    let first = store.create(item("cluster-a", WorkItemState::Pending), None).await;
    let first = first.unwrap_or_else(|_| unreachable!());
    let second = store.create(item("cluster-b", WorkItemState::Pending), None).await;
    let second = second.unwrap_or_else(|_| unreachable!());
    assert!(store.replace(first, None).await.is_ok());
    assert!(store.delete(&second).await.is_ok());

    let page = store.change_feed(None, 10).await;
    let page = page.unwrap_or_else(|_| unreachable!());
    let changes: Vec<String> = page
        .changes
        .iter()
        .map(|change| match change {
            ChangeEvent::Upserted(item) => format!("upsert:{}", item.id()),
            ChangeEvent::Deleted { id } => format!("delete:{id}"),
        })
        .collect();
    assert_eq!(changes, vec!["upsert:cluster-a", "delete:cluster-b"]);

    let drained = store.change_feed(page.continuation.clone(), 10).await;
    assert!(matches!(drained, Ok(ref next) if next.changes.is_empty()));
    assert!(matches!(drained, Ok(ref next) if next.continuation == page.continuation));
}

#[tokio::test]
async fn purge_drops_only_tombstones_older_than_cutoff() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = store(&pool);

    let doomed = store.create(item("cluster-a", WorkItemState::Deleting), None).await;
    let doomed = doomed.unwrap_or_else(|_| unreachable!());
    assert!(store.create(item("cluster-b", WorkItemState::Pending), None).await.is_ok());
    assert!(store.delete(&doomed).await.is_ok());

    let now = store.server_time().await.unwrap_or_else(|_| unreachable!());
    assert_eq!(store.purge_deleted(now - 3600).await.unwrap_or(usize::MAX), 0);
    assert_eq!(store.purge_deleted(now + 1).await.unwrap_or(usize::MAX), 1);

    let page = store.change_feed(None, 10).await.unwrap_or_else(|_| unreachable!());
    assert_eq!(page.changes.len(), 1);
    assert!(matches!(&page.changes[0], ChangeEvent::Upserted(item) if item.id() == "cluster-b"));
    assert!(store.create(item("cluster-a", WorkItemState::Pending), None).await.is_ok());
}
