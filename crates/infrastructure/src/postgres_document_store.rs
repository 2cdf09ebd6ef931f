use std::marker::PhantomData;

use async_trait::async_trait;
use fleetward_application::{ChangeEvent, ChangeFeedPage, DocumentPage, DocumentStore};
use fleetward_core::{AppError, AppResult};
use fleetward_domain::{Document, DocumentQuery, PreCommitHook, VersionToken};
use sqlx::{FromRow, PgPool, Postgres, Transaction};

const DEFAULT_PAGE_SIZE: i64 = 100;

/// PostgreSQL-backed document store for one named collection.
///
/// Writes run in a transaction holding a per-collection advisory lock, so
/// `change_seq` order matches commit order and the change feed never skips
/// a write that commits late. Lease hooks are stamped with the database
/// clock. Deleted documents stay as tombstone rows until
/// [`DocumentStore::purge_deleted`] drops them.
pub struct PostgresDocumentStore<D> {
    pool: PgPool,
    collection: String,
    page_size: i64,
    marker: PhantomData<fn() -> D>,
}

impl<D> Clone for PostgresDocumentStore<D> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            collection: self.collection.clone(),
            page_size: self.page_size,
            marker: PhantomData,
        }
    }
}

#[derive(FromRow)]
struct DocumentRow {
    id: String,
    body: String,
    version: i64,
}

#[derive(FromRow)]
struct ChangeRow {
    id: String,
    body: String,
    version: i64,
    change_seq: i64,
    deleted: bool,
}

impl<D: Document> PostgresDocumentStore<D> {
    /// Creates a store over `collection` with the provided connection pool.
    #[must_use]
    pub fn new(pool: PgPool, collection: impl Into<String>) -> Self {
        Self {
            pool,
            collection: collection.into(),
            page_size: DEFAULT_PAGE_SIZE,
            marker: PhantomData,
        }
    }

    /// Sets the query page size.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = i64::try_from(page_size.max(1)).unwrap_or(DEFAULT_PAGE_SIZE);
        self
    }

    async fn begin_write(&self) -> AppResult<Transaction<'static, Postgres>> {
        let mut transaction = self.pool.begin().await.map_err(|error| {
            AppError::Store(format!("failed to begin transaction: {error}"))
        })?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1)::BIGINT)")
            .bind(self.collection.as_str())
            .execute(&mut *transaction)
            .await
            .map_err(|error| {
                AppError::Store(format!(
                    "failed to lock collection '{}': {error}",
                    self.collection
                ))
            })?;

        Ok(transaction)
    }

    async fn encode(
        transaction: &mut Transaction<'static, Postgres>,
        mut document: D,
        hook: Option<PreCommitHook>,
    ) -> AppResult<String> {
        if let Some(hook) = hook {
            let server_now = sqlx::query_scalar::<_, i64>(
                "SELECT extract(epoch FROM now())::BIGINT",
            )
            .fetch_one(&mut **transaction)
            .await
            .map_err(|error| AppError::Store(format!("failed to read server time: {error}")))?;
            hook.apply(&mut document, server_now);
        }

        serde_json::to_string(&document).map_err(|error| {
            AppError::Internal(format!(
                "failed to serialize document '{}': {error}",
                document.id()
            ))
        })
    }

    fn decode(id: &str, body: &str, version: i64) -> AppResult<D> {
        let mut document: D = serde_json::from_str(body).map_err(|error| {
            AppError::Internal(format!("failed to deserialize document '{id}': {error}"))
        })?;
        document.set_version(Some(VersionToken::new(version.to_string())));
        Ok(document)
    }

    async fn commit(transaction: Transaction<'static, Postgres>) -> AppResult<()> {
        transaction
            .commit()
            .await
            .map_err(|error| AppError::Store(format!("failed to commit transaction: {error}")))
    }

    async fn write_failure(
        &self,
        transaction: &mut Transaction<'static, Postgres>,
        id: &str,
    ) -> AppError {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM coordination_documents
                WHERE collection = $1 AND id = $2 AND NOT deleted
            )
            "#,
        )
        .bind(self.collection.as_str())
        .bind(id)
        .fetch_one(&mut **transaction)
        .await;

        match exists {
            Ok(true) => AppError::VersionConflict(id.to_owned()),
            Ok(false) => AppError::NotFound(id.to_owned()),
            Err(error) => AppError::Store(format!(
                "failed to inspect document '{id}' after rejected write: {error}"
            )),
        }
    }
}

fn expected_version(id: &str, version: Option<&VersionToken>) -> AppResult<i64> {
    version
        .ok_or_else(|| AppError::Validation(format!("document '{id}' was never read")))?
        .as_str()
        .parse::<i64>()
        .map_err(|_| AppError::Validation(format!("document '{id}' has a foreign version token")))
}

fn parse_cursor(continuation: Option<String>) -> AppResult<i64> {
    continuation.map_or(Ok(0), |value| {
        value
            .parse::<i64>()
            .map_err(|_| AppError::Validation(format!("invalid continuation token '{value}'")))
    })
}

fn query_filter(query: &DocumentQuery) -> (&'static str, Vec<String>) {
    match query {
        DocumentQuery::All => ("all", Vec::new()),
        DocumentQuery::Claimable { states } => (
            "claimable",
            states.iter().map(|state| state.as_str().to_owned()).collect(),
        ),
        DocumentQuery::LeaseUnexpired => ("lease_unexpired", Vec::new()),
        DocumentQuery::LeaseExpired => ("lease_expired", Vec::new()),
    }
}

#[async_trait]
impl<D: Document> DocumentStore<D> for PostgresDocumentStore<D> {
    async fn create(&self, document: D, hook: Option<PreCommitHook>) -> AppResult<D> {
        let id = document.id().to_owned();
        let partition_key = document.partition_key().to_owned();
        let mut transaction = self.begin_write().await?;
        let body = Self::encode(&mut transaction, document, hook).await?;

        let version = sqlx::query_scalar::<_, i64>(
            r#"
            WITH next AS (SELECT nextval('coordination_change_seq') AS seq)
            INSERT INTO coordination_documents (
                collection, id, partition_key, body, version, change_seq, deleted
            )
            SELECT $1, $2, $3, $4::jsonb, next.seq, next.seq, FALSE
            FROM next
            ON CONFLICT (collection, id) DO UPDATE
            SET
                partition_key = EXCLUDED.partition_key,
                body = EXCLUDED.body,
                version = EXCLUDED.version,
                change_seq = EXCLUDED.change_seq,
                deleted = FALSE,
                updated_at = now()
            WHERE coordination_documents.deleted
            RETURNING version
            "#,
        )
        .bind(self.collection.as_str())
        .bind(id.as_str())
        .bind(partition_key.as_str())
        .bind(body.as_str())
        .fetch_optional(&mut *transaction)
        .await
        .map_err(|error| AppError::Store(format!("failed to create document '{id}': {error}")))?
        .ok_or_else(|| AppError::AlreadyExists(id.clone()))?;

        Self::commit(transaction).await?;
        Self::decode(&id, &body, version)
    }

    async fn get(&self, id: &str) -> AppResult<D> {
        let row = sqlx::query_as::<_, DocumentRow>(
            r#"
            SELECT id, body::text AS body, version
            FROM coordination_documents
            WHERE collection = $1 AND id = $2 AND NOT deleted
            "#,
        )
        .bind(self.collection.as_str())
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| AppError::Store(format!("failed to load document '{id}': {error}")))?
        .ok_or_else(|| AppError::NotFound(id.to_owned()))?;

        Self::decode(&row.id, &row.body, row.version)
    }

    async fn replace(&self, document: D, hook: Option<PreCommitHook>) -> AppResult<D> {
        let id = document.id().to_owned();
        let expected = expected_version(&id, document.version())?;
        let mut transaction = self.begin_write().await?;
        let body = Self::encode(&mut transaction, document, hook).await?;

        let version = sqlx::query_scalar::<_, i64>(
            r#"
            WITH next AS (SELECT nextval('coordination_change_seq') AS seq)
            UPDATE coordination_documents documents
            SET
                body = $4::jsonb,
                version = next.seq,
                change_seq = next.seq,
                updated_at = now()
            FROM next
            WHERE documents.collection = $1
              AND documents.id = $2
              AND documents.version = $3
              AND NOT documents.deleted
            RETURNING documents.version
            "#,
        )
        .bind(self.collection.as_str())
        .bind(id.as_str())
        .bind(expected)
        .bind(body.as_str())
        .fetch_optional(&mut *transaction)
        .await
        .map_err(|error| AppError::Store(format!("failed to replace document '{id}': {error}")))?;

        let Some(version) = version else {
            return Err(self.write_failure(&mut transaction, &id).await);
        };

        Self::commit(transaction).await?;
        Self::decode(&id, &body, version)
    }

    async fn delete(&self, document: &D) -> AppResult<()> {
        let id = document.id();
        let expected = expected_version(id, document.version())?;
        let mut transaction = self.begin_write().await?;

        let deleted = sqlx::query(
            r#"
            WITH next AS (SELECT nextval('coordination_change_seq') AS seq)
            UPDATE coordination_documents documents
            SET
                deleted = TRUE,
                version = next.seq,
                change_seq = next.seq,
                updated_at = now()
            FROM next
            WHERE documents.collection = $1
              AND documents.id = $2
              AND documents.version = $3
              AND NOT documents.deleted
            "#,
        )
        .bind(self.collection.as_str())
        .bind(id)
        .bind(expected)
        .execute(&mut *transaction)
        .await
        .map_err(|error| AppError::Store(format!("failed to delete document '{id}': {error}")))?;

        if deleted.rows_affected() == 0 {
            return Err(self.write_failure(&mut transaction, id).await);
        }

        Self::commit(transaction).await
    }

    async fn query(
        &self,
        query: &DocumentQuery,
        continuation: Option<String>,
    ) -> AppResult<DocumentPage<D>> {
        let (filter, states) = query_filter(query);
        let rows = sqlx::query_as::<_, DocumentRow>(
            r#"
            WITH server AS (SELECT extract(epoch FROM now())::BIGINT AS now)
            SELECT id, body::text AS body, version
            FROM coordination_documents, server
            WHERE collection = $1
              AND NOT deleted
              AND id > $2
              AND CASE $3
                    WHEN 'claimable' THEN
                        body->>'state' = ANY($4)
                        AND COALESCE((body->>'leaseExpires')::BIGINT, 0) < server.now
                    WHEN 'lease_unexpired' THEN
                        COALESCE((body->>'leaseExpires')::BIGINT, 0) > server.now
                    WHEN 'lease_expired' THEN
                        COALESCE((body->>'leaseExpires')::BIGINT, 0) <= server.now
                    ELSE TRUE
                  END
            ORDER BY id ASC
            LIMIT $5
            "#,
        )
        .bind(self.collection.as_str())
        .bind(continuation.unwrap_or_default())
        .bind(filter)
        .bind(states)
        .bind(self.page_size.saturating_add(1))
        .fetch_all(&self.pool)
        .await
        .map_err(|error| {
            AppError::Store(format!(
                "failed to query collection '{}': {error}",
                self.collection
            ))
        })?;

        let has_more = i64::try_from(rows.len()).unwrap_or(i64::MAX) > self.page_size;
        let documents = rows
            .iter()
            .take(usize::try_from(self.page_size).unwrap_or(usize::MAX))
            .map(|row| Self::decode(&row.id, &row.body, row.version))
            .collect::<AppResult<Vec<D>>>()?;
        let continuation = if has_more {
            documents.last().map(|document| document.id().to_owned())
        } else {
            None
        };

        Ok(DocumentPage {
            documents,
            continuation,
        })
    }

    async fn change_feed(
        &self,
        continuation: Option<String>,
        max_items: usize,
    ) -> AppResult<ChangeFeedPage<D>> {
        let cursor = parse_cursor(continuation)?;
        let rows = sqlx::query_as::<_, ChangeRow>(
            r#"
            SELECT id, body::text AS body, version, change_seq, deleted
            FROM coordination_documents
            WHERE collection = $1 AND change_seq > $2
            ORDER BY change_seq ASC
            LIMIT $3
            "#,
        )
        .bind(self.collection.as_str())
        .bind(cursor)
        .bind(i64::try_from(max_items.max(1)).unwrap_or(DEFAULT_PAGE_SIZE))
        .fetch_all(&self.pool)
        .await
        .map_err(|error| {
            AppError::Store(format!(
                "failed to read change feed for '{}': {error}",
                self.collection
            ))
        })?;

        let last_seq = rows.last().map_or(cursor, |row| row.change_seq);
        let changes = rows
            .into_iter()
            .map(|row| {
                if row.deleted {
                    Ok(ChangeEvent::Deleted { id: row.id })
                } else {
                    Self::decode(&row.id, &row.body, row.version).map(ChangeEvent::Upserted)
                }
            })
            .collect::<AppResult<Vec<_>>>()?;

        Ok(ChangeFeedPage {
            changes,
            continuation: Some(last_seq.to_string()),
        })
    }

    async fn server_time(&self) -> AppResult<i64> {
        sqlx::query_scalar::<_, i64>("SELECT extract(epoch FROM now())::BIGINT")
            .fetch_one(&self.pool)
            .await
            .map_err(|error| AppError::Store(format!("failed to read server time: {error}")))
    }

    async fn purge_deleted(&self, deleted_before: i64) -> AppResult<usize> {
        let purged = sqlx::query(
            r#"
            DELETE FROM coordination_documents
            WHERE collection = $1
              AND deleted
              AND updated_at < to_timestamp($2)
            "#,
        )
        .bind(self.collection.as_str())
        .bind(deleted_before)
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::Store(format!(
                "failed to purge deleted documents from '{}': {error}",
                self.collection
            ))
        })?;

        Ok(usize::try_from(purged.rows_affected()).unwrap_or(usize::MAX))
    }
}

#[cfg(test)]
mod tests;
