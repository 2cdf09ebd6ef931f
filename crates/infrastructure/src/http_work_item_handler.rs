use std::time::Duration;

use async_trait::async_trait;
use fleetward_application::{HandlerOutcome, WorkItemHandler};
use fleetward_core::{AppError, AppResult};
use fleetward_domain::{Document, WorkItem, WorkItemState};
use serde::Deserialize;

/// Work item handler that delegates each claimed item to an HTTP endpoint.
///
/// The item document is posted as JSON and the endpoint answers with the
/// outcome, e.g. `{"outcome": "transition", "state": "Succeeded"}`,
/// `{"outcome": "retryLater"}` or `{"outcome": "delete"}`.
pub struct HttpWorkItemHandler {
    http_client: reqwest::Client,
    endpoint: String,
    max_attempts: u8,
    retry_backoff_ms: u64,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "camelCase")]
enum HandlerResponse {
    Transition { state: WorkItemState },
    RetryLater,
    Delete,
}

impl From<HandlerResponse> for HandlerOutcome {
    fn from(response: HandlerResponse) -> Self {
        match response {
            HandlerResponse::Transition { state } => Self::Transition(state),
            HandlerResponse::RetryLater => Self::RetryLater,
            HandlerResponse::Delete => Self::Delete,
        }
    }
}

impl HttpWorkItemHandler {
    /// Creates a handler posting to `endpoint`.
    #[must_use]
    pub fn new(
        http_client: reqwest::Client,
        endpoint: impl Into<String>,
        max_attempts: u8,
        retry_backoff_ms: u64,
    ) -> Self {
        Self {
            http_client,
            endpoint: endpoint.into(),
            max_attempts: max_attempts.max(1),
            retry_backoff_ms: retry_backoff_ms.max(50),
        }
    }

    async fn post_with_retry(&self, item: &WorkItem) -> AppResult<HandlerResponse> {
        let idempotency_key = idempotency_key(item);
        let mut attempt = 0_u8;
        let mut last_error: Option<String> = None;

        while attempt < self.max_attempts {
            attempt = attempt.saturating_add(1);
            let response = self
                .http_client
                .post(self.endpoint.as_str())
                .header("Idempotency-Key", idempotency_key.as_str())
                .header("X-Fleetward-Item", item.id())
                .header("X-Fleetward-State", item.state().as_str())
                .json(item)
                .send()
                .await;

            match response {
                Ok(response) if response.status().is_success() => {
                    return response.json::<HandlerResponse>().await.map_err(|error| {
                        AppError::Validation(format!(
                            "handler response for item '{}' is malformed: {error}",
                            item.id()
                        ))
                    });
                }
                Ok(response)
                    if response.status().is_server_error()
                        || response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS =>
                {
                    last_error = Some(format!(
                        "transient HTTP status {} from handler for item '{}'",
                        response.status(),
                        item.id()
                    ));
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "<response body unavailable>".to_owned());
                    return Err(AppError::Validation(format!(
                        "handler rejected item '{}' with status {status}: {body}",
                        item.id()
                    )));
                }
                Err(error) => {
                    last_error = Some(format!("handler transport error: {error}"));
                }
            }

            if attempt < self.max_attempts {
                let delay = self.retry_backoff_ms.saturating_mul(u64::from(attempt));
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }

        Err(AppError::Store(last_error.unwrap_or_else(|| {
            "handler dispatch exhausted retries".to_owned()
        })))
    }
}

/// Key shared by retries of one claim; a reclaim gets a fresh key.
fn idempotency_key(item: &WorkItem) -> String {
    format!("{}:{}", item.id(), item.dequeue_count())
}

#[async_trait]
impl WorkItemHandler for HttpWorkItemHandler {
    async fn handle(&self, item: WorkItem) -> AppResult<HandlerOutcome> {
        self.post_with_retry(&item).await.map(HandlerOutcome::from)
    }
}

#[cfg(test)]
mod tests {
    use fleetward_application::{HandlerOutcome, WorkItemHandler};
    use fleetward_core::AppError;
    use fleetward_domain::{WorkItem, WorkItemInput, WorkItemState};

    use super::{HandlerResponse, HttpWorkItemHandler, idempotency_key};

    fn pending_item() -> WorkItem {
        WorkItem::new(WorkItemInput {
            id: "cluster-a".to_owned(),
            partition_key: "sub-1".to_owned(),
            state: WorkItemState::Pending,
            bucket: 0,
            payload: serde_json::Value::Null,
        })
        .unwrap_or_else(|_| unreachable!())
    }

    #[test]
    fn idempotency_key_changes_with_each_claim() {
        let mut item = pending_item();
        item.record_dequeue();
        assert_eq!(idempotency_key(&item), "cluster-a:1");

        item.record_dequeue();
        assert_eq!(idempotency_key(&item), "cluster-a:2");
    }

    #[test]
    fn response_body_maps_to_outcome() {
        let transition = serde_json::from_str::<HandlerResponse>(
            r#"{"outcome": "transition", "state": "Active"}"#,
        );
        assert_eq!(
            transition.map(HandlerOutcome::from).ok(),
            Some(HandlerOutcome::Transition(WorkItemState::Active))
        );

        let retry = serde_json::from_str::<HandlerResponse>(r#"{"outcome": "retryLater"}"#);
        assert_eq!(
            retry.map(HandlerOutcome::from).ok(),
            Some(HandlerOutcome::RetryLater)
        );

        assert!(serde_json::from_str::<HandlerResponse>(r#"{"outcome": "explode"}"#).is_err());
    }

    #[tokio::test]
    async fn unreachable_endpoint_surfaces_store_error_after_retries() {
        let handler =
            HttpWorkItemHandler::new(reqwest::Client::new(), "http://127.0.0.1:9/items", 2, 50);
        let result = handler.handle(pending_item()).await;
        assert!(matches!(result, Err(AppError::Store(_))));
    }
}
