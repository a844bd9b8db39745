//! Failure notification side effects.

use anyhow::Result;
use async_trait::async_trait;
use newsflow_storage::HttpFetcher;
use serde::Serialize;
use tracing::error;
use uuid::Uuid;

use crate::retry::{RunError, Stage};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunFailure {
    pub run_id: Uuid,
    pub stage: Stage,
    pub attempts: u32,
    pub error: String,
}

impl RunFailure {
    pub fn new(run_id: Uuid, err: &RunError) -> Self {
        Self {
            run_id,
            stage: err.stage,
            attempts: err.attempts,
            error: format!("{:#}", err.error),
        }
    }
}

#[async_trait]
pub trait FailureNotifier: Send + Sync {
    async fn notify(&self, failure: &RunFailure) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl FailureNotifier for LogNotifier {
    async fn notify(&self, failure: &RunFailure) -> Result<()> {
        error!(
            run_id = %failure.run_id,
            stage = %failure.stage,
            attempts = failure.attempts,
            error = %failure.error,
            "pipeline run failed"
        );
        Ok(())
    }
}

/// POSTs the failure as JSON to a fixed URL.
pub struct WebhookNotifier {
    http: HttpFetcher,
    url: String,
}

impl WebhookNotifier {
    pub fn new(http: HttpFetcher, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl FailureNotifier for WebhookNotifier {
    async fn notify(&self, failure: &RunFailure) -> Result<()> {
        LogNotifier.notify(failure).await?;
        self.http.post_json_unit(&self.url, failure).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use newsflow_core::StageError;
    use newsflow_storage::HttpClientConfig;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn failure() -> RunFailure {
        let err = RunError {
            stage: Stage::Extract,
            attempts: 2,
            error: StageError::Fetch(anyhow::anyhow!("connection refused")),
        };
        RunFailure::new(Uuid::nil(), &err)
    }

    #[test]
    fn failure_carries_stage_attempts_and_message() {
        let f = failure();
        assert_eq!(f.stage, Stage::Extract);
        assert_eq!(f.attempts, 2);
        assert!(f.error.contains("connection refused"));
    }

    #[tokio::test]
    async fn webhook_posts_failure_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/pipeline"))
            .and(body_json(serde_json::json!({
                "run_id": Uuid::nil(),
                "stage": "extract",
                "attempts": 2,
                "error": failure().error,
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let notifier = WebhookNotifier::new(http, format!("{}/hooks/pipeline", server.uri()));
        notifier.notify(&failure()).await.unwrap();
    }

    #[tokio::test]
    async fn webhook_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let notifier = WebhookNotifier::new(http, server.uri());
        assert!(notifier.notify(&failure()).await.is_err());
    }
}
