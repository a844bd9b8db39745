//! News sentiment pipeline orchestration.

pub mod artifacts;
pub mod classify;
pub mod config;
pub mod normalize;
pub mod notify;
pub mod persist;
pub mod pipeline;
pub mod retry;
pub mod scheduler;
pub mod schema;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use newsflow_adapters::{
    FixtureNewsSource, HttpClassifier, LexiconClassifier, NewsApiSource, NewsSource,
    SentimentClassifier,
};
use newsflow_core::RunTrigger;
use newsflow_storage::{ArtifactStore, HttpClientConfig, HttpFetcher, NewsStore};
use tracing::info;

pub use classify::{classify_batch, ClassifyOptions};
pub use config::{PipelineConfig, PipelineFile};
pub use normalize::{normalize, NormalizeOutcome};
pub use notify::{FailureNotifier, LogNotifier, RunFailure, WebhookNotifier};
pub use persist::{persist, PersistOutcome};
pub use pipeline::{NewsPipeline, RunSummary};
pub use retry::{run_stage, RetryPolicy, RunError, Stage, StageOutput};
pub use scheduler::{build_scheduler, maybe_build_scheduler};
pub use schema::{ensure_schema, SchemaBranch, SchemaGuard, SchemaState};

pub const CRATE_NAME: &str = "newsflow-sync";

/// Wire collaborators from config: fixture or NewsAPI source, hosted or lexicon
/// classifier, optional webhook and artifact directory.
pub async fn build_pipeline(config: &PipelineConfig) -> Result<NewsPipeline> {
    let store = NewsStore::connect(&config.database_url).await?;
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: config.http_timeout,
        user_agent: Some(config.user_agent.clone()),
    })?;

    let source: Arc<dyn NewsSource> = match (&config.fixture_path, &config.newsapi_key) {
        (Some(path), _) => {
            info!(fixture = %path.display(), "using fixture news source");
            Arc::new(FixtureNewsSource::from_path(path)?)
        }
        (None, Some(key)) => Arc::new(
            NewsApiSource::new(http.clone(), key.clone())
                .with_base_url(config.newsapi_base_url.clone())
                .with_lookback_days(config.lookback_days),
        ),
        (None, None) => bail!("NEWSAPI_KEY is not set and no NEWSFLOW_FIXTURE was given"),
    };

    let classifier: Arc<dyn SentimentClassifier> = match &config.classifier_url {
        Some(url) => Arc::new(HttpClassifier::new(
            http.clone(),
            url.clone(),
            config.classifier_token.clone(),
        )),
        None => Arc::new(LexiconClassifier),
    };
    info!(model = classifier.model_id(), "sentiment classifier ready");

    let mut pipeline = NewsPipeline::new(source, classifier, store)
        .with_retry_policy(config.retry_policy())
        .with_classify_options(config.classify_options());
    if let Some(url) = &config.failure_webhook {
        pipeline = pipeline.with_notifier(Arc::new(WebhookNotifier::new(http, url.clone())));
    }
    if let Some(dir) = &config.artifacts_dir {
        pipeline = pipeline.with_artifacts(ArtifactStore::new(dir.clone()));
    }
    Ok(pipeline)
}

/// Create the news table if it is missing. Connects only the store, so no source
/// credentials are needed.
pub async fn init_schema(config: &PipelineConfig) -> Result<SchemaBranch> {
    let store = NewsStore::connect(&config.database_url).await?;
    let branch = schema::ensure_schema(&store, config.retry_policy()).await;
    store.close().await;
    branch.context("schema guard failed")
}

/// One manual run built from `config`. The store is closed whether or not the run succeeds.
pub async fn run_once_with_config(config: &PipelineConfig) -> Result<RunSummary> {
    let pipeline = build_pipeline(config).await?;
    let summary = pipeline.run_once(config.new_run(RunTrigger::Manual)).await;
    pipeline.store().close().await;
    summary.context("pipeline run failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/../../fixtures/sample-news.json");

    fn config_with(db: &str, fixture: Option<&str>) -> PipelineConfig {
        PipelineConfig::from_lookup(|key| match key {
            "DATABASE_URL" => Some(db.to_string()),
            "ARTIFACTS_DIR" => Some(String::new()),
            "NEWSFLOW_FIXTURE" => fixture.map(str::to_string),
            "NEWSFLOW_QUERIES" => Some("tech,economy".into()),
            _ => None,
        })
        .unwrap()
    }

    fn sqlite_url(dir: &tempfile::TempDir) -> String {
        format!("sqlite://{}", dir.path().join("news.db").display())
    }

    #[tokio::test]
    async fn missing_key_and_fixture_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with(&sqlite_url(&dir), None);
        let err = build_pipeline(&config).await.err().unwrap();
        assert!(err.to_string().contains("NEWSAPI_KEY"));
    }

    #[tokio::test]
    async fn init_schema_needs_no_news_source() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with(&sqlite_url(&dir), None);
        assert!(config.newsapi_key.is_none());
        assert!(config.fixture_path.is_none());

        assert_eq!(init_schema(&config).await.unwrap(), SchemaBranch::CreateTable);
        assert_eq!(init_schema(&config).await.unwrap(), SchemaBranch::SkipCreate);
    }

    #[tokio::test]
    async fn run_once_with_config_persists_and_closes_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let url = sqlite_url(&dir);
        let config = config_with(&url, Some(SAMPLE));

        let summary = run_once_with_config(&config).await.unwrap();
        assert_eq!(summary.extracted, 4);
        assert_eq!(summary.inserted, 3);

        let store = NewsStore::connect(&url).await.unwrap();
        assert_eq!(store.row_count().await.unwrap(), 3);
        store.close().await;

        let rerun = run_once_with_config(&config).await.unwrap();
        assert_eq!(rerun.inserted, 0);
        assert_eq!(rerun.total_rows, 3);
    }

    #[tokio::test]
    async fn failed_run_from_config_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = dir.path().join("bad.json");
        std::fs::write(
            &fixture,
            r#"{"tech": [{"source": {"name": "Wire"}, "author": "Ana", "title": "t",
                "url": "https://example.com/t", "publishedAt": "last tuesday", "content": "c"}]}"#,
        )
        .unwrap();
        let config = config_with(&sqlite_url(&dir), fixture.to_str());

        let err = run_once_with_config(&config).await.unwrap_err();
        assert!(err.to_string().contains("pipeline run failed"));
        assert!(init_schema(&config).await.is_ok());
    }
}
