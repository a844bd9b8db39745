//! Extract → Normalize → Classify → Schema Guard → Persist, one run at a time.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use newsflow_adapters::{extract, NewsSource, SentimentClassifier};
use newsflow_core::{PipelineRun, RunTrigger, StageError};
use newsflow_storage::{ArtifactStore, NewsStore};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::artifacts::RunArtifacts;
use crate::classify::{classify_batch, ClassifyOptions};
use crate::normalize::normalize;
use crate::notify::{FailureNotifier, LogNotifier, RunFailure};
use crate::persist::persist;
use crate::retry::{run_stage, RetryPolicy, RunError, Stage};
use crate::schema::{SchemaBranch, SchemaGuard};

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub trigger: RunTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub extracted: usize,
    pub normalized: usize,
    pub duplicates_removed: usize,
    pub incomplete_dropped: usize,
    pub classified: usize,
    pub schema_branch: SchemaBranch,
    pub inserted: usize,
    pub already_stored: usize,
    pub duplicate_titles: usize,
    pub total_rows: i64,
    pub attempts: BTreeMap<Stage, u32>,
    pub manifest_path: Option<String>,
}

pub struct NewsPipeline {
    source: Arc<dyn NewsSource>,
    classifier: Arc<dyn SentimentClassifier>,
    notifier: Arc<dyn FailureNotifier>,
    store: NewsStore,
    artifacts: Option<ArtifactStore>,
    default_policy: RetryPolicy,
    stage_policies: BTreeMap<Stage, RetryPolicy>,
    classify_options: ClassifyOptions,
    active_run: Mutex<()>,
}

impl NewsPipeline {
    pub fn new(
        source: Arc<dyn NewsSource>,
        classifier: Arc<dyn SentimentClassifier>,
        store: NewsStore,
    ) -> Self {
        Self {
            source,
            classifier,
            notifier: Arc::new(LogNotifier),
            store,
            artifacts: None,
            default_policy: RetryPolicy::default(),
            stage_policies: BTreeMap::new(),
            classify_options: ClassifyOptions::default(),
            active_run: Mutex::new(()),
        }
    }

    pub fn with_artifacts(mut self, artifacts: ArtifactStore) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn FailureNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Policy for every stage without its own override.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn with_stage_policy(mut self, stage: Stage, policy: RetryPolicy) -> Self {
        self.stage_policies.insert(stage, policy);
        self
    }

    pub fn with_classify_options(mut self, options: ClassifyOptions) -> Self {
        self.classify_options = options;
        self
    }

    pub fn store(&self) -> &NewsStore {
        &self.store
    }

    pub fn policy(&self, stage: Stage) -> RetryPolicy {
        self.stage_policies
            .get(&stage)
            .copied()
            .unwrap_or(self.default_policy)
    }

    /// Run to completion, waiting for any active run to finish first.
    pub async fn run_once(&self, run: PipelineRun) -> Result<RunSummary, RunError> {
        let _guard = self.active_run.lock().await;
        self.execute(run).await
    }

    /// Run unless another run is active, in which case nothing happens and `None` is returned.
    pub async fn try_run_once(&self, run: PipelineRun) -> Option<Result<RunSummary, RunError>> {
        let Ok(_guard) = self.active_run.try_lock() else {
            warn!(run_id = %run.run_id, trigger = %run.trigger, "a run is already active; skipping");
            return None;
        };
        Some(self.execute(run).await)
    }

    /// Run the schema guard alone.
    pub async fn ensure_schema(&self) -> Result<SchemaBranch, RunError> {
        crate::schema::ensure_schema(&self.store, self.policy(Stage::SchemaGuard)).await
    }

    async fn execute(&self, run: PipelineRun) -> Result<RunSummary, RunError> {
        let span = info_span!("pipeline_run", run_id = %run.run_id, trigger = %run.trigger);
        async {
            let mut artifacts = self.artifacts.as_ref().map(|store| RunArtifacts::new(store, &run));
            let result = self.run_stages(&run, artifacts.as_mut()).await;
            let manifest_path = match artifacts {
                Some(artifacts) => artifacts.finish().await,
                None => None,
            };

            match result {
                Ok(mut summary) => {
                    summary.manifest_path = manifest_path.map(|p| p.display().to_string());
                    info!(
                        extracted = summary.extracted,
                        normalized = summary.normalized,
                        classified = summary.classified,
                        inserted = summary.inserted,
                        total_rows = summary.total_rows,
                        "pipeline run finished"
                    );
                    Ok(summary)
                }
                Err(err) => {
                    let failure = RunFailure::new(run.run_id, &err);
                    if let Err(notify_err) = self.notifier.notify(&failure).await {
                        warn!(error = %format!("{notify_err:#}"), "failure notification not delivered");
                    }
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_stages(
        &self,
        run: &PipelineRun,
        mut artifacts: Option<&mut RunArtifacts<'_>>,
    ) -> Result<RunSummary, RunError> {
        info!(queries = run.queries.len(), page_size = run.page_size, "pipeline run started");
        let mut attempts = BTreeMap::new();

        let source = self.source.as_ref();
        let extracted = run_stage(Stage::Extract, self.policy(Stage::Extract), move || async move {
            extract(source, run)
                .await
                .map_err(|err| StageError::Fetch(err.into()))
        })
        .await?;
        attempts.insert(Stage::Extract, extracted.attempts);
        let raw = extracted.value;
        if let Some(a) = artifacts.as_deref_mut() {
            a.record_stage(Stage::Extract, &raw).await;
        }

        let raw_batch = raw.as_slice();
        let normalized = run_stage(Stage::Normalize, self.policy(Stage::Normalize), move || async move {
            normalize(raw_batch)
        })
        .await?;
        attempts.insert(Stage::Normalize, normalized.attempts);
        let normalized = normalized.value;
        if let Some(a) = artifacts.as_deref_mut() {
            a.record_stage(Stage::Normalize, &normalized.records).await;
        }

        let classifier = self.classifier.as_ref();
        let records = normalized.records.as_slice();
        let options = self.classify_options;
        let classified = run_stage(Stage::Classify, self.policy(Stage::Classify), move || {
            classify_batch(classifier, records, options)
        })
        .await?;
        attempts.insert(Stage::Classify, classified.attempts);
        let classified = classified.value;
        if let Some(a) = artifacts.as_deref_mut() {
            a.record_stage(Stage::Classify, &classified).await;
            a.record_classified_snapshot(&classified).await;
        }

        let store = &self.store;
        let schema = run_stage(Stage::SchemaGuard, self.policy(Stage::SchemaGuard), move || {
            SchemaGuard::new(store).run_to_join()
        })
        .await?;
        attempts.insert(Stage::SchemaGuard, schema.attempts);

        let batch = classified.as_slice();
        let persisted = run_stage(Stage::Persist, self.policy(Stage::Persist), move || {
            persist(store, batch)
        })
        .await?;
        attempts.insert(Stage::Persist, persisted.attempts);
        let persisted = persisted.value;

        Ok(RunSummary {
            run_id: run.run_id,
            trigger: run.trigger,
            started_at: run.started_at,
            finished_at: Utc::now(),
            extracted: raw.len(),
            normalized: normalized.records.len(),
            duplicates_removed: normalized.duplicates_removed,
            incomplete_dropped: normalized.incomplete_dropped,
            classified: classified.len(),
            schema_branch: schema.value,
            inserted: persisted.inserted,
            already_stored: persisted.already_stored,
            duplicate_titles: persisted.duplicate_in_batch,
            total_rows: persisted.total_rows,
            attempts,
            manifest_path: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use newsflow_adapters::{FixtureNewsSource, LexiconClassifier};
    use std::time::Duration;

    async fn empty_pipeline() -> NewsPipeline {
        NewsPipeline::new(
            Arc::new(FixtureNewsSource::default()),
            Arc::new(LexiconClassifier),
            NewsStore::in_memory().await.unwrap(),
        )
    }

    #[tokio::test]
    async fn stage_override_wins_over_default_policy() {
        let fast = RetryPolicy::with_retries(4, Duration::ZERO);
        let pipeline = empty_pipeline()
            .await
            .with_retry_policy(RetryPolicy::no_retry())
            .with_stage_policy(Stage::Extract, fast);
        assert_eq!(pipeline.policy(Stage::Extract), fast);
        assert_eq!(pipeline.policy(Stage::Persist), RetryPolicy::no_retry());
    }

    #[tokio::test]
    async fn empty_search_results_still_reach_the_join() {
        let pipeline = empty_pipeline().await;
        let run = PipelineRun::new(vec!["tech".into()], 10, RunTrigger::Manual);
        let summary = pipeline.run_once(run).await.unwrap();
        assert_eq!(summary.extracted, 0);
        assert_eq!(summary.schema_branch, SchemaBranch::CreateTable);
        assert_eq!(summary.inserted, 0);
        assert_eq!(summary.attempts.len(), Stage::ORDER.len());
        assert!(summary.manifest_path.is_none());
    }

    #[tokio::test]
    async fn ensure_schema_is_repeatable() {
        let pipeline = empty_pipeline().await;
        assert_eq!(pipeline.ensure_schema().await.unwrap(), SchemaBranch::CreateTable);
        assert_eq!(pipeline.ensure_schema().await.unwrap(), SchemaBranch::SkipCreate);
    }

    #[tokio::test]
    async fn concurrent_trigger_is_skipped_while_a_run_is_active() {
        let pipeline = empty_pipeline().await;
        let _held = pipeline.active_run.lock().await;
        let run = PipelineRun::new(vec!["tech".into()], 10, RunTrigger::Scheduled);
        assert!(pipeline.try_run_once(run).await.is_none());
    }
}
