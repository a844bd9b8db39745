//! Per-run copies of each stage's batch plus a Parquet snapshot of the classified rows.
//!
//! Stage handoff itself is in memory; nothing here can fail a run. Write errors are
//! logged and the entry is left out of the manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use newsflow_core::{ClassifiedRecord, PipelineRun};
use newsflow_storage::ArtifactStore;
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::retry::Stage;

pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestEntry {
    pub stage: Stage,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub files: Vec<ManifestEntry>,
}

pub struct RunArtifacts<'a> {
    store: &'a ArtifactStore,
    run: &'a PipelineRun,
    files: Vec<ManifestEntry>,
}

impl<'a> RunArtifacts<'a> {
    pub fn new(store: &'a ArtifactStore, run: &'a PipelineRun) -> Self {
        Self {
            store,
            run,
            files: Vec::new(),
        }
    }

    pub fn run_dir(&self) -> PathBuf {
        self.store.run_dir(self.run.started_at)
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.files
    }

    /// Write a stage's output batch as hash-addressed JSON.
    pub async fn record_stage<T: Serialize>(&mut self, stage: Stage, batch: &[T]) {
        match self
            .store
            .store_json(self.run.started_at, stage.as_str(), batch)
            .await
        {
            Ok(stored) => {
                debug!(%stage, path = %stored.relative_path.display(), deduplicated = stored.deduplicated, "stage artifact stored");
                self.files.push(ManifestEntry {
                    stage,
                    path: stored.relative_path.display().to_string(),
                    sha256: stored.content_hash,
                    bytes: stored.byte_size as u64,
                    rows: batch.len(),
                });
            }
            Err(err) => warn!(%stage, error = %format!("{err:#}"), "stage artifact not written"),
        }
    }

    pub async fn record_classified_snapshot(&mut self, batch: &[ClassifiedRecord]) {
        let snapshot_dir = self.run_dir().join("snapshots");
        let path = snapshot_dir.join("classified.parquet");
        let written = async {
            fs::create_dir_all(&snapshot_dir)
                .await
                .with_context(|| format!("creating {}", snapshot_dir.display()))?;
            write_classified_parquet(&path, batch)?;
            let bytes = fs::read(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            Ok::<_, anyhow::Error>(bytes)
        }
        .await;

        match written {
            Ok(bytes) => {
                let relative = path
                    .strip_prefix(self.store.root())
                    .unwrap_or(&path)
                    .display()
                    .to_string();
                self.files.push(ManifestEntry {
                    stage: Stage::Classify,
                    path: relative,
                    sha256: ArtifactStore::sha256_hex(&bytes),
                    bytes: bytes.len() as u64,
                    rows: batch.len(),
                });
            }
            Err(err) => warn!(error = %format!("{err:#}"), "classified snapshot not written"),
        }
    }

    /// Write `manifest.json` into the run directory. Returns its path when written.
    pub async fn finish(self) -> Option<PathBuf> {
        let manifest = RunManifest {
            schema_version: MANIFEST_SCHEMA_VERSION,
            run_id: self.run.run_id,
            files: self.files,
        };
        let run_dir = self.store.run_dir(self.run.started_at);
        let path = run_dir.join("manifest.json");
        let written = async {
            let bytes = serde_json::to_vec_pretty(&manifest).context("serializing run manifest")?;
            fs::create_dir_all(&run_dir)
                .await
                .with_context(|| format!("creating {}", run_dir.display()))?;
            fs::write(&path, bytes)
                .await
                .with_context(|| format!("writing {}", path.display()))
        }
        .await;
        match written {
            Ok(()) => Some(path),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "run manifest not written");
                None
            }
        }
    }
}

fn write_classified_parquet(path: &Path, batch: &[ClassifiedRecord]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("source", DataType::Utf8, false),
        ArrowField::new("author", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("description", DataType::Utf8, true),
        ArrowField::new("url", DataType::Utf8, false),
        ArrowField::new("date", DataType::Utf8, false),
        ArrowField::new("query", DataType::Utf8, false),
        ArrowField::new("predicted_class", DataType::Utf8, false),
        ArrowField::new("prob_negative", DataType::Float64, false),
        ArrowField::new("prob_neutral", DataType::Float64, false),
        ArrowField::new("prob_positive", DataType::Float64, false),
    ]));

    let text = |f: fn(&ClassifiedRecord) -> &str| {
        StringArray::from(batch.iter().map(|r| Some(f(r))).collect::<Vec<_>>())
    };
    let prob = |i: usize| Float64Array::from(batch.iter().map(|r| r.probabilities[i]).collect::<Vec<_>>());
    let descriptions = StringArray::from(
        batch
            .iter()
            .map(|r| r.article.description.as_deref())
            .collect::<Vec<_>>(),
    );
    let dates = StringArray::from(
        batch
            .iter()
            .map(|r| Some(r.article.publish_date.to_string()))
            .collect::<Vec<_>>(),
    );

    let record_batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(text(|r| &r.article.source)),
            Arc::new(text(|r| &r.article.author)),
            Arc::new(text(|r| &r.article.title)),
            Arc::new(descriptions),
            Arc::new(text(|r| &r.article.url)),
            Arc::new(dates),
            Arc::new(text(|r| &r.article.query)),
            Arc::new(text(|r| r.predicted_class.as_str())),
            Arc::new(prob(0)),
            Arc::new(prob(1)),
            Arc::new(prob(2)),
        ],
    )
    .context("building classified record batch")?;

    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, record_batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&record_batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}
