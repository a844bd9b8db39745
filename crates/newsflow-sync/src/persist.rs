//! Append-only persistence keyed on title.

use std::collections::HashSet;

use anyhow::anyhow;
use newsflow_core::{ClassifiedRecord, StageError};
use newsflow_storage::NewsStore;
use serde::Serialize;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PersistOutcome {
    pub inserted: usize,
    pub already_stored: usize,
    pub duplicate_in_batch: usize,
    pub total_rows: i64,
}

/// Append the rows whose title is not yet stored, in one transaction.
pub async fn persist(
    store: &NewsStore,
    batch: &[ClassifiedRecord],
) -> Result<PersistOutcome, StageError> {
    let stored = store
        .existing_titles()
        .await
        .map_err(|err| failed(anyhow!(err).context("reading stored titles")))?;

    let mut batch_titles = HashSet::with_capacity(batch.len());
    let mut already_stored = 0;
    let mut duplicate_in_batch = 0;
    let mut fresh = Vec::new();
    for record in batch {
        let title = &record.article.title;
        if stored.contains(title) {
            already_stored += 1;
        } else if !batch_titles.insert(title.as_str()) {
            duplicate_in_batch += 1;
        } else {
            fresh.push(record.clone());
        }
    }

    // Nothing may fail after the append commits; its total comes from the same transaction.
    let (inserted, total_rows) = if fresh.is_empty() {
        info!(batch = batch.len(), already_stored, "no new titles; nothing to persist");
        let total_rows = store
            .row_count()
            .await
            .map_err(|err| failed(anyhow!(err).context("counting stored rows")))?;
        (0, total_rows)
    } else {
        let appended = store
            .append_records(&fresh)
            .await
            .map_err(|err| failed(err.context(format!("appending {} rows", fresh.len()))))?;
        (appended.inserted, appended.total_rows)
    };

    info!(inserted, already_stored, duplicate_in_batch, total_rows, "persisted batch");
    Ok(PersistOutcome {
        inserted,
        already_stored,
        duplicate_in_batch,
        total_rows,
    })
}

fn failed(err: anyhow::Error) -> StageError {
    error!(error = %format!("{err:#}"), "persistence failed");
    StageError::Persistence(err)
}
