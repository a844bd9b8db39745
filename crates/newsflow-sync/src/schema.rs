//! Create-or-skip branch for the `news` table, reconverging at a join.

use anyhow::anyhow;
use newsflow_core::{StageError, NEWS_TABLE};
use newsflow_storage::NewsStore;
use serde::Serialize;
use tracing::info;

use crate::retry::{run_stage, RetryPolicy, RunError, Stage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaBranch {
    CreateTable,
    SkipCreate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaState {
    Unchecked,
    TableExists,
    TableMissing,
    Joined(SchemaBranch),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchStatus {
    Pending,
    Succeeded,
    Skipped,
    Failed,
}

/// Join rule: no branch failed and at least one succeeded. The guard only ever runs
/// one branch, so both succeeding is treated as a broken invariant.
pub fn join(create: BranchStatus, skip: BranchStatus) -> Result<SchemaBranch, StageError> {
    use BranchStatus::*;
    match (create, skip) {
        (Failed, _) | (_, Failed) => Err(StageError::Schema(anyhow!(
            "schema branch failed (create: {create:?}, skip: {skip:?})"
        ))),
        (Succeeded, Succeeded) => Err(StageError::Schema(anyhow!(
            "both schema branches ran; exactly one is allowed"
        ))),
        (Succeeded, _) => Ok(SchemaBranch::CreateTable),
        (_, Succeeded) => Ok(SchemaBranch::SkipCreate),
        _ => Err(StageError::Schema(anyhow!(
            "join reached before any schema branch succeeded"
        ))),
    }
}

pub struct SchemaGuard<'a> {
    store: &'a NewsStore,
    state: SchemaState,
    create: BranchStatus,
    skip: BranchStatus,
}

impl<'a> SchemaGuard<'a> {
    pub fn new(store: &'a NewsStore) -> Self {
        Self {
            store,
            state: SchemaState::Unchecked,
            create: BranchStatus::Pending,
            skip: BranchStatus::Pending,
        }
    }

    pub fn state(&self) -> SchemaState {
        self.state
    }

    /// Advance one transition. `Joined` is terminal.
    pub async fn step(&mut self) -> Result<SchemaState, StageError> {
        self.state = match self.state {
            SchemaState::Unchecked => {
                let exists = self
                    .store
                    .table_exists(NEWS_TABLE)
                    .await
                    .map_err(|err| StageError::Schema(anyhow!(err).context("inspecting catalog")))?;
                if exists {
                    SchemaState::TableExists
                } else {
                    SchemaState::TableMissing
                }
            }
            SchemaState::TableExists => {
                self.create = BranchStatus::Skipped;
                self.skip = BranchStatus::Succeeded;
                info!(table = NEWS_TABLE, "table present; skipping create");
                SchemaState::Joined(join(self.create, self.skip)?)
            }
            SchemaState::TableMissing => {
                self.skip = BranchStatus::Skipped;
                if let Err(err) = self.store.create_news_table().await {
                    self.create = BranchStatus::Failed;
                    return Err(StageError::Schema(anyhow!(err).context("creating news table")));
                }
                self.create = BranchStatus::Succeeded;
                info!(table = NEWS_TABLE, "table missing; created");
                SchemaState::Joined(join(self.create, self.skip)?)
            }
            joined @ SchemaState::Joined(_) => joined,
        };
        Ok(self.state)
    }

    pub async fn run_to_join(mut self) -> Result<SchemaBranch, StageError> {
        loop {
            if let SchemaState::Joined(branch) = self.step().await? {
                return Ok(branch);
            }
        }
    }
}

/// Run the guard as a retried stage. Needs nothing but the store.
pub async fn ensure_schema(store: &NewsStore, policy: RetryPolicy) -> Result<SchemaBranch, RunError> {
    let out = run_stage(Stage::SchemaGuard, policy, move || {
        SchemaGuard::new(store).run_to_join()
    })
    .await?;
    Ok(out.value)
}
