//! Core domain model for the news sentiment pipeline.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "newsflow-core";

/// Name of the durable table every run appends to.
pub const NEWS_TABLE: &str = "news";

/// Allowed drift of a probability distribution's sum away from 1.0.
pub const PROBABILITY_TOLERANCE: f64 = 1e-4;

/// Nested `source` object as the search API returns it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RawSource {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// One row of the extractor's raw batch, tagged with the query that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawArticle {
    #[serde(default)]
    pub source: Option<RawSource>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub url_to_image: Option<String>,
    #[serde(default)]
    pub published_at: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub query: String,
}

/// Canonical article after normalization. `title` is the dedup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArticleRecord {
    pub source: String,
    pub author: String,
    pub title: String,
    pub description: Option<String>,
    pub url: String,
    pub publish_date: NaiveDate,
    pub content: String,
    pub query: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentimentClass {
    Negative,
    Neutral,
    Positive,
}

impl SentimentClass {
    pub const ALL: [SentimentClass; 3] = [Self::Negative, Self::Neutral, Self::Positive];

    pub fn index(self) -> usize {
        match self {
            Self::Negative => 0,
            Self::Neutral => 1,
            Self::Positive => 2,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Negative => "negative",
            Self::Neutral => "neutral",
            Self::Positive => "positive",
        }
    }
}

impl fmt::Display for SentimentClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ScoreError {
    #[error("probability {value} at index {index} is outside [0, 1]")]
    OutOfRange { index: usize, value: f64 },
    #[error("probabilities sum to {sum}, expected 1.0")]
    BadSum { sum: f64 },
    #[error("logits must be finite")]
    NonFiniteLogits,
}

/// Classifier output: the full three-class distribution plus its argmax.
///
/// Only constructible through [`SentimentScore::from_probabilities`] or
/// [`SentimentScore::from_logits`], so every value satisfies the shape contract.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SentimentScore {
    predicted_class: SentimentClass,
    probabilities: [f64; 3],
}

impl SentimentScore {
    pub fn from_probabilities(probabilities: [f64; 3]) -> Result<Self, ScoreError> {
        for (index, &value) in probabilities.iter().enumerate() {
            if !(0.0..=1.0).contains(&value) {
                return Err(ScoreError::OutOfRange { index, value });
            }
        }
        let sum: f64 = probabilities.iter().sum();
        if (sum - 1.0).abs() > PROBABILITY_TOLERANCE {
            return Err(ScoreError::BadSum { sum });
        }

        // First maximum wins on ties, matching argmax semantics.
        let mut best = 0;
        for (index, &value) in probabilities.iter().enumerate().skip(1) {
            if value > probabilities[best] {
                best = index;
            }
        }

        Ok(Self {
            predicted_class: SentimentClass::ALL[best],
            probabilities,
        })
    }

    pub fn from_logits(logits: [f64; 3]) -> Result<Self, ScoreError> {
        if logits.iter().any(|l| !l.is_finite()) {
            return Err(ScoreError::NonFiniteLogits);
        }
        let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let exps = logits.map(|l| (l - max).exp());
        let total: f64 = exps.iter().sum();
        Self::from_probabilities(exps.map(|e| e / total))
    }

    pub fn predicted_class(&self) -> SentimentClass {
        self.predicted_class
    }

    pub fn probabilities(&self) -> [f64; 3] {
        self.probabilities
    }
}

/// Canonical article extended with its sentiment label.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifiedRecord {
    #[serde(flatten)]
    pub article: ArticleRecord,
    pub predicted_class: SentimentClass,
    pub probabilities: [f64; 3],
}

impl ClassifiedRecord {
    pub fn new(article: ArticleRecord, score: SentimentScore) -> Self {
        Self {
            article,
            predicted_class: score.predicted_class(),
            probabilities: score.probabilities(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Scheduled,
    Manual,
}

impl fmt::Display for RunTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheduled => f.write_str("scheduled"),
            Self::Manual => f.write_str("manual"),
        }
    }
}

/// Per-invocation context. Lives only for one execution of the stage sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub queries: Vec<String>,
    pub page_size: u32,
    pub started_at: DateTime<Utc>,
    pub trigger: RunTrigger,
}

impl PipelineRun {
    pub fn new(queries: Vec<String>, page_size: u32, trigger: RunTrigger) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            queries,
            page_size,
            started_at: Utc::now(),
            trigger,
        }
    }
}

/// Error taxonomy shared by every stage of the pipeline.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("fetch error: {0:#}")]
    Fetch(anyhow::Error),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("classification error: {0:#}")]
    Classification(anyhow::Error),
    #[error("schema error: {0:#}")]
    Schema(anyhow::Error),
    #[error("persistence error: {0:#}")]
    Persistence(anyhow::Error),
}

impl StageError {
    /// Validation faults come from the input itself; re-running the stage cannot fix them.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Validation(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Fetch(_) => "fetch",
            Self::Validation(_) => "validation",
            Self::Classification(_) => "classification",
            Self::Schema(_) => "schema",
            Self::Persistence(_) => "persistence",
        }
    }
}
