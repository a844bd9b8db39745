//! Raw batch → canonical article batch.

use std::collections::HashSet;

use chrono::NaiveDate;
use newsflow_core::{ArticleRecord, RawArticle, StageError};
use serde::Serialize;

/// Length of `YYYY-MM-DD`, the calendar-date prefix of an ISO-8601 timestamp.
const DATE_PREFIX_LEN: usize = 10;

/// Reshaped row before null filtering. Equality over every field drives exact dedup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ReshapedRow {
    source: Option<String>,
    author: Option<String>,
    title: Option<String>,
    description: Option<String>,
    url: Option<String>,
    publish_date: Option<String>,
    content: Option<String>,
    query: String,
}

impl From<&RawArticle> for ReshapedRow {
    fn from(raw: &RawArticle) -> Self {
        Self {
            source: raw
                .source
                .as_ref()
                .and_then(|s| s.name.clone().or_else(|| s.id.clone())),
            author: raw.author.clone(),
            title: raw.title.clone(),
            description: raw.description.clone(),
            url: raw.url.clone(),
            // urlToImage is dropped.
            publish_date: raw
                .published_at
                .as_ref()
                .map(|ts| ts.chars().take(DATE_PREFIX_LEN).collect()),
            content: raw.content.clone(),
            query: raw.query.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizeOutcome {
    pub records: Vec<ArticleRecord>,
    pub duplicates_removed: usize,
    pub incomplete_dropped: usize,
}

/// Reshape, drop exact duplicates (first occurrence wins), then drop rows with no
/// content or author. Dedup runs before the null filter.
pub fn normalize(raw: &[RawArticle]) -> Result<NormalizeOutcome, StageError> {
    let mut seen = HashSet::with_capacity(raw.len());
    let mut unique = Vec::with_capacity(raw.len());
    for row in raw.iter().map(ReshapedRow::from) {
        if seen.insert(row.clone()) {
            unique.push(row);
        }
    }
    let duplicates_removed = raw.len() - unique.len();

    let complete: Vec<ReshapedRow> = unique
        .into_iter()
        .filter(|row| row.content.is_some() && row.author.is_some())
        .collect();
    let incomplete_dropped = raw.len() - duplicates_removed - complete.len();

    let records = complete
        .into_iter()
        .enumerate()
        .map(|(index, row)| into_record(index, row))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(NormalizeOutcome {
        records,
        duplicates_removed,
        incomplete_dropped,
    })
}

fn into_record(index: usize, row: ReshapedRow) -> Result<ArticleRecord, StageError> {
    let missing = |field: &str| {
        StageError::Validation(format!(
            "row {index} (query {:?}) has no {field}",
            row.query
        ))
    };

    let title = row
        .title
        .clone()
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| missing("title"))?;
    let url = row.url.clone().ok_or_else(|| missing("url"))?;
    let source = row.source.clone().ok_or_else(|| missing("source"))?;
    let date_text = row.publish_date.clone().ok_or_else(|| missing("publish date"))?;
    let publish_date = NaiveDate::parse_from_str(&date_text, "%Y-%m-%d").map_err(|err| {
        StageError::Validation(format!(
            "row {index} titled {title:?} has malformed publish date {date_text:?}: {err}"
        ))
    })?;

    Ok(ArticleRecord {
        source,
        author: row.author.unwrap_or_default(),
        title,
        description: row.description,
        url,
        publish_date,
        content: row.content.unwrap_or_default(),
        query: row.query,
    })
}
