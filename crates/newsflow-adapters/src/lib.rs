//! Search-source adapters feeding the extract stage, plus sentiment classifier adapters.

mod classifier;

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use newsflow_core::{PipelineRun, RawArticle};
use newsflow_storage::{FetchError, HttpFetcher};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

pub use classifier::{
    truncate_tokens, HttpClassifier, LexiconClassifier, SentimentClassifier,
    DEFAULT_MAX_INPUT_TOKENS,
};

pub const CRATE_NAME: &str = "newsflow-adapters";

pub const NEWSAPI_BASE_URL: &str = "https://newsapi.org";

/// The search API refuses page sizes above this.
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchContext {
    pub run_id: Uuid,
    pub page_size: u32,
    pub as_of: DateTime<Utc>,
}

impl From<&PipelineRun> for SearchContext {
    fn from(run: &PipelineRun) -> Self {
        Self {
            run_id: run.run_id,
            page_size: run.page_size,
            as_of: run.started_at,
        }
    }
}

#[async_trait]
pub trait NewsSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// One page of results for a single query term.
    async fn search(&self, ctx: &SearchContext, query: &str) -> Result<Vec<RawArticle>, FetchError>;
}

/// Run every query of the run in order and concatenate the results, each row tagged
/// with the term that produced it. Rows are not deduplicated across terms.
pub async fn extract(source: &dyn NewsSource, run: &PipelineRun) -> Result<Vec<RawArticle>, FetchError> {
    let ctx = SearchContext::from(run);
    let mut batch = Vec::new();
    for query in &run.queries {
        let articles = source.search(&ctx, query).await?;
        info!(
            source = source.source_id(),
            query = query.as_str(),
            articles = articles.len(),
            "search page fetched"
        );
        batch.extend(articles.into_iter().map(|mut article| {
            article.query = query.clone();
            article
        }));
    }
    Ok(batch)
}

#[derive(Debug, Deserialize)]
struct EverythingResponse {
    status: String,
    #[serde(default)]
    articles: Vec<RawArticle>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// NewsAPI `v2/everything` client.
#[derive(Debug, Clone)]
pub struct NewsApiSource {
    http: HttpFetcher,
    base_url: String,
    api_key: String,
    lookback_days: i64,
}

impl NewsApiSource {
    pub fn new(http: HttpFetcher, api_key: impl Into<String>) -> Self {
        Self {
            http,
            base_url: NEWSAPI_BASE_URL.to_string(),
            api_key: api_key.into(),
            lookback_days: 31,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_lookback_days(mut self, days: i64) -> Self {
        self.lookback_days = days.max(0);
        self
    }

    fn query_params(&self, ctx: &SearchContext, query: &str) -> Vec<(&'static str, String)> {
        let to = ctx.as_of.date_naive();
        let from = (ctx.as_of - Duration::days(self.lookback_days)).date_naive();
        vec![
            ("q", query.to_string()),
            ("from", from.format("%Y-%m-%d").to_string()),
            ("to", to.format("%Y-%m-%d").to_string()),
            ("pageSize", ctx.page_size.clamp(1, MAX_PAGE_SIZE).to_string()),
            ("apiKey", self.api_key.clone()),
        ]
    }
}

#[async_trait]
impl NewsSource for NewsApiSource {
    fn source_id(&self) -> &'static str {
        "newsapi"
    }

    async fn search(&self, ctx: &SearchContext, query: &str) -> Result<Vec<RawArticle>, FetchError> {
        let url = format!("{}/v2/everything", self.base_url);
        let params = self.query_params(ctx, query);
        let resp: EverythingResponse = self
            .http
            .get_json(ctx.run_id, self.source_id(), &url, &params)
            .await?;

        if resp.status != "ok" {
            return Err(FetchError::Api {
                code: resp.code.unwrap_or_else(|| resp.status.clone()),
                message: resp.message.unwrap_or_default(),
            });
        }
        Ok(resp.articles)
    }
}

/// Canned search results keyed by query term, for offline runs and tests.
#[derive(Debug, Clone, Default)]
pub struct FixtureNewsSource {
    pages: BTreeMap<String, Vec<RawArticle>>,
}

impl FixtureNewsSource {
    pub fn new(pages: BTreeMap<String, Vec<RawArticle>>) -> Self {
        Self { pages }
    }

    /// Load a JSON object of `{ "<query>": [<article>, ...] }`.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let pages = serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self { pages })
    }
}

#[async_trait]
impl NewsSource for FixtureNewsSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn search(&self, ctx: &SearchContext, query: &str) -> Result<Vec<RawArticle>, FetchError> {
        Ok(self
            .pages
            .get(query)
            .map(|articles| {
                articles
                    .iter()
                    .take(ctx.page_size as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use newsflow_core::RunTrigger;
    use newsflow_storage::HttpClientConfig;

    fn article(title: &str) -> RawArticle {
        RawArticle {
            title: Some(title.to_string()),
            ..Default::default()
        }
    }

    fn run(queries: &[&str], page_size: u32) -> PipelineRun {
        PipelineRun::new(
            queries.iter().map(|q| q.to_string()).collect(),
            page_size,
            RunTrigger::Manual,
        )
    }

    #[tokio::test]
    async fn extract_concatenates_in_query_order_and_tags_rows() {
        let source = FixtureNewsSource::new(BTreeMap::from([
            ("tech".to_string(), vec![article("chips"), article("shared")]),
            ("economy".to_string(), vec![article("shared")]),
        ]));

        let batch = extract(&source, &run(&["economy", "tech"], 10)).await.unwrap();
        let tagged: Vec<_> = batch
            .iter()
            .map(|a| (a.query.as_str(), a.title.as_deref().unwrap()))
            .collect();
        assert_eq!(
            tagged,
            vec![("economy", "shared"), ("tech", "chips"), ("tech", "shared")]
        );
    }

    #[tokio::test]
    async fn fixture_source_honours_page_size_and_unknown_queries() {
        let source = FixtureNewsSource::new(BTreeMap::from([(
            "tech".to_string(),
            vec![article("a"), article("b"), article("c")],
        )]));
        let batch = extract(&source, &run(&["tech", "weather"], 2)).await.unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn newsapi_params_cover_lookback_window_and_clamp_page_size() {
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let source = NewsApiSource::new(http, "key").with_lookback_days(31);
        let ctx = SearchContext {
            run_id: Uuid::nil(),
            page_size: 500,
            as_of: Utc.with_ymd_and_hms(2024, 8, 31, 9, 0, 0).single().unwrap(),
        };
        let params = source.query_params(&ctx, "stock market");
        let get = |k: &str| params.iter().find(|(key, _)| *key == k).unwrap().1.clone();
        assert_eq!(get("q"), "stock market");
        assert_eq!(get("from"), "2024-07-31");
        assert_eq!(get("to"), "2024-08-31");
        assert_eq!(get("pageSize"), "100");
        assert_eq!(get("apiKey"), "key");
    }
}
