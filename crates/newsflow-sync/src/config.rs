//! Environment and pipeline-file configuration.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use newsflow_adapters::{DEFAULT_MAX_INPUT_TOKENS, MAX_PAGE_SIZE, NEWSAPI_BASE_URL};
use newsflow_core::{PipelineRun, RunTrigger};
use serde::Deserialize;

use crate::classify::ClassifyOptions;
use crate::retry::RetryPolicy;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://./shared/news_data.db";
pub const DEFAULT_ARTIFACTS_DIR: &str = "./shared/artifacts";
/// Top of every hour. The scheduler's cron dialect has a leading seconds field.
pub const DEFAULT_CRON: &str = "0 0 * * * *";
pub const DEFAULT_QUERIES: [&str; 5] = [
    "artificial intelligence",
    "election",
    "stock market",
    "tech",
    "economy",
];

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub database_url: String,
    pub artifacts_dir: Option<PathBuf>,
    pub newsapi_key: Option<String>,
    pub newsapi_base_url: String,
    pub queries: Vec<String>,
    pub page_size: u32,
    pub lookback_days: i64,
    pub cron: String,
    pub scheduler_enabled: bool,
    pub retries: u32,
    pub retry_delay: Duration,
    pub http_timeout: Duration,
    pub user_agent: String,
    pub max_input_tokens: usize,
    pub classify_concurrency: usize,
    pub classifier_url: Option<String>,
    pub classifier_token: Option<String>,
    pub failure_webhook: Option<String>,
    pub fixture_path: Option<PathBuf>,
    pub pipeline_file: Option<PathBuf>,
}

/// Optional YAML overlay. Only the keys present override the environment.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineFile {
    pub queries: Option<Vec<String>>,
    pub page_size: Option<u32>,
    pub cron: Option<String>,
    pub retries: Option<u32>,
    pub retry_delay_secs: Option<u64>,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::from_lookup(|key| std::env::var(key).ok())?;
        if let Some(path) = config.pipeline_file.clone() {
            config.apply_file(&PipelineFile::load(&path)?)?;
        }
        Ok(config)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let queries = match var("NEWSFLOW_QUERIES") {
            Some(list) => parse_queries(&list),
            None => DEFAULT_QUERIES.iter().map(|q| q.to_string()).collect(),
        };

        let config = Self {
            database_url: var("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            // Set but empty disables artifacts; unset uses the default directory.
            artifacts_dir: match lookup("ARTIFACTS_DIR") {
                Some(dir) if dir.trim().is_empty() => None,
                Some(dir) => Some(PathBuf::from(dir.trim())),
                None => Some(PathBuf::from(DEFAULT_ARTIFACTS_DIR)),
            },
            newsapi_key: var("NEWSAPI_KEY"),
            newsapi_base_url: var("NEWSAPI_BASE_URL").unwrap_or_else(|| NEWSAPI_BASE_URL.to_string()),
            queries,
            page_size: parsed(&var, "NEWSFLOW_PAGE_SIZE", MAX_PAGE_SIZE)?,
            lookback_days: parsed(&var, "NEWSFLOW_LOOKBACK_DAYS", 31)?,
            cron: var("NEWSFLOW_CRON").unwrap_or_else(|| DEFAULT_CRON.to_string()),
            scheduler_enabled: var("NEWSFLOW_SCHEDULER_ENABLED")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            retries: parsed(&var, "NEWSFLOW_RETRIES", 1)?,
            retry_delay: Duration::from_secs(parsed(&var, "NEWSFLOW_RETRY_DELAY_SECS", 60)?),
            http_timeout: Duration::from_secs(parsed(&var, "NEWSFLOW_HTTP_TIMEOUT_SECS", 20)?),
            user_agent: var("NEWSFLOW_USER_AGENT")
                .unwrap_or_else(|| concat!("newsflow/", env!("CARGO_PKG_VERSION")).to_string()),
            max_input_tokens: parsed(&var, "NEWSFLOW_MAX_INPUT_TOKENS", DEFAULT_MAX_INPUT_TOKENS)?,
            classify_concurrency: parsed(&var, "NEWSFLOW_CLASSIFY_CONCURRENCY", 1)?,
            classifier_url: var("NEWSFLOW_CLASSIFIER_URL"),
            classifier_token: var("NEWSFLOW_CLASSIFIER_TOKEN"),
            failure_webhook: var("NEWSFLOW_FAILURE_WEBHOOK"),
            fixture_path: var("NEWSFLOW_FIXTURE").map(PathBuf::from),
            pipeline_file: var("NEWSFLOW_PIPELINE_FILE").map(PathBuf::from),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn apply_file(&mut self, file: &PipelineFile) -> Result<()> {
        if let Some(queries) = &file.queries {
            self.queries = queries
                .iter()
                .map(|q| q.trim().to_string())
                .filter(|q| !q.is_empty())
                .collect();
        }
        if let Some(page_size) = file.page_size {
            self.page_size = page_size;
        }
        if let Some(cron) = &file.cron {
            self.cron = cron.clone();
        }
        if let Some(retries) = file.retries {
            self.retries = retries;
        }
        if let Some(secs) = file.retry_delay_secs {
            self.retry_delay = Duration::from_secs(secs);
        }
        self.validate()
    }

    fn validate(&self) -> Result<()> {
        if self.queries.is_empty() {
            bail!("at least one search query is required");
        }
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            bail!("page size must be between 1 and {MAX_PAGE_SIZE}, got {}", self.page_size);
        }
        if self.max_input_tokens == 0 {
            bail!("max input tokens must be positive");
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_retries(self.retries, self.retry_delay)
    }

    pub fn classify_options(&self) -> ClassifyOptions {
        ClassifyOptions {
            max_input_tokens: self.max_input_tokens,
            concurrency: self.classify_concurrency.max(1),
        }
    }

    pub fn new_run(&self, trigger: RunTrigger) -> PipelineRun {
        PipelineRun::new(self.queries.clone(), self.page_size, trigger)
    }
}

impl PipelineFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

fn parse_queries(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(str::to_string)
        .collect()
}

fn parsed<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(key) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("invalid value {raw:?} for {key}")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<PipelineConfig> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PipelineConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.artifacts_dir, Some(PathBuf::from(DEFAULT_ARTIFACTS_DIR)));
        assert_eq!(config.queries.len(), 5);
        assert_eq!(config.page_size, 100);
        assert_eq!(config.cron, DEFAULT_CRON);
        assert!(!config.scheduler_enabled);
        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.backoff_delay, Duration::from_secs(60));
    }

    #[test]
    fn reads_queries_and_numbers() {
        let config = config_from(&[
            ("NEWSFLOW_QUERIES", " tech, ,economy "),
            ("NEWSFLOW_PAGE_SIZE", "25"),
            ("NEWSFLOW_RETRIES", "3"),
            ("NEWSFLOW_SCHEDULER_ENABLED", "TRUE"),
            ("NEWSFLOW_CLASSIFY_CONCURRENCY", "4"),
        ])
        .unwrap();
        assert_eq!(config.queries, vec!["tech", "economy"]);
        assert_eq!(config.page_size, 25);
        assert_eq!(config.retry_policy().max_attempts, 4);
        assert!(config.scheduler_enabled);
        assert_eq!(config.classify_options().concurrency, 4);
    }

    #[test]
    fn empty_artifacts_dir_disables_artifacts() {
        let config = config_from(&[("ARTIFACTS_DIR", "")]).unwrap();
        assert_eq!(config.artifacts_dir, None);
    }

    #[test]
    fn rejects_bad_numbers_and_out_of_range_page_size() {
        let err = config_from(&[("NEWSFLOW_PAGE_SIZE", "lots")]).unwrap_err();
        assert!(format!("{err:#}").contains("NEWSFLOW_PAGE_SIZE"));
        assert!(config_from(&[("NEWSFLOW_PAGE_SIZE", "500")]).is_err());
        assert!(config_from(&[("NEWSFLOW_QUERIES", " , ")]).is_err());
    }

    #[test]
    fn pipeline_file_overrides_selected_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.yaml");
        std::fs::write(
            &path,
            "queries: [climate, energy]\npage_size: 10\nretry_delay_secs: 5\n",
        )
        .unwrap();

        let mut config = config_from(&[("NEWSFLOW_RETRIES", "2")]).unwrap();
        config.apply_file(&PipelineFile::load(&path).unwrap()).unwrap();
        assert_eq!(config.queries, vec!["climate", "energy"]);
        assert_eq!(config.page_size, 10);
        assert_eq!(config.retry_delay, Duration::from_secs(5));
        assert_eq!(config.retries, 2);
        assert_eq!(config.cron, DEFAULT_CRON);
    }

    #[test]
    fn unknown_pipeline_file_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.yaml");
        std::fs::write(&path, "querys: [typo]\n").unwrap();
        assert!(PipelineFile::load(&path).is_err());
    }

    #[test]
    fn new_run_carries_queries_and_page_size() {
        let config = config_from(&[("NEWSFLOW_QUERIES", "tech")]).unwrap();
        let run = config.new_run(RunTrigger::Scheduled);
        assert_eq!(run.queries, vec!["tech"]);
        assert_eq!(run.page_size, 100);
        assert_eq!(run.trigger, RunTrigger::Scheduled);
    }
}
