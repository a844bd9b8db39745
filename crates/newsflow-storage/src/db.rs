use std::collections::HashSet;
use std::str::FromStr;

use anyhow::{Context, Result};
use newsflow_core::ClassifiedRecord;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

const CREATE_NEWS_TABLE: &str = r#"
CREATE TABLE news (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source TEXT,
    author TEXT,
    title TEXT,
    description TEXT,
    url TEXT,
    date TEXT,
    content TEXT,
    predicted_class INTEGER,
    probabilities TEXT,
    query TEXT
)
"#;

const INSERT_NEWS_ROW: &str = r#"
INSERT INTO news (source, author, title, description, url, date, content, predicted_class, probabilities, query)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

/// A `news` row as read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredNews {
    pub id: i64,
    pub source: String,
    pub author: String,
    pub title: String,
    pub description: Option<String>,
    pub url: String,
    pub date: String,
    pub content: String,
    pub predicted_class: i64,
    pub probabilities: Vec<f64>,
    pub query: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Appended {
    pub inserted: usize,
    pub total_rows: i64,
}

/// Explicit handle to the durable store.
///
/// Every operation checks a connection out of the pool and returns it when the
/// future completes or is dropped, so a failed attempt never leaks a connection
/// into the next retry.
#[derive(Debug, Clone)]
pub struct NewsStore {
    pool: SqlitePool,
}

impl NewsStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("parsing database url {database_url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating database directory {}", parent.display()))?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to {database_url}"))?;
        Ok(Self { pool })
    }

    /// Private in-memory database. A single pinned connection keeps it alive.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("opening in-memory sqlite")?;
        Ok(Self { pool })
    }

    pub async fn table_exists(&self, table: &str) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table)
            .fetch_one(&self.pool)
            .await
    }

    /// Plain `CREATE TABLE`: creating over an existing table is an error, not a no-op.
    pub async fn create_news_table(&self) -> Result<(), sqlx::Error> {
        sqlx::query(CREATE_NEWS_TABLE).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn existing_titles(&self) -> Result<HashSet<String>, sqlx::Error> {
        let titles: Vec<Option<String>> = sqlx::query_scalar("SELECT title FROM news")
            .fetch_all(&self.pool)
            .await?;
        Ok(titles.into_iter().flatten().collect())
    }

    /// Append every record in one transaction. Nothing is written unless all rows are.
    /// The table size is read inside the same transaction.
    pub async fn append_records(&self, records: &[ClassifiedRecord]) -> Result<Appended> {
        let mut tx = self.pool.begin().await.context("opening write transaction")?;
        for record in records {
            let article = &record.article;
            let probabilities = serde_json::to_string(&record.probabilities)
                .context("encoding probabilities")?;
            sqlx::query(INSERT_NEWS_ROW)
                .bind(&article.source)
                .bind(&article.author)
                .bind(&article.title)
                .bind(&article.description)
                .bind(&article.url)
                .bind(article.publish_date.to_string())
                .bind(&article.content)
                .bind(record.predicted_class.index() as i64)
                .bind(probabilities)
                .bind(&article.query)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("inserting news row titled {:?}", article.title))?;
        }
        let total_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM news")
            .fetch_one(&mut *tx)
            .await
            .context("counting news rows")?;
        tx.commit().await.context("committing news rows")?;
        Ok(Appended {
            inserted: records.len(),
            total_rows,
        })
    }

    pub async fn row_count(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM news")
            .fetch_one(&self.pool)
            .await
    }

    pub async fn load_rows(&self) -> Result<Vec<StoredNews>> {
        let rows = sqlx::query(
            r#"
            SELECT id, source, author, title, description, url, date, content,
                   predicted_class, probabilities, query
              FROM news
             ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let probabilities: String = row.try_get("probabilities")?;
            out.push(StoredNews {
                id: row.try_get("id")?,
                source: row.try_get("source")?,
                author: row.try_get("author")?,
                title: row.try_get("title")?,
                description: row.try_get("description")?,
                url: row.try_get("url")?,
                date: row.try_get("date")?,
                content: row.try_get("content")?,
                predicted_class: row.try_get("predicted_class")?,
                probabilities: serde_json::from_str(&probabilities)
                    .with_context(|| format!("decoding probabilities {probabilities}"))?,
                query: row.try_get("query")?,
            });
        }
        Ok(out)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
