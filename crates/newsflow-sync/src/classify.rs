//! Attach sentiment labels to a canonical batch.

use futures::stream::{self, StreamExt, TryStreamExt};
use newsflow_adapters::{truncate_tokens, SentimentClassifier, DEFAULT_MAX_INPUT_TOKENS};
use newsflow_core::{ArticleRecord, ClassifiedRecord, StageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifyOptions {
    pub max_input_tokens: usize,
    /// Rows classified at once. Output order always matches input order.
    pub concurrency: usize,
}

impl Default for ClassifyOptions {
    fn default() -> Self {
        Self {
            max_input_tokens: DEFAULT_MAX_INPUT_TOKENS,
            concurrency: 1,
        }
    }
}

/// Classify every row's content. The first failing row aborts the whole batch.
pub async fn classify_batch(
    classifier: &dyn SentimentClassifier,
    batch: &[ArticleRecord],
    options: ClassifyOptions,
) -> Result<Vec<ClassifiedRecord>, StageError> {
    let rows: Vec<_> = batch
        .iter()
        .enumerate()
        .map(|(index, article)| classify_row(classifier, index, article, options.max_input_tokens))
        .collect();
    stream::iter(rows)
        .buffered(options.concurrency.max(1))
        .try_collect()
        .await
}

async fn classify_row(
    classifier: &dyn SentimentClassifier,
    index: usize,
    article: &ArticleRecord,
    max_input_tokens: usize,
) -> Result<ClassifiedRecord, StageError> {
    let text = truncate_tokens(&article.content, max_input_tokens);
    let score = classifier.classify(text).await.map_err(|err| {
        StageError::Classification(err.context(format!(
            "row {index} titled {:?} with model {}",
            article.title,
            classifier.model_id()
        )))
    })?;
    Ok(ClassifiedRecord::new(article.clone(), score))
}
