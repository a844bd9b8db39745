use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use newsflow_core::{SentimentClass, SentimentScore};
use newsflow_storage::HttpFetcher;
use serde::Deserialize;
use serde_json::json;

/// Input limit of the RoBERTa-family sentiment models this pipeline targets.
pub const DEFAULT_MAX_INPUT_TOKENS: usize = 512;

/// Capability interface over any sentiment model, local or remote.
#[async_trait]
pub trait SentimentClassifier: Send + Sync {
    fn model_id(&self) -> &str;

    async fn classify(&self, text: &str) -> Result<SentimentScore>;
}

/// Keep the first `max_tokens` whitespace-delimited tokens. Longer text is cut, never chunked.
pub fn truncate_tokens(text: &str, max_tokens: usize) -> &str {
    let mut tokens = 0usize;
    let mut in_token = false;
    for (idx, ch) in text.char_indices() {
        if ch.is_whitespace() {
            in_token = false;
        } else if !in_token {
            if tokens == max_tokens {
                return text[..idx].trim_end();
            }
            tokens += 1;
            in_token = true;
        }
    }
    text
}

/// General-news word weights. Positive values push toward Positive, negative toward Negative.
const LEXICON: &[(&str, f64)] = &[
    ("gain", 0.4),
    ("gains", 0.4),
    ("growth", 0.4),
    ("rally", 0.5),
    ("rallied", 0.5),
    ("record", 0.3),
    ("surge", 0.4),
    ("strong", 0.3),
    ("success", 0.5),
    ("win", 0.4),
    ("wins", 0.4),
    ("improve", 0.3),
    ("improved", 0.3),
    ("breakthrough", 0.6),
    ("optimistic", 0.5),
    ("good", 0.3),
    ("great", 0.4),
    ("best", 0.4),
    ("crash", -0.6),
    ("crisis", -0.6),
    ("decline", -0.4),
    ("fell", -0.4),
    ("fall", -0.3),
    ("loss", -0.4),
    ("losses", -0.4),
    ("fraud", -0.7),
    ("lawsuit", -0.5),
    ("recession", -0.6),
    ("war", -0.6),
    ("fear", -0.5),
    ("fears", -0.5),
    ("weak", -0.3),
    ("bad", -0.4),
    ("worst", -0.6),
    ("failure", -0.5),
    ("layoffs", -0.5),
];

const NEUTRAL_BIAS: f64 = 0.5;
const LOGIT_SCALE: f64 = 2.0;

/// Deterministic word-weight model. Used when no hosted model is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LexiconClassifier;

impl LexiconClassifier {
    fn logits(text: &str) -> [f64; 3] {
        let mut positive = 0.0;
        let mut negative = 0.0;
        for word in text.split_whitespace() {
            let w = word
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase();
            if let Some(&(_, weight)) = LEXICON.iter().find(|(lex, _)| *lex == w) {
                if weight > 0.0 {
                    positive += weight;
                } else {
                    negative -= weight;
                }
            }
        }
        [negative * LOGIT_SCALE, NEUTRAL_BIAS, positive * LOGIT_SCALE]
    }
}

#[async_trait]
impl SentimentClassifier for LexiconClassifier {
    fn model_id(&self) -> &str {
        "lexicon-v1"
    }

    async fn classify(&self, text: &str) -> Result<SentimentScore> {
        Ok(SentimentScore::from_logits(Self::logits(text))?)
    }
}

#[derive(Debug, Deserialize)]
struct LabelScore {
    label: String,
    score: f64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InferenceResponse {
    Batched(Vec<Vec<LabelScore>>),
    Single(Vec<LabelScore>),
}

fn label_class(label: &str) -> Option<SentimentClass> {
    match label.to_ascii_lowercase().as_str() {
        "label_0" | "negative" | "neg" => Some(SentimentClass::Negative),
        "label_1" | "neutral" | "neu" => Some(SentimentClass::Neutral),
        "label_2" | "positive" | "pos" => Some(SentimentClass::Positive),
        _ => None,
    }
}

fn scores_to_distribution(scores: &[LabelScore]) -> Result<[f64; 3]> {
    let mut probabilities = [None; 3];
    for entry in scores {
        let class = label_class(&entry.label)
            .ok_or_else(|| anyhow!("unknown sentiment label {:?}", entry.label))?;
        if probabilities[class.index()].replace(entry.score).is_some() {
            bail!("sentiment label {:?} returned twice", entry.label);
        }
    }
    let mut out = [0.0; 3];
    for class in SentimentClass::ALL {
        out[class.index()] = probabilities[class.index()]
            .ok_or_else(|| anyhow!("model returned no score for {class}"))?;
    }
    Ok(out)
}

/// Hosted text-classification endpoint (Hugging Face inference shape).
#[derive(Debug, Clone)]
pub struct HttpClassifier {
    http: HttpFetcher,
    endpoint: String,
    token: Option<String>,
}

impl HttpClassifier {
    pub fn new(http: HttpFetcher, endpoint: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            token,
        }
    }
}

#[async_trait]
impl SentimentClassifier for HttpClassifier {
    fn model_id(&self) -> &str {
        &self.endpoint
    }

    async fn classify(&self, text: &str) -> Result<SentimentScore> {
        let resp: InferenceResponse = self
            .http
            .post_json(
                &self.endpoint,
                self.token.as_deref(),
                &json!({ "inputs": text, "parameters": { "truncation": true } }),
            )
            .await?;
        let scores = match resp {
            InferenceResponse::Batched(mut batches) => {
                if batches.len() != 1 {
                    bail!("expected one result set, got {}", batches.len());
                }
                batches.remove(0)
            }
            InferenceResponse::Single(scores) => scores,
        };
        Ok(SentimentScore::from_probabilities(scores_to_distribution(&scores)?)?)
    }
}
