//! Review classification: sentiment, score and topics from an OpenAI-compatible
//! chat endpoint, with a rating-derived fallback when that call fails or times out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use revlens_core::{Classification, Sentiment, UnifiedReview};
use revlens_storage::{HttpFetcher, RequestSpec};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "revlens-classifier";

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4";

const SYSTEM_PROMPT: &str = "You are an expert in sentiment analysis of online reviews. \
Give precise, useful analysis and answer with JSON only.";

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("classifier unavailable: {0}")]
    Unavailable(String),
    #[error("classifier returned malformed output: {0}")]
    Malformed(String),
    #[error("classifier timed out after {0:?}")]
    Timeout(Duration),
}

/// External sentiment/topic judgment for a single review.
#[async_trait]
pub trait Classifier: Send + Sync {
    fn name(&self) -> &str;

    async fn classify(&self, review: &UnifiedReview) -> Result<Classification, ClassifierError>;
}

/// Derives the classification from the star rating alone. Used when no
/// model is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct RatingClassifier;

#[async_trait]
impl Classifier for RatingClassifier {
    fn name(&self) -> &str {
        "rating"
    }

    async fn classify(&self, review: &UnifiedReview) -> Result<Classification, ClassifierError> {
        Ok(Classification::fallback_for(review.rating))
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

/// Chat-completions classifier for any OpenAI-compatible endpoint.
pub struct OpenAiClassifier {
    http: Arc<HttpFetcher>,
    config: OpenAiConfig,
}

impl OpenAiClassifier {
    pub fn new(http: Arc<HttpFetcher>, config: OpenAiConfig) -> Self {
        Self { http, config }
    }

    fn request_for(&self, review: &UnifiedReview) -> RequestSpec {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let body = json!({
            "model": self.config.model,
            "temperature": 0.3,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": review_prompt(review)},
            ],
        });
        RequestSpec::post_json(url, body).bearer(&self.config.api_key)
    }
}

#[async_trait]
impl Classifier for OpenAiClassifier {
    fn name(&self) -> &str {
        "openai"
    }

    async fn classify(&self, review: &UnifiedReview) -> Result<Classification, ClassifierError> {
        let body: JsonValue = self
            .http
            .fetch_json("openai", &self.request_for(review))
            .await
            .map_err(|e| ClassifierError::Unavailable(e.to_string()))?;
        parse_completion(body)
    }
}

pub fn review_prompt(review: &UnifiedReview) -> String {
    format!(
        "Analyze this review.\n\n\
         Platform: {platform}\n\
         Rating: {rating}/5\n\
         Title: {title}\n\
         Content: {content}\n\
         Author: {author}\n\n\
         Reply with a JSON object:\n\
         {{\"sentiment\": \"POSITIVE|NEGATIVE|NEUTRAL\", \"sentimentScore\": number between -1 and 1, \
         \"topics\": [\"topic\", ...], \"summary\": \"short summary\", \"actionItems\": [\"action\", ...]}}",
        platform = review.platform,
        rating = review.rating,
        title = review.title.as_deref().unwrap_or("(untitled)"),
        content = review.content,
        author = review.author_name.as_deref().unwrap_or("anonymous"),
    )
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReviewAnalysis {
    sentiment: String,
    sentiment_score: f64,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    action_items: Vec<String>,
}

/// Models often wrap JSON answers in a markdown code fence.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

pub fn parse_analysis(content: &str) -> Result<Classification, ClassifierError> {
    let analysis: ReviewAnalysis = serde_json::from_str(strip_code_fence(content))
        .map_err(|e| ClassifierError::Malformed(e.to_string()))?;
    let sentiment: Sentiment = analysis
        .sentiment
        .parse()
        .map_err(|e| ClassifierError::Malformed(format!("{e}")))?;
    if !analysis.sentiment_score.is_finite() {
        return Err(ClassifierError::Malformed("non-finite sentimentScore".into()));
    }
    let topics = analysis
        .topics
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    Ok(Classification {
        sentiment,
        sentiment_score: analysis.sentiment_score.clamp(-1.0, 1.0),
        topics,
        meta: json!({
            "summary": analysis.summary,
            "actionItems": analysis.action_items,
        }),
    })
}

pub fn parse_completion(body: JsonValue) -> Result<Classification, ClassifierError> {
    let completion: ChatCompletion =
        serde_json::from_value(body).map_err(|e| ClassifierError::Malformed(e.to_string()))?;
    let content = completion
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| ClassifierError::Malformed("completion has no message content".into()))?;
    parse_analysis(&content)
}

/// Total wrapper around a [`Classifier`]: bounded by a timeout, and any
/// failure degrades to the rating-derived fallback.
#[derive(Clone)]
pub struct ClassifierGateway {
    inner: Arc<dyn Classifier>,
    timeout: Duration,
}

impl ClassifierGateway {
    pub fn new(inner: Arc<dyn Classifier>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn rating_only() -> Self {
        Self::new(Arc::new(RatingClassifier), Duration::from_secs(1))
    }

    pub fn classifier_name(&self) -> &str {
        self.inner.name()
    }

    pub async fn classify(&self, review: &UnifiedReview) -> Classification {
        let outcome = match tokio::time::timeout(self.timeout, self.inner.classify(review)).await {
            Ok(result) => result,
            Err(_) => Err(ClassifierError::Timeout(self.timeout)),
        };
        match outcome {
            Ok(classification) => classification,
            Err(err) => {
                warn!(
                    classifier = self.inner.name(),
                    platform = %review.platform,
                    source_native_id = %review.source_native_id,
                    error = %err,
                    "classification failed; using rating fallback"
                );
                Classification::fallback_for(review.rating)
            }
        }
    }
}
