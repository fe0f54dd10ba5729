//! Core domain model for review aggregation: the unified review shape every
//! source is normalized into, its classified/stored form, and query filters.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "revlens-core";

/// Content stored in place of blank review text.
pub const EMPTY_CONTENT_SENTINEL: &str = "(no review text)";

pub const DEFAULT_WINDOW_DAYS: u32 = 30;
pub const DEFAULT_PAGE_LIMIT: u32 = 10;
pub const MAX_PAGE_LIMIT: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("rating {0} is outside 1..=5")]
    InvalidRating(i64),
    #[error("unknown platform tag `{0}`")]
    UnknownPlatform(String),
    #[error("unknown sentiment `{0}`")]
    UnknownSentiment(String),
}

/// Review platform tag. Known platforms get their own variant; any other
/// well-formed tag (`[A-Z0-9_]+`) is carried as `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Platform {
    GoogleMaps,
    Yelp,
    Trustpilot,
    Amazon,
    Other(String),
}

impl Platform {
    pub fn as_str(&self) -> &str {
        match self {
            Platform::GoogleMaps => "GOOGLE_MAPS",
            Platform::Yelp => "YELP",
            Platform::Trustpilot => "TRUSTPILOT",
            Platform::Amazon => "AMAZON",
            Platform::Other(tag) => tag,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s
            .trim()
            .to_ascii_uppercase()
            .replace(['-', ' '], "_");
        let platform = match tag.as_str() {
            "GOOGLE_MAPS" => Platform::GoogleMaps,
            "YELP" => Platform::Yelp,
            "TRUSTPILOT" => Platform::Trustpilot,
            "AMAZON" => Platform::Amazon,
            _ if !tag.is_empty()
                && tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') =>
            {
                Platform::Other(tag)
            }
            _ => return Err(CoreError::UnknownPlatform(s.to_string())),
        };
        Ok(platform)
    }
}

impl TryFrom<String> for Platform {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Platform> for String {
    fn from(value: Platform) -> Self {
        value.as_str().to_string()
    }
}

/// Star rating, always within 1..=5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u8")]
pub struct Rating(u8);

impl Rating {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 5;

    pub fn new(value: i64) -> Result<Self, CoreError> {
        if (i64::from(Self::MIN)..=i64::from(Self::MAX)).contains(&value) {
            Ok(Self(value as u8))
        } else {
            Err(CoreError::InvalidRating(value))
        }
    }

    /// Rounds and clamps a platform-native score into 1..=5. Non-finite input has no rating.
    pub fn clamped(native: f64) -> Option<Self> {
        if !native.is_finite() {
            return None;
        }
        let rounded = native.round().clamp(f64::from(Self::MIN), f64::from(Self::MAX));
        Some(Self(rounded as u8))
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn all() -> impl Iterator<Item = Rating> {
        (Self::MIN..=Self::MAX).map(Rating)
    }
}

impl TryFrom<i64> for Rating {
    type Error = CoreError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Rating::new(value)
    }
}

impl From<Rating> for u8 {
    fn from(value: Rating) -> Self {
        value.0
    }
}

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Sentiment {
    Positive,
    Negative,
    Neutral,
}

impl Sentiment {
    pub fn as_str(self) -> &'static str {
        match self {
            Sentiment::Positive => "POSITIVE",
            Sentiment::Negative => "NEGATIVE",
            Sentiment::Neutral => "NEUTRAL",
        }
    }

    /// Rating convention: 4-5 positive, 1-2 negative, 3 neutral.
    pub fn from_rating(rating: Rating) -> Self {
        match rating.value() {
            4..=5 => Sentiment::Positive,
            1..=2 => Sentiment::Negative,
            _ => Sentiment::Neutral,
        }
    }
}

impl fmt::Display for Sentiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Sentiment {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "POSITIVE" => Ok(Sentiment::Positive),
            "NEGATIVE" => Ok(Sentiment::Negative),
            "NEUTRAL" => Ok(Sentiment::Neutral),
            _ => Err(CoreError::UnknownSentiment(s.to_string())),
        }
    }
}

/// Business match returned by a platform search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusinessInfo {
    pub id: String,
    pub name: String,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub rating: Option<f64>,
    pub review_count: Option<u64>,
}

impl BusinessInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address: None,
            phone: None,
            website: None,
            rating: None,
            review_count: None,
        }
    }
}

/// Idempotency key: unique across the stored corpus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NaturalKey {
    pub platform: Platform,
    pub source_native_id: String,
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.platform, self.source_native_id)
    }
}

/// Canonical review shape produced by every source adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnifiedReview {
    pub platform: Platform,
    pub source_native_id: String,
    pub business_name: String,
    pub business_id: Option<String>,
    pub rating: Rating,
    pub title: Option<String>,
    pub content: String,
    pub author_name: Option<String>,
    pub author_image: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub source_url: Option<String>,
}

impl UnifiedReview {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            platform: self.platform.clone(),
            source_native_id: self.source_native_id.clone(),
        }
    }
}

/// Trims review text, substituting the sentinel for blank or missing text.
pub fn normalize_content(text: Option<&str>) -> String {
    match text.map(str::trim) {
        Some(t) if !t.is_empty() => t.to_string(),
        _ => EMPTY_CONTENT_SENTINEL.to_string(),
    }
}

/// Trims an optional string, mapping blanks to `None`.
pub fn non_blank(text: Option<&str>) -> Option<String> {
    text.map(str::trim)
        .filter(|t| !t.is_empty())
        .map(ToString::to_string)
}

/// Sentiment/topic judgment for one review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub sentiment: Sentiment,
    pub sentiment_score: f64,
    pub topics: Vec<String>,
    pub meta: JsonValue,
}

impl Classification {
    /// Deterministic rating-derived classification used when the classifier
    /// cannot answer. Never fails.
    pub fn fallback_for(rating: Rating) -> Self {
        let sentiment = Sentiment::from_rating(rating);
        let sentiment_score = match sentiment {
            Sentiment::Neutral => 0.0,
            _ => (f64::from(rating.value()) - 3.0) / 2.0,
        };
        Self {
            sentiment,
            sentiment_score,
            topics: Vec::new(),
            meta: serde_json::json!({
                "summary": "Review requires manual analysis",
                "actionItems": ["Review this item manually"],
                "manualReviewRequired": true,
            }),
        }
    }

    pub fn requires_manual_review(&self) -> bool {
        self.meta
            .get("manualReviewRequired")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false)
    }
}

/// Durable, classified review. Immutable once persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredReview {
    pub id: Uuid,
    #[serde(flatten)]
    pub review: UnifiedReview,
    pub sentiment: Sentiment,
    pub sentiment_score: f64,
    pub topics: Vec<String>,
    pub classification_meta: JsonValue,
    pub ingested_at: DateTime<Utc>,
}

impl StoredReview {
    pub fn new(review: UnifiedReview, classification: Classification, ingested_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            review,
            sentiment: classification.sentiment,
            sentiment_score: classification.sentiment_score,
            topics: classification.topics,
            classification_meta: classification.meta,
            ingested_at,
        }
    }

    pub fn natural_key(&self) -> NaturalKey {
        self.review.natural_key()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("invalid `days` value `{0}`: expected a non-negative integer")]
    InvalidDays(String),
    #[error("invalid `{field}` value `{value}`: expected a positive integer")]
    InvalidPaging { field: &'static str, value: String },
    #[error(transparent)]
    Tag(#[from] CoreError),
}

/// Filters over the stored corpus. All present filters combine with AND.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewFilters {
    pub business_name: Option<String>,
    pub platform: Option<Platform>,
    pub sentiment: Option<Sentiment>,
    pub since: Option<DateTime<Utc>>,
}

impl ReviewFilters {
    /// Window ending at `now` and covering the trailing `days` days.
    pub fn trailing_window(
        business_name: Option<String>,
        platform: Option<Platform>,
        days: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            business_name,
            platform,
            sentiment: None,
            // Windows reaching past the representable range are unbounded.
            since: now.checked_sub_signed(Duration::days(i64::from(days))),
        }
    }

    pub fn matches(&self, stored: &StoredReview) -> bool {
        let review = &stored.review;
        if let Some(needle) = &self.business_name {
            if !review
                .business_name
                .to_lowercase()
                .contains(&needle.to_lowercase())
            {
                return false;
            }
        }
        if let Some(platform) = &self.platform {
            if &review.platform != platform {
                return false;
            }
        }
        if let Some(sentiment) = self.sentiment {
            if stored.sentiment != sentiment {
                return false;
            }
        }
        if let Some(since) = self.since {
            if review.occurred_at < since {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub page: u32,
    pub limit: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            page: 1,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

impl Page {
    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.limit)
    }

    pub fn total_pages(&self, total: u64) -> u64 {
        total.div_ceil(u64::from(self.limit.max(1)))
    }
}

fn present(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim).filter(|s| !s.is_empty())
}

pub fn parse_days(raw: Option<&str>) -> Result<u32, FilterError> {
    match present(raw) {
        None => Ok(DEFAULT_WINDOW_DAYS),
        Some(v) => v
            .parse::<u32>()
            .map_err(|_| FilterError::InvalidDays(v.to_string())),
    }
}

pub fn parse_platform(raw: Option<&str>) -> Result<Option<Platform>, FilterError> {
    present(raw)
        .map(str::parse::<Platform>)
        .transpose()
        .map_err(FilterError::from)
}

pub fn parse_sentiment(raw: Option<&str>) -> Result<Option<Sentiment>, FilterError> {
    present(raw)
        .map(str::parse::<Sentiment>)
        .transpose()
        .map_err(FilterError::from)
}

pub fn parse_page(raw_page: Option<&str>, raw_limit: Option<&str>) -> Result<Page, FilterError> {
    fn positive(field: &'static str, raw: Option<&str>, default: u32) -> Result<u32, FilterError> {
        match present(raw) {
            None => Ok(default),
            Some(v) => match v.parse::<u32>() {
                Ok(n) if n > 0 => Ok(n),
                _ => Err(FilterError::InvalidPaging {
                    field,
                    value: v.to_string(),
                }),
            },
        }
    }

    Ok(Page {
        page: positive("page", raw_page, 1)?,
        limit: positive("limit", raw_limit, DEFAULT_PAGE_LIMIT)?.min(MAX_PAGE_LIMIT),
    })
}
