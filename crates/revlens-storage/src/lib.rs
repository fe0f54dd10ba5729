//! Review persistence (natural-key idempotent inserts) + HTTP fetch utilities.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use revlens_core::{
    NaturalKey, Page, Platform, Rating, ReviewFilters, Sentiment, StoredReview, UnifiedReview,
};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "revlens-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    /// The natural key is already present. Callers treat this as a duplicate skip.
    #[error("review {0} already stored")]
    Conflict(NaturalKey),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Durable review corpus keyed by (platform, source-native id).
///
/// `insert` must reject a second review with an existing natural key with
/// [`StoreError::Conflict`]; that check is the authoritative idempotency guard
/// when ingestion passes overlap.
#[async_trait]
pub trait ReviewStore: Send + Sync {
    async fn find_by_natural_key(&self, key: &NaturalKey) -> Result<Option<StoredReview>, StoreError>;

    async fn insert(&self, review: StoredReview) -> Result<StoredReview, StoreError>;

    /// Matching reviews, newest `occurred_at` first.
    async fn query_by_filters(
        &self,
        filters: &ReviewFilters,
        page: Option<Page>,
    ) -> Result<Vec<StoredReview>, StoreError>;

    async fn count_by_filters(&self, filters: &ReviewFilters) -> Result<u64, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    reviews: Vec<StoredReview>,
    keys: HashMap<NaturalKey, usize>,
}

/// In-process store with the same uniqueness semantics as the Postgres one.
#[derive(Debug, Default)]
pub struct InMemoryReviewStore {
    state: RwLock<MemoryState>,
}

impl InMemoryReviewStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.reviews.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn matching(&self, filters: &ReviewFilters) -> Vec<StoredReview> {
        let state = self.state.read().await;
        let mut out = state
            .reviews
            .iter()
            .filter(|r| filters.matches(r))
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| {
            b.review
                .occurred_at
                .cmp(&a.review.occurred_at)
                .then(b.ingested_at.cmp(&a.ingested_at))
        });
        out
    }
}

#[async_trait]
impl ReviewStore for InMemoryReviewStore {
    async fn find_by_natural_key(&self, key: &NaturalKey) -> Result<Option<StoredReview>, StoreError> {
        let state = self.state.read().await;
        Ok(state.keys.get(key).map(|&idx| state.reviews[idx].clone()))
    }

    async fn insert(&self, review: StoredReview) -> Result<StoredReview, StoreError> {
        let key = review.natural_key();
        let mut state = self.state.write().await;
        if state.keys.contains_key(&key) {
            return Err(StoreError::Conflict(key));
        }
        let idx = state.reviews.len();
        state.reviews.push(review.clone());
        state.keys.insert(key, idx);
        Ok(review)
    }

    async fn query_by_filters(
        &self,
        filters: &ReviewFilters,
        page: Option<Page>,
    ) -> Result<Vec<StoredReview>, StoreError> {
        let all = self.matching(filters).await;
        Ok(match page {
            Some(page) => all
                .into_iter()
                .skip(page.offset() as usize)
                .take(page.limit as usize)
                .collect(),
            None => all,
        })
    }

    async fn count_by_filters(&self, filters: &ReviewFilters) -> Result<u64, StoreError> {
        let state = self.state.read().await;
        Ok(state.reviews.iter().filter(|r| filters.matches(r)).count() as u64)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Postgres-backed store over the `reviews` table.
#[derive(Debug, Clone)]
pub struct PgReviewStore {
    pool: PgPool,
}

const REVIEW_COLUMNS: &str = "id, platform, platform_id, business_name, business_id, rating, title, content, \
     author_name, author_image, occurred_at, source_url, sentiment, sentiment_score, topics, \
     classification_meta, ingested_at";

const FILTER_CLAUSE: &str = "($1::text IS NULL OR position(lower($1) in lower(business_name)) > 0) \
     AND ($2::text IS NULL OR platform = $2) \
     AND ($3::text IS NULL OR sentiment = $3) \
     AND ($4::timestamptz IS NULL OR occurred_at >= $4)";

impl PgReviewStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running review migrations")
    }
}

fn row_to_stored_review(row: &PgRow) -> anyhow::Result<StoredReview> {
    let platform: String = row.try_get("platform")?;
    let rating: i16 = row.try_get("rating")?;
    let sentiment: String = row.try_get("sentiment")?;
    Ok(StoredReview {
        id: row.try_get("id")?,
        review: UnifiedReview {
            platform: platform.parse::<Platform>()?,
            source_native_id: row.try_get("platform_id")?,
            business_name: row.try_get("business_name")?,
            business_id: row.try_get("business_id")?,
            rating: Rating::new(i64::from(rating))?,
            title: row.try_get("title")?,
            content: row.try_get("content")?,
            author_name: row.try_get("author_name")?,
            author_image: row.try_get("author_image")?,
            occurred_at: row.try_get("occurred_at")?,
            source_url: row.try_get("source_url")?,
        },
        sentiment: sentiment.parse::<Sentiment>()?,
        sentiment_score: row.try_get("sentiment_score")?,
        topics: row.try_get("topics")?,
        classification_meta: row.try_get::<JsonValue, _>("classification_meta")?,
        ingested_at: row.try_get("ingested_at")?,
    })
}

/// A unique violation on insert means the natural key is already stored.
fn insert_error(key: NaturalKey, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict(key),
        err => StoreError::Backend(anyhow::Error::new(err).context(format!("inserting review {key}"))),
    }
}

#[async_trait]
impl ReviewStore for PgReviewStore {
    async fn find_by_natural_key(&self, key: &NaturalKey) -> Result<Option<StoredReview>, StoreError> {
        let sql = format!("SELECT {REVIEW_COLUMNS} FROM reviews WHERE platform = $1 AND platform_id = $2");
        let row = sqlx::query(&sql)
            .bind(key.platform.as_str())
            .bind(&key.source_native_id)
            .fetch_optional(&self.pool)
            .await
            .context("looking up review by natural key")?;
        row.as_ref()
            .map(row_to_stored_review)
            .transpose()
            .map_err(StoreError::from)
    }

    async fn insert(&self, review: StoredReview) -> Result<StoredReview, StoreError> {
        let r = &review.review;
        let result = sqlx::query(
            r#"
            INSERT INTO reviews (
                id, platform, platform_id, business_name, business_id, rating, title, content,
                author_name, author_image, occurred_at, source_url, sentiment, sentiment_score,
                topics, classification_meta, ingested_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(review.id)
        .bind(r.platform.as_str())
        .bind(&r.source_native_id)
        .bind(&r.business_name)
        .bind(&r.business_id)
        .bind(i16::from(r.rating.value()))
        .bind(&r.title)
        .bind(&r.content)
        .bind(&r.author_name)
        .bind(&r.author_image)
        .bind(r.occurred_at)
        .bind(&r.source_url)
        .bind(review.sentiment.as_str())
        .bind(review.sentiment_score)
        .bind(&review.topics)
        .bind(&review.classification_meta)
        .bind(review.ingested_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(review),
            Err(err) => Err(insert_error(review.natural_key(), err)),
        }
    }

    async fn query_by_filters(
        &self,
        filters: &ReviewFilters,
        page: Option<Page>,
    ) -> Result<Vec<StoredReview>, StoreError> {
        let sql = format!(
            "SELECT {REVIEW_COLUMNS} FROM reviews WHERE {FILTER_CLAUSE} \
             ORDER BY occurred_at DESC, ingested_at DESC LIMIT $5 OFFSET COALESCE($6, 0)"
        );
        let rows = sqlx::query(&sql)
            .bind(filters.business_name.as_deref())
            .bind(filters.platform.as_ref().map(Platform::as_str))
            .bind(filters.sentiment.map(Sentiment::as_str))
            .bind(filters.since)
            .bind(page.map(|p| i64::from(p.limit)))
            .bind(page.map(|p| p.offset() as i64))
            .fetch_all(&self.pool)
            .await
            .context("querying reviews")?;
        rows.iter()
            .map(row_to_stored_review)
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(StoreError::from)
    }

    async fn count_by_filters(&self, filters: &ReviewFilters) -> Result<u64, StoreError> {
        let sql = format!("SELECT COUNT(*) AS total FROM reviews WHERE {FILTER_CLAUSE}");
        let row = sqlx::query(&sql)
            .bind(filters.business_name.as_deref())
            .bind(filters.platform.as_ref().map(Platform::as_str))
            .bind(filters.sentiment.map(Sentiment::as_str))
            .bind(filters.since)
            .fetch_one(&self.pool)
            .await
            .context("counting reviews")?;
        let total: i64 = row.try_get("total").context("reading review count")?;
        Ok(total.max(0) as u64)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("pinging postgres")?;
        Ok(())
    }
}

/// Rate limits and upstream failures are worth another attempt; client errors are not.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Seconds-form `Retry-After`. The HTTP-date form is ignored.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?;
    raw.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    /// Doubling delay for the given zero-based retry, never above `max_delay`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = u32::try_from(attempt).unwrap_or(u32::MAX);
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// A server-supplied wait wins over the computed one, within the same cap.
    fn wait_before_retry(&self, attempt: usize, hinted: Option<Duration>) -> Duration {
        hinted
            .map(|d| d.min(self.max_delay))
            .unwrap_or_else(|| self.delay_for_attempt(attempt))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    /// Concurrent calls allowed against one upstream API (keyed by source id).
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// One outbound API call. Header values may carry credentials and are never logged.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub bearer_token: Option<String>,
    pub json_body: Option<JsonValue>,
}

impl RequestSpec {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            bearer_token: None,
            json_body: None,
        }
    }

    pub fn post_json(url: impl Into<String>, body: JsonValue) -> Self {
        Self {
            method: Method::POST,
            json_body: Some(body),
            ..Self::get(url)
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    fn to_request(&self, client: &reqwest::Client) -> reqwest::RequestBuilder {
        let mut req = client.request(self.method.clone(), &self.url).query(&self.query);
        for (key, value) in &self.headers {
            req = req.header(key.as_str(), value.as_str());
        }
        if let Some(token) = &self.bearer_token {
            req = req.bearer_auth(token);
        }
        match &self.json_body {
            Some(body) => req.json(body),
            None => req,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("http fetcher shut down")]
    Closed,
}

/// Shared outbound client for review platforms and the classifier API.
///
/// Calls are bounded by a global semaphore and a per-source one, then retried
/// on rate limits, server errors and transport failures per [`BackoffPolicy`].
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = config.user_agent {
            builder = builder.user_agent(user_agent);
        }

        Ok(Self {
            client: builder.build().context("building reqwest client")?,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn source_limit(&self, source_id: &str) -> Arc<Semaphore> {
        let mut limits = self.per_source.lock().await;
        limits
            .entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub async fn fetch(&self, source_id: &str, spec: &RequestSpec) -> Result<FetchedResponse, FetchError> {
        let _global = self.global_limit.acquire().await.map_err(|_| FetchError::Closed)?;
        let source_limit = self.source_limit(source_id).await;
        let _source = source_limit.acquire().await.map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_fetch", source_id, method = %spec.method, url = %spec.url);
        self.send_with_retries(spec).instrument(span).await
    }

    async fn send_with_retries(&self, spec: &RequestSpec) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let retries_left = attempt < self.backoff.max_retries;
            let wait = match spec.to_request(&self.client).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let body = resp.bytes().await?.to_vec();
                    return Ok(FetchedResponse {
                        status,
                        final_url,
                        body,
                    });
                }
                Ok(resp) => {
                    let status = resp.status();
                    if !(retries_left && is_retryable_status(status)) {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: resp.url().to_string(),
                        });
                    }
                    let wait = self.backoff.wait_before_retry(attempt, retry_after(resp.headers()));
                    debug!(attempt, status = status.as_u16(), wait_ms = wait.as_millis() as u64, "retrying after http status");
                    wait
                }
                Err(err) => {
                    if !(retries_left && is_retryable_error(&err)) {
                        return Err(FetchError::Request(err));
                    }
                    let wait = self.backoff.delay_for_attempt(attempt);
                    debug!(attempt, error = %err, wait_ms = wait.as_millis() as u64, "retrying after request error");
                    wait
                }
            };
            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }

    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        source_id: &str,
        spec: &RequestSpec,
    ) -> Result<T, FetchError> {
        let resp = self.fetch(source_id, spec).await?;
        serde_json::from_slice(&resp.body).map_err(|e| FetchError::Decode {
            url: resp.final_url,
            message: e.to_string(),
        })
    }
}

/// Current time truncated to microseconds, matching Postgres timestamp precision.
pub fn now_for_storage() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use revlens_core::Classification;

    fn stored(platform: Platform, native_id: &str, business: &str, day: u32) -> StoredReview {
        let rating = Rating::new(4).unwrap();
        StoredReview::new(
            UnifiedReview {
                platform,
                source_native_id: native_id.to_string(),
                business_name: business.to_string(),
                business_id: None,
                rating,
                title: None,
                content: "good".into(),
                author_name: None,
                author_image: None,
                occurred_at: Utc.with_ymd_and_hms(2026, 5, day, 9, 0, 0).unwrap(),
                source_url: None,
            },
            Classification::fallback_for(rating),
            Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn in_memory_store_rejects_duplicate_natural_keys() {
        let store = InMemoryReviewStore::new();
        store.insert(stored(Platform::Yelp, "r1", "Cafe", 1)).await.unwrap();

        let err = store
            .insert(stored(Platform::Yelp, "r1", "Cafe", 2))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(ref k) if k.source_native_id == "r1"));

        // Same native id on another platform is a different review.
        store.insert(stored(Platform::GoogleMaps, "r1", "Cafe", 2)).await.unwrap();
        assert_eq!(store.len().await, 2);

        let key = NaturalKey {
            platform: Platform::Yelp,
            source_native_id: "r1".into(),
        };
        let found = store.find_by_natural_key(&key).await.unwrap().unwrap();
        assert_eq!(
            found.review.occurred_at,
            Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn in_memory_query_orders_newest_first_and_pages() {
        let store = InMemoryReviewStore::new();
        for day in [3, 1, 5, 2, 4] {
            store
                .insert(stored(Platform::Trustpilot, &format!("t{day}"), "Acme Corp", day))
                .await
                .unwrap();
        }
        store.insert(stored(Platform::Trustpilot, "other", "Zeta", 6)).await.unwrap();

        let filters = ReviewFilters {
            business_name: Some("ACME".into()),
            ..Default::default()
        };
        let all = store.query_by_filters(&filters, None).await.unwrap();
        let ids = all.iter().map(|r| r.review.source_native_id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["t5", "t4", "t3", "t2", "t1"]);
        assert_eq!(store.count_by_filters(&filters).await.unwrap(), 5);

        let second_page = store
            .query_by_filters(&filters, Some(Page { page: 2, limit: 2 }))
            .await
            .unwrap();
        let ids = second_page
            .iter()
            .map(|r| r.review.source_native_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["t3", "t2"]);
    }

    #[derive(Debug)]
    struct PgViolation {
        unique: bool,
    }

    impl std::fmt::Display for PgViolation {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(sqlx::error::DatabaseError::message(self))
        }
    }

    impl std::error::Error for PgViolation {}

    impl sqlx::error::DatabaseError for PgViolation {
        fn message(&self) -> &str {
            if self.unique {
                "duplicate key value violates unique constraint \"reviews_platform_platform_id_key\""
            } else {
                "new row for relation \"reviews\" violates check constraint"
            }
        }

        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> sqlx::error::ErrorKind {
            if self.unique {
                sqlx::error::ErrorKind::UniqueViolation
            } else {
                sqlx::error::ErrorKind::CheckViolation
            }
        }
    }

    #[test]
    fn unique_violation_on_insert_is_a_conflict() {
        let key = NaturalKey {
            platform: Platform::Yelp,
            source_native_id: "r1".into(),
        };

        let dup = sqlx::Error::Database(Box::new(PgViolation { unique: true }));
        assert!(matches!(insert_error(key.clone(), dup), StoreError::Conflict(ref k) if *k == key));

        let check = sqlx::Error::Database(Box::new(PgViolation { unique: false }));
        assert!(matches!(insert_error(key.clone(), check), StoreError::Backend(_)));
        assert!(matches!(insert_error(key, sqlx::Error::PoolTimedOut), StoreError::Backend(_)));
    }

    #[tokio::test]
    #[ignore = "needs DATABASE_URL pointing at a scratch postgres"]
    async fn postgres_store_rejects_duplicate_natural_keys() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL");
        let store = PgReviewStore::connect(&url).await.unwrap();
        store.migrate().await.unwrap();

        let native_id = format!("pg-{}", unique_suffix());
        store.insert(stored(Platform::Yelp, &native_id, "Cafe", 1)).await.unwrap();
        let err = store
            .insert(stored(Platform::Yelp, &native_id, "Cafe", 2))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(ref k) if k.source_native_id == native_id));
    }

    fn unique_suffix() -> String {
        Utc::now().timestamp_nanos_opt().unwrap_or_default().to_string()
    }

    #[test]
    fn backoff_doubles_until_the_cap() {
        let policy = BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(300),
            max_delay: Duration::from_secs(1),
        };
        let waits = (0..4).map(|a| policy.delay_for_attempt(a)).collect::<Vec<_>>();
        assert_eq!(
            waits,
            vec![
                Duration::from_millis(300),
                Duration::from_millis(600),
                Duration::from_secs(1),
                Duration::from_secs(1),
            ]
        );
        assert_eq!(policy.delay_for_attempt(usize::MAX), Duration::from_secs(1));
    }

    #[test]
    fn retry_after_hint_overrides_backoff_within_cap() {
        let policy = BackoffPolicy::default();
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);

        headers.insert(RETRY_AFTER, "3".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(3)));
        assert_eq!(policy.wait_before_retry(0, retry_after(&headers)), Duration::from_secs(3));

        headers.insert(RETRY_AFTER, "120".parse().unwrap());
        assert_eq!(policy.wait_before_retry(0, retry_after(&headers)), policy.max_delay);

        headers.insert(RETRY_AFTER, "Wed, 21 Oct 2026 07:28:00 GMT".parse().unwrap());
        assert_eq!(retry_after(&headers), None);
        assert_eq!(policy.wait_before_retry(1, None), policy.delay_for_attempt(1));
    }

    #[test]
    fn only_rate_limits_and_server_errors_are_retried() {
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
    }

    #[test]
    fn request_spec_builder_collects_query_and_headers() {
        let spec = RequestSpec::get("https://api.example.test/search")
            .query("term", "cafe")
            .header("apikey", "secret")
            .bearer("token");
        assert_eq!(spec.method, Method::GET);
        assert_eq!(spec.query, vec![("term".to_string(), "cafe".to_string())]);
        assert_eq!(spec.headers.len(), 1);
        assert_eq!(spec.bearer_token.as_deref(), Some("token"));

        let post = RequestSpec::post_json("https://api.example.test/chat", serde_json::json!({"a": 1}));
        assert_eq!(post.method, Method::POST);
        assert!(post.json_body.is_some());
    }
}
