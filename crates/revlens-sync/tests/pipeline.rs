use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use revlens_adapters::{AdapterError, SourceAdapter};
use revlens_analytics::compute_report;
use revlens_classifier::ClassifierGateway;
use revlens_core::{BusinessInfo, NaturalKey, Page, Platform, Rating, ReviewFilters, StoredReview, UnifiedReview};
use revlens_storage::{HttpClientConfig, HttpFetcher, InMemoryReviewStore, ReviewStore, StoreError};
use revlens_sync::{
    build_adapters, Aggregator, IngestionStage, IngestionSummary, ReviewPipeline, SourceOutcome, SourceRegistry,
};

fn now() -> DateTime<Utc> {
    Utc::now()
}

fn review(platform: Platform, id: &str, rating: i64, hours_ago: i64) -> UnifiedReview {
    UnifiedReview {
        platform,
        source_native_id: id.to_string(),
        business_name: "Blue Door Bakery".to_string(),
        business_id: Some("biz-1".to_string()),
        rating: Rating::new(rating).unwrap(),
        title: None,
        content: format!("review {id}"),
        author_name: None,
        author_image: None,
        occurred_at: now() - chrono::Duration::hours(hours_ago),
        source_url: None,
    }
}

fn adapter_a_reviews() -> Vec<UnifiedReview> {
    vec![
        review(Platform::GoogleMaps, "g-1", 5, 2),
        review(Platform::GoogleMaps, "g-2", 2, 26),
        review(Platform::GoogleMaps, "g-3", 4, 50),
    ]
}

fn adapter_b_reviews() -> Vec<UnifiedReview> {
    vec![
        review(Platform::Yelp, "y-1", 1, 5),
        review(Platform::Yelp, "y-2", 3, 80),
    ]
}

struct StaticAdapter {
    platform: Platform,
    reviews: Vec<UnifiedReview>,
    needs_location: bool,
    matches: bool,
}

impl StaticAdapter {
    fn new(platform: Platform, reviews: Vec<UnifiedReview>) -> Arc<dyn SourceAdapter> {
        Arc::new(Self {
            platform,
            reviews,
            needs_location: false,
            matches: true,
        })
    }
}

#[async_trait]
impl SourceAdapter for StaticAdapter {
    fn platform(&self) -> Platform {
        self.platform.clone()
    }

    fn requires_location(&self) -> bool {
        self.needs_location
    }

    async fn search_business(&self, query: &str, _location: Option<&str>) -> Result<Vec<BusinessInfo>, AdapterError> {
        if !self.matches {
            return Ok(Vec::new());
        }
        Ok(vec![
            BusinessInfo::new("biz-1", query),
            BusinessInfo::new("biz-2", format!("{query} Annex")),
        ])
    }

    async fn get_reviews(&self, business: &BusinessInfo) -> Result<Vec<UnifiedReview>, AdapterError> {
        assert_eq!(business.id, "biz-1", "only the first search result is fetched");
        Ok(self.reviews.clone())
    }
}

struct FailingAdapter(Platform);

#[async_trait]
impl SourceAdapter for FailingAdapter {
    fn platform(&self) -> Platform {
        self.0.clone()
    }

    async fn search_business(&self, _query: &str, _location: Option<&str>) -> Result<Vec<BusinessInfo>, AdapterError> {
        Err(AdapterError::unavailable(self.0.clone(), "401 invalid api key"))
    }

    async fn get_reviews(&self, _business: &BusinessInfo) -> Result<Vec<UnifiedReview>, AdapterError> {
        unreachable!("search already failed")
    }
}

struct StalledAdapter(Platform);

#[async_trait]
impl SourceAdapter for StalledAdapter {
    fn platform(&self) -> Platform {
        self.0.clone()
    }

    async fn search_business(&self, _query: &str, _location: Option<&str>) -> Result<Vec<BusinessInfo>, AdapterError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Vec::new())
    }

    async fn get_reviews(&self, _business: &BusinessInfo) -> Result<Vec<UnifiedReview>, AdapterError> {
        Ok(Vec::new())
    }
}

/// Rejects inserts for one native id with a backend error.
struct FlakyStore {
    inner: InMemoryReviewStore,
    poisoned_id: String,
}

#[async_trait]
impl ReviewStore for FlakyStore {
    async fn find_by_natural_key(&self, key: &NaturalKey) -> Result<Option<StoredReview>, StoreError> {
        self.inner.find_by_natural_key(key).await
    }

    async fn insert(&self, review: StoredReview) -> Result<StoredReview, StoreError> {
        if review.review.source_native_id == self.poisoned_id {
            return Err(StoreError::Backend(anyhow::anyhow!("connection reset")));
        }
        self.inner.insert(review).await
    }

    async fn query_by_filters(&self, filters: &ReviewFilters, page: Option<Page>) -> Result<Vec<StoredReview>, StoreError> {
        self.inner.query_by_filters(filters, page).await
    }

    async fn count_by_filters(&self, filters: &ReviewFilters) -> Result<u64, StoreError> {
        self.inner.count_by_filters(filters).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

fn aggregator(adapters: Vec<Arc<dyn SourceAdapter>>) -> Aggregator {
    Aggregator::new(adapters, Duration::from_secs(5))
}

fn pipeline(adapters: Vec<Arc<dyn SourceAdapter>>, store: Arc<dyn ReviewStore>) -> ReviewPipeline {
    ReviewPipeline::new(
        aggregator(adapters),
        IngestionStage::new(store, ClassifierGateway::rating_only()),
    )
}

#[tokio::test]
async fn first_ingestion_stores_everything_and_analytics_reflects_it() {
    let store = Arc::new(InMemoryReviewStore::new());
    let pipeline = pipeline(
        vec![
            StaticAdapter::new(Platform::GoogleMaps, adapter_a_reviews()),
            StaticAdapter::new(Platform::Yelp, adapter_b_reviews()),
        ],
        store.clone(),
    );

    let run = pipeline.run_for_business("Blue Door Bakery", None).await;
    assert_eq!(run.summary.total_found, 5);
    assert_eq!(run.summary.newly_stored, 5);
    assert_eq!(store.len().await, 5);

    let generated_at = now();
    let filters = ReviewFilters::trailing_window(None, None, 30, generated_at);
    let slice = store.query_by_filters(&filters, None).await.unwrap();
    let report = compute_report(&slice, 30, generated_at);
    assert_eq!(report.summary.total_reviews, 5);
    assert_eq!(report.summary.average_rating, 3.0);
    assert_eq!(report.sentiment_distribution.positive, 2);
    assert_eq!(report.sentiment_distribution.negative, 2);
    assert_eq!(report.sentiment_distribution.neutral, 1);
}

#[tokio::test]
async fn rerunning_one_adapter_stores_nothing_new() {
    let store: Arc<dyn ReviewStore> = Arc::new(InMemoryReviewStore::new());
    let both = pipeline(
        vec![
            StaticAdapter::new(Platform::GoogleMaps, adapter_a_reviews()),
            StaticAdapter::new(Platform::Yelp, adapter_b_reviews()),
        ],
        store.clone(),
    );
    both.run_for_business("Blue Door Bakery", None).await;

    let only_a = pipeline(
        vec![StaticAdapter::new(Platform::GoogleMaps, adapter_a_reviews())],
        store.clone(),
    );
    let run = only_a.run_for_business("Blue Door Bakery", None).await;
    assert_eq!(
        run.summary,
        IngestionSummary {
            total_found: 3,
            newly_stored: 0,
            duplicates_skipped: 3,
            failed: 0,
        }
    );
    assert_eq!(store.count_by_filters(&ReviewFilters::default()).await.unwrap(), 5);
}

#[tokio::test]
async fn ingesting_the_same_batch_twice_is_idempotent() {
    let store = Arc::new(InMemoryReviewStore::new());
    let stage = IngestionStage::new(store.clone(), ClassifierGateway::rating_only());

    let first = stage.ingest(adapter_a_reviews()).await;
    let second = stage.ingest(adapter_a_reviews()).await;
    assert_eq!(first.newly_stored, 3);
    assert_eq!(second.newly_stored, 0);
    assert_eq!(second.duplicates_skipped, 3);
    assert_eq!(store.len().await, 3);
}

#[tokio::test]
async fn duplicates_within_one_batch_are_stored_once() {
    let store = Arc::new(InMemoryReviewStore::new());
    let stage = IngestionStage::new(store.clone(), ClassifierGateway::rating_only());

    let mut batch = adapter_a_reviews();
    batch.push(review(Platform::GoogleMaps, "g-1", 5, 2));
    // Same native id on another platform is a different review.
    batch.push(review(Platform::Yelp, "g-1", 4, 3));

    let summary = stage.ingest(batch).await;
    assert_eq!(summary.total_found, 5);
    assert_eq!(summary.newly_stored, 4);
    assert_eq!(summary.duplicates_skipped, 1);
}

#[tokio::test]
async fn one_failing_adapter_does_not_affect_the_others() {
    let agg = aggregator(vec![
        StaticAdapter::new(Platform::GoogleMaps, adapter_a_reviews()),
        Arc::new(FailingAdapter(Platform::Trustpilot)) as Arc<dyn SourceAdapter>,
        StaticAdapter::new(Platform::Yelp, adapter_b_reviews()),
    ]);

    let reviews = agg.get_all_reviews("Blue Door Bakery", Some("Portland, OR")).await;
    assert_eq!(reviews.len(), 5);

    let aggregation = agg.aggregate("Blue Door Bakery", Some("Portland, OR")).await;
    let trustpilot = aggregation
        .sources
        .iter()
        .find(|s| s.platform == Platform::Trustpilot)
        .unwrap();
    assert!(matches!(trustpilot.outcome, SourceOutcome::Failed { .. }));
}

#[tokio::test]
async fn stalled_adapter_is_cut_off_by_the_timeout() {
    let agg = Aggregator::new(
        vec![
            Arc::new(StalledAdapter(Platform::Trustpilot)) as Arc<dyn SourceAdapter>,
            StaticAdapter::new(Platform::Yelp, adapter_b_reviews()),
        ],
        Duration::from_millis(50),
    );
    let started = std::time::Instant::now();
    let aggregation = agg.aggregate("Blue Door Bakery", None).await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(aggregation.reviews.len(), 2);
    let stalled = aggregation
        .sources
        .iter()
        .find(|s| s.platform == Platform::Trustpilot)
        .unwrap();
    assert!(matches!(stalled.outcome, SourceOutcome::Failed { .. }));
}

#[tokio::test]
async fn location_bound_adapter_is_skipped_without_location() {
    let yelp: Arc<dyn SourceAdapter> = Arc::new(StaticAdapter {
        platform: Platform::Yelp,
        reviews: adapter_b_reviews(),
        needs_location: true,
        matches: true,
    });
    let no_match: Arc<dyn SourceAdapter> = Arc::new(StaticAdapter {
        platform: Platform::Trustpilot,
        reviews: Vec::new(),
        needs_location: false,
        matches: false,
    });
    let agg = aggregator(vec![
        StaticAdapter::new(Platform::GoogleMaps, adapter_a_reviews()),
        yelp,
        no_match,
    ]);

    let without = agg.aggregate("Blue Door Bakery", None).await;
    assert_eq!(without.reviews.len(), 3);
    let outcome_for = |platform: Platform| {
        without
            .sources
            .iter()
            .find(|s| s.platform == platform)
            .map(|s| s.outcome.clone())
    };
    assert_eq!(outcome_for(Platform::Yelp), Some(SourceOutcome::SkippedNoLocation));
    assert_eq!(outcome_for(Platform::Trustpilot), Some(SourceOutcome::NoMatch));

    let with = agg.aggregate("Blue Door Bakery", Some("Portland, OR")).await;
    assert_eq!(with.reviews.len(), 5);
}

#[tokio::test]
async fn persistence_failure_is_isolated_to_one_item() {
    let store = Arc::new(FlakyStore {
        inner: InMemoryReviewStore::new(),
        poisoned_id: "g-2".to_string(),
    });
    let stage = IngestionStage::new(store.clone(), ClassifierGateway::rating_only());

    let mut batch = adapter_a_reviews();
    batch.extend(adapter_b_reviews());
    let summary = stage.ingest(batch).await;
    assert_eq!(summary.total_found, 5);
    assert_eq!(summary.newly_stored, 4);
    assert_eq!(summary.failed, 1);
    assert_eq!(store.inner.len().await, 4);
}

#[tokio::test]
async fn every_adapter_down_reports_zero() {
    let store = Arc::new(InMemoryReviewStore::new());
    let pipeline = pipeline(
        vec![
            Arc::new(FailingAdapter(Platform::GoogleMaps)) as Arc<dyn SourceAdapter>,
            Arc::new(FailingAdapter(Platform::Yelp)) as Arc<dyn SourceAdapter>,
        ],
        store,
    );
    let run = pipeline.run_for_business("Blue Door Bakery", Some("Portland, OR")).await;
    assert_eq!(run.summary, IngestionSummary::default());
    assert_eq!(run.sources.len(), 2);
}

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

const FIXTURE_REGISTRY: &str = r#"
sources:
  - source_id: google-maps
    platform: GOOGLE_MAPS
    display_name: Google Maps
    enabled: true
    mode: fixture
  - source_id: yelp
    platform: YELP
    display_name: Yelp
    enabled: true
    mode: fixture
  - source_id: trustpilot
    platform: TRUSTPILOT
    display_name: Trustpilot
    enabled: true
    mode: fixture
"#;

#[tokio::test]
async fn fixture_sources_run_end_to_end() {
    let registry: SourceRegistry = serde_yaml_registry(FIXTURE_REGISTRY);
    let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
    let adapters = build_adapters(&workspace_root(), &registry, &http, |_| None).unwrap();
    assert_eq!(adapters.len(), 3);

    let store = Arc::new(InMemoryReviewStore::new());
    let pipeline = pipeline(adapters, store.clone());

    let first = pipeline.run_for_business("Blue Door Bakery", Some("Portland, OR")).await;
    assert_eq!(first.summary.total_found, 9);
    assert_eq!(first.summary.newly_stored, 9);

    let second = pipeline.run_for_business("Blue Door Bakery", Some("Portland, OR")).await;
    assert_eq!(second.summary.newly_stored, 0);
    assert_eq!(second.summary.duplicates_skipped, 9);

    let stored = store
        .query_by_filters(&ReviewFilters::default(), None)
        .await
        .unwrap();
    assert!(stored.iter().all(|r| !r.review.content.is_empty()));
    assert!(stored
        .windows(2)
        .all(|w| w[0].review.occurred_at >= w[1].review.occurred_at));
    let oldest = stored.last().unwrap();
    assert!(oldest.review.occurred_at >= Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
}

fn serde_yaml_registry(text: &str) -> SourceRegistry {
    serde_yaml::from_str(text).expect("registry yaml")
}

#[tokio::test]
async fn repository_registry_is_valid() {
    let registry = revlens_sync::load_source_registry(&workspace_root()).await.unwrap();
    assert!(registry.sources.iter().any(|s| s.platform == Platform::GoogleMaps));
    assert!(!registry.watchlist.is_empty());
    // Without keys every api-mode source is skipped rather than failing.
    let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
    let adapters = build_adapters(&workspace_root(), &registry, &http, |_| None).unwrap();
    assert!(adapters.is_empty());
}
