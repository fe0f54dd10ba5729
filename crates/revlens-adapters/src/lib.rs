//! Source adapter contracts + per-platform adapters mapping native review
//! payloads into [`UnifiedReview`].
//!
//! Every adapter talks to its platform through a [`NativeTransport`]: either
//! the live HTTP API ([`HttpTransport`]) or a recorded fixture bundle
//! ([`FixtureTransport`]). Both feed the same mapping code.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use revlens_core::{non_blank, normalize_content, BusinessInfo, Platform, Rating, UnifiedReview};
use revlens_storage::{HttpFetcher, RequestSpec};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "revlens-adapters";

pub const GOOGLE_MAPS_BASE_URL: &str = "https://maps.googleapis.com/maps/api";
pub const YELP_BASE_URL: &str = "https://api.yelp.com/v3";
pub const TRUSTPILOT_BASE_URL: &str = "https://api.trustpilot.com/v1";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{platform} unavailable: {reason}")]
    SourceUnavailable { platform: Platform, reason: String },
    #[error("{platform} returned an unexpected payload: {reason}")]
    MalformedPayload { platform: Platform, reason: String },
}

impl AdapterError {
    pub fn unavailable(platform: Platform, reason: impl Display) -> Self {
        AdapterError::SourceUnavailable {
            platform,
            reason: reason.to_string(),
        }
    }

    fn malformed(platform: Platform, reason: impl Display) -> Self {
        AdapterError::MalformedPayload {
            platform,
            reason: reason.to_string(),
        }
    }

    pub fn platform(&self) -> &Platform {
        match self {
            AdapterError::SourceUnavailable { platform, .. }
            | AdapterError::MalformedPayload { platform, .. } => platform,
        }
    }
}

/// A review platform reachable through search + review fetch.
///
/// `search_business` returns an empty list (not an error) when nothing matches.
/// `get_reviews` output always satisfies the unified review invariants, and
/// the same native review always maps to the same `source_native_id`.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    /// Adapters that cannot disambiguate without a location are skipped when none is given.
    fn requires_location(&self) -> bool {
        false
    }

    async fn search_business(
        &self,
        query: &str,
        location: Option<&str>,
    ) -> Result<Vec<BusinessInfo>, AdapterError>;

    async fn get_reviews(&self, business: &BusinessInfo) -> Result<Vec<UnifiedReview>, AdapterError>;
}

/// Raw JSON exchange with a platform. `key` names the call for fixture lookup
/// (`search`, `reviews:<id>`, `details:<id>`, `business:<id>`).
#[async_trait]
pub trait NativeTransport: Send + Sync {
    async fn call(&self, key: &str, request: RequestSpec) -> Result<JsonValue>;
}

pub struct HttpTransport {
    http: Arc<HttpFetcher>,
    source_id: String,
}

impl HttpTransport {
    pub fn new(http: Arc<HttpFetcher>, source_id: impl Into<String>) -> Self {
        Self {
            http,
            source_id: source_id.into(),
        }
    }
}

#[async_trait]
impl NativeTransport for HttpTransport {
    async fn call(&self, _key: &str, request: RequestSpec) -> Result<JsonValue> {
        Ok(self
            .http
            .fetch_json::<JsonValue>(&self.source_id, &request)
            .await?)
    }
}

/// Recorded native responses for one source, keyed like [`NativeTransport::call`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub fixture_id: String,
    pub source_id: String,
    pub platform: Platform,
    pub captured_at: DateTime<Utc>,
    pub responses: BTreeMap<String, JsonValue>,
    #[serde(default)]
    pub notes: Option<String>,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

pub struct FixtureTransport {
    bundle: FixtureBundle,
}

impl FixtureTransport {
    pub fn new(bundle: FixtureBundle) -> Self {
        Self { bundle }
    }
}

#[async_trait]
impl NativeTransport for FixtureTransport {
    async fn call(&self, key: &str, _request: RequestSpec) -> Result<JsonValue> {
        self.bundle.responses.get(key).cloned().ok_or_else(|| {
            anyhow!(
                "fixture {} has no recorded response for `{key}`",
                self.bundle.fixture_id
            )
        })
    }
}

/// Credentials and endpoint override for one adapter.
#[derive(Debug, Clone, Default)]
pub struct ApiCredentials {
    pub api_key: String,
    pub base_url: Option<String>,
}

async fn call_native(
    transport: &dyn NativeTransport,
    platform: Platform,
    key: &str,
    request: RequestSpec,
) -> Result<JsonValue, AdapterError> {
    transport
        .call(key, request)
        .await
        .map_err(|err| AdapterError::unavailable(platform, format!("{err:#}")))
}

fn decode<T: DeserializeOwned>(platform: Platform, value: JsonValue) -> Result<T, AdapterError> {
    serde_json::from_value(value).map_err(|e| AdapterError::malformed(platform, e))
}

/// Accepts RFC 3339 as well as the `YYYY-MM-DD HH:MM:SS` form (read as UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

/// Missing or non-finite ratings yield `None` and the review is dropped.
fn native_rating(platform: &Platform, native_id: &str, raw: Option<f64>) -> Option<Rating> {
    let Some(rating) = raw.and_then(Rating::clamped) else {
        warn!(%platform, native_id, ?raw, "skipping review without a usable rating");
        return None;
    };
    if raw != Some(f64::from(rating.value())) {
        warn!(%platform, native_id, ?raw, clamped = rating.value(), "clamped out-of-range rating");
    }
    Some(rating)
}

// --- Google Maps -------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GoogleSearchResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    results: Vec<GooglePlace>,
}

#[derive(Debug, Deserialize)]
struct GooglePlace {
    place_id: String,
    name: String,
    #[serde(default)]
    formatted_address: Option<String>,
    #[serde(default)]
    formatted_phone_number: Option<String>,
    #[serde(default)]
    website: Option<String>,
    #[serde(default)]
    rating: Option<f64>,
    #[serde(default)]
    user_ratings_total: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct GoogleDetailsResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    result: Option<GoogleDetails>,
}

#[derive(Debug, Deserialize)]
struct GoogleDetails {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    reviews: Vec<GoogleReview>,
}

#[derive(Debug, Deserialize)]
struct GoogleReview {
    #[serde(default)]
    author_name: Option<String>,
    #[serde(default)]
    author_url: Option<String>,
    #[serde(default)]
    profile_photo_url: Option<String>,
    #[serde(default)]
    rating: Option<f64>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    time: Option<i64>,
}

fn google_status(status: Option<&str>, error_message: Option<&str>) -> Result<(), AdapterError> {
    match status {
        None | Some("OK") | Some("ZERO_RESULTS") => Ok(()),
        Some(other) => Err(AdapterError::unavailable(
            Platform::GoogleMaps,
            format!("{other}: {}", error_message.unwrap_or("no error message")),
        )),
    }
}

pub fn parse_google_search(body: JsonValue) -> Result<Vec<BusinessInfo>, AdapterError> {
    let resp: GoogleSearchResponse = decode(Platform::GoogleMaps, body)?;
    google_status(resp.status.as_deref(), resp.error_message.as_deref())?;
    Ok(resp
        .results
        .into_iter()
        .map(|place| BusinessInfo {
            id: place.place_id,
            name: place.name,
            address: place.formatted_address,
            phone: place.formatted_phone_number,
            website: place.website,
            rating: place.rating,
            review_count: place.user_ratings_total,
        })
        .collect())
}

/// Google reviews carry no id; derive a stable one from place, timestamp and author.
pub fn google_review_id(place_id: &str, time: i64, author: &str) -> String {
    let name = format!("google-maps:{place_id}:{time}:{author}");
    Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()).to_string()
}

pub fn parse_google_reviews(business: &BusinessInfo, body: JsonValue) -> Result<Vec<UnifiedReview>, AdapterError> {
    let resp: GoogleDetailsResponse = decode(Platform::GoogleMaps, body)?;
    google_status(resp.status.as_deref(), resp.error_message.as_deref())?;
    let Some(details) = resp.result else {
        return Ok(Vec::new());
    };
    let business_name = non_blank(details.name.as_deref()).unwrap_or_else(|| business.name.clone());

    let mut out = Vec::with_capacity(details.reviews.len());
    for review in details.reviews {
        let Some(occurred_at) = review.time.and_then(|t| DateTime::from_timestamp(t, 0)) else {
            warn!(place_id = %business.id, "skipping google review without a timestamp");
            continue;
        };
        let author_key = review
            .author_url
            .as_deref()
            .or(review.author_name.as_deref())
            .unwrap_or("anonymous");
        let source_native_id = google_review_id(&business.id, occurred_at.timestamp(), author_key);
        let Some(rating) = native_rating(&Platform::GoogleMaps, &source_native_id, review.rating) else {
            continue;
        };
        out.push(UnifiedReview {
            platform: Platform::GoogleMaps,
            rating,
            source_native_id,
            business_name: business_name.clone(),
            business_id: Some(business.id.clone()),
            title: None,
            content: normalize_content(review.text.as_deref()),
            author_name: non_blank(review.author_name.as_deref()),
            author_image: non_blank(review.profile_photo_url.as_deref()),
            occurred_at,
            source_url: non_blank(details.url.as_deref()),
        });
    }
    Ok(out)
}

pub struct GoogleMapsAdapter {
    transport: Arc<dyn NativeTransport>,
    credentials: ApiCredentials,
}

impl GoogleMapsAdapter {
    pub fn new(transport: Arc<dyn NativeTransport>, credentials: ApiCredentials) -> Self {
        Self {
            transport,
            credentials,
        }
    }

    fn base_url(&self) -> &str {
        self.credentials.base_url.as_deref().unwrap_or(GOOGLE_MAPS_BASE_URL)
    }
}

#[async_trait]
impl SourceAdapter for GoogleMapsAdapter {
    fn platform(&self) -> Platform {
        Platform::GoogleMaps
    }

    async fn search_business(
        &self,
        query: &str,
        location: Option<&str>,
    ) -> Result<Vec<BusinessInfo>, AdapterError> {
        let text = match location {
            Some(loc) => format!("{query} {loc}"),
            None => query.to_string(),
        };
        let request = RequestSpec::get(format!("{}/place/textsearch/json", self.base_url()))
            .query("query", text)
            .query("key", &self.credentials.api_key);
        let body = call_native(self.transport.as_ref(), self.platform(), "search", request).await?;
        parse_google_search(body)
    }

    async fn get_reviews(&self, business: &BusinessInfo) -> Result<Vec<UnifiedReview>, AdapterError> {
        let request = RequestSpec::get(format!("{}/place/details/json", self.base_url()))
            .query("place_id", &business.id)
            .query("fields", "name,url,reviews")
            .query("key", &self.credentials.api_key);
        let key = format!("reviews:{}", business.id);
        let body = call_native(self.transport.as_ref(), self.platform(), &key, request).await?;
        parse_google_reviews(business, body)
    }
}

// --- Yelp --------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct YelpSearchResponse {
    #[serde(default)]
    businesses: Vec<YelpBusiness>,
}

#[derive(Debug, Deserialize)]
struct YelpBusiness {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    location: Option<YelpLocation>,
    #[serde(default)]
    phone: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    rating: Option<f64>,
    #[serde(default)]
    review_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct YelpLocation {
    #[serde(default)]
    display_address: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct YelpReviewsResponse {
    #[serde(default)]
    reviews: Vec<YelpReview>,
}

#[derive(Debug, Deserialize)]
struct YelpReview {
    id: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    rating: Option<f64>,
    #[serde(default)]
    time_created: Option<String>,
    #[serde(default)]
    user: Option<YelpUser>,
}

#[derive(Debug, Deserialize)]
struct YelpUser {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    image_url: Option<String>,
}

fn yelp_business_info(b: YelpBusiness) -> BusinessInfo {
    BusinessInfo {
        address: b
            .location
            .map(|l| l.display_address.join(", "))
            .filter(|a| !a.is_empty()),
        id: b.id,
        name: b.name,
        phone: non_blank(b.phone.as_deref()),
        website: b.url,
        rating: b.rating,
        review_count: b.review_count,
    }
}

pub fn parse_yelp_search(body: JsonValue) -> Result<Vec<BusinessInfo>, AdapterError> {
    let resp: YelpSearchResponse = decode(Platform::Yelp, body)?;
    Ok(resp.businesses.into_iter().map(yelp_business_info).collect())
}

pub fn parse_yelp_business(body: JsonValue) -> Result<BusinessInfo, AdapterError> {
    decode::<YelpBusiness>(Platform::Yelp, body).map(yelp_business_info)
}

pub fn parse_yelp_reviews(business: &BusinessInfo, body: JsonValue) -> Result<Vec<UnifiedReview>, AdapterError> {
    let resp: YelpReviewsResponse = decode(Platform::Yelp, body)?;
    let mut out = Vec::with_capacity(resp.reviews.len());
    for review in resp.reviews {
        let Some(occurred_at) = review.time_created.as_deref().and_then(parse_timestamp) else {
            warn!(review_id = %review.id, "skipping yelp review with unparseable time_created");
            continue;
        };
        let (author_name, author_image) = match &review.user {
            Some(user) => (non_blank(user.name.as_deref()), non_blank(user.image_url.as_deref())),
            None => (None, None),
        };
        let Some(rating) = native_rating(&Platform::Yelp, &review.id, review.rating) else {
            continue;
        };
        out.push(UnifiedReview {
            platform: Platform::Yelp,
            rating,
            source_native_id: review.id,
            business_name: business.name.clone(),
            business_id: Some(business.id.clone()),
            title: None,
            content: normalize_content(review.text.as_deref()),
            author_name,
            author_image,
            occurred_at,
            source_url: non_blank(review.url.as_deref()),
        });
    }
    Ok(out)
}

pub struct YelpAdapter {
    transport: Arc<dyn NativeTransport>,
    credentials: ApiCredentials,
}

impl YelpAdapter {
    pub fn new(transport: Arc<dyn NativeTransport>, credentials: ApiCredentials) -> Self {
        Self {
            transport,
            credentials,
        }
    }

    fn base_url(&self) -> &str {
        self.credentials.base_url.as_deref().unwrap_or(YELP_BASE_URL)
    }

    async fn business_details(&self, business_id: &str) -> Result<BusinessInfo, AdapterError> {
        let request = RequestSpec::get(format!("{}/businesses/{business_id}", self.base_url()))
            .bearer(&self.credentials.api_key);
        let key = format!("details:{business_id}");
        let body = call_native(self.transport.as_ref(), self.platform(), &key, request).await?;
        parse_yelp_business(body)
    }
}

#[async_trait]
impl SourceAdapter for YelpAdapter {
    fn platform(&self) -> Platform {
        Platform::Yelp
    }

    fn requires_location(&self) -> bool {
        true
    }

    async fn search_business(
        &self,
        query: &str,
        location: Option<&str>,
    ) -> Result<Vec<BusinessInfo>, AdapterError> {
        let Some(location) = location else {
            return Ok(Vec::new());
        };
        let request = RequestSpec::get(format!("{}/businesses/search", self.base_url()))
            .bearer(&self.credentials.api_key)
            .query("term", query)
            .query("location", location)
            .query("limit", "20");
        let body = call_native(self.transport.as_ref(), self.platform(), "search", request).await?;
        parse_yelp_search(body)
    }

    async fn get_reviews(&self, business: &BusinessInfo) -> Result<Vec<UnifiedReview>, AdapterError> {
        let request = RequestSpec::get(format!("{}/businesses/{}/reviews", self.base_url(), business.id))
            .bearer(&self.credentials.api_key);
        let key = format!("reviews:{}", business.id);
        let body = call_native(self.transport.as_ref(), self.platform(), &key, request).await?;

        // Reviews carry no business name; resolve it when the search result lacked one.
        if business.name.trim().is_empty() {
            let details = self.business_details(&business.id).await?;
            return parse_yelp_reviews(&details, body);
        }
        parse_yelp_reviews(business, body)
    }
}

// --- Trustpilot --------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrustpilotSearchResponse {
    #[serde(default)]
    business_units: Vec<TrustpilotBusinessUnit>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrustpilotBusinessUnit {
    id: String,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    website_url: Option<String>,
    #[serde(default)]
    trust_score: Option<f64>,
    #[serde(default)]
    number_of_reviews: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct TrustpilotReviewsResponse {
    #[serde(default)]
    reviews: Vec<TrustpilotReview>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrustpilotReview {
    id: String,
    #[serde(default)]
    stars: Option<f64>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    consumer: Option<TrustpilotConsumer>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrustpilotConsumer {
    #[serde(default)]
    display_name: Option<String>,
}

fn trustpilot_business_info(unit: TrustpilotBusinessUnit) -> BusinessInfo {
    // numberOfReviews is either a bare count or an object with a `total`.
    let review_count = unit.number_of_reviews.as_ref().and_then(|v| {
        v.as_u64()
            .or_else(|| v.get("total").and_then(JsonValue::as_u64))
    });
    BusinessInfo {
        id: unit.id,
        name: unit.display_name,
        address: None,
        phone: None,
        website: unit.website_url,
        rating: unit.trust_score,
        review_count,
    }
}

pub fn parse_trustpilot_search(body: JsonValue) -> Result<Vec<BusinessInfo>, AdapterError> {
    let resp: TrustpilotSearchResponse = decode(Platform::Trustpilot, body)?;
    Ok(resp
        .business_units
        .into_iter()
        .map(trustpilot_business_info)
        .collect())
}

pub fn parse_trustpilot_reviews(
    business: &BusinessInfo,
    unit_body: JsonValue,
    reviews_body: JsonValue,
) -> Result<Vec<UnifiedReview>, AdapterError> {
    let unit: TrustpilotBusinessUnit = decode(Platform::Trustpilot, unit_body)?;
    let resp: TrustpilotReviewsResponse = decode(Platform::Trustpilot, reviews_body)?;
    let business_name = non_blank(Some(unit.display_name.as_str())).unwrap_or_else(|| business.name.clone());

    let mut out = Vec::with_capacity(resp.reviews.len());
    for review in resp.reviews {
        let Some(occurred_at) = review.created_at.as_deref().and_then(parse_timestamp) else {
            warn!(review_id = %review.id, "skipping trustpilot review with unparseable createdAt");
            continue;
        };
        let Some(rating) = native_rating(&Platform::Trustpilot, &review.id, review.stars) else {
            continue;
        };
        out.push(UnifiedReview {
            platform: Platform::Trustpilot,
            rating,
            source_native_id: review.id,
            business_name: business_name.clone(),
            business_id: Some(business.id.clone()),
            title: non_blank(review.title.as_deref()),
            content: normalize_content(review.text.as_deref()),
            author_name: review
                .consumer
                .as_ref()
                .and_then(|c| non_blank(c.display_name.as_deref())),
            author_image: None,
            occurred_at,
            source_url: non_blank(review.url.as_deref()),
        });
    }
    Ok(out)
}

pub struct TrustpilotAdapter {
    transport: Arc<dyn NativeTransport>,
    credentials: ApiCredentials,
}

impl TrustpilotAdapter {
    pub fn new(transport: Arc<dyn NativeTransport>, credentials: ApiCredentials) -> Self {
        Self {
            transport,
            credentials,
        }
    }

    fn base_url(&self) -> &str {
        self.credentials.base_url.as_deref().unwrap_or(TRUSTPILOT_BASE_URL)
    }
}

#[async_trait]
impl SourceAdapter for TrustpilotAdapter {
    fn platform(&self) -> Platform {
        Platform::Trustpilot
    }

    async fn search_business(
        &self,
        query: &str,
        _location: Option<&str>,
    ) -> Result<Vec<BusinessInfo>, AdapterError> {
        let request = RequestSpec::get(format!("{}/business-units/search", self.base_url()))
            .header("apikey", &self.credentials.api_key)
            .query("query", query)
            .query("perPage", "20");
        let body = call_native(self.transport.as_ref(), self.platform(), "search", request).await?;
        parse_trustpilot_search(body)
    }

    async fn get_reviews(&self, business: &BusinessInfo) -> Result<Vec<UnifiedReview>, AdapterError> {
        let unit_request = RequestSpec::get(format!("{}/business-units/{}", self.base_url(), business.id))
            .header("apikey", &self.credentials.api_key);
        let reviews_request =
            RequestSpec::get(format!("{}/business-units/{}/reviews", self.base_url(), business.id))
                .header("apikey", &self.credentials.api_key)
                .query("perPage", "100");
        let unit_key = format!("business:{}", business.id);
        let reviews_key = format!("reviews:{}", business.id);

        let (unit_body, reviews_body) = futures::try_join!(
            call_native(self.transport.as_ref(), self.platform(), &unit_key, unit_request),
            call_native(self.transport.as_ref(), self.platform(), &reviews_key, reviews_request),
        )?;
        parse_trustpilot_reviews(business, unit_body, reviews_body)
    }
}

/// Builds the adapter for `platform`, or `None` when no adapter exists for it.
pub fn adapter_for_platform(
    platform: &Platform,
    transport: Arc<dyn NativeTransport>,
    credentials: ApiCredentials,
) -> Option<Arc<dyn SourceAdapter>> {
    match platform {
        Platform::GoogleMaps => Some(Arc::new(GoogleMapsAdapter::new(transport, credentials))),
        Platform::Yelp => Some(Arc::new(YelpAdapter::new(transport, credentials))),
        Platform::Trustpilot => Some(Arc::new(TrustpilotAdapter::new(transport, credentials))),
        Platform::Amazon | Platform::Other(_) => None,
    }
}
