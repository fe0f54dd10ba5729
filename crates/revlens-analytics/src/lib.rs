//! Read-only aggregation over a slice of stored reviews.
//!
//! Every statistic is a fold over the slice; an empty slice yields a
//! zero-filled report whose only insight says there is not enough data.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, NaiveDate, Utc};
use revlens_core::{Platform, Rating, Sentiment, StoredReview};
use serde::Serialize;

pub const CRATE_NAME: &str = "revlens-analytics";

pub const TOP_TOPICS_LIMIT: usize = 10;
pub const RECENT_REVIEWS_LIMIT: usize = 5;
pub const TREND_WINDOW: usize = 10;
pub const TREND_THRESHOLD: f64 = 0.3;
pub const INSUFFICIENT_DATA: &str = "Insufficient data to generate insights";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSummary {
    pub total_reviews: usize,
    pub average_rating: f64,
    pub period: String,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SentimentDistribution {
    pub positive: usize,
    pub negative: usize,
    pub neutral: usize,
}

impl SentimentDistribution {
    fn add(&mut self, sentiment: Sentiment) {
        match sentiment {
            Sentiment::Positive => self.positive += 1,
            Sentiment::Negative => self.negative += 1,
            Sentiment::Neutral => self.neutral += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.positive + self.negative + self.neutral
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyTrend {
    pub date: NaiveDate,
    pub count: usize,
    pub average_rating: f64,
    pub positive: usize,
    pub negative: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicCount {
    pub topic: String,
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecentReviews {
    pub positive: Vec<StoredReview>,
    pub negative: Vec<StoredReview>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusinessStats {
    pub business_name: String,
    pub total_reviews: usize,
    pub average_rating: f64,
    pub positive: usize,
    pub negative: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsReport {
    pub summary: ReportSummary,
    pub sentiment_distribution: SentimentDistribution,
    pub rating_distribution: BTreeMap<u8, usize>,
    pub platform_distribution: BTreeMap<Platform, usize>,
    pub daily_trends: Vec<DailyTrend>,
    pub top_topics: Vec<TopicCount>,
    pub recent_reviews: RecentReviews,
    pub business_comparison: Vec<BusinessStats>,
    pub insights: Vec<String>,
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Running count + rating sum, shared by the per-day and per-business folds.
#[derive(Debug, Clone, Copy, Default)]
struct Tally {
    count: usize,
    rating_sum: u64,
    positive: usize,
    negative: usize,
}

impl Tally {
    fn add(mut self, review: &StoredReview) -> Self {
        self.count += 1;
        self.rating_sum += u64::from(review.review.rating.value());
        match review.sentiment {
            Sentiment::Positive => self.positive += 1,
            Sentiment::Negative => self.negative += 1,
            Sentiment::Neutral => {}
        }
        self
    }

    fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.rating_sum as f64 / self.count as f64
        }
    }
}

pub fn mean_rating(reviews: &[StoredReview]) -> f64 {
    reviews.iter().fold(Tally::default(), Tally::add).mean()
}

pub fn sentiment_distribution(reviews: &[StoredReview]) -> SentimentDistribution {
    reviews.iter().fold(SentimentDistribution::default(), |mut acc, r| {
        acc.add(r.sentiment);
        acc
    })
}

/// Always carries all five rating keys.
pub fn rating_distribution(reviews: &[StoredReview]) -> BTreeMap<u8, usize> {
    let zeroed: BTreeMap<u8, usize> = Rating::all().map(|r| (r.value(), 0)).collect();
    reviews.iter().fold(zeroed, |mut acc, r| {
        *acc.entry(r.review.rating.value()).or_default() += 1;
        acc
    })
}

pub fn platform_distribution(reviews: &[StoredReview]) -> BTreeMap<Platform, usize> {
    reviews.iter().fold(BTreeMap::new(), |mut acc, r| {
        *acc.entry(r.review.platform.clone()).or_default() += 1;
        acc
    })
}

/// One bucket per UTC calendar day, oldest first.
pub fn daily_trends(reviews: &[StoredReview]) -> Vec<DailyTrend> {
    let buckets = reviews.iter().fold(BTreeMap::<NaiveDate, Tally>::new(), |mut acc, r| {
        let day = r.review.occurred_at.date_naive();
        let tally = acc.entry(day).or_default();
        *tally = tally.add(r);
        acc
    });
    buckets
        .into_iter()
        .map(|(date, t)| DailyTrend {
            date,
            count: t.count,
            average_rating: round2(t.mean()),
            positive: t.positive,
            negative: t.negative,
        })
        .collect()
}

/// Most frequent topics; equal counts keep first-seen order.
pub fn top_topics(reviews: &[StoredReview], limit: usize) -> Vec<TopicCount> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut counts: Vec<TopicCount> = Vec::new();
    for topic in reviews.iter().flat_map(|r| r.topics.iter()) {
        match index.get(topic.as_str()) {
            Some(&i) => counts[i].count += 1,
            None => {
                index.insert(topic.as_str(), counts.len());
                counts.push(TopicCount {
                    topic: topic.clone(),
                    count: 1,
                });
            }
        }
    }
    counts.sort_by(|a, b| b.count.cmp(&a.count));
    counts.truncate(limit);
    counts
}

pub fn recent_reviews(reviews: &[StoredReview], limit: usize) -> RecentReviews {
    let take = |sentiment: Sentiment| -> Vec<StoredReview> {
        reviews
            .iter()
            .filter(|r| r.sentiment == sentiment)
            .take(limit)
            .cloned()
            .collect()
    };
    RecentReviews {
        positive: take(Sentiment::Positive),
        negative: take(Sentiment::Negative),
    }
}

/// Per-business stats, best average first; ties keep first-seen order.
pub fn business_comparison(reviews: &[StoredReview]) -> Vec<BusinessStats> {
    let mut order: Vec<&str> = Vec::new();
    let mut tallies: HashMap<&str, Tally> = HashMap::new();
    for r in reviews {
        let name = r.review.business_name.as_str();
        let tally = tallies.entry(name).or_insert_with(|| {
            order.push(name);
            Tally::default()
        });
        *tally = tally.add(r);
    }

    let mut stats: Vec<(f64, BusinessStats)> = order
        .into_iter()
        .map(|name| {
            let t = tallies[name];
            let mean = t.mean();
            (
                mean,
                BusinessStats {
                    business_name: name.to_string(),
                    total_reviews: t.count,
                    average_rating: round2(mean),
                    positive: t.positive,
                    negative: t.negative,
                },
            )
        })
        .collect();
    stats.sort_by(|a, b| b.0.total_cmp(&a.0));
    stats.into_iter().map(|(_, s)| s).collect()
}

pub fn insights(reviews: &[StoredReview], sentiments: &SentimentDistribution, topics: &[TopicCount]) -> Vec<String> {
    if reviews.is_empty() {
        return vec![INSUFFICIENT_DATA.to_string()];
    }
    let mut out = Vec::new();
    let total = reviews.len() as f64;

    let positive_share = sentiments.positive as f64 / total * 100.0;
    if positive_share > 70.0 {
        out.push(format!(
            "Excellent online reputation with {}% positive reviews",
            positive_share.round()
        ));
    } else if positive_share < 40.0 {
        out.push(format!(
            "Attention needed: only {}% of reviews are positive",
            positive_share.round()
        ));
    }

    let overall = mean_rating(reviews);
    if overall >= 4.5 {
        out.push("Exceptional rating; maintain current quality standards".to_string());
    } else if overall < 3.0 {
        out.push("Low rating requires immediate action to improve customer experience".to_string());
    }

    if let Some(top) = topics.first() {
        out.push(format!(
            "\"{}\" is the most mentioned topic ({} times)",
            top.topic, top.count
        ));
    }

    let recent = mean_rating(&reviews[..reviews.len().min(TREND_WINDOW)]);
    if recent - overall > TREND_THRESHOLD {
        out.push("Positive trend: recent reviews show improvement".to_string());
    } else if overall - recent > TREND_THRESHOLD {
        out.push("Negative trend: recent reviews have declined".to_string());
    }
    out
}

/// Full report over `reviews`, which are expected newest first.
pub fn compute_report(reviews: &[StoredReview], days: u32, generated_at: DateTime<Utc>) -> AnalyticsReport {
    let sentiment_distribution = sentiment_distribution(reviews);
    let top_topics = top_topics(reviews, TOP_TOPICS_LIMIT);
    let insights = insights(reviews, &sentiment_distribution, &top_topics);
    AnalyticsReport {
        summary: ReportSummary {
            total_reviews: reviews.len(),
            average_rating: round2(mean_rating(reviews)),
            period: format!("{days} days"),
            last_updated: generated_at,
        },
        sentiment_distribution,
        rating_distribution: rating_distribution(reviews),
        platform_distribution: platform_distribution(reviews),
        daily_trends: daily_trends(reviews),
        top_topics,
        recent_reviews: recent_reviews(reviews, RECENT_REVIEWS_LIMIT),
        business_comparison: business_comparison(reviews),
        insights,
    }
}
