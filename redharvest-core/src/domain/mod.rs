use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod queue;
mod scraper;

pub use scraper::*;

/// A harvested submission. Content fields are refreshed on every sighting;
/// the four tracking fields are owned by the comments worker and must never
/// regress on upsert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub post_id: String,
    pub subreddit: String,
    pub title: String,
    pub url: String,
    pub permalink: String,
    pub author: String,
    pub selftext: String,
    pub score: i64,
    pub upvote_ratio: f64,
    pub num_comments: u64,
    pub is_self: bool,
    pub over_18: bool,
    pub spoiler: bool,
    pub stickied: bool,
    pub locked: bool,
    pub distinguished: Option<String>,
    pub created_utc: f64,
    pub created_at: DateTime<Utc>,
    /// Which listing sort first surfaced this post in the current cycle.
    pub sort_method: String,
    pub scraped_at: DateTime<Utc>,

    pub comments_scraped: bool,
    pub initial_comments_scraped: bool,
    pub last_comment_fetch_time: Option<DateTime<Utc>>,
    pub comments_scraped_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParentKind {
    Post,
    Comment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub comment_id: String,
    pub post_id: String,
    pub subreddit: String,
    /// None for top-level comments; otherwise the parent comment id.
    pub parent_id: Option<String>,
    pub parent_kind: ParentKind,
    /// 0 = top-level.
    pub depth: u32,
    pub author: String,
    pub body: String,
    pub score: i64,
    pub created_utc: f64,
    pub created_at: DateTime<Utc>,
    pub is_submitter: bool,
    pub stickied: bool,
    pub distinguished: Option<String>,
    pub edited: bool,
    pub controversiality: i64,
    pub gilded: i64,
    pub scraped_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingStatus {
    Pending,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubredditRule {
    pub short_name: String,
    pub description: String,
    pub kind: String,
}

/// Community metadata, refreshed at most once per
/// [`ScraperConfig::metadata_refresh_interval_seconds`]. The text corpus
/// fields feed a downstream embedding worker; `embedding_status` flips back
/// to `pending` only when one of them actually changed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubredditMetadata {
    pub subreddit_name: String,
    pub title: String,
    pub public_description: String,
    pub description: String,
    pub subscribers: u64,
    pub active_user_count: Option<u64>,
    pub over_18: bool,
    pub lang: String,
    pub created_utc: f64,
    pub subreddit_type: String,
    pub advertiser_category: Option<String>,
    pub icon_img: Option<String>,
    pub banner_img: Option<String>,

    pub rules: Vec<SubredditRule>,
    pub rules_text: String,
    pub sample_post_titles: String,

    pub embedding_status: EmbeddingStatus,
    pub scraped_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl SubredditMetadata {
    /// The fields the embedding worker consumes. A change in any of them
    /// requires re-embedding.
    pub fn embedding_corpus(&self) -> [&str; 5] {
        [
            &self.title,
            &self.public_description,
            &self.description,
            &self.rules_text,
            &self.sample_post_titles,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CommentScrapeFailed,
    VerificationFailed,
    AuthFailed,
    TransportError,
}

/// Append-only row in the error ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: Uuid,
    pub subreddit: String,
    pub post_id: String,
    pub kind: ErrorKind,
    pub message: String,
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
    pub resolved: bool,
}

impl ErrorRecord {
    pub fn new(
        subreddit: impl Into<String>,
        post_id: impl Into<String>,
        kind: ErrorKind,
        message: impl Into<String>,
        retry_count: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subreddit: subreddit.into(),
            post_id: post_id.into(),
            kind,
            message: message.into(),
            retry_count,
            timestamp: Utc::now(),
            resolved: false,
        }
    }
}

/// Rate-limit snapshot as attached to usage rows.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub remaining: f64,
    pub used: u64,
    pub reset_in_seconds: u64,
}

/// One flush interval's worth of transport-level accounting for a
/// `(subreddit, scraper_type)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub subreddit: String,
    pub scraper_type: ScraperType,
    pub timestamp: DateTime<Utc>,
    pub actual_http_requests: u64,
    pub estimated_cost_usd: f64,
    pub cycle_duration_seconds: f64,
    pub rate_limit: Option<RateLimitSnapshot>,
}

/// Plaintext OAuth application credentials. Exists only in memory; the
/// at-rest form is [`SealedCredentials`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedditCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
    pub user_agent: String,
}

/// Credentials as persisted. Secrets are sealed; username and user agent
/// stay readable for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
    pub user_agent: String,
}

/// A reusable named credential set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub account_name: String,
    pub credentials: SealedCredentials,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}
