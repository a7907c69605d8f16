use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::common::error::Result;
use crate::domain::queue::QueueDiff;
use crate::domain::*;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub inserted: u64,
    pub updated: u64,
}

/// The document-store contract. The concrete engine is an external
/// collaborator; the bundled [`super::MemoryStore`] implements the same
/// contract for tests and single-process deployments.
///
/// Implementations must provide unique-key semantics on `posts.post_id`,
/// `comments.comment_id`, `subreddit_metadata.subreddit_name`,
/// `scrapers.id` and `accounts.account_name`, and every method must be
/// individually atomic.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn ping(&self) -> Result<()>;

    // ---- posts ----

    /// Merge a batch of posts. Content fields take the incoming value; the
    /// four comment-tracking fields never regress: booleans only go
    /// false -> true, timestamps are kept once set.
    async fn upsert_posts(&self, posts: &[Post]) -> Result<UpsertOutcome>;

    async fn posts_count(&self, subreddit: &str) -> Result<u64>;

    async fn post(&self, post_id: &str) -> Result<Option<Post>>;

    /// Posts eligible for a comment pass under the freshness tiers:
    /// never scraped (immediate), >100 comments older than 2h,
    /// 20..=100 older than 6h, <20 older than 24h. Ordered unscraped
    /// first, then `num_comments` descending, then newest first.
    async fn posts_needing_comments(
        &self,
        subreddit: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Post>>;

    /// Flip tracking flags after a verified comment pass. Only called once
    /// verification succeeded (or the remote tree was genuinely empty).
    async fn mark_comments_scraped(
        &self,
        post_ids: &[String],
        initial: bool,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    // ---- comments ----

    /// Insert comments keyed on `comment_id`; duplicates are silently
    /// dropped. Returns the number actually inserted.
    async fn upsert_comments(&self, comments: &[Comment]) -> Result<u64>;

    /// The deduplication oracle: every stored comment id for a post.
    async fn existing_comment_ids(&self, post_id: &str) -> Result<HashSet<String>>;

    /// Fresh read-back used by verify-then-mark. Must not be served from a
    /// cache populated by the write being verified.
    async fn verify_comments_present(&self, post_id: &str) -> Result<u64>;

    async fn comments_count(&self, subreddit: &str) -> Result<u64>;

    // ---- subreddit metadata ----

    async fn subreddit_metadata(&self, name: &str) -> Result<Option<SubredditMetadata>>;

    /// Upsert community metadata. `embedding_status` is reset to `pending`
    /// only when an embedding-relevant text field changed; otherwise the
    /// stored status is preserved.
    async fn upsert_subreddit_metadata(&self, metadata: SubredditMetadata) -> Result<()>;

    // ---- scraper records ----

    async fn save_scraper(&self, record: ScraperRecord) -> Result<()>;
    async fn load_scraper(&self, id: &str) -> Result<Option<ScraperRecord>>;
    async fn list_scrapers(&self) -> Result<Vec<ScraperRecord>>;
    async fn delete_scraper(&self, id: &str) -> Result<bool>;

    async fn set_scraper_status(
        &self,
        id: &str,
        status: ScraperStatus,
        last_error: Option<String>,
    ) -> Result<()>;

    /// Child identity fields; the supervisor is the only caller.
    async fn set_scraper_runtime(
        &self,
        id: &str,
        container_id: Option<String>,
        container_name: Option<String>,
    ) -> Result<()>;

    async fn increment_restart_count(&self, id: &str) -> Result<u32>;
    async fn set_auto_restart(&self, id: &str, enabled: bool) -> Result<()>;

    async fn add_subreddits(&self, id: &str, subs: &[String]) -> Result<QueueDiff>;
    async fn remove_subreddits(&self, id: &str, subs: &[String]) -> Result<QueueDiff>;
    async fn replace_subreddits(&self, id: &str, subs: &[String]) -> Result<QueueDiff>;

    /// Worker-side acknowledgement that a pending subreddit got its
    /// priority pass; removes it from `pending_scrape`.
    async fn mark_subreddit_scraped(&self, id: &str, subreddit: &str) -> Result<()>;

    /// Fold one finished cycle into the scraper's rolling metrics.
    async fn record_cycle(
        &self,
        id: &str,
        posts_delta: u64,
        comments_delta: u64,
        duration_seconds: f64,
    ) -> Result<()>;

    // ---- accounts ----

    async fn save_account(&self, account: Account) -> Result<()>;
    async fn load_account(&self, name: &str) -> Result<Option<Account>>;
    async fn list_accounts(&self) -> Result<Vec<Account>>;
    async fn delete_account(&self, name: &str) -> Result<bool>;

    // ---- error ledger ----

    async fn record_error(&self, error: ErrorRecord) -> Result<()>;
    async fn unresolved_errors(&self, subreddit: Option<&str>) -> Result<Vec<ErrorRecord>>;

    // ---- usage ----

    async fn append_usage(&self, rows: Vec<UsageRecord>) -> Result<()>;
    async fn usage_since(&self, since: DateTime<Utc>) -> Result<Vec<UsageRecord>>;
}
