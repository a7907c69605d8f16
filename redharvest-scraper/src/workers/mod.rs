pub mod comments;
pub mod posts;
pub mod rotation;

use async_trait::async_trait;
use redharvest_core::common::error::Result;
use redharvest_core::domain::{ScraperRecord, ScraperType};

/// What one subreddit pass produced.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubredditOutcome {
    pub posts_fetched: usize,
    pub new_posts: u64,
    pub updated_posts: u64,
    pub new_comments: u64,
    pub posts_processed: usize,
}

impl SubredditOutcome {
    pub fn absorb(&mut self, other: SubredditOutcome) {
        self.posts_fetched += other.posts_fetched;
        self.new_posts += other.new_posts;
        self.updated_posts += other.updated_posts;
        self.new_comments += other.new_comments;
        self.posts_processed += other.posts_processed;
    }
}

/// The pluggable per-subreddit action the rotation skeleton drives. The
/// posts worker and the comments worker are the two implementations; both
/// share the queue state, oracle and transport collaborators.
#[async_trait]
pub trait SubredditAction: Send + Sync {
    fn scraper_type(&self) -> ScraperType;

    async fn run_one(&self, record: &ScraperRecord, subreddit: &str) -> Result<SubredditOutcome>;
}
