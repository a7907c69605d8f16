pub mod client;
pub mod model;
pub mod rate_limit;
pub mod transport;

use async_trait::async_trait;
use redharvest_core::common::error::Result;
use redharvest_core::domain::{MoreCommentsPolicy, Post, SortOrder, SubredditMetadata, TimeFilter};

use model::FetchedTree;

/// The seam between the workers and the Reddit HTTP layer. Production uses
/// [`client::RedditClient`]; tests drive the workers against a fake.
#[async_trait]
pub trait RedditApi: Send + Sync {
    /// Perform an authenticated identity call. Returns the username; the
    /// first success is the worker's readiness signal.
    async fn authenticate(&self) -> Result<String>;

    /// Fetch up to `limit` posts for one sort order, paginating in pages
    /// of at most 100.
    async fn fetch_posts(
        &self,
        subreddit: &str,
        sort: SortOrder,
        time_filter: Option<TimeFilter>,
        limit: usize,
    ) -> Result<Vec<Post>>;

    /// Fetch a post's comment tree, retaining levels `0..=max_depth` and
    /// expanding collapsed stubs per `more`.
    async fn fetch_comment_tree(
        &self,
        subreddit: &str,
        post_id: &str,
        max_depth: u32,
        more: MoreCommentsPolicy,
    ) -> Result<FetchedTree>;

    async fn fetch_subreddit_about(&self, name: &str) -> Result<SubredditMetadata>;
}
