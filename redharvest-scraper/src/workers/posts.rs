//! Posts worker: multi-sort listing fetch with in-cycle dedup, tracking
//! preserving upserts and periodic community-metadata refresh.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use redharvest_core::common::error::Result;
use redharvest_core::config::POLITENESS_DELAY;
use redharvest_core::domain::{Post, ScraperRecord, ScraperType, SortOrder, TimeFilter};
use redharvest_core::storage::Storage;
use tracing::{info, warn};

use crate::observability::metrics;
use crate::reddit::RedditApi;

use super::{SubredditAction, SubredditOutcome};

pub struct PostsWorker {
    api: Arc<dyn RedditApi>,
    storage: Arc<dyn Storage>,
}

impl PostsWorker {
    pub fn new(api: Arc<dyn RedditApi>, storage: Arc<dyn Storage>) -> Self {
        Self { api, storage }
    }

    fn time_filter_for(
        record: &ScraperRecord,
        sort: SortOrder,
        first_run: bool,
    ) -> Option<TimeFilter> {
        match sort {
            // The one-shot month-wide fetch backfills a new subreddit; the
            // comments worker then drains it gradually by priority.
            SortOrder::Top if first_run => Some(record.config.initial_top_time_filter),
            SortOrder::Top => Some(record.config.top_time_filter),
            SortOrder::Controversial => Some(record.config.controversial_time_filter),
            _ => None,
        }
    }

    async fn refresh_metadata_if_due(&self, record: &ScraperRecord, subreddit: &str) -> Result<bool> {
        let refresh_after =
            chrono::Duration::seconds(record.config.metadata_refresh_interval_seconds as i64);
        if let Some(existing) = self.storage.subreddit_metadata(subreddit).await? {
            if Utc::now() - existing.last_updated < refresh_after {
                return Ok(false);
            }
        }

        match self.api.fetch_subreddit_about(subreddit).await {
            Ok(metadata) => {
                info!(
                    subreddit,
                    subscribers = metadata.subscribers,
                    rules = metadata.rules.len(),
                    "refreshed subreddit metadata"
                );
                self.storage.upsert_subreddit_metadata(metadata).await?;
                Ok(true)
            }
            Err(e) => {
                warn!(subreddit, "metadata refresh failed: {e}");
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl SubredditAction for PostsWorker {
    fn scraper_type(&self) -> ScraperType {
        ScraperType::Posts
    }

    async fn run_one(&self, record: &ScraperRecord, subreddit: &str) -> Result<SubredditOutcome> {
        let config = &record.config;
        let first_run = self.storage.posts_count(subreddit).await? == 0;
        if first_run {
            info!(subreddit, "first run detected, using historical top window");
        }

        let mut seen: HashSet<String> = HashSet::new();
        let mut batch: Vec<Post> = Vec::new();
        let mut sorts = config.sorting_methods.iter().peekable();
        while let Some(&sort) = sorts.next() {
            let limit = config.limit_for(sort);
            let time_filter = Self::time_filter_for(record, sort, first_run);
            match self
                .api
                .fetch_posts(subreddit, sort, time_filter, limit)
                .await
            {
                Ok(posts) => {
                    let before = batch.len();
                    for post in posts {
                        // First sort wins on in-cycle duplicates.
                        if seen.insert(post.post_id.clone()) {
                            batch.push(post);
                        }
                    }
                    info!(
                        subreddit,
                        sort = sort.as_str(),
                        new = batch.len() - before,
                        "listing merged"
                    );
                }
                Err(e) => {
                    warn!(subreddit, sort = sort.as_str(), "listing fetch failed: {e}");
                    metrics::workers::scrape_error(subreddit, "post_listing");
                }
            }
            if sorts.peek().is_some() {
                tokio::time::sleep(POLITENESS_DELAY).await;
            }
        }

        let outcome = self.storage.upsert_posts(&batch).await?;
        metrics::workers::posts_scraped(subreddit, outcome.inserted);

        self.refresh_metadata_if_due(record, subreddit).await?;

        info!(
            subreddit,
            fetched = batch.len(),
            new = outcome.inserted,
            updated = outcome.updated,
            "posts pass complete"
        );
        Ok(SubredditOutcome {
            posts_fetched: batch.len(),
            new_posts: outcome.inserted,
            updated_posts: outcome.updated,
            new_comments: 0,
            posts_processed: 0,
        })
    }
}
