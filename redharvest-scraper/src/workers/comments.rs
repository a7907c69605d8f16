//! Comments worker: tier-prioritized batch selection, depth-capped tree
//! harvesting with dedup, retry with backoff, and verify-then-mark.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use redharvest_core::common::error::{HarvestError, Result};
use redharvest_core::config::POLITENESS_DELAY;
use redharvest_core::domain::{
    Comment, ErrorKind, ErrorRecord, ParentKind, Post, ScraperRecord, ScraperType,
};
use redharvest_core::storage::Storage;
use tracing::{error, info, warn};

use crate::observability::metrics;
use crate::reddit::model::FetchedTree;
use crate::reddit::RedditApi;
use crate::retry::{retry_with_backoff, RetryPolicy};

use super::{SubredditAction, SubredditOutcome};

pub struct CommentsWorker {
    api: Arc<dyn RedditApi>,
    storage: Arc<dyn Storage>,
}

impl CommentsWorker {
    pub fn new(api: Arc<dyn RedditApi>, storage: Arc<dyn Storage>) -> Self {
        Self { api, storage }
    }

    fn to_domain(fetched: &crate::reddit::model::FetchedComment, post: &Post) -> Comment {
        let now = Utc::now();
        Comment {
            comment_id: fetched.id.clone(),
            post_id: post.post_id.clone(),
            subreddit: post.subreddit.clone(),
            parent_id: fetched.parent_id.clone(),
            parent_kind: if fetched.parent_id.is_some() {
                ParentKind::Comment
            } else {
                ParentKind::Post
            },
            depth: fetched.depth,
            author: fetched.author.clone(),
            body: fetched.body.clone(),
            score: fetched.score,
            created_utc: fetched.created_utc,
            created_at: chrono::DateTime::from_timestamp(fetched.created_utc as i64, 0)
                .unwrap_or(now),
            is_submitter: fetched.is_submitter,
            stickied: fetched.stickied,
            distinguished: fetched.distinguished.clone(),
            edited: fetched.edited,
            controversiality: fetched.controversiality,
            gilded: fetched.gilded,
            scraped_at: now,
        }
    }

    /// Harvest one post's comments. Returns the number of newly stored
    /// comments; tracking flags are only flipped after verification.
    async fn process_post(&self, record: &ScraperRecord, post: &Post) -> Result<u64> {
        let config = &record.config;
        let policy = RetryPolicy::new(config.max_retries, config.retry_backoff_factor);
        let post_id = post.post_id.clone();
        let is_initial = !post.initial_comments_scraped;

        let existing = self.storage.existing_comment_ids(&post_id).await?;

        let tree: FetchedTree = {
            let api = self.api.clone();
            let subreddit = post.subreddit.clone();
            let target = post_id.clone();
            let max_depth = config.max_comment_depth;
            let more = config.more_comments;
            let fetched = retry_with_backoff(&policy, "fetch_comment_tree", move || {
                let api = api.clone();
                let subreddit = subreddit.clone();
                let target = target.clone();
                async move {
                    api.fetch_comment_tree(&subreddit, &target, max_depth, more)
                        .await
                }
            })
            .await;
            match fetched {
                Ok(tree) => tree,
                Err(HarvestError::NotFound(_)) => {
                    // The post is gone on Reddit's side; its comments are
                    // vacuously scraped.
                    info!(post_id = %post_id, "post deleted upstream, marking vacuously scraped");
                    self.storage
                        .mark_comments_scraped(&[post_id], is_initial, Utc::now())
                        .await?;
                    return Ok(0);
                }
                Err(e) => return Err(e),
            }
        };

        let remote_tree_size = tree.comments.len();
        let fresh: Vec<Comment> = tree
            .comments
            .iter()
            .filter(|c| c.depth <= config.max_comment_depth)
            // Known comments are skipped, but their replies were still
            // walked and appear here independently if new.
            .filter(|c| !existing.contains(&c.id))
            .map(|c| Self::to_domain(c, post))
            .collect();

        let inserted = {
            let storage = self.storage.clone();
            let batch = fresh.clone();
            retry_with_backoff(&policy, "upsert_comments", move || {
                let storage = storage.clone();
                let batch = batch.clone();
                async move { storage.upsert_comments(&batch).await }
            })
            .await?
        };

        if config.verify_before_marking {
            let present = self.storage.verify_comments_present(&post_id).await?;
            if present == 0 && remote_tree_size > 0 {
                error!(
                    post_id = %post_id,
                    expected = remote_tree_size,
                    "verification failed: store reads back 0 comments"
                );
                metrics::workers::verification_failure(&post.subreddit);
                self.storage
                    .record_error(ErrorRecord::new(
                        &post.subreddit,
                        &post_id,
                        ErrorKind::VerificationFailed,
                        format!("expected {remote_tree_size} comments, store has 0 after save"),
                        config.max_retries,
                    ))
                    .await?;
                // Flags untouched: the post is re-selected next cycle.
                return Ok(inserted);
            }
        }

        self.storage
            .mark_comments_scraped(&[post_id.clone()], is_initial, Utc::now())
            .await?;
        info!(
            post_id = %post_id,
            new = inserted,
            skipped = remote_tree_size - fresh.len(),
            initial = is_initial,
            "comments stored"
        );
        Ok(inserted)
    }
}

#[async_trait]
impl SubredditAction for CommentsWorker {
    fn scraper_type(&self) -> ScraperType {
        ScraperType::Comments
    }

    async fn run_one(&self, record: &ScraperRecord, subreddit: &str) -> Result<SubredditOutcome> {
        let batch = self
            .storage
            .posts_needing_comments(subreddit, Utc::now(), record.config.comment_batch)
            .await?;
        if batch.is_empty() {
            info!(subreddit, "no posts need comment updates");
            return Ok(SubredditOutcome::default());
        }

        let unscraped = batch
            .iter()
            .filter(|p| !p.initial_comments_scraped)
            .count();
        info!(
            subreddit,
            selected = batch.len(),
            unscraped,
            "comment batch selected"
        );

        let mut outcome = SubredditOutcome::default();
        let mut posts = batch.iter().peekable();
        while let Some(post) = posts.next() {
            match self.process_post(record, post).await {
                Ok(new_comments) => {
                    outcome.new_comments += new_comments;
                    outcome.posts_processed += 1;
                    metrics::workers::comments_scraped(subreddit, new_comments);
                }
                Err(e @ HarvestError::Auth { .. }) => {
                    self.storage
                        .record_error(ErrorRecord::new(
                            subreddit,
                            &post.post_id,
                            ErrorKind::AuthFailed,
                            e.to_string(),
                            0,
                        ))
                        .await?;
                    return Err(e);
                }
                Err(e) => {
                    warn!(post_id = %post.post_id, "comment scrape failed: {e}");
                    metrics::workers::scrape_error(subreddit, "comment_scrape");
                    self.storage
                        .record_error(ErrorRecord::new(
                            subreddit,
                            &post.post_id,
                            ErrorKind::CommentScrapeFailed,
                            e.to_string(),
                            record.config.max_retries,
                        ))
                        .await?;
                }
            }
            if posts.peek().is_some() {
                tokio::time::sleep(POLITENESS_DELAY).await;
            }
        }

        info!(
            subreddit,
            processed = outcome.posts_processed,
            new_comments = outcome.new_comments,
            "comments pass complete"
        );
        Ok(outcome)
    }
}
