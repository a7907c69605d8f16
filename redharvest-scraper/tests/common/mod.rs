//! Shared fixtures: a scripted Reddit fake and a store wrapper that
//! simulates silently dropped comment writes.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use redharvest_core::common::error::{HarvestError, Result};
use redharvest_core::domain::queue::QueueDiff;
use redharvest_core::domain::*;
use redharvest_core::storage::{MemoryStore, Storage, UpsertOutcome};
use redharvest_scraper::reddit::model::{FetchedComment, FetchedTree};
use redharvest_scraper::reddit::RedditApi;

#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    FetchPosts {
        subreddit: String,
        sort: SortOrder,
        time_filter: Option<TimeFilter>,
        limit: usize,
    },
    FetchTree {
        post_id: String,
    },
    FetchAbout {
        subreddit: String,
    },
}

pub enum FailurePlan {
    NotFound,
    Auth,
    /// Fail this many times with a 503, then serve the scripted tree.
    Transient(u32),
}

#[derive(Default)]
pub struct FakeReddit {
    posts: Mutex<HashMap<(String, SortOrder), Vec<Post>>>,
    trees: Mutex<HashMap<String, FetchedTree>>,
    tree_failures: Mutex<HashMap<String, FailurePlan>>,
    pub calls: Mutex<Vec<RecordedCall>>,
}

impl FakeReddit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_posts(&self, subreddit: &str, sort: SortOrder, posts: Vec<Post>) {
        self.posts
            .lock()
            .unwrap()
            .insert((subreddit.to_string(), sort), posts);
    }

    pub fn script_tree(&self, post_id: &str, tree: FetchedTree) {
        self.trees.lock().unwrap().insert(post_id.to_string(), tree);
    }

    pub fn script_tree_failure(&self, post_id: &str, plan: FailurePlan) {
        self.tree_failures
            .lock()
            .unwrap()
            .insert(post_id.to_string(), plan);
    }

    pub fn recorded(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn tree_fetches(&self, post_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| matches!(c, RecordedCall::FetchTree { post_id: p } if p == post_id))
            .count()
    }
}

#[async_trait]
impl RedditApi for FakeReddit {
    async fn authenticate(&self) -> Result<String> {
        Ok("fake-account".to_string())
    }

    async fn fetch_posts(
        &self,
        subreddit: &str,
        sort: SortOrder,
        time_filter: Option<TimeFilter>,
        limit: usize,
    ) -> Result<Vec<Post>> {
        self.calls.lock().unwrap().push(RecordedCall::FetchPosts {
            subreddit: subreddit.to_string(),
            sort,
            time_filter,
            limit,
        });
        Ok(self
            .posts
            .lock()
            .unwrap()
            .get(&(subreddit.to_string(), sort))
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_comment_tree(
        &self,
        _subreddit: &str,
        post_id: &str,
        _max_depth: u32,
        _more: MoreCommentsPolicy,
    ) -> Result<FetchedTree> {
        self.calls.lock().unwrap().push(RecordedCall::FetchTree {
            post_id: post_id.to_string(),
        });

        let mut failures = self.tree_failures.lock().unwrap();
        match failures.get_mut(post_id) {
            Some(FailurePlan::NotFound) => {
                return Err(HarvestError::NotFound(format!("/comments/{post_id}")))
            }
            Some(FailurePlan::Auth) => {
                return Err(HarvestError::Auth {
                    status: 403,
                    message: "forbidden".into(),
                })
            }
            Some(FailurePlan::Transient(n)) if *n > 0 => {
                *n -= 1;
                return Err(HarvestError::Api {
                    status: 503,
                    message: "upstream unavailable".into(),
                });
            }
            _ => {}
        }
        drop(failures);

        Ok(self
            .trees
            .lock()
            .unwrap()
            .get(post_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_subreddit_about(&self, name: &str) -> Result<SubredditMetadata> {
        self.calls.lock().unwrap().push(RecordedCall::FetchAbout {
            subreddit: name.to_string(),
        });
        let now = Utc::now();
        Ok(SubredditMetadata {
            subreddit_name: name.to_string(),
            title: format!("r/{name}"),
            public_description: "a community".into(),
            description: "a longer description".into(),
            subscribers: 1000,
            active_user_count: Some(10),
            over_18: false,
            lang: "en".into(),
            created_utc: 1.2e9,
            subreddit_type: "public".into(),
            advertiser_category: None,
            icon_img: None,
            banner_img: None,
            rules: vec![],
            rules_text: String::new(),
            sample_post_titles: String::new(),
            embedding_status: EmbeddingStatus::Pending,
            scraped_at: now,
            last_updated: now,
        })
    }
}

pub fn make_post(id: &str, subreddit: &str, num_comments: u64) -> Post {
    let now = Utc::now();
    Post {
        post_id: id.to_string(),
        subreddit: subreddit.to_string(),
        title: format!("post {id}"),
        url: format!("https://example.com/{id}"),
        permalink: format!("/r/{subreddit}/comments/{id}/"),
        author: "author".into(),
        selftext: String::new(),
        score: 1,
        upvote_ratio: 0.5,
        num_comments,
        is_self: true,
        over_18: false,
        spoiler: false,
        stickied: false,
        locked: false,
        distinguished: None,
        created_utc: now.timestamp() as f64,
        created_at: now,
        sort_method: "new".into(),
        scraped_at: now,
        comments_scraped: false,
        initial_comments_scraped: false,
        last_comment_fetch_time: None,
        comments_scraped_at: None,
    }
}

pub fn make_fetched_comment(id: &str, depth: u32, parent: Option<&str>) -> FetchedComment {
    FetchedComment {
        id: id.to_string(),
        parent_id: parent.map(String::from),
        depth,
        author: "commenter".into(),
        body: format!("comment {id}"),
        score: 1,
        created_utc: 1.7e9,
        is_submitter: false,
        stickied: false,
        distinguished: None,
        edited: false,
        controversiality: 0,
        gilded: 0,
    }
}

/// A flat tree of `n` top-level comments c0..c{n-1}.
pub fn make_tree(n: usize) -> FetchedTree {
    FetchedTree {
        comments: (0..n)
            .map(|i| make_fetched_comment(&format!("c{i}"), 0, None))
            .collect(),
        more_stubs: Vec::new(),
    }
}

pub fn make_record(primary: &str, scraper_type: ScraperType) -> ScraperRecord {
    ScraperRecord::new(
        primary,
        scraper_type,
        ScraperConfig::default(),
        SealedCredentials {
            client_id: String::new(),
            client_secret: String::new(),
            username: "tester".into(),
            password: String::new(),
            user_agent: "redharvest-test/0.3".into(),
        },
    )
}

/// Storage wrapper whose comment writes report success but store nothing:
/// the failure mode verify-then-mark exists to catch.
pub struct SilentDropStore {
    pub inner: MemoryStore,
}

impl SilentDropStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
        }
    }
}

#[async_trait]
impl Storage for SilentDropStore {
    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }

    async fn upsert_posts(&self, posts: &[Post]) -> Result<UpsertOutcome> {
        self.inner.upsert_posts(posts).await
    }

    async fn posts_count(&self, subreddit: &str) -> Result<u64> {
        self.inner.posts_count(subreddit).await
    }

    async fn post(&self, post_id: &str) -> Result<Option<Post>> {
        self.inner.post(post_id).await
    }

    async fn posts_needing_comments(
        &self,
        subreddit: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Post>> {
        self.inner.posts_needing_comments(subreddit, now, limit).await
    }

    async fn mark_comments_scraped(
        &self,
        post_ids: &[String],
        initial: bool,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        self.inner.mark_comments_scraped(post_ids, initial, now).await
    }

    async fn upsert_comments(&self, comments: &[Comment]) -> Result<u64> {
        // Pretend the write landed.
        Ok(comments.len() as u64)
    }

    async fn existing_comment_ids(&self, post_id: &str) -> Result<HashSet<String>> {
        self.inner.existing_comment_ids(post_id).await
    }

    async fn verify_comments_present(&self, post_id: &str) -> Result<u64> {
        self.inner.verify_comments_present(post_id).await
    }

    async fn comments_count(&self, subreddit: &str) -> Result<u64> {
        self.inner.comments_count(subreddit).await
    }

    async fn subreddit_metadata(&self, name: &str) -> Result<Option<SubredditMetadata>> {
        self.inner.subreddit_metadata(name).await
    }

    async fn upsert_subreddit_metadata(&self, metadata: SubredditMetadata) -> Result<()> {
        self.inner.upsert_subreddit_metadata(metadata).await
    }

    async fn save_scraper(&self, record: ScraperRecord) -> Result<()> {
        self.inner.save_scraper(record).await
    }

    async fn load_scraper(&self, id: &str) -> Result<Option<ScraperRecord>> {
        self.inner.load_scraper(id).await
    }

    async fn list_scrapers(&self) -> Result<Vec<ScraperRecord>> {
        self.inner.list_scrapers().await
    }

    async fn delete_scraper(&self, id: &str) -> Result<bool> {
        self.inner.delete_scraper(id).await
    }

    async fn set_scraper_status(
        &self,
        id: &str,
        status: ScraperStatus,
        last_error: Option<String>,
    ) -> Result<()> {
        self.inner.set_scraper_status(id, status, last_error).await
    }

    async fn set_scraper_runtime(
        &self,
        id: &str,
        container_id: Option<String>,
        container_name: Option<String>,
    ) -> Result<()> {
        self.inner
            .set_scraper_runtime(id, container_id, container_name)
            .await
    }

    async fn increment_restart_count(&self, id: &str) -> Result<u32> {
        self.inner.increment_restart_count(id).await
    }

    async fn set_auto_restart(&self, id: &str, enabled: bool) -> Result<()> {
        self.inner.set_auto_restart(id, enabled).await
    }

    async fn add_subreddits(&self, id: &str, subs: &[String]) -> Result<QueueDiff> {
        self.inner.add_subreddits(id, subs).await
    }

    async fn remove_subreddits(&self, id: &str, subs: &[String]) -> Result<QueueDiff> {
        self.inner.remove_subreddits(id, subs).await
    }

    async fn replace_subreddits(&self, id: &str, subs: &[String]) -> Result<QueueDiff> {
        self.inner.replace_subreddits(id, subs).await
    }

    async fn mark_subreddit_scraped(&self, id: &str, subreddit: &str) -> Result<()> {
        self.inner.mark_subreddit_scraped(id, subreddit).await
    }

    async fn record_cycle(
        &self,
        id: &str,
        posts_delta: u64,
        comments_delta: u64,
        duration_seconds: f64,
    ) -> Result<()> {
        self.inner
            .record_cycle(id, posts_delta, comments_delta, duration_seconds)
            .await
    }

    async fn save_account(&self, account: Account) -> Result<()> {
        self.inner.save_account(account).await
    }

    async fn load_account(&self, name: &str) -> Result<Option<Account>> {
        self.inner.load_account(name).await
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        self.inner.list_accounts().await
    }

    async fn delete_account(&self, name: &str) -> Result<bool> {
        self.inner.delete_account(name).await
    }

    async fn record_error(&self, error: ErrorRecord) -> Result<()> {
        self.inner.record_error(error).await
    }

    async fn unresolved_errors(&self, subreddit: Option<&str>) -> Result<Vec<ErrorRecord>> {
        self.inner.unresolved_errors(subreddit).await
    }

    async fn append_usage(&self, rows: Vec<UsageRecord>) -> Result<()> {
        self.inner.append_usage(rows).await
    }

    async fn usage_since(&self, since: DateTime<Utc>) -> Result<Vec<UsageRecord>> {
        self.inner.usage_since(since).await
    }
}
