//! Embedded file-backed [`Storage`].
//!
//! One JSON document per collection under a root directory. Writes go
//! through a temp file and an atomic rename, serialized by a lock file
//! per collection; reads always come from disk. That makes a store root
//! shared between the control plane and its worker processes behave as
//! the single shared mutable resource the system is built around: a
//! queue mutation committed by the API is visible to the worker's next
//! `load_scraper`, and metrics or error rows written by a worker show up
//! in the operator endpoints.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::common::error::{HarvestError, Result};
use crate::domain::queue::{self, QueueDiff};
use crate::domain::*;

use super::traits::{Storage, UpsertOutcome};
use super::{merge_post, reconcile_embedding_status, select_comment_candidates, tier_eligible};

const LOCK_RETRY: Duration = Duration::from_millis(25);
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

const POSTS: &str = "posts";
const COMMENTS: &str = "comments";
const METADATA: &str = "subreddit_metadata";
const SCRAPERS: &str = "scrapers";
const ACCOUNTS: &str = "accounts";
const ERRORS: &str = "errors";
const USAGE: &str = "usage";

pub struct FileStore {
    root: PathBuf,
}

/// Cross-process advisory lock: an `O_EXCL` lock file, removed on drop.
struct CollectionLock {
    path: PathBuf,
}

impl CollectionLock {
    async fn acquire(path: PathBuf) -> Result<Self> {
        let deadline = tokio::time::Instant::now() + LOCK_TIMEOUT;
        loop {
            match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(HarvestError::storage(format!(
                            "timed out waiting for store lock {}",
                            path.display()
                        )));
                    }
                    tokio::time::sleep(LOCK_RETRY).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for CollectionLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

impl FileStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn collection_path(&self, collection: &str) -> PathBuf {
        self.root.join(format!("{collection}.json"))
    }

    async fn lock(&self, collection: &str) -> Result<CollectionLock> {
        CollectionLock::acquire(self.root.join(format!("{collection}.lock"))).await
    }

    fn read<T: DeserializeOwned + Default>(&self, collection: &str) -> Result<T> {
        let path = self.collection_path(collection);
        if !path.exists() {
            return Ok(T::default());
        }
        let raw = fs::read_to_string(&path)?;
        if raw.trim().is_empty() {
            return Ok(T::default());
        }
        Ok(serde_json::from_str(&raw)?)
    }

    /// Temp-file-then-rename so readers never see a half-written
    /// document.
    fn write<T: Serialize>(&self, collection: &str, value: &T) -> Result<()> {
        let tmp = self.root.join(format!(".{collection}.tmp"));
        fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
        fs::rename(&tmp, self.collection_path(collection))?;
        Ok(())
    }

    async fn with_scraper<T, F>(&self, id: &str, f: F) -> Result<T>
    where
        T: Send,
        F: FnOnce(&mut ScraperRecord) -> Result<T> + Send,
    {
        let _lock = self.lock(SCRAPERS).await?;
        let mut scrapers: HashMap<String, ScraperRecord> = self.read(SCRAPERS)?;
        let record = scrapers
            .get_mut(id)
            .ok_or_else(|| HarvestError::ScraperNotFound(id.to_string()))?;
        let out = f(record)?;
        record.last_updated = Utc::now();
        self.write(SCRAPERS, &scrapers)?;
        Ok(out)
    }
}

#[async_trait]
impl Storage for FileStore {
    async fn ping(&self) -> Result<()> {
        fs::metadata(&self.root)?;
        Ok(())
    }

    async fn upsert_posts(&self, posts: &[Post]) -> Result<UpsertOutcome> {
        let _lock = self.lock(POSTS).await?;
        let mut stored: HashMap<String, Post> = self.read(POSTS)?;
        let mut outcome = UpsertOutcome::default();
        for post in posts {
            match stored.get(&post.post_id) {
                Some(existing) => {
                    let merged = merge_post(existing, post);
                    stored.insert(post.post_id.clone(), merged);
                    outcome.updated += 1;
                }
                None => {
                    stored.insert(post.post_id.clone(), post.clone());
                    outcome.inserted += 1;
                }
            }
        }
        self.write(POSTS, &stored)?;
        Ok(outcome)
    }

    async fn posts_count(&self, subreddit: &str) -> Result<u64> {
        let posts: HashMap<String, Post> = self.read(POSTS)?;
        Ok(posts.values().filter(|p| p.subreddit == subreddit).count() as u64)
    }

    async fn post(&self, post_id: &str) -> Result<Option<Post>> {
        let posts: HashMap<String, Post> = self.read(POSTS)?;
        Ok(posts.get(post_id).cloned())
    }

    async fn posts_needing_comments(
        &self,
        subreddit: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Post>> {
        let posts: HashMap<String, Post> = self.read(POSTS)?;
        let eligible: Vec<Post> = posts
            .values()
            .filter(|p| p.subreddit == subreddit && tier_eligible(p, now))
            .cloned()
            .collect();
        Ok(select_comment_candidates(eligible, limit))
    }

    async fn mark_comments_scraped(
        &self,
        post_ids: &[String],
        initial: bool,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let _lock = self.lock(POSTS).await?;
        let mut posts: HashMap<String, Post> = self.read(POSTS)?;
        let mut modified = 0;
        for id in post_ids {
            if let Some(post) = posts.get_mut(id) {
                post.comments_scraped = true;
                post.last_comment_fetch_time = Some(now);
                if initial {
                    post.initial_comments_scraped = true;
                    post.comments_scraped_at = Some(now);
                }
                modified += 1;
            }
        }
        self.write(POSTS, &posts)?;
        Ok(modified)
    }

    async fn upsert_comments(&self, comments: &[Comment]) -> Result<u64> {
        let _lock = self.lock(COMMENTS).await?;
        let mut stored: HashMap<String, Comment> = self.read(COMMENTS)?;
        let mut inserted = 0;
        for comment in comments {
            if stored.contains_key(&comment.comment_id) {
                continue;
            }
            stored.insert(comment.comment_id.clone(), comment.clone());
            inserted += 1;
        }
        if inserted > 0 {
            self.write(COMMENTS, &stored)?;
        }
        Ok(inserted)
    }

    async fn existing_comment_ids(&self, post_id: &str) -> Result<HashSet<String>> {
        let comments: HashMap<String, Comment> = self.read(COMMENTS)?;
        Ok(comments
            .values()
            .filter(|c| c.post_id == post_id)
            .map(|c| c.comment_id.clone())
            .collect())
    }

    async fn verify_comments_present(&self, post_id: &str) -> Result<u64> {
        // Always a fresh read from disk, never the write path's buffers.
        let comments: HashMap<String, Comment> = self.read(COMMENTS)?;
        Ok(comments.values().filter(|c| c.post_id == post_id).count() as u64)
    }

    async fn comments_count(&self, subreddit: &str) -> Result<u64> {
        let comments: HashMap<String, Comment> = self.read(COMMENTS)?;
        Ok(comments
            .values()
            .filter(|c| c.subreddit == subreddit)
            .count() as u64)
    }

    async fn subreddit_metadata(&self, name: &str) -> Result<Option<SubredditMetadata>> {
        let metadata: HashMap<String, SubredditMetadata> = self.read(METADATA)?;
        Ok(metadata.get(name).cloned())
    }

    async fn upsert_subreddit_metadata(&self, mut incoming: SubredditMetadata) -> Result<()> {
        let _lock = self.lock(METADATA).await?;
        let mut metadata: HashMap<String, SubredditMetadata> = self.read(METADATA)?;
        reconcile_embedding_status(metadata.get(&incoming.subreddit_name), &mut incoming);
        metadata.insert(incoming.subreddit_name.clone(), incoming);
        self.write(METADATA, &metadata)
    }

    async fn save_scraper(&self, record: ScraperRecord) -> Result<()> {
        let _lock = self.lock(SCRAPERS).await?;
        let mut scrapers: HashMap<String, ScraperRecord> = self.read(SCRAPERS)?;
        scrapers.insert(record.id.clone(), record);
        self.write(SCRAPERS, &scrapers)
    }

    async fn load_scraper(&self, id: &str) -> Result<Option<ScraperRecord>> {
        let scrapers: HashMap<String, ScraperRecord> = self.read(SCRAPERS)?;
        Ok(scrapers.get(id).cloned())
    }

    async fn list_scrapers(&self) -> Result<Vec<ScraperRecord>> {
        let scrapers: HashMap<String, ScraperRecord> = self.read(SCRAPERS)?;
        let mut all: Vec<ScraperRecord> = scrapers.into_values().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn delete_scraper(&self, id: &str) -> Result<bool> {
        let _lock = self.lock(SCRAPERS).await?;
        let mut scrapers: HashMap<String, ScraperRecord> = self.read(SCRAPERS)?;
        let removed = scrapers.remove(id).is_some();
        if removed {
            self.write(SCRAPERS, &scrapers)?;
        }
        Ok(removed)
    }

    async fn set_scraper_status(
        &self,
        id: &str,
        status: ScraperStatus,
        last_error: Option<String>,
    ) -> Result<()> {
        self.with_scraper(id, |record| {
            record.status = status;
            if last_error.is_some() {
                record.last_error = last_error;
            }
            Ok(())
        })
        .await
    }

    async fn set_scraper_runtime(
        &self,
        id: &str,
        container_id: Option<String>,
        container_name: Option<String>,
    ) -> Result<()> {
        self.with_scraper(id, |record| {
            record.container_id = container_id;
            record.container_name = container_name;
            Ok(())
        })
        .await
    }

    async fn increment_restart_count(&self, id: &str) -> Result<u32> {
        self.with_scraper(id, |record| {
            record.restart_count += 1;
            Ok(record.restart_count)
        })
        .await
    }

    async fn set_auto_restart(&self, id: &str, enabled: bool) -> Result<()> {
        self.with_scraper(id, |record| {
            record.auto_restart = enabled;
            Ok(())
        })
        .await
    }

    async fn add_subreddits(&self, id: &str, subs: &[String]) -> Result<QueueDiff> {
        self.with_scraper(id, |record| queue::add(record, subs)).await
    }

    async fn remove_subreddits(&self, id: &str, subs: &[String]) -> Result<QueueDiff> {
        self.with_scraper(id, |record| queue::remove(record, subs)).await
    }

    async fn replace_subreddits(&self, id: &str, subs: &[String]) -> Result<QueueDiff> {
        self.with_scraper(id, |record| queue::replace(record, subs)).await
    }

    async fn mark_subreddit_scraped(&self, id: &str, subreddit: &str) -> Result<()> {
        self.with_scraper(id, |record| {
            record.pending_scrape.remove(subreddit);
            Ok(())
        })
        .await
    }

    async fn record_cycle(
        &self,
        id: &str,
        posts_delta: u64,
        comments_delta: u64,
        duration_seconds: f64,
    ) -> Result<()> {
        self.with_scraper(id, |record| {
            let created_at = record.created_at;
            record.metrics.record_cycle(
                posts_delta,
                comments_delta,
                duration_seconds,
                created_at,
                Utc::now(),
            );
            Ok(())
        })
        .await
    }

    async fn save_account(&self, account: Account) -> Result<()> {
        let _lock = self.lock(ACCOUNTS).await?;
        let mut accounts: HashMap<String, Account> = self.read(ACCOUNTS)?;
        accounts.insert(account.account_name.clone(), account);
        self.write(ACCOUNTS, &accounts)
    }

    async fn load_account(&self, name: &str) -> Result<Option<Account>> {
        let accounts: HashMap<String, Account> = self.read(ACCOUNTS)?;
        Ok(accounts.get(name).cloned())
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        let accounts: HashMap<String, Account> = self.read(ACCOUNTS)?;
        let mut all: Vec<Account> = accounts.into_values().collect();
        all.sort_by(|a, b| a.account_name.cmp(&b.account_name));
        Ok(all)
    }

    async fn delete_account(&self, name: &str) -> Result<bool> {
        let _lock = self.lock(ACCOUNTS).await?;
        let mut accounts: HashMap<String, Account> = self.read(ACCOUNTS)?;
        let removed = accounts.remove(name).is_some();
        if removed {
            self.write(ACCOUNTS, &accounts)?;
        }
        Ok(removed)
    }

    async fn record_error(&self, error: ErrorRecord) -> Result<()> {
        let _lock = self.lock(ERRORS).await?;
        let mut errors: Vec<ErrorRecord> = self.read(ERRORS)?;
        errors.push(error);
        self.write(ERRORS, &errors)
    }

    async fn unresolved_errors(&self, subreddit: Option<&str>) -> Result<Vec<ErrorRecord>> {
        let errors: Vec<ErrorRecord> = self.read(ERRORS)?;
        Ok(errors
            .into_iter()
            .filter(|e| !e.resolved)
            .filter(|e| subreddit.map_or(true, |s| e.subreddit == s))
            .collect())
    }

    async fn append_usage(&self, rows: Vec<UsageRecord>) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let _lock = self.lock(USAGE).await?;
        let mut usage: Vec<UsageRecord> = self.read(USAGE)?;
        usage.extend(rows);
        self.write(USAGE, &usage)
    }

    async fn usage_since(&self, since: DateTime<Utc>) -> Result<Vec<UsageRecord>> {
        let usage: Vec<UsageRecord> = self.read(USAGE)?;
        Ok(usage
            .into_iter()
            .filter(|row| row.timestamp >= since)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ScraperConfig, ScraperType, SealedCredentials};

    fn record(primary: &str) -> ScraperRecord {
        ScraperRecord::new(
            primary,
            ScraperType::Posts,
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

    fn post(id: &str, subreddit: &str) -> Post {
        let now = Utc::now();
        Post {
            post_id: id.to_string(),
            subreddit: subreddit.to_string(),
            title: format!("post {id}"),
            url: String::new(),
            permalink: String::new(),
            author: "author".into(),
            selftext: String::new(),
            score: 1,
            upvote_ratio: 0.5,
            num_comments: 3,
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

    #[tokio::test]
    async fn queue_mutations_are_visible_across_handles() {
        // Two handles on one root stand in for the control plane and a
        // worker process sharing the store.
        let dir = tempfile::tempdir().unwrap();
        let control_plane = FileStore::open(dir.path()).unwrap();
        let worker = FileStore::open(dir.path()).unwrap();

        control_plane.save_scraper(record("rust")).await.unwrap();
        control_plane
            .add_subreddits("rust", &["newsub".into()])
            .await
            .unwrap();

        // The worker's next load observes the committed mutation.
        let seen = worker.load_scraper("rust").await.unwrap().unwrap();
        assert_eq!(seen.subreddits, vec!["rust", "newsub"]);
        assert!(seen.pending_scrape.contains("newsub"));
        assert_eq!(seen.cycle_list().first().map(String::as_str), Some("newsub"));

        // And the worker's acknowledgement flows back.
        worker.mark_subreddit_scraped("rust", "newsub").await.unwrap();
        let back = control_plane.load_scraper("rust").await.unwrap().unwrap();
        assert!(back.pending_scrape.is_empty());
    }

    #[tokio::test]
    async fn worker_metrics_reach_the_other_handle() {
        let dir = tempfile::tempdir().unwrap();
        let control_plane = FileStore::open(dir.path()).unwrap();
        let worker = FileStore::open(dir.path()).unwrap();

        control_plane.save_scraper(record("rust")).await.unwrap();
        worker.record_cycle("rust", 10, 5, 12.0).await.unwrap();

        let seen = control_plane.load_scraper("rust").await.unwrap().unwrap();
        assert_eq!(seen.metrics.total_posts_collected, 10);
        assert_eq!(seen.metrics.total_cycles, 1);
    }

    #[tokio::test]
    async fn upsert_preserves_tracking_fields_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let a = FileStore::open(dir.path()).unwrap();
        let b = FileStore::open(dir.path()).unwrap();

        a.upsert_posts(&[post("p1", "rust")]).await.unwrap();
        a.mark_comments_scraped(&["p1".into()], true, Utc::now())
            .await
            .unwrap();

        let outcome = b.upsert_posts(&[post("p1", "rust")]).await.unwrap();
        assert_eq!(outcome.updated, 1);
        let stored = b.post("p1").await.unwrap().unwrap();
        assert!(stored.comments_scraped);
        assert!(stored.initial_comments_scraped);
    }

    #[tokio::test]
    async fn comment_dedup_and_verification_read_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        let now = Utc::now();
        let comment = Comment {
            comment_id: "c1".into(),
            post_id: "p1".into(),
            subreddit: "rust".into(),
            parent_id: None,
            parent_kind: ParentKind::Post,
            depth: 0,
            author: "a".into(),
            body: "b".into(),
            score: 1,
            created_utc: now.timestamp() as f64,
            created_at: now,
            is_submitter: false,
            stickied: false,
            distinguished: None,
            edited: false,
            controversiality: 0,
            gilded: 0,
            scraped_at: now,
        };
        assert_eq!(store.upsert_comments(&[comment.clone()]).await.unwrap(), 1);
        assert_eq!(store.upsert_comments(&[comment]).await.unwrap(), 0);

        let fresh = FileStore::open(dir.path()).unwrap();
        assert_eq!(fresh.verify_comments_present("p1").await.unwrap(), 1);
        assert!(fresh
            .existing_comment_ids("p1")
            .await
            .unwrap()
            .contains("c1"));
    }

    #[tokio::test]
    async fn lock_is_released_between_operations() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.save_scraper(record("rust")).await.unwrap();
        store.set_auto_restart("rust", false).await.unwrap();
        store
            .set_scraper_status("rust", ScraperStatus::Running, None)
            .await
            .unwrap();
        let seen = store.load_scraper("rust").await.unwrap().unwrap();
        assert!(!seen.auto_restart);
        assert_eq!(seen.status, ScraperStatus::Running);
    }
}
