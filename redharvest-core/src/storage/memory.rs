//! Embedded in-memory [`Storage`] implementation.
//!
//! `HashMap`s behind `std::sync::RwLock`; locks are never held across an
//! await point. Serves as the test substrate and as the store for
//! single-process deployments where no external document store is wired.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::common::error::{HarvestError, Result};
use crate::domain::queue::{self, QueueDiff};
use crate::domain::*;

use super::traits::{Storage, UpsertOutcome};
use super::{merge_post, reconcile_embedding_status, select_comment_candidates, tier_eligible};

#[derive(Default)]
pub struct MemoryStore {
    posts: RwLock<HashMap<String, Post>>,
    comments: RwLock<HashMap<String, Comment>>,
    comments_by_post: RwLock<HashMap<String, HashSet<String>>>,
    metadata: RwLock<HashMap<String, SubredditMetadata>>,
    scrapers: RwLock<HashMap<String, ScraperRecord>>,
    accounts: RwLock<HashMap<String, Account>>,
    errors: RwLock<Vec<ErrorRecord>>,
    usage: RwLock<Vec<UsageRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_scraper<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut ScraperRecord) -> Result<T>,
    ) -> Result<T> {
        let mut scrapers = self.scrapers.write().expect("scrapers lock poisoned");
        let record = scrapers
            .get_mut(id)
            .ok_or_else(|| HarvestError::ScraperNotFound(id.to_string()))?;
        let out = f(record)?;
        record.last_updated = Utc::now();
        Ok(out)
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn upsert_posts(&self, posts: &[Post]) -> Result<UpsertOutcome> {
        let mut stored = self.posts.write().expect("posts lock poisoned");
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
        Ok(outcome)
    }

    async fn posts_count(&self, subreddit: &str) -> Result<u64> {
        let posts = self.posts.read().expect("posts lock poisoned");
        Ok(posts.values().filter(|p| p.subreddit == subreddit).count() as u64)
    }

    async fn post(&self, post_id: &str) -> Result<Option<Post>> {
        let posts = self.posts.read().expect("posts lock poisoned");
        Ok(posts.get(post_id).cloned())
    }

    async fn posts_needing_comments(
        &self,
        subreddit: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Post>> {
        let posts = self.posts.read().expect("posts lock poisoned");
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
        let mut posts = self.posts.write().expect("posts lock poisoned");
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
        Ok(modified)
    }

    async fn upsert_comments(&self, comments: &[Comment]) -> Result<u64> {
        let mut stored = self.comments.write().expect("comments lock poisoned");
        let mut by_post = self
            .comments_by_post
            .write()
            .expect("comment index lock poisoned");
        let mut inserted = 0;
        for comment in comments {
            if stored.contains_key(&comment.comment_id) {
                continue;
            }
            by_post
                .entry(comment.post_id.clone())
                .or_default()
                .insert(comment.comment_id.clone());
            stored.insert(comment.comment_id.clone(), comment.clone());
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn existing_comment_ids(&self, post_id: &str) -> Result<HashSet<String>> {
        let by_post = self
            .comments_by_post
            .read()
            .expect("comment index lock poisoned");
        Ok(by_post.get(post_id).cloned().unwrap_or_default())
    }

    async fn verify_comments_present(&self, post_id: &str) -> Result<u64> {
        // Counted from the primary comment map, not the per-post index, so
        // a dropped write cannot be masked by a stale index entry.
        let comments = self.comments.read().expect("comments lock poisoned");
        Ok(comments.values().filter(|c| c.post_id == post_id).count() as u64)
    }

    async fn comments_count(&self, subreddit: &str) -> Result<u64> {
        let comments = self.comments.read().expect("comments lock poisoned");
        Ok(comments
            .values()
            .filter(|c| c.subreddit == subreddit)
            .count() as u64)
    }

    async fn subreddit_metadata(&self, name: &str) -> Result<Option<SubredditMetadata>> {
        let metadata = self.metadata.read().expect("metadata lock poisoned");
        Ok(metadata.get(name).cloned())
    }

    async fn upsert_subreddit_metadata(&self, mut incoming: SubredditMetadata) -> Result<()> {
        let mut metadata = self.metadata.write().expect("metadata lock poisoned");
        reconcile_embedding_status(metadata.get(&incoming.subreddit_name), &mut incoming);
        metadata.insert(incoming.subreddit_name.clone(), incoming);
        Ok(())
    }

    async fn save_scraper(&self, record: ScraperRecord) -> Result<()> {
        let mut scrapers = self.scrapers.write().expect("scrapers lock poisoned");
        scrapers.insert(record.id.clone(), record);
        Ok(())
    }

    async fn load_scraper(&self, id: &str) -> Result<Option<ScraperRecord>> {
        let scrapers = self.scrapers.read().expect("scrapers lock poisoned");
        Ok(scrapers.get(id).cloned())
    }

    async fn list_scrapers(&self) -> Result<Vec<ScraperRecord>> {
        let scrapers = self.scrapers.read().expect("scrapers lock poisoned");
        let mut all: Vec<ScraperRecord> = scrapers.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn delete_scraper(&self, id: &str) -> Result<bool> {
        let mut scrapers = self.scrapers.write().expect("scrapers lock poisoned");
        Ok(scrapers.remove(id).is_some())
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
    }

    async fn increment_restart_count(&self, id: &str) -> Result<u32> {
        self.with_scraper(id, |record| {
            record.restart_count += 1;
            Ok(record.restart_count)
        })
    }

    async fn set_auto_restart(&self, id: &str, enabled: bool) -> Result<()> {
        self.with_scraper(id, |record| {
            record.auto_restart = enabled;
            Ok(())
        })
    }

    async fn add_subreddits(&self, id: &str, subs: &[String]) -> Result<QueueDiff> {
        self.with_scraper(id, |record| queue::add(record, subs))
    }

    async fn remove_subreddits(&self, id: &str, subs: &[String]) -> Result<QueueDiff> {
        self.with_scraper(id, |record| queue::remove(record, subs))
    }

    async fn replace_subreddits(&self, id: &str, subs: &[String]) -> Result<QueueDiff> {
        self.with_scraper(id, |record| queue::replace(record, subs))
    }

    async fn mark_subreddit_scraped(&self, id: &str, subreddit: &str) -> Result<()> {
        self.with_scraper(id, |record| {
            record.pending_scrape.remove(subreddit);
            Ok(())
        })
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
            record
                .metrics
                .record_cycle(posts_delta, comments_delta, duration_seconds, created_at, Utc::now());
            Ok(())
        })
    }

    async fn save_account(&self, account: Account) -> Result<()> {
        let mut accounts = self.accounts.write().expect("accounts lock poisoned");
        accounts.insert(account.account_name.clone(), account);
        Ok(())
    }

    async fn load_account(&self, name: &str) -> Result<Option<Account>> {
        let accounts = self.accounts.read().expect("accounts lock poisoned");
        Ok(accounts.get(name).cloned())
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        let accounts = self.accounts.read().expect("accounts lock poisoned");
        let mut all: Vec<Account> = accounts.values().cloned().collect();
        all.sort_by(|a, b| a.account_name.cmp(&b.account_name));
        Ok(all)
    }

    async fn delete_account(&self, name: &str) -> Result<bool> {
        let mut accounts = self.accounts.write().expect("accounts lock poisoned");
        Ok(accounts.remove(name).is_some())
    }

    async fn record_error(&self, error: ErrorRecord) -> Result<()> {
        let mut errors = self.errors.write().expect("errors lock poisoned");
        errors.push(error);
        Ok(())
    }

    async fn unresolved_errors(&self, subreddit: Option<&str>) -> Result<Vec<ErrorRecord>> {
        let errors = self.errors.read().expect("errors lock poisoned");
        Ok(errors
            .iter()
            .filter(|e| !e.resolved)
            .filter(|e| subreddit.map_or(true, |s| e.subreddit == s))
            .cloned()
            .collect())
    }

    async fn append_usage(&self, rows: Vec<UsageRecord>) -> Result<()> {
        let mut usage = self.usage.write().expect("usage lock poisoned");
        usage.extend(rows);
        Ok(())
    }

    async fn usage_since(&self, since: DateTime<Utc>) -> Result<Vec<UsageRecord>> {
        let usage = self.usage.read().expect("usage lock poisoned");
        Ok(usage
            .iter()
            .filter(|row| row.timestamp >= since)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    fn post(id: &str, subreddit: &str, num_comments: u64) -> Post {
        let now = Utc::now();
        Post {
            post_id: id.to_string(),
            subreddit: subreddit.to_string(),
            title: format!("post {id}"),
            url: format!("https://example.com/{id}"),
            permalink: format!("/r/{subreddit}/comments/{id}/"),
            author: "author".into(),
            selftext: String::new(),
            score: 10,
            upvote_ratio: 0.9,
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

    fn comment(id: &str, post_id: &str, depth: u32, parent: Option<&str>) -> Comment {
        let now = Utc::now();
        Comment {
            comment_id: id.to_string(),
            post_id: post_id.to_string(),
            subreddit: "rust".into(),
            parent_id: parent.map(String::from),
            parent_kind: if parent.is_some() {
                ParentKind::Comment
            } else {
                ParentKind::Post
            },
            depth,
            author: "author".into(),
            body: "body".into(),
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
        }
    }

    #[tokio::test]
    async fn upsert_preserves_tracking_fields() {
        let store = MemoryStore::new();
        let p = post("p1", "rust", 42);
        store.upsert_posts(&[p.clone()]).await.unwrap();
        store
            .mark_comments_scraped(&["p1".into()], true, Utc::now())
            .await
            .unwrap();

        // A fresh sighting arrives with tracking fields reset to default.
        let outcome = store.upsert_posts(&[p]).await.unwrap();
        assert_eq!(outcome.updated, 1);
        let stored = store.post("p1").await.unwrap().unwrap();
        assert!(stored.comments_scraped);
        assert!(stored.initial_comments_scraped);
        assert!(stored.last_comment_fetch_time.is_some());
        assert!(stored.comments_scraped_at.is_some());
    }

    #[tokio::test]
    async fn upserting_same_batch_twice_inserts_once() {
        let store = MemoryStore::new();
        let batch = vec![post("p1", "rust", 5), post("p2", "rust", 7)];
        let first = store.upsert_posts(&batch).await.unwrap();
        assert_eq!(first.inserted, 2);
        let second = store.upsert_posts(&batch).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.updated, 2);
        assert_eq!(store.posts_count("rust").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn comment_duplicates_are_silently_dropped() {
        let store = MemoryStore::new();
        let c = comment("c1", "p1", 0, None);
        assert_eq!(store.upsert_comments(&[c.clone()]).await.unwrap(), 1);
        assert_eq!(store.upsert_comments(&[c]).await.unwrap(), 0);
        assert_eq!(store.verify_comments_present("p1").await.unwrap(), 1);
        let ids = store.existing_comment_ids("p1").await.unwrap();
        assert!(ids.contains("c1"));
    }

    #[tokio::test]
    async fn tier_selection_orders_unscraped_then_activity() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let mut hot = post("hot", "rust", 500);
        hot.initial_comments_scraped = true;
        hot.last_comment_fetch_time = Some(now - Duration::hours(3));

        let mut fresh_hot = post("fresh_hot", "rust", 500);
        fresh_hot.initial_comments_scraped = true;
        fresh_hot.last_comment_fetch_time = Some(now - Duration::minutes(30));

        let mut warm = post("warm", "rust", 50);
        warm.initial_comments_scraped = true;
        warm.last_comment_fetch_time = Some(now - Duration::hours(7));

        let mut cold = post("cold", "rust", 5);
        cold.initial_comments_scraped = true;
        cold.last_comment_fetch_time = Some(now - Duration::hours(12));

        let unscraped = post("unscraped", "rust", 1);

        store
            .upsert_posts(&[hot, fresh_hot, warm, cold, unscraped])
            .await
            .unwrap();

        let selected = store.posts_needing_comments("rust", now, 10).await.unwrap();
        let ids: Vec<&str> = selected.iter().map(|p| p.post_id.as_str()).collect();
        // fresh_hot was refreshed 30 minutes ago and is not yet due; cold
        // (<20 comments) needs 24h of staleness.
        assert_eq!(ids, vec!["unscraped", "hot", "warm"]);
    }

    #[tokio::test]
    async fn tier_selection_respects_batch_limit_and_subreddit() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .upsert_posts(&[
                post("a", "rust", 1),
                post("b", "rust", 2),
                post("other", "golang", 3),
            ])
            .await
            .unwrap();
        let selected = store.posts_needing_comments("rust", now, 1).await.unwrap();
        assert_eq!(selected.len(), 1);
        assert!(selected[0].subreddit == "rust");
    }

    #[tokio::test]
    async fn metadata_embedding_status_resets_only_on_content_change() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut meta = SubredditMetadata {
            subreddit_name: "rust".into(),
            title: "Rust".into(),
            public_description: "The Rust programming language".into(),
            description: "long".into(),
            subscribers: 100,
            active_user_count: Some(5),
            over_18: false,
            lang: "en".into(),
            created_utc: 0.0,
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
        };
        store.upsert_subreddit_metadata(meta.clone()).await.unwrap();

        // Downstream worker finishes embedding.
        let mut done = store.subreddit_metadata("rust").await.unwrap().unwrap();
        done.embedding_status = EmbeddingStatus::Complete;
        {
            let mut map = store.metadata.write().unwrap();
            map.insert("rust".into(), done);
        }

        // Subscriber count changes but the text corpus does not.
        meta.subscribers = 200;
        store.upsert_subreddit_metadata(meta.clone()).await.unwrap();
        let stored = store.subreddit_metadata("rust").await.unwrap().unwrap();
        assert_eq!(stored.embedding_status, EmbeddingStatus::Complete);
        assert_eq!(stored.subscribers, 200);

        // Description changes: back to pending.
        meta.public_description = "changed".into();
        store.upsert_subreddit_metadata(meta).await.unwrap();
        let stored = store.subreddit_metadata("rust").await.unwrap().unwrap();
        assert_eq!(stored.embedding_status, EmbeddingStatus::Pending);
    }

    #[tokio::test]
    async fn record_cycle_folds_rolling_metrics() {
        let store = MemoryStore::new();
        let mut rec = ScraperRecord::new(
            "rust",
            ScraperType::Posts,
            ScraperConfig::default(),
            SealedCredentials {
                client_id: String::new(),
                client_secret: String::new(),
                username: "u".into(),
                password: String::new(),
                user_agent: "ua".into(),
            },
        );
        rec.created_at = Utc::now() - Duration::hours(2);
        store.save_scraper(rec).await.unwrap();

        store.record_cycle("rust", 100, 0, 10.0).await.unwrap();
        store.record_cycle("rust", 50, 0, 20.0).await.unwrap();

        let rec = store.load_scraper("rust").await.unwrap().unwrap();
        assert_eq!(rec.metrics.total_posts_collected, 150);
        assert_eq!(rec.metrics.total_cycles, 2);
        assert!((rec.metrics.avg_cycle_duration - 15.0).abs() < 1e-9);
        assert!((rec.metrics.posts_per_hour - 75.0).abs() < 1.0);
        assert_eq!(rec.metrics.last_cycle_posts, 50);
    }

    #[tokio::test]
    async fn usage_rows_filter_by_timestamp() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let row = |age_hours: i64| UsageRecord {
            id: Uuid::new_v4(),
            subreddit: "rust".into(),
            scraper_type: ScraperType::Posts,
            timestamp: now - Duration::hours(age_hours),
            actual_http_requests: 10,
            estimated_cost_usd: 0.0024,
            cycle_duration_seconds: 1.0,
            rate_limit: None,
        };
        store.append_usage(vec![row(48), row(1)]).await.unwrap();
        let recent = store.usage_since(now - Duration::hours(24)).await.unwrap();
        assert_eq!(recent.len(), 1);
    }

    #[tokio::test]
    async fn worker_and_api_edits_commute() {
        let store = MemoryStore::new();
        let rec = ScraperRecord::new(
            "rust",
            ScraperType::Posts,
            ScraperConfig::default(),
            SealedCredentials {
                client_id: String::new(),
                client_secret: String::new(),
                username: "u".into(),
                password: String::new(),
                user_agent: "ua".into(),
            },
        );
        store.save_scraper(rec).await.unwrap();
        store
            .add_subreddits("rust", &["a".into(), "b".into()])
            .await
            .unwrap();

        // Worker acknowledges one pending sub while the API adds another.
        store.mark_subreddit_scraped("rust", "a").await.unwrap();
        store.add_subreddits("rust", &["c".into()]).await.unwrap();

        let rec = store.load_scraper("rust").await.unwrap().unwrap();
        assert_eq!(rec.subreddits, vec!["rust", "a", "b", "c"]);
        let pending: Vec<String> = rec.pending_scrape.iter().cloned().collect();
        assert_eq!(pending, vec!["b".to_string(), "c".to_string()]);
    }
}
