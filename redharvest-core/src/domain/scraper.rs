use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::SealedCredentials;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScraperType {
    Posts,
    Comments,
}

impl ScraperType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScraperType::Posts => "posts",
            ScraperType::Comments => "comments",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScraperStatus {
    Configured,
    Starting,
    Running,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    New,
    Hot,
    Rising,
    Top,
    Controversial,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::New => "new",
            SortOrder::Hot => "hot",
            SortOrder::Rising => "rising",
            SortOrder::Top => "top",
            SortOrder::Controversial => "controversial",
        }
    }

    /// Only `top` and `controversial` listings accept a time filter.
    pub fn takes_time_filter(&self) -> bool {
        matches!(self, SortOrder::Top | SortOrder::Controversial)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeFilter {
    Hour,
    Day,
    Week,
    Month,
    Year,
    All,
}

impl TimeFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeFilter::Hour => "hour",
            TimeFilter::Day => "day",
            TimeFilter::Week => "week",
            TimeFilter::Month => "month",
            TimeFilter::Year => "year",
            TimeFilter::All => "all",
        }
    }
}

/// Expansion policy for Reddit's collapsed "load more comments" stubs.
/// Skipping them cuts 70-80% of comment-tree HTTP calls; depths 0..=3
/// already capture the bulk of discussion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoreCommentsPolicy {
    Skip,
    Limit(u32),
    All,
}

impl Default for MoreCommentsPolicy {
    fn default() -> Self {
        MoreCommentsPolicy::Skip
    }
}

fn default_posts_limit() -> usize {
    1000
}
fn default_interval() -> u64 {
    300
}
fn default_rotation_delay() -> u64 {
    2
}
fn default_comment_batch() -> usize {
    20
}
fn default_max_depth() -> u32 {
    3
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_factor() -> u64 {
    2
}
fn default_sorting_methods() -> Vec<SortOrder> {
    vec![SortOrder::New, SortOrder::Top, SortOrder::Rising]
}
fn default_top_filter() -> TimeFilter {
    TimeFilter::Day
}
fn default_initial_top_filter() -> TimeFilter {
    TimeFilter::Month
}
fn default_metadata_refresh() -> u64 {
    86_400
}
fn default_true() -> bool {
    true
}

/// Per-scraper tuning knobs, stored on the scraper record and overridable
/// per field from the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScraperConfig {
    #[serde(default = "default_posts_limit")]
    pub posts_limit: usize,
    /// Per-sort overrides of `posts_limit`.
    #[serde(default)]
    pub sort_limits: HashMap<SortOrder, usize>,
    #[serde(default = "default_sorting_methods")]
    pub sorting_methods: Vec<SortOrder>,
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,
    #[serde(default = "default_rotation_delay")]
    pub rotation_delay_seconds: u64,
    #[serde(default = "default_comment_batch")]
    pub comment_batch: usize,
    /// Inclusive depth cap: levels 0..=max_comment_depth are retained.
    #[serde(default = "default_max_depth")]
    pub max_comment_depth: u32,
    #[serde(default)]
    pub more_comments: MoreCommentsPolicy,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_factor")]
    pub retry_backoff_factor: u64,
    #[serde(default = "default_top_filter")]
    pub top_time_filter: TimeFilter,
    #[serde(default = "default_initial_top_filter")]
    pub initial_top_time_filter: TimeFilter,
    #[serde(default = "default_top_filter")]
    pub controversial_time_filter: TimeFilter,
    #[serde(default = "default_true")]
    pub verify_before_marking: bool,
    #[serde(default = "default_metadata_refresh")]
    pub metadata_refresh_interval_seconds: u64,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            posts_limit: default_posts_limit(),
            sort_limits: HashMap::new(),
            sorting_methods: default_sorting_methods(),
            interval_seconds: default_interval(),
            rotation_delay_seconds: default_rotation_delay(),
            comment_batch: default_comment_batch(),
            max_comment_depth: default_max_depth(),
            more_comments: MoreCommentsPolicy::default(),
            max_retries: default_max_retries(),
            retry_backoff_factor: default_backoff_factor(),
            top_time_filter: default_top_filter(),
            initial_top_time_filter: default_initial_top_filter(),
            controversial_time_filter: default_top_filter(),
            verify_before_marking: true,
            metadata_refresh_interval_seconds: default_metadata_refresh(),
        }
    }
}

impl ScraperConfig {
    pub fn limit_for(&self, sort: SortOrder) -> usize {
        self.sort_limits.get(&sort).copied().unwrap_or(self.posts_limit)
    }
}

/// Rolling per-scraper statistics, updated once per cycle and displayed by
/// the control plane without touching raw data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScraperMetrics {
    pub total_posts_collected: u64,
    pub total_comments_collected: u64,
    pub total_cycles: u64,
    pub posts_per_hour: f64,
    pub comments_per_hour: f64,
    pub avg_cycle_duration: f64,
    pub last_cycle_posts: u64,
    pub last_cycle_comments: u64,
    pub last_cycle_duration: f64,
    pub last_cycle_time: Option<DateTime<Utc>>,
}

impl ScraperMetrics {
    /// Fold one finished cycle into the rolling stats. Rates are measured
    /// over the scraper's lifetime starting at `created_at`.
    pub fn record_cycle(
        &mut self,
        posts_delta: u64,
        comments_delta: u64,
        duration_seconds: f64,
        created_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        self.total_posts_collected += posts_delta;
        self.total_comments_collected += comments_delta;
        let prev_cycles = self.total_cycles;
        self.total_cycles += 1;

        let runtime_hours = (now - created_at).num_seconds().max(0) as f64 / 3600.0;
        if runtime_hours > 0.0 {
            self.posts_per_hour = self.total_posts_collected as f64 / runtime_hours;
            self.comments_per_hour = self.total_comments_collected as f64 / runtime_hours;
        }

        self.avg_cycle_duration = (self.avg_cycle_duration * prev_cycles as f64
            + duration_seconds)
            / self.total_cycles as f64;
        self.last_cycle_posts = posts_delta;
        self.last_cycle_comments = comments_delta;
        self.last_cycle_duration = duration_seconds;
        self.last_cycle_time = Some(now);
    }
}

/// Durable record describing one tenant: its target communities, pending
/// priority set, config, credentials and runtime state.
///
/// Ownership: the supervisor writes `status`, `container_id`,
/// `container_name` and `restart_count`; the queue mutation API edits
/// `subreddits` and adds to `pending_scrape`; the worker removes from
/// `pending_scrape` and updates `status` and `metrics`. These edits commute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScraperRecord {
    /// The primary subreddit; also the scraper id. Always present in
    /// `subreddits`.
    pub id: String,
    pub subreddits: Vec<String>,
    pub pending_scrape: BTreeSet<String>,
    pub scraper_type: ScraperType,
    pub config: ScraperConfig,
    pub credentials: SealedCredentials,
    /// Set when the credentials came from a saved account.
    pub account_name: Option<String>,
    pub status: ScraperStatus,
    pub auto_restart: bool,
    pub restart_count: u32,
    pub container_id: Option<String>,
    pub container_name: Option<String>,
    pub last_error: Option<String>,
    pub metrics: ScraperMetrics,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl ScraperRecord {
    pub fn new(
        primary: impl Into<String>,
        scraper_type: ScraperType,
        config: ScraperConfig,
        credentials: SealedCredentials,
    ) -> Self {
        let primary = primary.into().to_lowercase();
        let now = Utc::now();
        Self {
            id: primary.clone(),
            subreddits: vec![primary],
            pending_scrape: BTreeSet::new(),
            scraper_type,
            config,
            credentials,
            account_name: None,
            status: ScraperStatus::Configured,
            auto_restart: true,
            restart_count: 0,
            container_id: None,
            container_name: None,
            last_error: None,
            metrics: ScraperMetrics::default(),
            created_at: now,
            last_updated: now,
        }
    }

    /// The processing order for one rotation cycle: pending subreddits
    /// first (in set order), then the remainder in list order.
    pub fn cycle_list(&self) -> Vec<String> {
        let mut out: Vec<String> = self.pending_scrape.iter().cloned().collect();
        out.extend(
            self.subreddits
                .iter()
                .filter(|s| !self.pending_scrape.contains(*s))
                .cloned(),
        );
        out
    }
}
