//! Fleet-wide constants. Per-scraper knobs live on
//! [`crate::domain::ScraperConfig`].

use std::time::Duration;

/// Minimum remaining quota before a worker sleeps until the window resets.
pub const RATE_LIMIT_THRESHOLD: f64 = 50.0;

/// Safety margin added on top of Reddit's advertised reset time.
pub const RATE_LIMIT_RESET_GUARD: Duration = Duration::from_secs(5);

/// Reddit API pricing: $0.24 per 1,000 HTTP requests, billed per request.
pub const COST_PER_1000_REQUESTS: f64 = 0.24;

/// How often buffered usage counts are written to the store.
pub const USAGE_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// Pause between posts in the comment loop.
pub const POLITENESS_DELAY: Duration = Duration::from_secs(2);

/// Idle period when a scraper's subreddit queue is empty.
pub const EMPTY_QUEUE_IDLE: Duration = Duration::from_secs(60);

/// Supervisor liveness poll cadence.
pub const LIVENESS_INTERVAL: Duration = Duration::from_secs(30);

/// Minimum time a scraper stays down before an auto-restart.
pub const RESTART_COOLDOWN: Duration = Duration::from_secs(30);

/// Extra delay before re-spawning a child detected as dead.
pub const RESTART_DELAY: Duration = Duration::from_secs(5);

/// Restart ceiling: at most this many restarts within [`RESTART_WINDOW`].
pub const MAX_RESTARTS_PER_WINDOW: usize = 5;
pub const RESTART_WINDOW: Duration = Duration::from_secs(600);

/// Hard cap on the subreddit list of a single scraper.
pub const MAX_SUBREDDITS: usize = 100;

/// Grace period between a stop request and a forced kill.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
