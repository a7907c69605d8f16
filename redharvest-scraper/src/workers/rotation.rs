//! The rotation skeleton shared by both worker variants.
//!
//! One cycle walks the scraper's subreddit list, pending entries first.
//! The record is re-loaded before every subreddit so queue mutations from
//! the control plane take effect within one rotation step; a subreddit
//! added mid-cycle is typically reached 30-60s after the mutation commits.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use redharvest_core::common::error::{HarvestError, Result};
use redharvest_core::config::EMPTY_QUEUE_IDLE;
use redharvest_core::domain::{ScraperRecord, ScraperStatus};
use redharvest_core::storage::Storage;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::observability::metrics;
use crate::reddit::rate_limit::RateLimitOracle;
use crate::reddit::transport::CountingTransport;
use crate::shutdown::Shutdown;
use crate::usage::UsageRecorder;

use super::{SubredditAction, SubredditOutcome};

pub struct Rotation {
    storage: Arc<dyn Storage>,
    oracle: Arc<RateLimitOracle>,
    transport: Arc<CountingTransport>,
    recorder: UsageRecorder,
    scraper_id: String,
    shutdown: Shutdown,
    cycle_count: u64,
}

/// Why a cycle ended.
#[derive(Debug, PartialEq, Eq)]
pub enum CycleEnd {
    Completed,
    EmptyQueue,
    Cancelled,
    Stopped,
}

impl Rotation {
    pub fn new(
        storage: Arc<dyn Storage>,
        oracle: Arc<RateLimitOracle>,
        transport: Arc<CountingTransport>,
        recorder: UsageRecorder,
        scraper_id: impl Into<String>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            storage,
            oracle,
            transport,
            recorder,
            scraper_id: scraper_id.into(),
            shutdown,
            cycle_count: 0,
        }
    }

    async fn load(&self) -> Result<ScraperRecord> {
        self.storage
            .load_scraper(&self.scraper_id)
            .await?
            .ok_or_else(|| HarvestError::ScraperNotFound(self.scraper_id.clone()))
    }

    /// Run rotation cycles until shutdown or a stop written to the record.
    /// Fatal errors (auth failures, unreachable store) propagate so the
    /// process exits and the supervisor can decide on a restart.
    pub async fn run(&mut self, action: &dyn SubredditAction) -> Result<()> {
        loop {
            if self.shutdown.is_cancelled() {
                info!("worker cancelled, exiting");
                return Ok(());
            }

            let record = self.load().await?;
            if record.status == ScraperStatus::Stopped {
                info!("stop requested via scraper record, exiting");
                return Ok(());
            }

            let interval = Duration::from_secs(record.config.interval_seconds);
            let started = Instant::now();
            match self.run_cycle(action).await {
                Ok((CycleEnd::Cancelled | CycleEnd::Stopped, _)) => return Ok(()),
                Ok((CycleEnd::EmptyQueue, _)) => {
                    warn!(scraper = %self.scraper_id, "subreddit queue is empty, idling");
                    if !self.shutdown.sleep(EMPTY_QUEUE_IDLE).await {
                        return Ok(());
                    }
                    continue;
                }
                Ok((CycleEnd::Completed, _)) => {}
                Err(e) => {
                    if matches!(e, HarvestError::Auth { .. }) {
                        self.storage
                            .set_scraper_status(
                                &self.scraper_id,
                                ScraperStatus::Failed,
                                Some(e.to_string()),
                            )
                            .await?;
                    }
                    return Err(e);
                }
            }

            let remaining = interval.saturating_sub(started.elapsed());
            if remaining > Duration::ZERO {
                info!(
                    sleep_secs = remaining.as_secs(),
                    "cycle complete, waiting for next"
                );
                if !self.shutdown.sleep(remaining).await {
                    return Ok(());
                }
            }
        }
    }

    /// One pass over the subreddit list. Public so `--single-run` and the
    /// tests can drive exactly one cycle.
    pub async fn run_cycle(
        &mut self,
        action: &dyn SubredditAction,
    ) -> Result<(CycleEnd, SubredditOutcome)> {
        self.cycle_count += 1;
        let cycle_started = Instant::now();
        let mut processed: HashSet<String> = HashSet::new();
        let mut totals = SubredditOutcome::default();
        info!(cycle = self.cycle_count, scraper = %self.scraper_id, "cycle starting");

        let end = loop {
            if self.shutdown.is_cancelled() {
                break CycleEnd::Cancelled;
            }

            // Reload so queue mutations land inside the running cycle.
            let record = self.load().await?;
            if record.status == ScraperStatus::Stopped {
                break CycleEnd::Stopped;
            }
            if record.subreddits.is_empty() {
                break CycleEnd::EmptyQueue;
            }

            let Some(subreddit) = record
                .cycle_list()
                .into_iter()
                .find(|s| !processed.contains(s))
            else {
                break CycleEnd::Completed;
            };
            let was_pending = record.pending_scrape.contains(&subreddit);

            self.oracle.await_capacity().await;
            match action.run_one(&record, &subreddit).await {
                Ok(outcome) => {
                    totals.absorb(outcome);
                    if was_pending {
                        self.storage
                            .mark_subreddit_scraped(&self.scraper_id, &subreddit)
                            .await?;
                    }
                }
                Err(e @ HarvestError::Auth { .. }) => return Err(e),
                Err(e) => {
                    // One bad subreddit must not abort the cycle.
                    error!(subreddit = %subreddit, "subreddit pass failed: {e}");
                    metrics::workers::scrape_error(&subreddit, "subreddit_pass");
                }
            }
            processed.insert(subreddit);

            if self.recorder.due() {
                self.recorder
                    .flush(
                        self.transport.reset_cycle(),
                        self.oracle.snapshot(),
                        cycle_started.elapsed().as_secs_f64(),
                    )
                    .await?;
            }

            let record_delay = Duration::from_secs(record.config.rotation_delay_seconds);
            if !self.shutdown.sleep(record_delay).await {
                break CycleEnd::Cancelled;
            }
        };

        let duration = cycle_started.elapsed().as_secs_f64();
        if !processed.is_empty() {
            let posts_delta = totals.new_posts;
            self.storage
                .record_cycle(&self.scraper_id, posts_delta, totals.new_comments, duration)
                .await?;
            self.recorder
                .flush(self.transport.reset_cycle(), self.oracle.snapshot(), duration)
                .await?;
            metrics::workers::cycle_completed(action.scraper_type().as_str(), &self.scraper_id);
            metrics::workers::cycle_duration(action.scraper_type().as_str(), duration);
            info!(
                cycle = self.cycle_count,
                subreddits = processed.len(),
                new_posts = totals.new_posts,
                new_comments = totals.new_comments,
                duration_secs = duration,
                "cycle summary"
            );
        }
        Ok((end, totals))
    }
}
