//! Buffered usage accounting.
//!
//! The counting transport accumulates per-subreddit request counts; this
//! recorder turns them into durable usage rows, one per
//! `(subreddit, scraper_type)` pair per flush, with the current rate-limit
//! snapshot attached.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use redharvest_core::common::error::Result;
use redharvest_core::config::USAGE_FLUSH_INTERVAL;
use redharvest_core::domain::{RateLimitSnapshot, ScraperType, UsageRecord};
use redharvest_core::storage::Storage;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::reddit::transport::{estimated_cost, CycleStats};

pub struct UsageRecorder {
    storage: Arc<dyn Storage>,
    scraper_type: ScraperType,
    last_flush: Mutex<Instant>,
}

impl UsageRecorder {
    pub fn new(storage: Arc<dyn Storage>, scraper_type: ScraperType) -> Self {
        Self {
            storage,
            scraper_type,
            last_flush: Mutex::new(Instant::now()),
        }
    }

    /// Whether the flush interval has elapsed since the last write.
    pub fn due(&self) -> bool {
        self.last_flush
            .lock()
            .expect("usage lock poisoned")
            .elapsed()
            >= USAGE_FLUSH_INTERVAL
    }

    /// Write one usage row per subreddit seen since the last reset.
    /// No-ops when nothing was requested.
    pub async fn flush(
        &self,
        stats: CycleStats,
        rate_limit: Option<RateLimitSnapshot>,
        cycle_duration_seconds: f64,
    ) -> Result<()> {
        *self.last_flush.lock().expect("usage lock poisoned") = Instant::now();
        if stats.total_requests == 0 {
            return Ok(());
        }

        let now = Utc::now();
        let rows: Vec<UsageRecord> = stats
            .requests_by_subreddit
            .into_iter()
            .map(|(subreddit, requests)| UsageRecord {
                id: Uuid::new_v4(),
                subreddit,
                scraper_type: self.scraper_type,
                timestamp: now,
                actual_http_requests: requests,
                estimated_cost_usd: estimated_cost(requests),
                cycle_duration_seconds,
                rate_limit,
            })
            .collect();

        debug!(
            rows = rows.len(),
            requests = stats.total_requests,
            cost_usd = stats.cost_usd,
            "flushing usage"
        );
        self.storage.append_usage(rows).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use redharvest_core::storage::MemoryStore;
    use std::collections::HashMap;

    #[tokio::test]
    async fn flush_writes_one_row_per_subreddit_with_cost() {
        let storage = Arc::new(MemoryStore::new());
        let recorder = UsageRecorder::new(storage.clone(), ScraperType::Posts);

        let mut by_sub = HashMap::new();
        by_sub.insert("examplesub".to_string(), 156u64);
        by_sub.insert("othersub".to_string(), 10u64);
        let stats = CycleStats {
            total_requests: 166,
            cost_usd: estimated_cost(166),
            requests_by_subreddit: by_sub,
        };
        let snapshot = RateLimitSnapshot {
            remaining: 80.0,
            used: 20,
            reset_in_seconds: 300,
        };
        recorder.flush(stats, Some(snapshot), 42.5).await.unwrap();

        let rows = storage
            .usage_since(Utc::now() - Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        let example = rows
            .iter()
            .find(|r| r.subreddit == "examplesub")
            .expect("row for examplesub");
        assert_eq!(example.actual_http_requests, 156);
        assert!((example.estimated_cost_usd - 0.03744).abs() < 1e-6);
        assert_eq!(example.cycle_duration_seconds, 42.5);
        assert_eq!(example.rate_limit.unwrap().used, 20);
    }

    #[tokio::test]
    async fn empty_cycle_writes_nothing() {
        let storage = Arc::new(MemoryStore::new());
        let recorder = UsageRecorder::new(storage.clone(), ScraperType::Comments);
        recorder.flush(CycleStats::default(), None, 1.0).await.unwrap();
        let rows = storage
            .usage_since(Utc::now() - Duration::minutes(1))
            .await
            .unwrap();
        assert!(rows.is_empty());
    }
}
