//! Cost aggregation over stored usage rows. Pure reductions; the shape of
//! this report is the one part of the operator API treated as stable.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use redharvest_core::common::error::Result;
use redharvest_core::domain::UsageRecord;
use redharvest_core::storage::Storage;
use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
pub struct SubredditCost {
    pub requests: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CostReport {
    pub requests_today: u64,
    pub cost_today_usd: f64,
    pub requests_last_hour: u64,
    pub cost_last_hour_usd: f64,
    pub avg_daily_cost_usd: f64,
    pub projected_monthly_cost_usd: f64,
    pub by_subreddit: HashMap<String, SubredditCost>,
}

fn sum(rows: &[&UsageRecord]) -> (u64, f64) {
    rows.iter().fold((0, 0.0), |(req, cost), row| {
        (req + row.actual_http_requests, cost + row.estimated_cost_usd)
    })
}

/// Build the report from the last seven days of usage rows.
pub fn build_report(rows: &[UsageRecord], now: DateTime<Utc>) -> CostReport {
    let today_start = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .unwrap_or(now);
    let hour_ago = now - Duration::hours(1);
    let week_ago = now - Duration::days(7);

    let today: Vec<&UsageRecord> = rows.iter().filter(|r| r.timestamp >= today_start).collect();
    let last_hour: Vec<&UsageRecord> = rows.iter().filter(|r| r.timestamp >= hour_ago).collect();
    let week: Vec<&UsageRecord> = rows.iter().filter(|r| r.timestamp >= week_ago).collect();

    let (requests_today, cost_today_usd) = sum(&today);
    let (requests_last_hour, cost_last_hour_usd) = sum(&last_hour);
    let (_, week_cost) = sum(&week);
    let avg_daily_cost_usd = week_cost / 7.0;

    let mut by_subreddit: HashMap<String, SubredditCost> = HashMap::new();
    for row in &today {
        let entry = by_subreddit.entry(row.subreddit.clone()).or_default();
        entry.requests += row.actual_http_requests;
        entry.cost_usd += row.estimated_cost_usd;
    }

    CostReport {
        requests_today,
        cost_today_usd,
        requests_last_hour,
        cost_last_hour_usd,
        avg_daily_cost_usd,
        projected_monthly_cost_usd: avg_daily_cost_usd * 30.0,
        by_subreddit,
    }
}

pub async fn report(storage: &Arc<dyn Storage>) -> Result<CostReport> {
    let now = Utc::now();
    let rows = storage.usage_since(now - Duration::days(7)).await?;
    Ok(build_report(&rows, now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use redharvest_core::domain::ScraperType;
    use uuid::Uuid;

    fn row(subreddit: &str, requests: u64, age: Duration, now: DateTime<Utc>) -> UsageRecord {
        UsageRecord {
            id: Uuid::new_v4(),
            subreddit: subreddit.to_string(),
            scraper_type: ScraperType::Posts,
            timestamp: now - age,
            actual_http_requests: requests,
            estimated_cost_usd: requests as f64 * 0.24 / 1000.0,
            cycle_duration_seconds: 30.0,
            rate_limit: None,
        }
    }

    #[test]
    fn aggregates_windows_and_projection() {
        // Noon, so same-day rows stay inside the today window.
        let now = DateTime::parse_from_rfc3339("2026-03-10T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let rows = vec![
            row("rust", 156, Duration::minutes(30), now),
            row("golang", 44, Duration::hours(3), now),
            row("rust", 1000, Duration::days(3), now),
        ];

        let report = build_report(&rows, now);
        assert_eq!(report.requests_today, 200);
        assert!((report.cost_today_usd - 0.048).abs() < 1e-9);
        assert_eq!(report.requests_last_hour, 156);
        assert!((report.cost_last_hour_usd - 0.03744).abs() < 1e-9);

        // Week total is 1200 requests = $0.288; daily average and the
        // 30-day projection follow.
        assert!((report.avg_daily_cost_usd - 0.288 / 7.0).abs() < 1e-9);
        assert!((report.projected_monthly_cost_usd - 0.288 / 7.0 * 30.0).abs() < 1e-9);

        assert_eq!(report.by_subreddit["rust"].requests, 156);
        assert_eq!(report.by_subreddit["golang"].requests, 44);
    }

    #[test]
    fn empty_usage_reports_zero() {
        let report = build_report(&[], Utc::now());
        assert_eq!(report.requests_today, 0);
        assert_eq!(report.cost_today_usd, 0.0);
        assert!(report.by_subreddit.is_empty());
    }
}
