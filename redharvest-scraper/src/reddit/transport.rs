//! Transport-layer request counting.
//!
//! Every outbound HTTP call the scraper makes goes through
//! [`CountingTransport`]: listing pages, comment trees, morechildren
//! expansions, token refreshes and failed attempts alike. A high-level
//! "fetch the posts" operation expands to ceil(limit/100) paginated calls,
//! so counting anywhere above this layer undercounts the bill by 2-5x.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use redharvest_core::common::error::{HarvestError, Result};
use redharvest_core::config::COST_PER_1000_REQUESTS;
use redharvest_core::domain::ScraperType;
use reqwest::Response;
use tracing::{debug, warn};

use crate::observability::metrics;

use super::rate_limit::RateLimitOracle;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

pub fn estimated_cost(requests: u64) -> f64 {
    requests as f64 * COST_PER_1000_REQUESTS / 1000.0
}

#[derive(Default)]
struct Counts {
    cycle_by_subreddit: HashMap<String, u64>,
    cycle_total: u64,
    total: u64,
    errors: u64,
    response_ms_total: f64,
}

/// Per-cycle totals handed to the usage recorder.
#[derive(Debug, Clone, Default)]
pub struct CycleStats {
    pub requests_by_subreddit: HashMap<String, u64>,
    pub total_requests: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub total_requests: u64,
    pub total_cost_usd: f64,
    pub error_count: u64,
    pub avg_response_time_ms: f64,
}

pub struct CountingTransport {
    client: reqwest::Client,
    oracle: Arc<RateLimitOracle>,
    scraper_type: ScraperType,
    counts: Mutex<Counts>,
}

impl CountingTransport {
    pub fn new(
        oracle: Arc<RateLimitOracle>,
        scraper_type: ScraperType,
        user_agent: &str,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(HTTP_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            oracle,
            scraper_type,
            counts: Mutex::new(Counts::default()),
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Send a request, counting it and feeding rate-limit headers to the
    /// oracle. Non-2xx statuses are classified into the error taxonomy;
    /// the request is billed either way.
    pub async fn execute(
        &self,
        request: reqwest::RequestBuilder,
        subreddit_label: &str,
    ) -> Result<Response> {
        let started = std::time::Instant::now();
        let outcome = request.send().await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        self.note_request(subreddit_label, elapsed_ms);
        metrics::transport::request(subreddit_label, self.scraper_type.as_str());
        metrics::transport::response_time(elapsed_ms);

        let response = match outcome {
            Ok(r) => r,
            Err(e) => {
                self.note_error();
                metrics::transport::request_error(subreddit_label);
                return Err(HarvestError::Http(e));
            }
        };

        self.observe_rate_limit(&response);

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        self.note_error();
        metrics::transport::request_error(subreddit_label);
        let code = status.as_u16();
        let url = response.url().path().to_string();
        warn!(status = code, url = %url, "reddit request failed");
        match code {
            401 | 403 => Err(HarvestError::Auth {
                status: code,
                message: url,
            }),
            404 => Err(HarvestError::NotFound(url)),
            429 => Err(HarvestError::RateLimited),
            _ => Err(HarvestError::Api {
                status: code,
                message: url,
            }),
        }
    }

    fn observe_rate_limit(&self, response: &Response) {
        let header_f64 = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<f64>().ok())
        };
        if let (Some(remaining), Some(used), Some(reset)) = (
            header_f64("x-ratelimit-remaining"),
            header_f64("x-ratelimit-used"),
            header_f64("x-ratelimit-reset"),
        ) {
            self.oracle.observe(remaining, used as u64, reset as u64);
        } else {
            debug!("response carried no rate-limit headers");
        }
    }

    fn note_request(&self, subreddit: &str, elapsed_ms: f64) {
        let mut counts = self.counts.lock().expect("transport lock poisoned");
        *counts
            .cycle_by_subreddit
            .entry(subreddit.to_string())
            .or_default() += 1;
        counts.cycle_total += 1;
        counts.total += 1;
        counts.response_ms_total += elapsed_ms;
    }

    fn note_error(&self) {
        let mut counts = self.counts.lock().expect("transport lock poisoned");
        counts.errors += 1;
    }

    /// Per-cycle totals without resetting.
    pub fn cycle_stats(&self) -> CycleStats {
        let counts = self.counts.lock().expect("transport lock poisoned");
        CycleStats {
            requests_by_subreddit: counts.cycle_by_subreddit.clone(),
            total_requests: counts.cycle_total,
            cost_usd: estimated_cost(counts.cycle_total),
        }
    }

    /// Return the cycle totals and reset them. Called once per flush.
    pub fn reset_cycle(&self) -> CycleStats {
        let mut counts = self.counts.lock().expect("transport lock poisoned");
        let stats = CycleStats {
            requests_by_subreddit: std::mem::take(&mut counts.cycle_by_subreddit),
            total_requests: counts.cycle_total,
            cost_usd: estimated_cost(counts.cycle_total),
        };
        counts.cycle_total = 0;
        stats
    }

    pub fn total_stats(&self) -> TransportStats {
        let counts = self.counts.lock().expect("transport lock poisoned");
        TransportStats {
            total_requests: counts.total,
            total_cost_usd: estimated_cost(counts.total),
            error_count: counts.errors,
            avg_response_time_ms: if counts.total > 0 {
                counts.response_ms_total / counts.total as f64
            } else {
                0.0
            },
        }
    }
}
