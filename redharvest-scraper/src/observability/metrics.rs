//! Worker metrics on the `metrics` facade, exported through the Prometheus
//! recorder installed at startup. Names follow the
//! `redharvest_<phase>_<what>` convention.

use tracing::info;

/// Install the Prometheus recorder. Safe to call once per process; a
/// second call (e.g. in tests) is ignored.
pub fn init() {
    match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
        Ok(_) => info!("metrics recorder installed"),
        Err(e) => info!("metrics recorder not installed: {e}"),
    }
}

pub mod transport {
    pub fn request(subreddit: &str, scraper_type: &str) {
        ::metrics::counter!(
            "redharvest_http_requests_total",
            "subreddit" => subreddit.to_string(),
            "scraper_type" => scraper_type.to_string()
        )
        .increment(1);
    }

    pub fn request_error(subreddit: &str) {
        ::metrics::counter!(
            "redharvest_http_request_errors_total",
            "subreddit" => subreddit.to_string()
        )
        .increment(1);
    }

    pub fn response_time(ms: f64) {
        ::metrics::histogram!("redharvest_http_response_time_ms").record(ms);
    }
}

pub mod workers {
    pub fn cycle_completed(scraper_type: &str, subreddit: &str) {
        ::metrics::counter!(
            "redharvest_cycles_total",
            "scraper_type" => scraper_type.to_string(),
            "subreddit" => subreddit.to_string()
        )
        .increment(1);
    }

    pub fn cycle_duration(scraper_type: &str, secs: f64) {
        ::metrics::histogram!(
            "redharvest_cycle_duration_seconds",
            "scraper_type" => scraper_type.to_string()
        )
        .record(secs);
    }

    pub fn posts_scraped(subreddit: &str, count: u64) {
        ::metrics::counter!(
            "redharvest_posts_scraped_total",
            "subreddit" => subreddit.to_string()
        )
        .increment(count);
    }

    pub fn comments_scraped(subreddit: &str, count: u64) {
        ::metrics::counter!(
            "redharvest_comments_scraped_total",
            "subreddit" => subreddit.to_string()
        )
        .increment(count);
    }

    pub fn scrape_error(subreddit: &str, kind: &str) {
        ::metrics::counter!(
            "redharvest_scrape_errors_total",
            "subreddit" => subreddit.to_string(),
            "error_type" => kind.to_string()
        )
        .increment(1);
    }

    pub fn verification_failure(subreddit: &str) {
        ::metrics::counter!(
            "redharvest_verification_failures_total",
            "subreddit" => subreddit.to_string()
        )
        .increment(1);
    }

    pub fn rate_limit_wait(secs: f64) {
        ::metrics::histogram!("redharvest_rate_limit_wait_seconds").record(secs);
    }
}
