use axum::routing::{delete, get, patch, post, put};
use axum::Router;

use crate::handlers;
use crate::state::AppState;

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/scrapers/start", post(handlers::start_scraper))
        .route("/scrapers", get(handlers::list_scrapers))
        .route("/scrapers/status-summary", get(handlers::status_summary))
        .route(
            "/scrapers/restart-all-failed",
            post(handlers::restart_all_failed),
        )
        .route("/scrapers/{id}/stop", post(handlers::stop_scraper))
        .route("/scrapers/{id}/restart", post(handlers::restart_scraper))
        .route("/scrapers/{id}", delete(handlers::delete_scraper))
        .route("/scrapers/{id}/status", get(handlers::scraper_status))
        .route("/scrapers/{id}/stats", get(handlers::scraper_stats))
        .route("/scrapers/{id}/logs", get(handlers::scraper_logs))
        .route(
            "/scrapers/{id}/auto-restart",
            put(handlers::set_auto_restart),
        )
        .route(
            "/scrapers/{id}/subreddits/add",
            post(handlers::add_subreddits),
        )
        .route(
            "/scrapers/{id}/subreddits/remove",
            post(handlers::remove_subreddits),
        )
        .route(
            "/scrapers/{id}/subreddits",
            patch(handlers::replace_subreddits),
        )
        .route("/api/usage/cost", get(handlers::usage_cost))
        .route(
            "/accounts",
            get(handlers::list_accounts).post(handlers::save_account),
        )
        .route(
            "/accounts/{name}",
            get(handlers::get_account).delete(handlers::delete_account),
        )
        .route("/health", get(handlers::health))
        .with_state(state)
}
