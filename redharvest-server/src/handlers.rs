//! Control-plane HTTP handlers.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use redharvest_core::common::error::HarvestError;
use redharvest_core::domain::queue::QueueDiff;
use redharvest_core::domain::{
    Account, RedditCredentials, ScraperConfig, ScraperMetrics, ScraperRecord, ScraperStatus,
    ScraperType,
};
use redharvest_core::security::seal_credentials;

use crate::cost;
use crate::state::AppState;

const MASKED: &str = "***";

pub enum ApiError {
    Harvest(HarvestError),
    BadRequest(String),
    Conflict(String),
    NotFound(String),
}

impl From<HarvestError> for ApiError {
    fn from(e: HarvestError) -> Self {
        ApiError::Harvest(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Harvest(HarvestError::InvalidQueue(msg)) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Harvest(HarvestError::ScraperNotFound(id)) => {
                (StatusCode::NOT_FOUND, format!("scraper '{id}' not found"))
            }
            ApiError::Harvest(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Scraper record as shown to operators: secrets masked, username kept
/// for identification.
#[derive(Serialize)]
pub struct ScraperView {
    pub id: String,
    pub subreddits: Vec<String>,
    pub pending_scrape: Vec<String>,
    pub scraper_type: ScraperType,
    pub status: ScraperStatus,
    pub auto_restart: bool,
    pub restart_count: u32,
    pub container_id: Option<String>,
    pub container_name: Option<String>,
    pub last_error: Option<String>,
    pub username: String,
    pub account_name: Option<String>,
    pub client_id: &'static str,
    pub config: ScraperConfig,
    pub metrics: ScraperMetrics,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl From<ScraperRecord> for ScraperView {
    fn from(r: ScraperRecord) -> Self {
        Self {
            id: r.id,
            subreddits: r.subreddits,
            pending_scrape: r.pending_scrape.into_iter().collect(),
            scraper_type: r.scraper_type,
            status: r.status,
            auto_restart: r.auto_restart,
            restart_count: r.restart_count,
            container_id: r.container_id,
            container_name: r.container_name,
            last_error: r.last_error,
            username: r.credentials.username,
            account_name: r.account_name,
            client_id: MASKED,
            config: r.config,
            metrics: r.metrics,
            created_at: r.created_at,
            last_updated: r.last_updated,
        }
    }
}

#[derive(Deserialize)]
pub struct StartScraperRequest {
    /// Single-subreddit form; `subreddits` wins when both are present.
    pub subreddit: Option<String>,
    pub subreddits: Option<Vec<String>>,
    pub scraper_type: Option<ScraperType>,
    pub config: Option<ScraperConfig>,
    pub auto_restart: Option<bool>,

    /// Either a saved account name or inline credentials.
    pub saved_account_name: Option<String>,
    pub credentials: Option<RedditCredentials>,
    /// When set alongside inline credentials, saves them under this name.
    pub save_account_as: Option<String>,
}

#[derive(Deserialize)]
pub struct SubredditsBody {
    pub subreddits: Vec<String>,
}

#[derive(Deserialize)]
pub struct AutoRestartBody {
    pub auto_restart: bool,
}

#[derive(Deserialize)]
pub struct LogsQuery {
    pub lines: Option<usize>,
}

#[derive(Deserialize)]
pub struct AccountBody {
    pub account_name: String,
    pub credentials: RedditCredentials,
}

fn diff_response(diff: QueueDiff, record: &ScraperRecord) -> Json<serde_json::Value> {
    Json(json!({
        "added": diff.added,
        "removed": diff.removed,
        "subreddits": record.subreddits,
        "pending_scrape": record.pending_scrape,
    }))
}

// ---- scraper lifecycle ----

pub async fn start_scraper(
    State(state): State<AppState>,
    Json(request): Json<StartScraperRequest>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let subreddits: Vec<String> = request
        .subreddits
        .or_else(|| request.subreddit.map(|s| vec![s]))
        .unwrap_or_default()
        .into_iter()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect();
    let Some(primary) = subreddits.first().cloned() else {
        return Err(ApiError::BadRequest(
            "at least one subreddit is required".into(),
        ));
    };

    if state.storage.load_scraper(&primary).await?.is_some() {
        return Err(ApiError::Conflict(format!(
            "scraper '{primary}' already exists"
        )));
    }

    let sealed = if let Some(account_name) = &request.saved_account_name {
        state
            .storage
            .load_account(account_name)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("account '{account_name}' not found")))?
            .credentials
    } else if let Some(creds) = &request.credentials {
        let sealed = seal_credentials(&state.sealer, creds);
        if let Some(name) = &request.save_account_as {
            let now = Utc::now();
            state
                .storage
                .save_account(Account {
                    account_name: name.clone(),
                    credentials: sealed.clone(),
                    created_at: now,
                    last_updated: now,
                })
                .await?;
            info!(account = %name, "saved credentials from start request");
        }
        sealed
    } else {
        return Err(ApiError::BadRequest(
            "either credentials or saved_account_name is required".into(),
        ));
    };

    let mut record = ScraperRecord::new(
        primary.clone(),
        request.scraper_type.unwrap_or(ScraperType::Posts),
        request.config.unwrap_or_default(),
        sealed,
    );
    record.account_name = request.saved_account_name.clone();
    record.auto_restart = request.auto_restart.unwrap_or(true);
    if subreddits.len() > 1 {
        redharvest_core::domain::queue::add(&mut record, &subreddits[1..])?;
    }

    state.storage.save_scraper(record.clone()).await?;
    state.supervisor.start(&record).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": format!("scraper for r/{primary} started"),
            "scraper_id": primary,
            "subreddits": record.subreddits,
        })),
    ))
}

pub async fn stop_scraper(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    require_scraper(&state, &id).await?;
    state.supervisor.stop(&id).await?;
    Ok(Json(json!({ "message": format!("scraper '{id}' stopped") })))
}

pub async fn restart_scraper(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    require_scraper(&state, &id).await?;
    state.supervisor.restart(&id).await?;
    Ok(Json(json!({ "message": format!("scraper '{id}' restarted") })))
}

pub async fn delete_scraper(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    require_scraper(&state, &id).await?;
    state.supervisor.stop(&id).await?;
    state.storage.delete_scraper(&id).await?;
    Ok(Json(json!({ "message": format!("scraper '{id}' removed") })))
}

pub async fn set_auto_restart(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AutoRestartBody>,
) -> ApiResult<Json<serde_json::Value>> {
    state.storage.set_auto_restart(&id, body.auto_restart).await?;
    Ok(Json(json!({
        "scraper_id": id,
        "auto_restart": body.auto_restart,
    })))
}

pub async fn restart_all_failed(
    State(state): State<AppState>,
) -> ApiResult<Json<serde_json::Value>> {
    let mut restarted = Vec::new();
    let mut failed = Vec::new();
    for record in state.storage.list_scrapers().await? {
        if record.status != ScraperStatus::Failed {
            continue;
        }
        match state.supervisor.restart(&record.id).await {
            Ok(()) => restarted.push(record.id),
            Err(e) => failed.push(json!({ "scraper_id": record.id, "error": e.to_string() })),
        }
    }
    Ok(Json(json!({ "restarted": restarted, "failed": failed })))
}

// ---- queue mutation ----

pub async fn add_subreddits(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SubredditsBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let diff = state.storage.add_subreddits(&id, &body.subreddits).await?;
    let record = require_scraper(&state, &id).await?;
    info!(scraper = %id, added = diff.added.len(), "queue add");
    Ok(diff_response(diff, &record))
}

pub async fn remove_subreddits(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SubredditsBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let diff = state
        .storage
        .remove_subreddits(&id, &body.subreddits)
        .await?;
    let record = require_scraper(&state, &id).await?;
    info!(scraper = %id, removed = diff.removed.len(), "queue remove");
    Ok(diff_response(diff, &record))
}

pub async fn replace_subreddits(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SubredditsBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let diff = state
        .storage
        .replace_subreddits(&id, &body.subreddits)
        .await?;
    let record = require_scraper(&state, &id).await?;
    info!(
        scraper = %id,
        added = diff.added.len(),
        removed = diff.removed.len(),
        "queue replace"
    );
    Ok(diff_response(diff, &record))
}

// ---- observability ----

async fn require_scraper(state: &AppState, id: &str) -> Result<ScraperRecord, ApiError> {
    state
        .storage
        .load_scraper(id)
        .await?
        .ok_or_else(|| ApiError::Harvest(HarvestError::ScraperNotFound(id.to_string())))
}

pub async fn list_scrapers(State(state): State<AppState>) -> ApiResult<Json<Vec<ScraperView>>> {
    let records = state.storage.list_scrapers().await?;
    Ok(Json(records.into_iter().map(ScraperView::from).collect()))
}

pub async fn scraper_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ScraperView>> {
    Ok(Json(require_scraper(&state, &id).await?.into()))
}

pub async fn scraper_stats(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let record = require_scraper(&state, &id).await?;
    let mut per_subreddit = Vec::new();
    let mut total_posts = 0;
    let mut total_comments = 0;
    for subreddit in &record.subreddits {
        let posts = state.storage.posts_count(subreddit).await?;
        let comments = state.storage.comments_count(subreddit).await?;
        total_posts += posts;
        total_comments += comments;
        per_subreddit.push(json!({
            "subreddit": subreddit,
            "posts": posts,
            "comments": comments,
        }));
    }
    let unresolved = state.storage.unresolved_errors(None).await?;
    let unresolved_for_scraper = unresolved
        .iter()
        .filter(|e| record.subreddits.contains(&e.subreddit))
        .count();

    Ok(Json(json!({
        "scraper_id": record.id,
        "total_posts": total_posts,
        "total_comments": total_comments,
        "per_subreddit": per_subreddit,
        "unresolved_errors": unresolved_for_scraper,
        "metrics": record.metrics,
    })))
}

pub async fn scraper_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    require_scraper(&state, &id).await?;
    let lines = query.lines.unwrap_or(100);
    let path = state.supervisor.log_path(&id);
    let content = tokio::fs::read_to_string(&path).await.unwrap_or_default();
    let tail: Vec<&str> = {
        let all: Vec<&str> = content.lines().collect();
        all.iter()
            .skip(all.len().saturating_sub(lines))
            .copied()
            .collect()
    };
    Ok(Json(json!({
        "scraper_id": id,
        "lines": tail,
    })))
}

pub async fn status_summary(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let mut counts: std::collections::HashMap<&'static str, usize> = Default::default();
    let records = state.storage.list_scrapers().await?;
    for record in &records {
        let key = match record.status {
            ScraperStatus::Configured => "configured",
            ScraperStatus::Starting => "starting",
            ScraperStatus::Running => "running",
            ScraperStatus::Stopped => "stopped",
            ScraperStatus::Failed => "failed",
        };
        *counts.entry(key).or_default() += 1;
    }
    Ok(Json(json!({
        "total": records.len(),
        "by_status": counts,
    })))
}

pub async fn usage_cost(State(state): State<AppState>) -> ApiResult<Json<cost::CostReport>> {
    Ok(Json(cost::report(&state.storage).await?))
}

pub async fn health(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let store_ok = state.storage.ping().await.is_ok();
    let children = state.supervisor.running_children().await;
    let uptime = (Utc::now() - state.started_at).num_seconds();
    Ok(Json(json!({
        "status": if store_ok { "ok" } else { "degraded" },
        "store_connected": store_ok,
        "supervised_workers": children,
        "uptime_seconds": uptime,
    })))
}

// ---- accounts ----

fn account_view(account: &Account) -> serde_json::Value {
    json!({
        "account_name": account.account_name,
        "username": account.credentials.username,
        "user_agent": account.credentials.user_agent,
        "client_id": MASKED,
        "created_at": account.created_at,
        "last_updated": account.last_updated,
    })
}

pub async fn list_accounts(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let accounts = state.storage.list_accounts().await?;
    Ok(Json(json!({
        "accounts": accounts.iter().map(account_view).collect::<Vec<_>>(),
    })))
}

pub async fn save_account(
    State(state): State<AppState>,
    Json(body): Json<AccountBody>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let now = Utc::now();
    let existing = state.storage.load_account(&body.account_name).await?;
    let account = Account {
        account_name: body.account_name.clone(),
        credentials: seal_credentials(&state.sealer, &body.credentials),
        created_at: existing.map(|a| a.created_at).unwrap_or(now),
        last_updated: now,
    };
    state.storage.save_account(account.clone()).await?;
    Ok((StatusCode::CREATED, Json(account_view(&account))))
}

pub async fn get_account(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let account = state
        .storage
        .load_account(&name)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("account '{name}' not found")))?;
    let used_by: Vec<String> = state
        .storage
        .list_scrapers()
        .await?
        .into_iter()
        .filter(|r| r.account_name.as_deref() == Some(name.as_str()))
        .map(|r| r.id)
        .collect();
    let mut view = account_view(&account);
    view["used_by"] = json!(used_by);
    Ok(Json(view))
}

pub async fn delete_account(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    if !state.storage.delete_account(&name).await? {
        return Err(ApiError::NotFound(format!("account '{name}' not found")));
    }
    Ok(Json(json!({ "message": format!("account '{name}' deleted") })))
}
