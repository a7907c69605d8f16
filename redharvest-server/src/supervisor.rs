//! Worker process lifecycle.
//!
//! One child process per scraper, launched from the scraper record with
//! that tenant's credentials injected through the environment. The
//! supervisor communicates with running workers only through the persisted
//! record (a stop is written to `status` and honored at the worker's next
//! suspension point) and through OS process control as the fallback.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use chrono::Utc;
use redharvest_core::common::error::{HarvestError, Result};
use redharvest_core::config::{
    LIVENESS_INTERVAL, MAX_RESTARTS_PER_WINDOW, RESTART_COOLDOWN, RESTART_DELAY, RESTART_WINDOW,
    SHUTDOWN_GRACE,
};
use redharvest_core::domain::{ScraperRecord, ScraperStatus, ScraperType};
use redharvest_core::security::{unseal_credentials, Sealer};
use redharvest_core::storage::{Storage, STORE_ENV};
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{error, info, warn};

const CONTAINER_PREFIX: &str = "redharvest-scraper-";

struct ChildHandle {
    child: Child,
    container_name: String,
}

pub struct Supervisor {
    storage: Arc<dyn Storage>,
    sealer: Sealer,
    /// [`STORE_ENV`] value injected into every child so workers open the
    /// same store the control plane writes to.
    store_env: String,
    scraper_bin: PathBuf,
    log_dir: PathBuf,
    children: Mutex<HashMap<String, ChildHandle>>,
    restart_history: StdMutex<HashMap<String, VecDeque<Instant>>>,
}

/// Restart ceiling: at most `max` restarts inside `window`. The history
/// deque is pruned in place.
fn restart_allowed(
    history: &mut VecDeque<Instant>,
    now: Instant,
    window: Duration,
    max: usize,
) -> bool {
    while let Some(oldest) = history.front() {
        if now.duration_since(*oldest) > window {
            history.pop_front();
        } else {
            break;
        }
    }
    if history.len() >= max {
        return false;
    }
    history.push_back(now);
    true
}

impl Supervisor {
    pub fn new(storage: Arc<dyn Storage>, sealer: Sealer, store_env: String) -> Self {
        let scraper_bin = std::env::var("REDHARVEST_SCRAPER_BIN")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("redharvest-scraper"));
        let log_dir = std::env::var("REDHARVEST_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("logs"));
        Self {
            storage,
            sealer,
            store_env,
            scraper_bin,
            log_dir,
            children: Mutex::new(HashMap::new()),
            restart_history: StdMutex::new(HashMap::new()),
        }
    }

    pub fn log_path(&self, scraper_id: &str) -> PathBuf {
        self.log_dir.join(format!("{scraper_id}.log"))
    }

    fn record_restart_allowed(&self, scraper_id: &str) -> bool {
        let mut history = self.restart_history.lock().expect("restart lock poisoned");
        restart_allowed(
            history.entry(scraper_id.to_string()).or_default(),
            Instant::now(),
            RESTART_WINDOW,
            MAX_RESTARTS_PER_WINDOW,
        )
    }

    /// Spawn the worker for a persisted scraper record.
    pub async fn start(&self, record: &ScraperRecord) -> Result<()> {
        let creds = unseal_credentials(&self.sealer, &record.credentials)?;
        self.storage
            .set_scraper_status(&record.id, ScraperStatus::Starting, None)
            .await?;

        // A stale child under the same name must go first.
        self.kill_child(&record.id).await;

        std::fs::create_dir_all(&self.log_dir)?;
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(&record.id))?;
        let err_file = log_file.try_clone()?;

        let subcommand = match record.scraper_type {
            ScraperType::Posts => "posts",
            ScraperType::Comments => "comments",
        };
        let container_name = format!("{CONTAINER_PREFIX}{}", record.id);
        let mut command = Command::new(&self.scraper_bin);
        // Everything else the worker needs (subreddit list, config,
        // queue mutations) it reads from its scraper record in the
        // shared store.
        command
            .arg(subcommand)
            .arg(&record.id)
            .env(STORE_ENV, &self.store_env)
            .env("REDDIT_CLIENT_ID", &creds.client_id)
            .env("REDDIT_CLIENT_SECRET", &creds.client_secret)
            .env("REDDIT_USERNAME", &creds.username)
            .env("REDDIT_PASSWORD", &creds.password)
            .env("REDDIT_USER_AGENT", &creds.user_agent)
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(err_file));

        let child = command.spawn().map_err(HarvestError::Io)?;
        let pid = child.id().map(|p| p.to_string());

        self.storage
            .set_scraper_runtime(&record.id, pid.clone(), Some(container_name.clone()))
            .await?;
        self.storage
            .set_scraper_status(&record.id, ScraperStatus::Running, None)
            .await?;
        info!(
            scraper = %record.id,
            pid = pid.as_deref().unwrap_or("?"),
            container = %container_name,
            "worker started"
        );

        self.children
            .lock()
            .await
            .insert(record.id.clone(), ChildHandle {
                child,
                container_name,
            });
        Ok(())
    }

    async fn kill_child(&self, scraper_id: &str) {
        let handle = self.children.lock().await.remove(scraper_id);
        if let Some(mut handle) = handle {
            match handle.child.try_wait() {
                Ok(Some(_)) => {}
                _ => {
                    warn!(scraper = scraper_id, "force-killing worker");
                    let _ = handle.child.kill().await;
                }
            }
        }
    }

    /// Graceful stop: write the stop to the record so the worker exits at
    /// its next suspension point, wait out the grace period, then kill.
    pub async fn stop(&self, scraper_id: &str) -> Result<()> {
        self.storage
            .set_scraper_status(scraper_id, ScraperStatus::Stopped, None)
            .await?;

        let handle = self.children.lock().await.remove(scraper_id);
        let Some(mut handle) = handle else {
            info!(scraper = scraper_id, "no child process to stop");
            return Ok(());
        };

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        loop {
            match handle.child.try_wait() {
                Ok(Some(status)) => {
                    info!(
                        scraper = scraper_id,
                        container = %handle.container_name,
                        exit = %status,
                        "worker stopped"
                    );
                    return Ok(());
                }
                Ok(None) if Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                _ => {
                    warn!(scraper = scraper_id, "grace period expired, killing worker");
                    let _ = handle.child.kill().await;
                    return Ok(());
                }
            }
        }
    }

    pub async fn restart(&self, scraper_id: &str) -> Result<()> {
        let record = self
            .storage
            .load_scraper(scraper_id)
            .await?
            .ok_or_else(|| HarvestError::ScraperNotFound(scraper_id.to_string()))?;
        self.stop(scraper_id).await?;
        self.storage.increment_restart_count(scraper_id).await?;
        self.start(&record).await
    }

    pub async fn running_children(&self) -> usize {
        self.children.lock().await.len()
    }

    async fn child_is_alive(&self, scraper_id: &str) -> Option<bool> {
        let mut children = self.children.lock().await;
        let handle = children.get_mut(scraper_id)?;
        match handle.child.try_wait() {
            Ok(None) => Some(true),
            _ => Some(false),
        }
    }

    /// One liveness sweep. Split out of the loop so the cadence is owned
    /// by [`Supervisor::monitor`] and the logic stays testable.
    pub async fn check_once(&self) -> Result<()> {
        for record in self.storage.list_scrapers().await? {
            match record.status {
                ScraperStatus::Running => {
                    let alive = self.child_is_alive(&record.id).await;
                    if alive == Some(true) {
                        continue;
                    }
                    // No handle means the record predates this control
                    // plane process; only a dead handle is conclusive.
                    if alive == Some(false) {
                        warn!(scraper = %record.id, "worker exited unexpectedly");
                        self.children.lock().await.remove(&record.id);
                        self.storage
                            .set_scraper_status(
                                &record.id,
                                ScraperStatus::Failed,
                                Some("worker process exited unexpectedly".into()),
                            )
                            .await?;
                    }
                }
                ScraperStatus::Failed if record.auto_restart => {
                    let since_update = Utc::now() - record.last_updated;
                    if since_update.num_seconds() < RESTART_COOLDOWN.as_secs() as i64 {
                        continue;
                    }
                    if !self.record_restart_allowed(&record.id) {
                        warn!(
                            scraper = %record.id,
                            "restart ceiling reached, leaving scraper failed"
                        );
                        continue;
                    }
                    info!(scraper = %record.id, "auto-restarting failed scraper");
                    tokio::time::sleep(RESTART_DELAY).await;
                    if let Err(e) = self.restart(&record.id).await {
                        error!(scraper = %record.id, "auto-restart failed: {e}");
                        self.storage
                            .set_scraper_status(
                                &record.id,
                                ScraperStatus::Failed,
                                Some(format!("restart failed: {e}")),
                            )
                            .await?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Background liveness loop.
    pub async fn monitor(self: Arc<Self>) {
        loop {
            if let Err(e) = self.check_once().await {
                error!("liveness sweep failed: {e}");
            }
            tokio::time::sleep(LIVENESS_INTERVAL).await;
        }
    }
}
