//! Per-OAuth-application rate-limit oracle.
//!
//! A passive observer: the counting transport feeds it the
//! `X-Ratelimit-*` headers of every response, and workers call
//! [`RateLimitOracle::await_capacity`] before touching the network.
//! Probing quota never costs an HTTP request.

use std::sync::Mutex;
use std::time::Duration;

use redharvest_core::config::{RATE_LIMIT_RESET_GUARD, RATE_LIMIT_THRESHOLD};
use redharvest_core::domain::RateLimitSnapshot;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::observability::metrics;

#[derive(Debug, Clone, Copy)]
struct State {
    remaining: f64,
    used: u64,
    reset_at: Instant,
}

pub struct RateLimitOracle {
    threshold: f64,
    state: Mutex<Option<State>>,
}

impl Default for RateLimitOracle {
    fn default() -> Self {
        Self::new(RATE_LIMIT_THRESHOLD)
    }
}

impl RateLimitOracle {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            state: Mutex::new(None),
        }
    }

    /// Record a fresh header snapshot. `reset_secs` is Reddit's advertised
    /// seconds-until-window-reset.
    pub fn observe(&self, remaining: f64, used: u64, reset_secs: u64) {
        let mut state = self.state.lock().expect("rate limit lock poisoned");
        *state = Some(State {
            remaining,
            used,
            reset_at: Instant::now() + Duration::from_secs(reset_secs),
        });
        debug!(remaining, used, reset_secs, "rate limit observed");
    }

    pub fn snapshot(&self) -> Option<RateLimitSnapshot> {
        let state = self.state.lock().expect("rate limit lock poisoned");
        state.map(|s| RateLimitSnapshot {
            remaining: s.remaining,
            used: s.used,
            reset_in_seconds: s.reset_at.saturating_duration_since(Instant::now()).as_secs(),
        })
    }

    /// Block until quota is available.
    ///
    /// Returns immediately while `remaining >= threshold`. Below the
    /// threshold it sleeps until the advertised reset plus a guard margin.
    /// With no snapshot yet (first call of a fresh process) a short
    /// precautionary pause is taken instead.
    pub async fn await_capacity(&self) {
        let wait = {
            let state = self.state.lock().expect("rate limit lock poisoned");
            match *state {
                None => Some(Duration::from_secs(1)),
                Some(s) if s.remaining >= self.threshold => None,
                Some(s) => {
                    let until_reset = s.reset_at.saturating_duration_since(Instant::now());
                    Some(until_reset + RATE_LIMIT_RESET_GUARD)
                }
            }
        };

        match wait {
            None => {}
            Some(d) if d <= Duration::from_secs(1) => {
                tokio::time::sleep(d).await;
            }
            Some(d) => {
                info!(wait_secs = d.as_secs(), "rate limit low, waiting for reset");
                metrics::workers::rate_limit_wait(d.as_secs_f64());
                tokio::time::sleep(d).await;
                // The stale snapshot would otherwise re-trigger the wait.
                let mut state = self.state.lock().expect("rate limit lock poisoned");
                if let Some(s) = state.as_mut() {
                    if s.reset_at <= Instant::now() {
                        s.remaining = self.threshold;
                    }
                }
                info!("rate limit window reset, continuing");
            }
        }
    }
}
