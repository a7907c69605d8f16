use std::sync::Arc;

use chrono::{DateTime, Utc};
use redharvest_core::security::Sealer;
use redharvest_core::storage::Storage;

use crate::supervisor::Supervisor;

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub supervisor: Arc<Supervisor>,
    pub sealer: Sealer,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(storage: Arc<dyn Storage>, supervisor: Arc<Supervisor>, sealer: Sealer) -> Self {
        Self {
            storage,
            supervisor,
            sealer,
            started_at: Utc::now(),
        }
    }
}
