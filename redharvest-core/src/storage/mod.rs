pub mod file;
pub mod memory;
pub mod traits;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::common::error::Result;
use crate::domain::{EmbeddingStatus, Post, SubredditMetadata};

pub use file::FileStore;
pub use memory::MemoryStore;
pub use traits::{Storage, UpsertOutcome};

/// Environment variable selecting the store backend. The supervisor
/// forwards it to every worker it spawns so the whole fleet shares one
/// store.
pub const STORE_ENV: &str = "REDHARVEST_STORE";

const DEFAULT_STORE_DIR: &str = "data/store";

/// Which [`Storage`] backend to wire.
///
/// `memory` keeps everything inside one process and is what the tests
/// use; any other value is a directory for the embedded file store, the
/// default topology in which the control plane and its worker processes
/// observe each other's writes. A full deployment swaps in its document
/// store by implementing [`Storage`] behind this same seam.
#[derive(Debug, Clone)]
pub enum StoreSpec {
    Memory,
    File(PathBuf),
}

impl StoreSpec {
    pub fn from_env() -> Self {
        match std::env::var(STORE_ENV) {
            Ok(value) if value.trim().eq_ignore_ascii_case("memory") => StoreSpec::Memory,
            Ok(value) => StoreSpec::File(PathBuf::from(value.trim())),
            Err(_) => StoreSpec::File(PathBuf::from(DEFAULT_STORE_DIR)),
        }
    }

    pub fn open(&self) -> Result<Arc<dyn Storage>> {
        match self {
            StoreSpec::Memory => Ok(Arc::new(MemoryStore::new())),
            StoreSpec::File(root) => Ok(Arc::new(FileStore::open(root.clone())?)),
        }
    }

    /// The [`STORE_ENV`] value handed to spawned workers. File paths are
    /// made absolute so a child's working directory cannot split the
    /// fleet across different stores.
    pub fn as_env_value(&self) -> Result<String> {
        match self {
            StoreSpec::Memory => Ok("memory".to_string()),
            StoreSpec::File(root) => {
                let absolute = if root.is_absolute() {
                    root.clone()
                } else {
                    std::env::current_dir()?.join(root)
                };
                Ok(absolute.display().to_string())
            }
        }
    }

    pub fn is_shared_across_processes(&self) -> bool {
        matches!(self, StoreSpec::File(_))
    }
}

/// Merge an incoming sighting into the stored row, keeping tracking
/// fields monotonic: booleans only ever go false -> true, timestamps stay
/// once set.
pub(crate) fn merge_post(existing: &Post, incoming: &Post) -> Post {
    let mut merged = incoming.clone();
    merged.comments_scraped = existing.comments_scraped || incoming.comments_scraped;
    merged.initial_comments_scraped =
        existing.initial_comments_scraped || incoming.initial_comments_scraped;
    merged.last_comment_fetch_time = existing
        .last_comment_fetch_time
        .or(incoming.last_comment_fetch_time);
    merged.comments_scraped_at = existing.comments_scraped_at.or(incoming.comments_scraped_at);
    merged
}

pub(crate) fn tier_eligible(post: &Post, now: DateTime<Utc>) -> bool {
    if !post.initial_comments_scraped {
        return true;
    }
    let age_threshold = if post.num_comments > 100 {
        Duration::hours(2)
    } else if post.num_comments >= 20 {
        Duration::hours(6)
    } else {
        Duration::hours(24)
    };
    match post.last_comment_fetch_time {
        Some(fetched) => now - fetched >= age_threshold,
        None => true,
    }
}

/// Order comment candidates: unscraped first, then `num_comments`
/// descending, then newest first; truncated to the batch limit.
pub(crate) fn select_comment_candidates(mut eligible: Vec<Post>, limit: usize) -> Vec<Post> {
    eligible.sort_by(|a, b| {
        a.initial_comments_scraped
            .cmp(&b.initial_comments_scraped)
            .then(b.num_comments.cmp(&a.num_comments))
            .then(b.created_at.cmp(&a.created_at))
    });
    eligible.truncate(limit);
    eligible
}

/// `embedding_status` resets to pending only when an embedding-relevant
/// text field changed; otherwise the stored status is carried over.
pub(crate) fn reconcile_embedding_status(
    existing: Option<&SubredditMetadata>,
    incoming: &mut SubredditMetadata,
) {
    match existing {
        Some(prev) if prev.embedding_corpus() == incoming.embedding_corpus() => {
            incoming.embedding_status = prev.embedding_status;
        }
        _ => incoming.embedding_status = EmbeddingStatus::Pending,
    }
}
