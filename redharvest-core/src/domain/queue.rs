//! Pure subreddit-queue mutations.
//!
//! All three operations edit a [`ScraperRecord`] in place and report the
//! effective diff. Invariants enforced at this boundary:
//! - the primary subreddit can never be removed,
//! - the list never exceeds [`MAX_SUBREDDITS`],
//! - `pending_scrape` stays a subset of `subreddits`.

use std::collections::BTreeSet;

use chrono::Utc;

use crate::common::error::{HarvestError, Result};
use crate::config::MAX_SUBREDDITS;
use crate::domain::ScraperRecord;

/// What a mutation actually changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

fn normalize(subs: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    subs.iter()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .filter(|s| seen.insert(s.clone()))
        .collect()
}

/// Union `new_subs` into the queue. New entries also join `pending_scrape`
/// so the worker picks them up at the head of its next rotation step.
/// Duplicates are silently dropped.
pub fn add(record: &mut ScraperRecord, new_subs: &[String]) -> Result<QueueDiff> {
    let candidates = normalize(new_subs);
    let added: Vec<String> = candidates
        .into_iter()
        .filter(|s| !record.subreddits.contains(s))
        .collect();

    if record.subreddits.len() + added.len() > MAX_SUBREDDITS {
        return Err(HarvestError::InvalidQueue(format!(
            "subreddit list would exceed the {MAX_SUBREDDITS}-entry limit"
        )));
    }

    for sub in &added {
        record.subreddits.push(sub.clone());
        record.pending_scrape.insert(sub.clone());
    }
    if !added.is_empty() {
        record.last_updated = Utc::now();
    }
    Ok(QueueDiff {
        added,
        removed: Vec::new(),
    })
}

/// Remove `old_subs` from the queue and from `pending_scrape`. Removing the
/// primary subreddit is an invariant violation.
pub fn remove(record: &mut ScraperRecord, old_subs: &[String]) -> Result<QueueDiff> {
    let candidates = normalize(old_subs);
    if candidates.iter().any(|s| *s == record.id) {
        return Err(HarvestError::InvalidQueue(format!(
            "the primary subreddit '{}' cannot be removed",
            record.id
        )));
    }

    let removed: Vec<String> = candidates
        .into_iter()
        .filter(|s| record.subreddits.contains(s))
        .collect();

    record.subreddits.retain(|s| !removed.contains(s));
    for sub in &removed {
        record.pending_scrape.remove(sub);
    }
    if !removed.is_empty() {
        record.last_updated = Utc::now();
    }
    Ok(QueueDiff {
        added: Vec::new(),
        removed,
    })
}

/// Replace the queue wholesale. Additions relative to the old list join
/// `pending_scrape`; removals are purged from it. The primary subreddit is
/// kept even when the new list omits it.
pub fn replace(record: &mut ScraperRecord, full_list: &[String]) -> Result<QueueDiff> {
    let mut new_list = normalize(full_list);
    if !new_list.contains(&record.id) {
        new_list.insert(0, record.id.clone());
    }
    if new_list.len() > MAX_SUBREDDITS {
        return Err(HarvestError::InvalidQueue(format!(
            "subreddit list would exceed the {MAX_SUBREDDITS}-entry limit"
        )));
    }

    let added: Vec<String> = new_list
        .iter()
        .filter(|s| !record.subreddits.contains(*s))
        .cloned()
        .collect();
    let removed: Vec<String> = record
        .subreddits
        .iter()
        .filter(|s| !new_list.contains(*s))
        .cloned()
        .collect();

    record.subreddits = new_list;
    record.pending_scrape.retain(|s| record.subreddits.contains(s));
    for sub in &added {
        record.pending_scrape.insert(sub.clone());
    }
    if !added.is_empty() || !removed.is_empty() {
        record.last_updated = Utc::now();
    }
    Ok(QueueDiff { added, removed })
}
