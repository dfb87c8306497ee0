use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::config::StorageSettings;
use crate::error::{Error, Result};
use crate::source::ContentItem;
use crate::storage::persistent_store::PersistentStore;

pub type TimestampStore = PersistentStore<DateTime<Utc>>;
pub type PresenceStore = PersistentStore<()>;

/// Lifetimes applied to the timestamped stores.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub processed_ttl: ChronoDuration,
    pub disqualified_ttl: ChronoDuration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            processed_ttl: ChronoDuration::hours(48),
            disqualified_ttl: ChronoDuration::hours(48),
        }
    }
}

impl RetentionPolicy {
    pub fn from_settings(settings: &StorageSettings) -> Result<Self> {
        let to_chrono = |secs: u64| {
            ChronoDuration::from_std(std::time::Duration::from_secs(secs))
                .map_err(|e| Error::Config(format!("Retention window out of range: {}", e)))
        };
        Ok(Self {
            processed_ttl: to_chrono(settings.processed_ttl)?,
            disqualified_ttl: to_chrono(settings.disqualified_ttl)?,
        })
    }
}

/// Handles to every store the pipeline shares between the orchestrator and
/// its jobs.
#[derive(Clone)]
pub struct Stores {
    pub processed: Arc<TimestampStore>,
    pub forwarded_ids: Arc<PresenceStore>,
    pub forwarded_urls: Arc<PresenceStore>,
    pub disqualified: Arc<TimestampStore>,
    pub retention: RetentionPolicy,
}

impl Stores {
    pub const PROCESSED_FILE: &'static str = "processed.json";
    pub const FORWARDED_IDS_FILE: &'static str = "forwarded_ids.json";
    pub const FORWARDED_URLS_FILE: &'static str = "forwarded_urls.json";
    pub const DISQUALIFIED_FILE: &'static str = "disqualified_authors.json";

    /// Load all stores from `data_dir`. Any corrupt snapshot aborts startup.
    pub fn open(data_dir: &Path, retention: RetentionPolicy) -> Result<Self> {
        let stores = Self {
            processed: Arc::new(PersistentStore::open(data_dir.join(Self::PROCESSED_FILE))?),
            forwarded_ids: Arc::new(PersistentStore::open(
                data_dir.join(Self::FORWARDED_IDS_FILE),
            )?),
            forwarded_urls: Arc::new(PersistentStore::open(
                data_dir.join(Self::FORWARDED_URLS_FILE),
            )?),
            disqualified: Arc::new(PersistentStore::open(data_dir.join(Self::DISQUALIFIED_FILE))?),
            retention,
        };

        tracing::info!(
            processed = stores.processed.len(),
            forwarded_ids = stores.forwarded_ids.len(),
            forwarded_urls = stores.forwarded_urls.len(),
            disqualified = stores.disqualified.len(),
            data_dir = %data_dir.display(),
            "Opened stores"
        );
        Ok(stores)
    }

    pub fn in_memory(retention: RetentionPolicy) -> Self {
        Self {
            processed: Arc::new(PersistentStore::in_memory("processed")),
            forwarded_ids: Arc::new(PersistentStore::in_memory("forwarded_ids")),
            forwarded_urls: Arc::new(PersistentStore::in_memory("forwarded_urls")),
            disqualified: Arc::new(PersistentStore::in_memory("disqualified_authors")),
            retention,
        }
    }

    /// Record `full_id` as seen. Returns false if it had been seen already.
    pub fn mark_processed(&self, full_id: &str, now: DateTime<Utc>) -> bool {
        if self.processed.contains(full_id) {
            return false;
        }
        log_persist_failure(self.processed.name(), self.processed.store(full_id, now));
        true
    }

    /// Whether `author_id` was disqualified less than one TTL ago.
    ///
    /// A TTL that overflows the calendar never expires.
    pub fn is_disqualified(&self, author_id: &str, now: DateTime<Utc>) -> bool {
        let ttl = self.retention.disqualified_ttl;
        self.disqualified
            .retrieve(author_id)
            .map(|recorded_at| {
                recorded_at
                    .checked_add_signed(ttl)
                    .map_or(true, |expires_at| now < expires_at)
            })
            .unwrap_or(false)
    }

    pub fn record_disqualified(&self, author_id: &str, now: DateTime<Utc>) {
        log_persist_failure(self.disqualified.name(), self.disqualified.store(author_id, now));
    }

    pub fn was_forwarded(&self, item: &ContentItem) -> bool {
        self.forwarded_ids.contains(&item.full_id)
            || (!item.url.is_empty() && self.forwarded_urls.contains(&item.url))
    }

    pub fn record_forwarded(&self, item: &ContentItem) {
        log_persist_failure(self.forwarded_ids.name(), self.forwarded_ids.store(&item.full_id, ()));
        if !item.url.is_empty() {
            log_persist_failure(self.forwarded_urls.name(), self.forwarded_urls.store(&item.url, ()));
        }
    }

    /// Drop processed markers older than their retention window.
    pub fn prune_processed(&self, now: DateTime<Utc>) -> usize {
        let ttl = self.retention.processed_ttl;
        let expired = |seen_at: &DateTime<Utc>| {
            seen_at
                .checked_add_signed(ttl)
                .map_or(false, |expires_at| now > expires_at)
        };
        match self.processed.erase_where(|_, seen_at| expired(seen_at)) {
            Ok(removed) => removed,
            Err(err) => {
                tracing::warn!(store = %self.processed.name(), error = %err, "Failed to persist pruned store");
                0
            }
        }
    }
}

fn log_persist_failure(store: &str, result: Result<()>) {
    if let Err(err) = result {
        tracing::warn!(
            store = %store,
            error = %err,
            "Store updated in memory but could not be persisted"
        );
    }
}
