pub mod credentials;
pub mod memory;
pub mod reddit;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use credentials::Credentials;
pub use memory::MemorySource;
pub use reddit::RedditClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemKind {
    Post,
    Comment,
}

/// A post or comment as seen in a feed or an author's history.
///
/// For comments `title` holds the comment body and `url` is usually empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: String,
    pub full_id: String,
    pub kind: ItemKind,
    pub author_id: String,
    pub author_name: String,
    pub title: String,
    pub source_collection: String,
    pub url: String,
}

/// Pagination boundaries for "new since last time" listings, as full ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cursor {
    pub newest: Option<String>,
    pub oldest: Option<String>,
}

/// Rate budget reported alongside a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateSignal {
    pub remaining: u32,
    pub reset_in: Duration,
}

/// Outcome of one remote call together with whatever rate feedback came
/// back with it. Failed calls may still carry a signal.
#[derive(Debug)]
pub struct Reply<T> {
    pub outcome: Result<T>,
    pub rate: Option<RateSignal>,
}

impl<T> Reply<T> {
    pub fn new(outcome: Result<T>, rate: Option<RateSignal>) -> Self {
        Self { outcome, rate }
    }

    pub fn ok(value: T) -> Self {
        Self::new(Ok(value), None)
    }

    pub fn err(err: crate::error::Error) -> Self {
        Self::new(Err(err), None)
    }

    pub fn with_rate(mut self, rate: RateSignal) -> Self {
        self.rate = Some(rate);
        self
    }
}

/// The remote platform the pipeline reads from and forwards into.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Items newer than `cursor.newest`, plus the advanced cursor.
    async fn fetch_new_items(&self, collection: &str, cursor: &Cursor)
        -> Reply<(Vec<ContentItem>, Cursor)>;

    /// Most recent posts by `author_name`, newest first.
    async fn fetch_author_posts(&self, author_name: &str) -> Reply<Vec<ContentItem>>;

    /// Most recent comments by `author_name`, newest first.
    async fn fetch_author_comments(&self, author_name: &str) -> Reply<Vec<ContentItem>>;

    /// Cross-post `item` into `destination`. Returns the new item when the
    /// platform reports one.
    async fn cross_post(&self, item: &ContentItem, destination: &str)
        -> Reply<Option<ContentItem>>;

    async fn approve(&self, item: &ContentItem) -> Reply<()>;
}
