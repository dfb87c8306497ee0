use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::source::{ContentItem, ContentSource, Cursor, ItemKind, RateSignal, Reply};

/// Scripted in-memory [`ContentSource`] for tests and dry runs.
///
/// Feed pages are served in the order they were pushed; once they run out
/// every fetch returns an empty page. Author histories are looked up by
/// author name, and scripted failures are consumed one per call.
#[derive(Default)]
pub struct MemorySource {
    state: Mutex<MemoryState>,
    history_delay: Duration,
    rate: Option<RateSignal>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

#[derive(Default)]
struct MemoryState {
    pages: VecDeque<Result<Vec<ContentItem>>>,
    posts: HashMap<String, Vec<ContentItem>>,
    comments: HashMap<String, Vec<ContentItem>>,
    history_failures: HashMap<String, VecDeque<Error>>,
    history_calls: HashMap<String, usize>,
    cross_post_failures: HashSet<String>,
    approvals_fail: bool,
    forwarded: Vec<ContentItem>,
    approved: Vec<String>,
    next_id: usize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make each history fetch take `delay`, so overlapping jobs are observable.
    pub fn with_history_delay(mut self, delay: Duration) -> Self {
        self.history_delay = delay;
        self
    }

    /// Attach `rate` to every reply.
    pub fn with_rate(mut self, rate: RateSignal) -> Self {
        self.rate = Some(rate);
        self
    }

    pub fn push_page(&self, items: Vec<ContentItem>) {
        self.state.lock().pages.push_back(Ok(items));
    }

    pub fn push_page_error(&self, err: Error) {
        self.state.lock().pages.push_back(Err(err));
    }

    pub fn set_history(&self, author_name: &str, posts: Vec<ContentItem>, comments: Vec<ContentItem>) {
        let mut state = self.state.lock();
        state.posts.insert(author_name.to_string(), posts);
        state.comments.insert(author_name.to_string(), comments);
    }

    /// Fail the next history fetch for `author_name` with `err`.
    pub fn fail_history(&self, author_name: &str, err: Error) {
        self.state
            .lock()
            .history_failures
            .entry(author_name.to_string())
            .or_default()
            .push_back(err);
    }

    pub fn fail_cross_post(&self, full_id: &str) {
        self.state.lock().cross_post_failures.insert(full_id.to_string());
    }

    pub fn fail_approvals(&self) {
        self.state.lock().approvals_fail = true;
    }

    pub fn forwarded(&self) -> Vec<ContentItem> {
        self.state.lock().forwarded.clone()
    }

    pub fn approved(&self) -> Vec<String> {
        self.state.lock().approved.clone()
    }

    /// Post and comment fetches made for `author_name`, failures included.
    pub fn history_calls(&self, author_name: &str) -> usize {
        self.state
            .lock()
            .history_calls
            .get(author_name)
            .copied()
            .unwrap_or(0)
    }

    /// Most history fetches that were ever running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn reply<T>(&self, outcome: Result<T>) -> Reply<T> {
        Reply::new(outcome, self.rate)
    }

    async fn history(&self, author_name: &str, kind: ItemKind) -> Reply<Vec<ContentItem>> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);

        if !self.history_delay.is_zero() {
            tokio::time::sleep(self.history_delay).await;
        }

        let outcome = {
            let mut state = self.state.lock();
            *state.history_calls.entry(author_name.to_string()).or_default() += 1;

            let failure = state
                .history_failures
                .get_mut(author_name)
                .and_then(|queue| queue.pop_front());

            match failure {
                Some(err) => Err(err),
                None => {
                    let histories = match kind {
                        ItemKind::Post => &state.posts,
                        ItemKind::Comment => &state.comments,
                    };
                    Ok(histories.get(author_name).cloned().unwrap_or_default())
                }
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.reply(outcome)
    }
}

#[async_trait]
impl ContentSource for MemorySource {
    async fn fetch_new_items(
        &self,
        _collection: &str,
        cursor: &Cursor,
    ) -> Reply<(Vec<ContentItem>, Cursor)> {
        let page = self.state.lock().pages.pop_front();
        let outcome = match page {
            None => Ok((Vec::new(), cursor.clone())),
            Some(Err(err)) => Err(err),
            Some(Ok(items)) => {
                let next = match (items.first(), items.last()) {
                    (Some(newest), Some(oldest)) => Cursor {
                        newest: Some(newest.full_id.clone()),
                        oldest: Some(oldest.full_id.clone()),
                    },
                    _ => cursor.clone(),
                };
                Ok((items, next))
            }
        };
        self.reply(outcome)
    }

    async fn fetch_author_posts(&self, author_name: &str) -> Reply<Vec<ContentItem>> {
        self.history(author_name, ItemKind::Post).await
    }

    async fn fetch_author_comments(&self, author_name: &str) -> Reply<Vec<ContentItem>> {
        self.history(author_name, ItemKind::Comment).await
    }

    async fn cross_post(
        &self,
        item: &ContentItem,
        destination: &str,
    ) -> Reply<Option<ContentItem>> {
        let mut state = self.state.lock();
        if state.cross_post_failures.contains(&item.full_id) {
            return self.reply(Err(Error::Rejected {
                status: 403,
                message: format!("cross-post of {} refused", item.full_id),
            }));
        }

        state.next_id += 1;
        let id = format!("x{}", state.next_id);
        let created = ContentItem {
            full_id: format!("t3_{}", id),
            id,
            kind: ItemKind::Post,
            author_id: String::new(),
            author_name: String::new(),
            title: item.title.clone(),
            source_collection: destination.to_string(),
            url: item.url.clone(),
        };
        state.forwarded.push(item.clone());
        drop(state);

        self.reply(Ok(Some(created)))
    }

    async fn approve(&self, item: &ContentItem) -> Reply<()> {
        let mut state = self.state.lock();
        if state.approvals_fail {
            return self.reply(Err(Error::Rejected {
                status: 403,
                message: "not a moderator".to_string(),
            }));
        }
        state.approved.push(item.full_id.clone());
        drop(state);

        self.reply(Ok(()))
    }
}
