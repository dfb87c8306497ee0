//! Shared rate budget for every remote call, plus the adapter that routes a
//! [`ContentSource`] through it.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::config::ThrottleSettings;
use crate::error::Result;
use crate::source::{ContentItem, ContentSource, Cursor, RateSignal, Reply};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BudgetSnapshot {
    pub remaining: Option<u32>,
    pub reset_at: Option<Instant>,
}

/// Tracks the upstream's advertised rate budget and parks callers once it is
/// spent.
///
/// The gate is open until the first rate signal arrives. After that a caller
/// is held only while `remaining == 0` and the reset instant is still ahead;
/// it then sleeps until the reset plus a safety margin.
#[derive(Debug)]
pub struct ThrottleGate {
    budget: Mutex<BudgetSnapshot>,
    safety_margin: Duration,
}

impl Default for ThrottleGate {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl ThrottleGate {
    pub fn new(safety_margin: Duration) -> Self {
        Self {
            budget: Mutex::new(BudgetSnapshot::default()),
            safety_margin,
        }
    }

    pub fn from_settings(settings: &ThrottleSettings) -> Self {
        Self::new(Duration::from_millis(settings.safety_margin_ms))
    }

    /// How long a caller arriving at `now` would have to wait.
    pub fn wait_time(&self, now: Instant) -> Option<Duration> {
        let budget = self.budget.lock();
        match (budget.remaining, budget.reset_at) {
            (Some(0), Some(reset_at)) if now < reset_at => {
                Some(reset_at - now + self.safety_margin)
            }
            _ => None,
        }
    }

    pub async fn acquire(&self) {
        while let Some(wait) = self.wait_time(Instant::now()) {
            debug!(wait_ms = wait.as_millis() as u64, "Rate budget spent; waiting for reset");
            sleep(wait).await;
        }
    }

    pub fn update(&self, signal: RateSignal) {
        self.update_at(signal, Instant::now());
    }

    /// Take the freshest `remaining`; never move the reset instant backwards.
    ///
    /// A reset too far out to represent leaves the current reset instant as is.
    pub fn update_at(&self, signal: RateSignal, now: Instant) {
        let reported = now.checked_add(signal.reset_in);
        let mut budget = self.budget.lock();
        budget.remaining = Some(signal.remaining);
        budget.reset_at = match (budget.reset_at, reported) {
            (Some(current), Some(reported)) => Some(current.max(reported)),
            (current, reported) => current.or(reported),
        };
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        *self.budget.lock()
    }
}

/// A [`ContentSource`] whose every call first passes the [`ThrottleGate`] and
/// whose every reply feeds its rate signal back into it.
#[derive(Clone)]
pub struct GatedSource {
    inner: Arc<dyn ContentSource>,
    gate: Arc<ThrottleGate>,
}

impl GatedSource {
    pub fn new(inner: Arc<dyn ContentSource>, gate: Arc<ThrottleGate>) -> Self {
        Self { inner, gate }
    }

    pub fn gate(&self) -> &Arc<ThrottleGate> {
        &self.gate
    }

    fn settle<T>(&self, reply: Reply<T>) -> Result<T> {
        if let Some(rate) = reply.rate {
            self.gate.update(rate);
        }
        reply.outcome
    }

    pub async fn fetch_new_items(
        &self,
        collection: &str,
        cursor: &Cursor,
    ) -> Result<(Vec<ContentItem>, Cursor)> {
        self.gate.acquire().await;
        let reply = self.inner.fetch_new_items(collection, cursor).await;
        self.settle(reply)
    }

    pub async fn fetch_author_posts(&self, author_name: &str) -> Result<Vec<ContentItem>> {
        self.gate.acquire().await;
        let reply = self.inner.fetch_author_posts(author_name).await;
        self.settle(reply)
    }

    pub async fn fetch_author_comments(&self, author_name: &str) -> Result<Vec<ContentItem>> {
        self.gate.acquire().await;
        let reply = self.inner.fetch_author_comments(author_name).await;
        self.settle(reply)
    }

    pub async fn cross_post(
        &self,
        item: &ContentItem,
        destination: &str,
    ) -> Result<Option<ContentItem>> {
        self.gate.acquire().await;
        let reply = self.inner.cross_post(item, destination).await;
        self.settle(reply)
    }

    pub async fn approve(&self, item: &ContentItem) -> Result<()> {
        self.gate.acquire().await;
        let reply = self.inner.approve(item).await;
        self.settle(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::source::memory::MemorySource;
    use proptest::prelude::*;

    fn signal(remaining: u32, reset_secs: u64) -> RateSignal {
        RateSignal {
            remaining,
            reset_in: Duration::from_secs(reset_secs),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_reset() {
        let gate = ThrottleGate::new(Duration::from_millis(500));
        let start = Instant::now();
        gate.update(signal(0, 2));

        gate.acquire().await;

        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(2), "returned after {:?}", waited);
        assert!(waited >= Duration::from_millis(2500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_is_open_with_budget_left() {
        let gate = ThrottleGate::default();
        let start = Instant::now();

        gate.acquire().await;
        gate.update(signal(5, 600));
        gate.acquire().await;

        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spent_budget_after_reset_is_open() {
        let gate = ThrottleGate::default();
        gate.update(signal(0, 1));
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(gate.wait_time(Instant::now()), None);
    }

    #[test]
    fn test_reset_never_moves_backwards() {
        let gate = ThrottleGate::default();
        let now = Instant::now();
        gate.update_at(signal(10, 100), now);
        gate.update_at(signal(3, 20), now + Duration::from_secs(1));

        let snapshot = gate.snapshot();
        assert_eq!(snapshot.remaining, Some(3));
        assert_eq!(snapshot.reset_at, Some(now + Duration::from_secs(100)));
    }

    #[test]
    fn test_unrepresentable_reset_keeps_current() {
        let gate = ThrottleGate::default();
        let now = Instant::now();
        gate.update_at(signal(0, 30), now);

        gate.update_at(
            RateSignal {
                remaining: 0,
                reset_in: Duration::MAX,
            },
            now,
        );

        let snapshot = gate.snapshot();
        assert_eq!(snapshot.remaining, Some(0));
        assert_eq!(snapshot.reset_at, Some(now + Duration::from_secs(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gated_source_feeds_rate_signal() {
        let source = Arc::new(MemorySource::new().with_rate(signal(0, 30)));
        source.push_page_error(Error::RateLimited("slow down".into()));
        let gate = Arc::new(ThrottleGate::default());
        let gated = GatedSource::new(source, gate.clone());

        let err = gated
            .fetch_new_items("pics", &Cursor::default())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(gate.snapshot().remaining, Some(0));
        assert!(gate.wait_time(Instant::now()).is_some());
    }

    proptest! {
        #[test]
        fn prop_reset_is_monotonic(updates in prop::collection::vec((0u32..100, 0u64..600, 0u64..30), 1..40)) {
            let gate = ThrottleGate::default();
            let mut now = Instant::now();
            let mut last_reset = None;
            let mut last_remaining = None;

            for (remaining, reset_secs, step) in updates {
                now += Duration::from_secs(step);
                gate.update_at(signal(remaining, reset_secs), now);
                let snapshot = gate.snapshot();

                if let (Some(prev), Some(current)) = (last_reset, snapshot.reset_at) {
                    prop_assert!(current >= prev);
                }
                last_reset = snapshot.reset_at;
                last_remaining = snapshot.remaining;
                prop_assert_eq!(last_remaining, Some(remaining));
            }
            prop_assert!(last_remaining.is_some());
        }
    }
}
