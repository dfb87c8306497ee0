//! End-to-end cycles over the in-memory source: filtering, concurrency,
//! failure isolation and persistence.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use repost_guard::error::Error;
use repost_guard::pipeline::CycleReport;
use repost_guard::source::MemorySource;
use repost_guard::storage::{RetentionPolicy, Stores};

use test_data::*;

#[test_log::test(tokio::test(start_paused = true))]
async fn test_cycle_forwards_clean_and_skips_promoters() {
    let source = Arc::new(MemorySource::new().with_history_delay(Duration::from_millis(200)));
    source.push_page(vec![
        post("a1", "alice"),
        post("b1", "bob"),
        post("c1", "carol"),
        post("d1", "dave"),
    ]);
    source.set_history("bob", vec![promo_post("b0", "bob")], vec![]);
    source.set_history(
        "dave",
        vec![post("d0", "dave")],
        vec![comment("dc", "dave", "DM me, link to my fansly in bio")],
    );

    let orchestrator = orchestrator(source.clone(), memory_stores(), 2);
    let report = orchestrator.run_cycle().await.unwrap();

    assert_eq!(
        report,
        CycleReport {
            fetched: 4,
            processed: 4,
            dispatched: 4,
            forwarded: 2,
            approved: 2,
            disqualified: 2,
            failed: 0,
            pruned: 0,
        }
    );
    assert!(source.peak_in_flight() <= 2);

    let mut forwarded: Vec<String> = source.forwarded().into_iter().map(|i| i.full_id).collect();
    forwarded.sort();
    assert_eq!(forwarded, vec!["t3_a1", "t3_c1"]);

    let stores = &orchestrator.context().stores;
    let now = Utc::now();
    assert!(stores.is_disqualified("t2_bob", now));
    assert!(stores.is_disqualified("t2_dave", now));
    assert!(!stores.is_disqualified("t2_alice", now));
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_never_exceeds_limit() {
    let source = Arc::new(MemorySource::new().with_history_delay(Duration::from_secs(1)));
    source.push_page((0..6).map(|i| post(&format!("p{}", i), &format!("user{}", i))).collect());

    let report = orchestrator(source.clone(), memory_stores(), 2)
        .run_cycle()
        .await
        .unwrap();

    assert_eq!(report.forwarded, 6);
    assert_eq!(source.peak_in_flight(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_items_are_processed_once_across_cycles() {
    let source = Arc::new(MemorySource::new());
    let page = vec![post("a1", "alice"), post("b1", "bob")];
    source.push_page(page.clone());

    let orchestrator = orchestrator(source.clone(), memory_stores(), 2);
    let first = orchestrator.run_cycle().await.unwrap();
    assert_eq!(first.processed, 2);
    assert_eq!(first.forwarded, 2);

    source.push_page(page);
    let second = orchestrator.run_cycle().await.unwrap();
    assert_eq!(second.fetched, 2);
    assert_eq!(second.processed, 0);
    assert_eq!(second.dispatched, 0);
    assert_eq!(source.forwarded().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_recently_disqualified_author_is_not_fetched() {
    let source = Arc::new(MemorySource::new());
    source.push_page(vec![post("b2", "bob")]);
    let stores = memory_stores();
    stores.record_disqualified("t2_bob", Utc::now());

    let report = orchestrator(source.clone(), stores, 2).run_cycle().await.unwrap();

    assert_eq!(report.processed, 1);
    assert_eq!(report.dispatched, 0);
    assert_eq!(source.history_calls("bob"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_expired_disqualification_is_reevaluated() {
    let source = Arc::new(MemorySource::new());
    source.push_page(vec![post("b3", "bob")]);
    let stores = memory_stores();
    stores.record_disqualified("t2_bob", Utc::now() - chrono::Duration::hours(49));

    let report = orchestrator(source.clone(), stores, 2).run_cycle().await.unwrap();

    assert_eq!(report.dispatched, 1);
    assert_eq!(report.forwarded, 1);
}

#[tokio::test(start_paused = true)]
async fn test_same_url_is_forwarded_once() {
    let source = Arc::new(MemorySource::new());
    let original = post("a1", "alice");
    let repost = post_with_url("z9", "zed", &original.url);
    source.push_page(vec![original.clone(), repost]);

    let report = orchestrator(source.clone(), memory_stores(), 2).run_cycle().await.unwrap();

    assert_eq!(report.processed, 2);
    assert_eq!(report.dispatched, 1);
    assert_eq!(source.forwarded(), vec![original]);
}

#[tokio::test(start_paused = true)]
async fn test_previously_forwarded_url_is_skipped() {
    let source = Arc::new(MemorySource::new());
    let stores = memory_stores();
    stores.record_forwarded(&post("old", "alice"));
    source.push_page(vec![post_with_url("new", "zed", "https://i.example.com/old.jpg")]);

    let report = orchestrator(source.clone(), stores, 2).run_cycle().await.unwrap();

    assert_eq!(report.processed, 1);
    assert_eq!(report.dispatched, 0);
    assert!(source.forwarded().is_empty());
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_forward_failure_does_not_stop_cycle() {
    let source = Arc::new(MemorySource::new());
    source.push_page(vec![post("a1", "alice"), post("b1", "bob"), post("c1", "carol")]);
    source.fail_cross_post("t3_a1");

    let orchestrator = orchestrator(source.clone(), memory_stores(), 1);
    let report = orchestrator.run_cycle().await.unwrap();

    assert_eq!(report.dispatched, 3);
    assert_eq!(report.failed, 1);
    assert_eq!(report.forwarded, 2);
    // The failed item stays processed and is not retried next cycle
    assert!(orchestrator.context().stores.processed.contains("t3_a1"));
    assert!(!orchestrator.context().stores.was_forwarded(&post("a1", "alice")));
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_history_retries_are_isolated() {
    let source = Arc::new(MemorySource::new());
    source.push_page(vec![post("a1", "alice"), post("b1", "bob")]);
    for _ in 0..3 {
        source.fail_history("alice", Error::RateLimited("HTTP 429".to_string()));
    }

    let report = orchestrator(source.clone(), memory_stores(), 2).run_cycle().await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.forwarded, 1);
    assert_eq!(source.history_calls("alice"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_job_error_ends_cycle() {
    let source = Arc::new(MemorySource::new());
    source.push_page(vec![post("a1", "alice")]);
    source.fail_history("alice", Error::Auth("token revoked".to_string()));

    let err = orchestrator(source, memory_stores(), 2).run_cycle().await.unwrap_err();
    assert!(err.is_fatal());
}

#[tokio::test(start_paused = true)]
async fn test_retryable_page_error_keeps_earlier_pages() {
    let source = Arc::new(MemorySource::new());
    source.push_page(vec![post("a1", "alice")]);
    source.push_page_error(Error::Http("HTTP 503".to_string()));
    source.push_page(vec![post("b1", "bob")]);

    let report = orchestrator(source.clone(), memory_stores(), 2).run_cycle().await.unwrap();

    assert_eq!(report.fetched, 1);
    assert_eq!(report.forwarded, 1);
}

#[tokio::test(start_paused = true)]
async fn test_permanent_page_error_is_returned() {
    let source = Arc::new(MemorySource::new());
    source.push_page_error(Error::Rejected {
        status: 403,
        message: "private collection".to_string(),
    });

    let err = orchestrator(source, memory_stores(), 2).run_cycle().await.unwrap_err();
    assert!(matches!(err, Error::Rejected { status: 403, .. }));
}

#[tokio::test(start_paused = true)]
async fn test_state_survives_restart() {
    let temp_dir = TempDir::new().unwrap();
    let source = Arc::new(MemorySource::new());
    source.push_page(vec![post("a1", "alice"), post("b1", "bob")]);
    source.set_history("bob", vec![promo_post("b0", "bob")], vec![]);

    let stores = Stores::open(temp_dir.path(), RetentionPolicy::default()).unwrap();
    orchestrator(source, stores, 2).run_cycle().await.unwrap();

    let reopened = Stores::open(temp_dir.path(), RetentionPolicy::default()).unwrap();
    assert!(reopened.processed.contains("t3_a1"));
    assert!(reopened.processed.contains("t3_b1"));
    assert!(reopened.was_forwarded(&post("a1", "alice")));
    assert!(reopened.is_disqualified("t2_bob", Utc::now()));
    assert!(temp_dir.path().join(Stores::FORWARDED_URLS_FILE).exists());
}

#[tokio::test(start_paused = true)]
async fn test_stale_processed_items_are_pruned() {
    let source = Arc::new(MemorySource::new());
    let stores = memory_stores();
    stores.mark_processed("t3_ancient", Utc::now() - chrono::Duration::hours(72));

    let report = orchestrator(source, stores.clone(), 2).run_cycle().await.unwrap();

    assert_eq!(report.pruned, 1);
    assert!(!stores.processed.contains("t3_ancient"));
}

#[tokio::test(start_paused = true)]
async fn test_run_stops_on_shutdown() {
    let source = Arc::new(MemorySource::new());
    source.push_page(vec![post("a1", "alice")]);
    let orchestrator = orchestrator(source.clone(), memory_stores(), 2);
    let shutdown = CancellationToken::new();

    let token = shutdown.clone();
    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(60)).await;
        token.cancel();
    });

    orchestrator.run(shutdown).await.unwrap();
    stopper.await.unwrap();

    assert_eq!(source.forwarded().len(), 1);
}
