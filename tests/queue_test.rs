mod helpers;

use mnemos::config::QueueConfig;
use mnemos::db;
use mnemos::queue::{ConsolidationQueue, FailureDisposition, QueueStatus};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[test]
fn failed_session_is_retried_after_its_delay() {
    let (_tmp, pool) = helpers::test_pool();
    let queue = ConsolidationQueue::new(Arc::clone(&pool), helpers::queue_config());

    assert!(queue.add("abc123", Path::new("/tmp/abc123.jsonl")).unwrap());
    assert!(!queue.add("abc123", Path::new("/tmp/abc123.jsonl")).unwrap());

    let entry = queue.get_next().unwrap().unwrap();
    assert_eq!(entry.session_id, "abc123");
    assert_eq!(entry.session_path, "/tmp/abc123.jsonl");
    assert_eq!(entry.status, QueueStatus::Processing);

    let before = chrono::Utc::now();
    let disposition = queue
        .mark_failed("abc123", "timeout", Some(Duration::from_secs(300)))
        .unwrap();
    let (retry_count, next_retry_at) = match disposition {
        FailureDisposition::Retry { retry_count, next_retry_at } => (retry_count, next_retry_at),
        other => panic!("expected a retry, got {other:?}"),
    };
    assert_eq!(retry_count, 1);
    let next = db::parse_timestamp(&next_retry_at).unwrap();
    let delay = (next - before).num_seconds();
    assert!((299..=301).contains(&delay), "delay was {delay}s");

    let entry = queue.get("abc123").unwrap().unwrap();
    assert_eq!(entry.status, QueueStatus::Failed);
    assert_eq!(entry.retry_count, 1);
    assert_eq!(entry.error_message.as_deref(), Some("timeout"));

    assert!(queue.get_next().unwrap().is_none());

    helpers::set_queue_column(&pool, "abc123", "next_retry_at", "2000-01-01T00:00:00.000000Z");
    let retried = queue.get_next().unwrap().unwrap();
    assert_eq!(retried.session_id, "abc123");
    assert_eq!(retried.status, QueueStatus::Processing);
    assert_eq!(retried.retry_count, 1);
}

#[test]
fn entries_are_claimed_oldest_first() {
    let (_tmp, pool) = helpers::test_pool();
    let queue = ConsolidationQueue::new(pool, helpers::queue_config());

    for id in ["s1", "s2", "s3"] {
        queue.add(id, Path::new("/tmp/x.jsonl")).unwrap();
    }

    let order: Vec<String> = std::iter::from_fn(|| queue.get_next().unwrap())
        .map(|e| e.session_id)
        .collect();
    assert_eq!(order, ["s1", "s2", "s3"]);
}

#[test]
fn concurrent_workers_never_claim_the_same_entry() {
    let (_tmp, pool) = helpers::test_pool();
    let queue = ConsolidationQueue::new(pool, helpers::queue_config());
    for i in 0..40 {
        queue.add(&format!("session-{i}"), Path::new("/tmp/s.jsonl")).unwrap();
    }

    let claimed = Arc::new(Mutex::new(Vec::new()));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let queue = queue.clone();
            let claimed = Arc::clone(&claimed);
            thread::spawn(move || {
                while let Some(entry) = queue.get_next().unwrap() {
                    claimed.lock().unwrap().push(entry.session_id);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let claimed = claimed.lock().unwrap();
    let unique: HashSet<&String> = claimed.iter().collect();
    assert_eq!(claimed.len(), 40);
    assert_eq!(unique.len(), 40);
}

#[test]
fn session_is_abandoned_after_max_retries() {
    let (_tmp, pool) = helpers::test_pool();
    let config = QueueConfig {
        max_retries: 2,
        ..QueueConfig::default()
    };
    let queue = ConsolidationQueue::new(pool, config);
    queue.add("s1", Path::new("/tmp/s1.jsonl")).unwrap();

    queue.get_next().unwrap().unwrap();
    let first = queue.mark_failed("s1", "boom", None).unwrap();
    assert!(matches!(first, FailureDisposition::Retry { retry_count: 1, .. }));

    let second = queue.mark_failed("s1", "boom again", None).unwrap();
    assert_eq!(second, FailureDisposition::Abandoned { retry_count: 2 });

    let entry = queue.get("s1").unwrap().unwrap();
    assert_eq!(entry.status, QueueStatus::Abandoned);
    assert!(entry.abandoned_at.is_some());
    assert!(entry.next_retry_at.is_none());

    // Operator reset restores a fresh budget.
    assert!(queue.requeue("s1").unwrap());
    let entry = queue.get_next().unwrap().unwrap();
    assert_eq!(entry.session_id, "s1");
    assert_eq!(entry.retry_count, 0);
}

#[test]
fn defer_does_not_consume_a_retry() {
    let (_tmp, pool) = helpers::test_pool();
    let queue = ConsolidationQueue::new(pool, helpers::queue_config());
    queue.add("s1", Path::new("/tmp/s1.jsonl")).unwrap();
    let claim = queue.get_next().unwrap().unwrap();

    assert!(queue.defer(&claim, Duration::from_secs(600), "breaker open").unwrap());

    let entry = queue.get("s1").unwrap().unwrap();
    assert_eq!(entry.status, QueueStatus::Failed);
    assert_eq!(entry.retry_count, 0);
    assert!(entry.next_retry_at.is_some());
    assert!(queue.get_next().unwrap().is_none());
}

#[test]
fn stale_processing_entries_are_requeued() {
    let (_tmp, pool) = helpers::test_pool();
    let queue = ConsolidationQueue::new(Arc::clone(&pool), helpers::queue_config());
    queue.add("orphan", Path::new("/tmp/o.jsonl")).unwrap();
    queue.add("fresh", Path::new("/tmp/f.jsonl")).unwrap();
    queue.get_next().unwrap().unwrap();
    queue.get_next().unwrap().unwrap();

    helpers::set_queue_column(&pool, "orphan", "started_at", "2000-01-01T00:00:00.000000Z");

    let sweep = queue.requeue_stale(Duration::from_secs(3600)).unwrap();
    assert_eq!(sweep.requeued, vec!["orphan".to_string()]);
    assert!(sweep.abandoned.is_empty());

    let orphan = queue.get("orphan").unwrap().unwrap();
    assert_eq!(orphan.status, QueueStatus::Pending);
    assert_eq!(orphan.retry_count, 1);
    assert!(orphan.started_at.is_none());
    assert!(orphan.error_message.is_some());
    assert_eq!(queue.get("fresh").unwrap().unwrap().status, QueueStatus::Processing);
}

#[test]
fn repeatedly_stale_entry_is_abandoned_at_max_retries() {
    let (_tmp, pool) = helpers::test_pool();
    let config = QueueConfig {
        max_retries: 2,
        ..helpers::queue_config()
    };
    let queue = ConsolidationQueue::new(Arc::clone(&pool), config);
    queue.add("crasher", Path::new("/tmp/c.jsonl")).unwrap();

    for expected_retries in 1..=2 {
        queue.get_next().unwrap().unwrap();
        helpers::set_queue_column(&pool, "crasher", "started_at", "2000-01-01T00:00:00.000000Z");
        let sweep = queue.requeue_stale(Duration::from_secs(3600)).unwrap();
        let entry = queue.get("crasher").unwrap().unwrap();
        assert_eq!(entry.retry_count, expected_retries);
        if expected_retries < 2 {
            assert_eq!(sweep.requeued, vec!["crasher".to_string()]);
            assert_eq!(entry.status, QueueStatus::Pending);
        } else {
            assert_eq!(sweep.abandoned, vec!["crasher".to_string()]);
            assert_eq!(entry.status, QueueStatus::Abandoned);
            assert!(entry.abandoned_at.is_some());
        }
    }
    assert!(queue.get_next().unwrap().is_none());
}

#[test]
fn lost_claim_cannot_finish_the_entry() {
    let (_tmp, pool) = helpers::test_pool();
    let queue = ConsolidationQueue::new(pool, helpers::queue_config());
    queue.add("s1", Path::new("/tmp/s1.jsonl")).unwrap();

    let first = queue.get_next().unwrap().unwrap();
    thread::sleep(Duration::from_millis(5));
    assert_eq!(queue.requeue_stale(Duration::ZERO).unwrap().requeued, vec!["s1".to_string()]);
    let second = queue.get_next().unwrap().unwrap();
    assert_ne!(first.started_at, second.started_at);

    assert!(queue.complete_claim(&second, &[]).unwrap());
    assert!(!queue.complete_claim(&first, &[]).unwrap());
    assert!(queue.fail_claim(&first, "late failure", None).unwrap().is_none());
    assert!(!queue.defer(&first, Duration::from_secs(60), "late deferral").unwrap());

    let entry = queue.get("s1").unwrap().unwrap();
    assert_eq!(entry.status, QueueStatus::Completed);
    assert!(entry.error_message.is_none());
}

#[test]
fn cleanup_removes_only_old_finished_entries() {
    let (_tmp, pool) = helpers::test_pool();
    let queue = ConsolidationQueue::new(Arc::clone(&pool), helpers::queue_config());
    for id in ["old", "recent", "waiting"] {
        queue.add(id, Path::new("/tmp/s.jsonl")).unwrap();
    }
    queue.get_next().unwrap().unwrap();
    queue.get_next().unwrap().unwrap();
    queue.mark_completed("old").unwrap();
    queue.mark_completed("recent").unwrap();
    helpers::set_queue_column(&pool, "old", "completed_at", "2000-01-01T00:00:00.000000Z");

    assert_eq!(queue.cleanup_old(30).unwrap(), 1);
    assert!(queue.get("old").unwrap().is_none());
    assert!(queue.get("recent").unwrap().is_some());
    assert!(queue.get("waiting").unwrap().is_some());
}

#[test]
fn stats_count_entries_by_status() {
    let (_tmp, pool) = helpers::test_pool();
    let queue = ConsolidationQueue::new(pool, helpers::queue_config());
    for id in ["a", "b", "c", "d"] {
        queue.add(id, Path::new("/tmp/s.jsonl")).unwrap();
    }
    queue.get_next().unwrap().unwrap(); // a
    queue.mark_completed("a").unwrap();
    queue.get_next().unwrap().unwrap(); // b
    queue.mark_failed("b", "err", None).unwrap();
    queue.get_next().unwrap().unwrap(); // c stays processing

    let stats = queue.stats().unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.processing, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.abandoned, 0);
    assert!(stats.oldest_pending.is_some());

    let failed = queue.list(Some(QueueStatus::Failed), 10).unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].session_id, "b");
}
