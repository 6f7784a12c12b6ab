mod helpers;

use mnemos::memory::references::{RefType, ReferenceCounter};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

#[test]
fn increments_and_decrements_net_out() {
    let (_tmp, pool) = helpers::test_pool();
    let refs = ReferenceCounter::new(pool);

    for _ in 0..3 {
        refs.increment("mem1", RefType::Relationship).unwrap();
    }
    for _ in 0..2 {
        refs.decrement("mem1", RefType::Relationship).unwrap();
    }

    let counts = refs.get_count("mem1").unwrap();
    assert_eq!(counts.relationship, 1);
    assert_eq!(counts.get(RefType::Relationship), 1);
    assert_eq!(counts.total, 1);
    assert!(refs.is_protected("mem1").unwrap());
}

#[test]
fn decrement_never_goes_negative() {
    let (_tmp, pool) = helpers::test_pool();
    let refs = ReferenceCounter::new(pool);

    assert_eq!(refs.decrement("ghost", RefType::Chunk).unwrap(), 0);
    refs.increment("mem1", RefType::Chunk).unwrap();
    refs.decrement("mem1", RefType::Chunk).unwrap();
    assert_eq!(refs.decrement("mem1", RefType::Chunk).unwrap(), 0);

    assert_eq!(refs.get_count("mem1").unwrap().total, 0);
    assert!(!refs.is_protected("mem1").unwrap());
}

#[test]
fn unknown_memory_has_zero_counts() {
    let (_tmp, pool) = helpers::test_pool();
    let refs = ReferenceCounter::new(pool);
    let counts = refs.get_count("never-seen").unwrap();
    assert_eq!(counts.total, 0);
    assert!(refs.get_zero_ref_memories().unwrap().is_empty());
}

#[test]
fn zero_ref_memories_are_listed_once() {
    let (_tmp, pool) = helpers::test_pool();
    let refs = ReferenceCounter::new(pool);

    refs.increment("kept", RefType::Decision).unwrap();
    refs.increment("dropped", RefType::Decision).unwrap();
    refs.increment("dropped", RefType::Synthesis).unwrap();
    refs.decrement("dropped", RefType::Decision).unwrap();
    refs.decrement("dropped", RefType::Synthesis).unwrap();

    assert_eq!(refs.get_zero_ref_memories().unwrap(), vec!["dropped".to_string()]);
}

#[test]
fn bulk_update_replaces_relationship_counts() {
    let (_tmp, pool) = helpers::test_pool();
    let refs = ReferenceCounter::new(pool);

    refs.increment("stale", RefType::Relationship).unwrap();
    refs.increment("a", RefType::Chunk).unwrap();

    let edges = vec![
        ("a".to_string(), "b".to_string()),
        ("a".to_string(), "c".to_string()),
    ];
    assert_eq!(refs.bulk_update_from_relationships(&edges).unwrap(), 3);

    assert_eq!(refs.get_count("a").unwrap().relationship, 2);
    assert_eq!(refs.get_count("a").unwrap().chunk, 1);
    assert_eq!(refs.get_count("b").unwrap().relationship, 1);
    assert_eq!(refs.get_count("c").unwrap().relationship, 1);
    assert_eq!(refs.get_count("stale").unwrap().total, 0);
    assert_eq!(refs.get_zero_ref_memories().unwrap(), vec!["stale".to_string()]);
}

#[test]
fn dangling_references_point_outside_the_active_set() {
    let (_tmp, pool) = helpers::test_pool();
    let refs = ReferenceCounter::new(pool);

    refs.increment("live", RefType::Relationship).unwrap();
    refs.increment("deleted", RefType::Chunk).unwrap();
    refs.increment("gone", RefType::Synthesis).unwrap();
    refs.decrement("gone", RefType::Synthesis).unwrap();

    let active: HashSet<String> = ["live".to_string()].into_iter().collect();
    let dangling = refs.find_dangling_references(&active).unwrap();

    assert_eq!(dangling.len(), 1);
    assert_eq!(dangling[0].memory_id, "deleted");
    assert_eq!(dangling[0].ref_type, RefType::Chunk);
    assert_eq!(dangling[0].ref_count, 1);
}

#[test]
fn concurrent_increments_are_not_lost() {
    let (_tmp, pool) = helpers::test_pool();
    let refs = ReferenceCounter::new(Arc::clone(&pool));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let refs = refs.clone();
            thread::spawn(move || {
                for _ in 0..25 {
                    refs.increment("hot", RefType::Relationship).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(refs.get_count("hot").unwrap().relationship, 100);
}

#[test]
fn summary_counts_protected_and_unreferenced() {
    let (_tmp, pool) = helpers::test_pool();
    let refs = ReferenceCounter::new(pool);

    refs.increment("a", RefType::Relationship).unwrap();
    refs.increment("a", RefType::Chunk).unwrap();
    refs.increment("b", RefType::Chunk).unwrap();
    refs.decrement("b", RefType::Chunk).unwrap();

    let summary = refs.summary().unwrap();
    assert_eq!(summary.tracked_memories, 2);
    assert_eq!(summary.protected, 1);
    assert_eq!(summary.unreferenced, 1);
    assert_eq!(summary.by_type["relationship"], 1);
    assert_eq!(summary.by_type["chunk"], 1);
    assert_eq!(summary.by_type["decision"], 0);
}
