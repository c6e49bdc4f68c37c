use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use sedaq::core::error::SinkError;
use sedaq::core::predicate::{
    EnqueuePredicate, QueueState, RateLimitingPredicate, ThresholdEnqueuePredicate,
};
use sedaq::core::queue::{DefaultQueue, FixedSizeQueue, Occupancy, Queue, Sink, Source};

mod common;

fn both_kinds() -> Vec<(&'static str, Arc<dyn Queue<u32>>)> {
    vec![
        ("default", Arc::new(DefaultQueue::<u32>::new()) as Arc<dyn Queue<u32>>),
        (
            "fixed",
            Arc::new(FixedSizeQueue::<u32>::new(64).unwrap()) as Arc<dyn Queue<u32>>,
        ),
    ]
}

#[test]
fn threshold_accepts_iff_below_limit() {
    for limit in 1..6usize {
        let predicate = ThresholdEnqueuePredicate::new(limit);
        for size in 0..6usize {
            for n in 1..4usize {
                let state = QueueState {
                    size,
                    max_size: None,
                };
                assert_eq!(
                    predicate.accept(n, &state),
                    size + n < limit,
                    "limit={limit} size={size} n={n}"
                );
            }
        }
    }
    let unlimited = ThresholdEnqueuePredicate::new(0);
    let state = QueueState {
        size: 1_000_000,
        max_size: None,
    };
    assert!(unlimited.accept(1_000, &state));
}

#[test]
fn prepare_abort_restores_size_on_both_kinds() {
    common::init_logging();
    for (kind, q) in both_kinds() {
        q.enqueue(7).unwrap();
        let before = q.size();
        let mut prepared = q.prepare_enqueue(vec![1, 2]).unwrap();
        assert_eq!(q.size(), before + 2, "{kind}");
        prepared.abort().unwrap();
        drop(prepared);
        assert_eq!(q.size(), before, "{kind}");
        assert_eq!(q.dequeue_all(), vec![7], "{kind}");
    }
}

#[test]
fn prepare_commit_appends_in_order_on_both_kinds() {
    for (kind, q) in both_kinds() {
        q.enqueue(0).unwrap();
        let before = q.size();
        let mut prepared = q.prepare_enqueue(vec![1, 2]).unwrap();
        prepared.commit().unwrap();
        drop(prepared);
        assert_eq!(q.size(), before + 2, "{kind}");
        assert_eq!(q.dequeue(), Some(0), "{kind}");
        assert_eq!(q.dequeue(), Some(1), "{kind}");
        assert_eq!(q.dequeue(), Some(2), "{kind}");
        assert_eq!(q.dequeue(), None, "{kind}");
    }
}

#[test]
fn reuse_of_a_prepared_enqueue_is_an_error() {
    for (kind, q) in both_kinds() {
        let mut prepared = q.prepare_enqueue(vec![1, 2]).unwrap();
        prepared.commit().unwrap();
        assert!(
            matches!(prepared.commit(), Err(SinkError::AlreadyProcessed)),
            "{kind}"
        );
        assert!(
            matches!(prepared.abort(), Err(SinkError::AlreadyProcessed)),
            "{kind}"
        );
        drop(prepared);
        assert_eq!(q.dequeue_all(), vec![1, 2], "{kind}");
        assert_eq!(q.size(), 0, "{kind}");
    }
}

#[test]
fn capacity_queries_distinguish_bounded_and_unbounded() {
    let unbounded = DefaultQueue::<u8>::new();
    assert_eq!(unbounded.max_size(), None);
    assert_eq!(unbounded.can_accept(), None);
    assert!(!unbounded.is_full());

    let bounded = FixedSizeQueue::<u8>::new(2).unwrap();
    bounded.enqueue(1).unwrap();
    assert_eq!(bounded.can_accept(), Some(1));
    bounded.enqueue(2).unwrap();
    assert!(bounded.is_full());
    assert_eq!(bounded.can_accept(), Some(0));
}

#[test]
fn token_bucket_admits_depth_then_refills() {
    let q = DefaultQueue::<u32>::with_predicate(Arc::new(RateLimitingPredicate::new(100.0, 5).unwrap()));
    for i in 0..5u32 {
        assert!(q.try_enqueue(i), "element {i} should be admitted");
    }
    assert!(!q.try_enqueue(5));

    // 100/s regenerates the whole bucket within 50ms
    thread::sleep(Duration::from_millis(80));
    for i in 0..5u32 {
        assert!(q.try_enqueue(i), "element {i} should be admitted after refill");
    }
    assert!(!q.try_enqueue(5));
    assert_eq!(q.size(), 10);
}

#[test]
fn concurrent_producers_and_consumers_lose_nothing() {
    common::init_logging();
    const PRODUCERS: u32 = 4;
    const PER_PRODUCER: u32 = 2_000;

    let q = Arc::new(FixedSizeQueue::<u32>::new(128).unwrap());
    q.set_timeout(Duration::from_millis(5));
    let received = Arc::new(AtomicUsize::new(0));
    let checksum = Arc::new(AtomicUsize::new(0));
    let producing = Arc::new(AtomicBool::new(true));

    let consumers: Vec<_> = (0..3)
        .map(|_| {
            let q = Arc::clone(&q);
            let received = Arc::clone(&received);
            let checksum = Arc::clone(&checksum);
            let producing = Arc::clone(&producing);
            thread::spawn(move || loop {
                let batch = q.dequeue_many(16);
                if batch.is_empty() {
                    if !producing.load(Ordering::Acquire) && q.size() == 0 {
                        break;
                    }
                    thread::yield_now();
                    continue;
                }
                received.fetch_add(batch.len(), Ordering::SeqCst);
                let sum: usize = batch.iter().map(|&v: &u32| v as usize).sum();
                checksum.fetch_add(sum, Ordering::SeqCst);
            })
        })
        .collect();

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let value = p * PER_PRODUCER + i;
                    if i % 3 == 0 {
                        // two-phase path, retried until there is room
                        loop {
                            match q.prepare_enqueue(vec![value]) {
                                Ok(mut prepared) => {
                                    prepared.commit().unwrap();
                                    break;
                                }
                                Err(e) => {
                                    assert!(e.is_full());
                                    thread::yield_now();
                                }
                            }
                        }
                    } else {
                        while !q.try_enqueue(value) {
                            thread::yield_now();
                        }
                    }
                }
            })
        })
        .collect();

    for producer in producers {
        producer.join().unwrap();
    }
    producing.store(false, Ordering::Release);
    for consumer in consumers {
        consumer.join().unwrap();
    }

    let total = (PRODUCERS * PER_PRODUCER) as usize;
    assert_eq!(received.load(Ordering::SeqCst), total);
    assert_eq!(checksum.load(Ordering::SeqCst), total * (total - 1) / 2);
    assert_eq!(q.size(), 0);
}
