use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use super::*;

#[test]
fn fifo_order() {
    let q = BoundedQueue::new(8);
    for i in 0..8 {
        q.push(i).unwrap();
    }
    let out: Vec<_> = (0..8).map(|_| q.pop().unwrap()).collect();
    assert_eq!(out, (0..8).collect::<Vec<_>>());
}

#[test]
fn occupancy_never_exceeds_capacity() {
    let q = Arc::new(BoundedQueue::new(4));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let producers: Vec<_> = (0..3)
        .map(|p| {
            let q = q.clone();
            let max_seen = max_seen.clone();
            thread::spawn(move || {
                for i in 0..200 {
                    q.push(p * 1000 + i).unwrap();
                    max_seen.fetch_max(q.len(), Ordering::Relaxed);
                }
            })
        })
        .collect();

    let mut last = [None::<usize>; 3];
    for _ in 0..600 {
        let v = q.pop().unwrap();
        max_seen.fetch_max(q.len(), Ordering::Relaxed);
        let (p, i) = (v / 1000, v % 1000);
        // Each producer is individually FIFO.
        assert!(last[p].map_or(true, |prev| prev < i));
        last[p] = Some(i);
    }
    for p in producers {
        p.join().unwrap();
    }
    assert!(max_seen.load(Ordering::Relaxed) <= 4);
}

#[test]
fn full_push_returns_after_a_pop() {
    let q = Arc::new(BoundedQueue::new(1));
    q.push(1).unwrap();
    let q2 = q.clone();
    let blocked = thread::spawn(move || q2.push(2).is_ok());
    thread::sleep(Duration::from_millis(20));
    assert_eq!(q.pop().unwrap(), 1);
    assert!(blocked.join().unwrap());
    assert_eq!(q.pop().unwrap(), 2);
}

#[test]
fn close_releases_a_blocked_producer() {
    let q = Arc::new(BoundedQueue::new(1));
    q.push(1).unwrap();
    let q2 = q.clone();
    let blocked = thread::spawn(move || matches!(q2.push(2), Err(PushError::Closed(2))));
    thread::sleep(Duration::from_millis(20));
    q.close();
    assert!(blocked.join().unwrap());
    assert_eq!(q.pop(), Err(PopError::Closed));
}

#[test]
fn interrupt_abandons_blocked_pushes_only() {
    let q = Arc::new(BoundedQueue::new(1));
    q.push(1).unwrap();
    let q2 = q.clone();
    let blocked = thread::spawn(move || matches!(q2.push(2), Err(PushError::Interrupted(2))));
    thread::sleep(Duration::from_millis(20));
    q.interrupt_pushes();
    assert!(blocked.join().unwrap());

    assert_eq!(q.len(), 1);
    assert_eq!(q.pop().unwrap(), 1);
    q.push(3).unwrap();
    assert_eq!(q.pop().unwrap(), 3);
}

#[test]
fn timeouts() {
    let q = BoundedQueue::new(1);
    assert_eq!(q.pop_timeout(Duration::from_millis(5)), Err(PopError::Timeout));
    q.push(1).unwrap();
    assert!(matches!(
        q.push_timeout(2, Duration::from_millis(5)),
        Err(PushError::Timeout(2))
    ));
    assert!(q.try_push(3).is_err());
}

#[test]
fn pause_withholds_items_without_losing_them() {
    let q = Arc::new(BoundedQueue::new(8));
    q.set_paused(true);
    for i in 0..5 {
        q.push(i).unwrap();
    }
    assert_eq!(q.pop_timeout(Duration::from_millis(10)), Err(PopError::Timeout));
    assert_eq!(q.len(), 5);

    let q2 = q.clone();
    let consumer = thread::spawn(move || (0..5).map(|_| q2.pop().unwrap()).collect::<Vec<_>>());
    thread::sleep(Duration::from_millis(10));
    q.set_paused(false);
    assert_eq!(consumer.join().unwrap(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn purge_and_reopen() {
    let q = BoundedQueue::new(4);
    q.push("a").unwrap();
    q.push("b").unwrap();
    assert_eq!(q.purge(), 2);
    q.close();
    assert!(q.is_closed());
    q.reopen();
    q.push("c").unwrap();
    assert_eq!(q.pop(), Ok("c"));
}
