use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use super::*;
use crate::message::Action;
use crate::pad::MessageConsumer;

#[test]
fn walks_the_happy_path() {
    let lc = Lifecycle::new("test");
    assert_eq!(lc.phase(), Phase::Uninitialized);
    lc.begin(&[Phase::Uninitialized], Phase::Initialized)
        .unwrap()
        .commit();
    lc.begin(&[Phase::Initialized], Phase::Opened).unwrap().commit();
    lc.begin(&[Phase::Opened], Phase::Running).unwrap().commit();
    assert!(lc.phase().has_worker());
}

#[test]
fn redundant_transition_is_rejected() {
    let lc = Lifecycle::new("test");
    lc.begin(&[Phase::Uninitialized], Phase::Initialized)
        .unwrap()
        .commit();
    let err = lc
        .begin(&[Phase::Uninitialized], Phase::Initialized)
        .err()
        .unwrap();
    assert_eq!(err.code(), 100);
    assert_eq!(lc.phase(), Phase::Initialized);
}

#[test]
fn dropped_transition_rolls_back() {
    let lc = Lifecycle::new("test");
    {
        let _t = lc.begin(&[Phase::Uninitialized], Phase::Initialized).unwrap();
        assert!(lc.is_transitioning());
    }
    assert!(!lc.is_transitioning());
    assert_eq!(lc.phase(), Phase::Uninitialized);
}

#[test]
fn commit_as_overrides_the_target() {
    let lc = Lifecycle::new("test");
    lc.begin(&[Phase::Uninitialized], Phase::Opened)
        .unwrap()
        .commit_as(Phase::Initialized);
    assert_eq!(lc.phase(), Phase::Initialized);
}

#[test]
fn concurrent_callers_are_serialized() {
    let lc = Arc::new(Lifecycle::new("race"));
    let winners = Arc::new(AtomicUsize::new(0));
    let threads: Vec<_> = (0..8)
        .map(|_| {
            let lc = lc.clone();
            let winners = winners.clone();
            thread::spawn(move || {
                if let Ok(t) = lc.begin(&[Phase::Uninitialized], Phase::Initialized) {
                    thread::sleep(Duration::from_millis(5));
                    winners.fetch_add(1, Ordering::SeqCst);
                    t.commit();
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }
    assert_eq!(winners.load(Ordering::SeqCst), 1);
    assert_eq!(lc.phase(), Phase::Initialized);
}

#[test]
fn worker_hands_back_its_state() {
    let w = Worker::spawn("w", || vec![1, 2, 3]).unwrap();
    assert_eq!(w.join(), Some(vec![1, 2, 3]));
}

#[test]
fn signal_wakes_waiters() {
    let s = Arc::new(Signal::new());
    let seen = s.current();
    let s2 = s.clone();
    let t = thread::spawn(move || s2.wait_past(seen, Duration::from_secs(5)));
    thread::sleep(Duration::from_millis(10));
    s.notify();
    assert_eq!(t.join().unwrap(), seen + 1);
    assert_eq!(s.wait_past(seen + 1, Duration::from_millis(5)), seen + 1);
}

#[test]
fn last_error_is_recorded() {
    let lc = Lifecycle::new("test");
    assert!(lc.last_error().is_none());
    lc.record_error("device lost");
    assert_eq!(lc.last_error().as_deref(), Some("device lost"));
    lc.clear_error();
    assert!(lc.last_error().is_none());
}

/// Consumer that parks deliveries in a full queue until interrupted.
struct Backlog {
    queue: crate::queue::BoundedQueue<Message>,
    dropped: AtomicUsize,
}

impl MessageConsumer for Backlog {
    fn consume(&self, _pad: PadId, message: Message) {
        if self.queue.push(message).is_err() {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn interrupt(&self, _pad: PadId) {
        self.queue.interrupt_pushes();
    }
}

#[test]
fn shut_gate_drops_later_deliveries() {
    let graph = PadGraph::new();
    let out = graph.create_output_pad("src", None);
    let gate = OutputGate::new();
    assert!(!gate.produce(&graph, out, Message::control(Action::Start)));
    gate.open();
    assert!(gate.is_open());
    gate.shut(&graph, &[out]);
    assert!(gate.enter().is_none());
}

#[test]
fn shut_interrupts_a_blocked_delivery() {
    let graph = PadGraph::new();
    let out = graph.create_output_pad("src", None);
    let backlog = Arc::new(Backlog {
        queue: crate::queue::BoundedQueue::new(1),
        dropped: AtomicUsize::new(0),
    });
    let consumer: Arc<dyn MessageConsumer> = backlog.clone();
    let input = graph.create_input_pad("sink", None, Arc::downgrade(&consumer));
    graph.connect(out, input).unwrap();

    let gate = Arc::new(OutputGate::new());
    gate.open();
    let sender = {
        let graph = graph.clone();
        let gate = gate.clone();
        thread::spawn(move || {
            let mut sent = 0;
            while gate.produce(&graph, out, Message::control(Action::Start)) {
                sent += 1;
            }
            sent
        })
    };
    while backlog.queue.is_empty() {
        thread::sleep(Duration::from_millis(1));
    }
    thread::sleep(Duration::from_millis(10));
    gate.shut(&graph, &[out]);
    assert_eq!(backlog.dropped.load(Ordering::SeqCst), 1);
    assert_eq!(sender.join().unwrap(), 2);
    assert_eq!(backlog.queue.len(), 1);
}
