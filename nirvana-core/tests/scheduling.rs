// Copyright 2025-Present the Nirvana project contributors.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end scheduling scenarios: deadline-ordered hand-off, deadline
//! propagation through async calls, mutual exclusion, cancellation.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use nirvana_core::{
    CoreError, Deadline, Event, ExecDomain, MemContext, RestrictedMode, Runnable, SyncDomain,
};

fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    panic!("condition not reached in time");
}

/// Holds a domain until told to leave, reporting when it is in.
fn spawn_holder(sd: &Arc<SyncDomain>) -> (mpsc::Sender<()>, mpsc::Receiver<()>) {
    let (held_tx, held_rx) = mpsc::channel();
    let (leave_tx, leave_rx) = mpsc::channel::<()>();
    let sd = sd.clone();
    ExecDomain::spawn(
        Box::new(move || {
            let ed = ExecDomain::current().unwrap();
            sd.enter(&ed).unwrap();
            held_tx.send(()).unwrap();
            leave_rx.recv().unwrap();
            sd.leave(&ed).unwrap();
        }),
        Deadline::INFINITE,
        MemContext::create(),
    )
    .unwrap();
    (leave_tx, held_rx)
}

#[test]
fn contended_entry_resolves_in_deadline_order() {
    let sd = SyncDomain::new(MemContext::create());
    let (leave_tx, held_rx) = spawn_holder(&sd);
    held_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let (order_tx, order_rx) = mpsc::channel();
    for deadline in [100u64, 10, 50] {
        let sd = sd.clone();
        let order_tx = order_tx.clone();
        ExecDomain::spawn(
            Box::new(move || {
                let ed = ExecDomain::current().unwrap();
                sd.enter(&ed).unwrap();
                order_tx.send(deadline).unwrap();
                sd.leave(&ed).unwrap();
            }),
            Deadline::from_raw(deadline),
            MemContext::create(),
        )
        .unwrap();
    }

    wait_for(|| sd.waiting() == 3);
    leave_tx.send(()).unwrap();

    let order: Vec<u64> = (0..3)
        .map(|_| order_rx.recv_timeout(Duration::from_secs(5)).unwrap())
        .collect();
    assert_eq!(order, vec![10, 50, 100]);
}

#[test]
fn async_call_propagates_the_tighter_deadline() {
    let sd = SyncDomain::new(MemContext::create());
    let (tx, rx) = mpsc::channel();

    // From an execution domain with deadline 50, schedule work at 1000:
    // the runnable must run with the caller's 50.
    let sd2 = sd.clone();
    ExecDomain::spawn(
        Box::new(move || {
            let tx = tx.clone();
            sd2.async_call(
                Box::new(move || {
                    let d = ExecDomain::current().unwrap().deadline();
                    tx.send(d.raw()).unwrap();
                }),
                Deadline::from_raw(1000),
                None,
            )
            .unwrap();
        }),
        Deadline::from_raw(50),
        MemContext::create(),
    )
    .unwrap();

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 50);
}

#[test]
fn only_one_domain_runs_inside_at_a_time() {
    let sd = SyncDomain::new(MemContext::create());
    let inside = Arc::new(AtomicBool::new(false));
    let entries = Arc::new(AtomicUsize::new(0));
    let violations = Arc::new(AtomicUsize::new(0));
    const DOMAINS: usize = 6;
    const ROUNDS: usize = 25;

    let (done_tx, done_rx) = mpsc::channel();
    for _ in 0..DOMAINS {
        let sd = sd.clone();
        let inside = inside.clone();
        let entries = entries.clone();
        let violations = violations.clone();
        let done_tx = done_tx.clone();
        ExecDomain::spawn(
            Box::new(move || {
                let ed = ExecDomain::current().unwrap();
                for _ in 0..ROUNDS {
                    sd.enter(&ed).unwrap();
                    if inside.swap(true, Ordering::SeqCst) {
                        violations.fetch_add(1, Ordering::SeqCst);
                    }
                    entries.fetch_add(1, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_micros(50));
                    inside.store(false, Ordering::SeqCst);
                    sd.leave(&ed).unwrap();
                }
                done_tx.send(()).unwrap();
            }),
            Deadline::INFINITE,
            MemContext::create(),
        )
        .unwrap();
    }
    drop(done_tx);
    for _ in 0..DOMAINS {
        done_rx.recv_timeout(Duration::from_secs(30)).unwrap();
    }
    assert_eq!(violations.load(Ordering::SeqCst), 0);
    assert_eq!(entries.load(Ordering::SeqCst), DOMAINS * ROUNDS);
}

#[test]
fn cancelled_waiter_gets_its_failure_hook() {
    struct Job {
        ran: mpsc::Sender<&'static str>,
    }
    impl Runnable for Job {
        fn run(&mut self) {
            self.ran.send("ran").unwrap();
        }
        fn on_exception(&mut self, error: CoreError) {
            assert!(matches!(error, CoreError::Cancelled));
            self.ran.send("cancelled").unwrap();
        }
    }

    let sd = SyncDomain::new(MemContext::create());
    let (leave_tx, held_rx) = spawn_holder(&sd);
    held_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let (tx, rx) = mpsc::channel();
    let waiter = sd
        .async_call(Box::new(Job { ran: tx }), Deadline::from_raw(5), None)
        .unwrap();

    wait_for(|| sd.waiting() == 1);
    assert!(sd.cancel(&waiter).unwrap());
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "cancelled");

    // The domain is still healthy.
    leave_tx.send(()).unwrap();
    let (tx2, rx2) = mpsc::channel();
    sd.async_call(
        Box::new(move || tx2.send(()).unwrap()),
        Deadline::INFINITE,
        None,
    )
    .unwrap();
    rx2.recv_timeout(Duration::from_secs(5)).unwrap();
}

#[test]
fn shortened_deadline_requeues_a_waiter() {
    let sd = SyncDomain::new(MemContext::create());
    let (leave_tx, held_rx) = spawn_holder(&sd);
    held_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let (order_tx, order_rx) = mpsc::channel();
    let mut waiters = Vec::new();
    for deadline in [100u64, 50] {
        let sd = sd.clone();
        let order_tx = order_tx.clone();
        let ed = ExecDomain::spawn(
            Box::new(move || {
                let ed = ExecDomain::current().unwrap();
                sd.enter(&ed).unwrap();
                order_tx.send(deadline).unwrap();
                sd.leave(&ed).unwrap();
            }),
            Deadline::from_raw(deadline),
            MemContext::create(),
        )
        .unwrap();
        waiters.push(ed);
    }
    wait_for(|| sd.waiting() == 2);

    // Re-key the slower waiter in front of the other.
    assert!(sd.decrease_waiter_deadline(&waiters[0], Deadline::from_raw(10)));
    leave_tx.send(()).unwrap();

    let first = order_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let second = order_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!((first, second), (100, 50)); // tags are the original deadlines
}

#[test]
fn reschedule_yields_to_an_earlier_deadline() {
    let sd = SyncDomain::new(MemContext::create());
    let (order_tx, order_rx) = mpsc::channel();
    let (spawned_tx, spawned_rx) = mpsc::channel();

    let sd2 = sd.clone();
    let order_main = order_tx.clone();
    ExecDomain::spawn(
        Box::new(move || {
            let ed = ExecDomain::current().unwrap();
            sd2.enter(&ed).unwrap();
            order_main.send("first").unwrap();
            // A more urgent arrival queues up while we hold the domain.
            spawned_tx.send(()).unwrap();
            while sd2.waiting() == 0 {
                std::thread::sleep(Duration::from_millis(1));
            }
            ExecDomain::reschedule().unwrap();
            order_main.send("after-yield").unwrap();
            sd2.leave(&ed).unwrap();
        }),
        Deadline::INFINITE,
        MemContext::create(),
    )
    .unwrap();

    spawned_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let order_urgent = order_tx.clone();
    sd.async_call(
        Box::new(move || order_urgent.send("urgent").unwrap()),
        Deadline::from_raw(1),
        None,
    )
    .unwrap();

    let order: Vec<&str> = (0..3)
        .map(|_| order_rx.recv_timeout(Duration::from_secs(5)).unwrap())
        .collect();
    assert_eq!(order, vec!["first", "urgent", "after-yield"]);
}

#[test]
fn module_init_forbids_hopping_domains() {
    let a = SyncDomain::new(MemContext::create());
    let b = SyncDomain::new(MemContext::create());
    let (tx, rx) = mpsc::channel();

    let (a2, b2) = (a.clone(), b.clone());
    ExecDomain::spawn(
        Box::new(move || {
            let ed = ExecDomain::current().unwrap();
            a2.enter(&ed).unwrap();
            ed.set_restricted_mode(RestrictedMode::ClassLibraryInit);
            let refused = b2.enter(&ed).is_err();
            // Re-entry of the held domain stays legal.
            let reenter = a2.enter(&ed).is_ok();
            a2.leave(&ed).unwrap();
            ed.set_restricted_mode(RestrictedMode::Normal);
            a2.leave(&ed).unwrap();
            tx.send((refused, reenter)).unwrap();
        }),
        Deadline::INFINITE,
        MemContext::create(),
    )
    .unwrap();

    let (refused, reenter) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(refused);
    assert!(reenter);
}

#[test]
fn event_wakes_all_waiters() {
    let event = Arc::new(Event::new(false));
    let woken = Arc::new(AtomicUsize::new(0));
    let (done_tx, done_rx) = mpsc::channel();

    for _ in 0..3 {
        let event = event.clone();
        let woken = woken.clone();
        let done_tx = done_tx.clone();
        ExecDomain::spawn(
            Box::new(move || {
                event.wait().unwrap();
                woken.fetch_add(1, Ordering::SeqCst);
                done_tx.send(()).unwrap();
            }),
            Deadline::INFINITE,
            MemContext::create(),
        )
        .unwrap();
    }

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(woken.load(Ordering::SeqCst), 0);
    event.signal();
    for _ in 0..3 {
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }
    assert_eq!(woken.load(Ordering::SeqCst), 3);

    // A wait after the signal returns immediately.
    let event2 = event.clone();
    let (tx, rx) = mpsc::channel();
    ExecDomain::spawn(
        Box::new(move || {
            event2.wait().unwrap();
            tx.send(()).unwrap();
        }),
        Deadline::INFINITE,
        MemContext::create(),
    )
    .unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
}

#[test]
fn event_delivers_errors_to_waiters() {
    let event = Arc::new(Event::new(false));
    let (tx, rx) = mpsc::channel();
    let event2 = event.clone();
    ExecDomain::spawn(
        Box::new(move || {
            let outcome = event2.wait();
            tx.send(outcome.is_err()).unwrap();
        }),
        Deadline::INFINITE,
        MemContext::create(),
    )
    .unwrap();

    std::thread::sleep(Duration::from_millis(20));
    event.signal_error(CoreError::Cancelled);
    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
}

#[test]
fn context_allocations_cross_domains_by_move() {
    // The marshaling pattern: build in the source context's heap, adopt
    // into the receiver's heap at the hand-off point.
    let src = MemContext::create();
    let dst = MemContext::create();

    let p = src.heap().allocate(512).unwrap();
    unsafe { std::ptr::write_bytes(p, 0x42, 512) };
    let moved = dst.heap().move_from(src.heap(), p, 512).unwrap();
    assert_eq!(moved, p);
    assert!(src.heap().empty());
    assert_eq!(unsafe { moved.read_volatile() }, 0x42);
    dst.heap().release(moved, 512).unwrap();
    assert!(dst.heap().empty());
}
