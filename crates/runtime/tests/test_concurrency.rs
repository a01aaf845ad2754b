//! Cross-task behavior of the runtime surface: shared stacks, blocking
//! takes under cancellation, and the spawn queue end to end.

use serial_test::serial;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use ual_runtime::{workqueue, Context, Perspective, Stack, TakeResult};

#[test]
fn test_fifo_order_single_producer_single_consumer() {
    let s: Arc<Stack<i64>> = Arc::new(Stack::new(Perspective::Fifo));
    let producer = s.clone();
    let handle = std::thread::spawn(move || {
        for v in 1..=100 {
            producer.push(v);
        }
    });
    let mut seen = Vec::new();
    while seen.len() < 100 {
        match s.take(1000) {
            TakeResult::Value(v) => seen.push(v),
            other => panic!("unexpected take result: {:?}", other),
        }
    }
    handle.join().unwrap();
    assert_eq!(seen, (1..=100).collect::<Vec<_>>());
}

#[test]
fn test_select_style_winner_cancels_losers() {
    let a: Arc<Stack<i64>> = Arc::new(Stack::new(Perspective::Lifo));
    let b: Arc<Stack<i64>> = Arc::new(Stack::new(Perspective::Lifo));
    let ctx = Context::with_cancel();
    let (tx, rx) = std::sync::mpsc::channel();

    for (idx, stack) in [a.clone(), b.clone()].into_iter().enumerate() {
        let tx = tx.clone();
        let ctx = ctx.clone();
        std::thread::spawn(move || match stack.take_with_context(&ctx, 0) {
            TakeResult::Value(v) => {
                let _ = tx.send((idx, v));
            }
            TakeResult::Cancelled => {}
            TakeResult::Timeout => unreachable!("no timeout configured"),
        });
    }
    drop(tx);

    std::thread::sleep(Duration::from_millis(20));
    a.push(42);
    let (idx, v) = rx.recv().unwrap();
    ctx.cancel();
    assert_eq!((idx, v), (0, 42));
    // The loser observed cancellation and sent nothing.
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn test_take_timeout_then_value() {
    let s: Arc<Stack<i64>> = Arc::new(Stack::new(Perspective::Lifo));
    assert_eq!(s.take(20), TakeResult::Timeout);
    s.push(7);
    assert_eq!(s.take(20), TakeResult::Value(7));
}

#[test]
#[serial]
fn test_spawn_queue_runs_on_new_tasks() {
    let queue = workqueue::global();
    queue.clear();
    let hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let hits = hits.clone();
        queue.push(Arc::new(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        }));
    }
    assert_eq!(queue.len(), 3);

    // peek play: runs without removing
    workqueue::run_task(queue.peek().unwrap());
    // pop play: removes then runs
    workqueue::run_task(queue.pop().unwrap());
    assert_eq!(queue.len(), 2);

    assert!(workqueue::wait_idle(2000));
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    queue.clear();
    assert!(queue.is_empty());
}

#[test]
#[serial]
fn test_spawned_panic_does_not_poison_program() {
    let queue = workqueue::global();
    queue.clear();
    queue.push(Arc::new(|| panic!("task failure")));
    workqueue::run_task(queue.pop().unwrap());
    assert!(workqueue::wait_idle(2000));
}

#[test]
fn test_shared_stack_capacity_under_contention() {
    let s: Arc<Stack<i64>> = Arc::new(Stack::with_capacity(Perspective::Lifo, Some(50)));
    let mut handles = Vec::new();
    let accepted = Arc::new(AtomicUsize::new(0));
    for _ in 0..4 {
        let s = s.clone();
        let accepted = accepted.clone();
        handles.push(std::thread::spawn(move || {
            for v in 0..25 {
                if s.try_push(v).is_ok() {
                    accepted.fetch_add(1, Ordering::SeqCst);
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(accepted.load(Ordering::SeqCst), 50);
    assert_eq!(s.len(), 50);
}
