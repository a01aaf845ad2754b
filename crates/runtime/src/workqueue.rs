//! The spawn work queue
//!
//! `@spawn < { body }` appends a closure to a program-global queue;
//! `@spawn pop play` removes one and runs it on a fresh task. Tasks are
//! `Arc<dyn Fn>` rather than `FnOnce` because `peek play` runs the top
//! closure without removing it, so a task must be runnable more than once.
//!
//! Active-task accounting uses a lock-free counter for the spawn/complete
//! hot path and a mutex/condvar pair only for the cold shutdown wait.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::Duration;

/// A queued spawn body.
pub type Task = Arc<dyn Fn() + Send + Sync + 'static>;

/// Number of tasks currently running (spawned but not yet complete).
static ACTIVE_TASKS: AtomicUsize = AtomicUsize::new(0);
static IDLE_CONDVAR: Condvar = Condvar::new();
static IDLE_MUTEX: Mutex<()> = Mutex::new(());

static GLOBAL_QUEUE: OnceLock<WorkQueue> = OnceLock::new();

/// The program-global work queue backing `@spawn`.
pub fn global() -> &'static WorkQueue {
    GLOBAL_QUEUE.get_or_init(WorkQueue::new)
}

/// A lock-guarded vector of pending closures, stack-ordered: `pop`
/// removes the most recently pushed task.
pub struct WorkQueue {
    tasks: Mutex<Vec<Task>>,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        WorkQueue {
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, Vec<Task>> {
        match self.tasks.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn push(&self, task: Task) {
        self.locked().push(task);
    }

    /// Remove and return the most recently pushed task.
    pub fn pop(&self) -> Option<Task> {
        self.locked().pop()
    }

    /// The most recently pushed task, without removing it.
    pub fn peek(&self) -> Option<Task> {
        self.locked().last().cloned()
    }

    pub fn len(&self) -> usize {
        self.locked().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locked().is_empty()
    }

    pub fn clear(&self) {
        self.locked().clear();
    }
}

/// Run a task on a newly created concurrent task (never inline).
///
/// A panic inside the body is the task's own failure: it is reported on
/// stderr and does not take the rest of the program down.
pub fn run_task(task: Task) {
    ACTIVE_TASKS.fetch_add(1, Ordering::SeqCst);
    std::thread::spawn(move || {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| task()));
        if let Err(cause) = result {
            eprintln!("spawned task panicked: {}", crate::panic::panic_message(&cause));
        }
        ACTIVE_TASKS.fetch_sub(1, Ordering::SeqCst);
        IDLE_CONDVAR.notify_all();
    });
}

/// Number of tasks currently running.
pub fn active_tasks() -> usize {
    ACTIVE_TASKS.load(Ordering::SeqCst)
}

/// Block until every spawned task has completed or `timeout_ms` elapses
/// (`0` = wait indefinitely). Returns true if the count reached zero.
pub fn wait_idle(timeout_ms: u64) -> bool {
    let deadline = if timeout_ms > 0 {
        Some(std::time::Instant::now() + Duration::from_millis(timeout_ms))
    } else {
        None
    };
    let mut guard = match IDLE_MUTEX.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    loop {
        if ACTIVE_TASKS.load(Ordering::SeqCst) == 0 {
            return true;
        }
        let wait = match deadline {
            Some(d) => {
                let now = std::time::Instant::now();
                if now >= d {
                    return false;
                }
                (d - now).min(Duration::from_millis(50))
            }
            None => Duration::from_millis(50),
        };
        guard = match IDLE_CONDVAR.wait_timeout(guard, wait) {
            Ok((g, _)) => g,
            Err(poisoned) => poisoned.into_inner().0,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_is_stack_ordered() {
        let q = WorkQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let log = log.clone();
            q.push(Arc::new(move || log.lock().unwrap().push(tag)));
        }
        assert_eq!(q.len(), 2);
        q.pop().unwrap()();
        assert_eq!(log.lock().unwrap().as_slice(), &["second"]);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_peek_does_not_remove() {
        let q = WorkQueue::new();
        q.push(Arc::new(|| {}));
        assert!(q.peek().is_some());
        assert_eq!(q.len(), 1);
        q.clear();
        assert!(q.is_empty());
    }
}
