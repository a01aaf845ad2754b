//! Per-task execution environment
//!
//! Each task (the main task and every spawned closure) owns an `Env`:
//! its private `dstack`/`rstack` pair and the consider `(status, value)`
//! state. Threading the environment through generated call frames keeps
//! consider state task-local without any process-global mutable state.

use crate::stack::{Perspective, Stack};
use crate::value::Value;

/// The environment generated functions receive as their first argument.
#[derive(Debug)]
pub struct Env {
    /// The Forth-style data stack, private to this task.
    pub dstack: Stack<i64>,
    /// The return stack, private to this task.
    pub rstack: Stack<i64>,
    /// Current consider status label.
    pub status: String,
    /// Payload attached by `status:label(value)`, if any.
    pub status_value: Option<Value>,
}

impl Default for Env {
    fn default() -> Self {
        Self::new()
    }
}

impl Env {
    pub fn new() -> Env {
        Env {
            dstack: Stack::new(Perspective::Lifo),
            rstack: Stack::new(Perspective::Lifo),
            status: String::from("ok"),
            status_value: None,
        }
    }

    /// Set the consider status pair (`status:label(value)`).
    pub fn set_status(&mut self, label: &str, value: Option<Value>) {
        self.status = label.to_string();
        self.status_value = value;
    }

    /// Save the consider pair and reset to `("ok", nil)` before running a
    /// consider-attached block. The caller restores with
    /// [`Env::restore_status`] so nested considers compose.
    pub fn save_status(&mut self) -> (String, Option<Value>) {
        (
            std::mem::replace(&mut self.status, String::from("ok")),
            self.status_value.take(),
        )
    }

    pub fn restore_status(&mut self, saved: (String, Option<Value>)) {
        self.status = saved.0;
        self.status_value = saved.1;
    }
}

/// Deferred blocks for one scope, run LIFO on every exit path.
///
/// Declared first in a generated function so it drops last; the `Drop`
/// impl fires during normal return, early return, and unwinding alike.
#[derive(Default)]
pub struct DeferScope {
    blocks: Vec<Box<dyn FnOnce() + 'static>>,
}

impl DeferScope {
    pub fn new() -> DeferScope {
        DeferScope { blocks: Vec::new() }
    }

    pub fn push(&mut self, block: Box<dyn FnOnce() + 'static>) {
        self.blocks.push(block);
    }
}

impl Drop for DeferScope {
    fn drop(&mut self) {
        while let Some(block) = self.blocks.pop() {
            block();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_env_status_save_restore() {
        let mut env = Env::new();
        env.set_status("outer", Some(Value::I64(1)));
        let saved = env.save_status();
        assert_eq!(env.status, "ok");
        assert_eq!(env.status_value, None);
        env.set_status("inner", None);
        env.restore_status(saved);
        assert_eq!(env.status, "outer");
        assert_eq!(env.status_value, Some(Value::I64(1)));
    }

    #[test]
    fn test_defer_runs_lifo() {
        let order = Rc::new(RefCell::new(Vec::new()));
        {
            let mut defers = DeferScope::new();
            for tag in ["a", "b", "c"] {
                let order = order.clone();
                defers.push(Box::new(move || order.borrow_mut().push(tag)));
            }
        }
        assert_eq!(order.borrow().as_slice(), &["c", "b", "a"]);
    }

    #[test]
    fn test_defer_runs_on_unwind() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let inner = order.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let mut defers = DeferScope::new();
            let order = inner.clone();
            defers.push(Box::new(move || order.borrow_mut().push("deferred")));
            panic!("boom");
        }));
        assert!(result.is_err());
        assert_eq!(order.borrow().as_slice(), &["deferred"]);
    }
}
