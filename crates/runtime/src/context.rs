//! Cancellation contexts
//!
//! A context is a shared cancellation flag handed to blocking takes. A
//! winning `select` case cancels the context; every take still parked on
//! it observes `Cancelled` and returns without a value. Cancellation is
//! level-triggered and sticky: once cancelled, always cancelled.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A cancellation handle shared between tasks.
///
/// Cloning yields another handle to the same flag, so a context can be
/// moved into any number of worker tasks and cancelled from one place.
#[derive(Debug, Clone)]
pub struct Context {
    cancelled: Arc<AtomicBool>,
    /// Background contexts ignore cancel() and never report cancelled.
    cancellable: bool,
}

impl Context {
    /// A cancellable context (the `WithCancel` constructor).
    pub fn with_cancel() -> Context {
        Context {
            cancelled: Arc::new(AtomicBool::new(false)),
            cancellable: true,
        }
    }

    /// A context that is never cancelled, for plain blocking takes.
    pub fn background() -> Context {
        Context {
            cancelled: Arc::new(AtomicBool::new(false)),
            cancellable: false,
        }
    }

    /// Cancel every handle sharing this flag. No-op on a background
    /// context, and idempotent on a cancellable one.
    pub fn cancel(&self) {
        if self.cancellable {
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellable && self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_shared_and_sticky() {
        let ctx = Context::with_cancel();
        let clone = ctx.clone();
        assert!(!clone.is_cancelled());
        ctx.cancel();
        assert!(clone.is_cancelled());
        ctx.cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_background_ignores_cancel() {
        let ctx = Context::background();
        ctx.cancel();
        assert!(!ctx.is_cancelled());
    }
}
