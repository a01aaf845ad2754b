//! ual runtime library
//!
//! The fixed-name API that programs emitted by the ual compiler's Rust
//! backend link against. The surface is deliberately small:
//!
//! - [`Stack`]: the typed container with access perspectives, blocking
//!   `take`, freeze, and the locked raw operations compute kernels use.
//! - [`Context`]: the cancellation handle `select` threads through
//!   blocking takes.
//! - [`workqueue`]: the program-global spawn queue and task launcher.
//! - [`Env`]: per-task `dstack`/`rstack` and consider state, passed as the
//!   first argument of every generated function.
//! - [`codec`]: little-endian byte codecs for the stack-resident variable
//!   scheme and the bytes↔string boundary.
//! - [`arith`]: arithmetic with ual semantics (division by zero yields
//!   zero) plus the `reduce` folds.
//! - [`select`]: the worker/winner protocol behind blocking `select`.
//! - [`panic`]: payload-carrying unwind helpers behind ual's `panic` and
//!   `try/catch`.
//!
//! Nothing here parses ual source; the compiler crate owns the language.

pub mod arith;
pub mod codec;
pub mod context;
pub mod env;
pub mod panic;
pub mod select;
pub mod stack;
pub mod value;
pub mod workqueue;

pub use context::Context;
pub use env::{DeferScope, Env};
pub use panic::{install_quiet_panic_hook, panic_message, ual_panic};
pub use select::{SELECT_DONE, SELECT_RESTART, select_wait};
pub use stack::{HashSlot, Perspective, SliceView, Stack, StackError, StackGuard, TakeResult};
pub use value::Value;
pub use workqueue::{Task, WorkQueue};

/// Sleep the current task (the `sleep(ms)` builtin).
pub fn sleep_ms(ms: u64) {
    std::thread::sleep(std::time::Duration::from_millis(ms));
}
