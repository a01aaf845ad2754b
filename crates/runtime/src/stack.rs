//! Typed stacks with access perspectives
//!
//! The stack is ual's primary data abstraction: a named, typed container
//! whose access discipline (the *perspective*) belongs to the container
//! rather than to the values inside it. One element type governs every
//! resident value; the compiler enforces that boundary, so this module can
//! store `T` directly instead of a tagged value union.
//!
//! ## Blocking and synchronization
//!
//! Every operation serializes on the stack's internal mutex, so a stack
//! shared between tasks needs no external locking. `take` parks the caller
//! on a condvar until a value arrives, the optional timeout expires, or the
//! supplied [`Context`] is cancelled. Waits are sliced so cancellation is
//! observed promptly even when no producer ever pushes.
//!
//! ## Panicking vs. fallible variants
//!
//! Mirroring the send/`send-safe` split in the channel layer this crate
//! grew out of, the primary operations panic on misuse (underflow, frozen
//! stack, capacity overflow) with messages the emitted program's unwind
//! handler reports, while `try_push`/`try_pop` return a [`StackError`] for
//! call sites that want a flag instead.

use crate::context::Context;
use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Maximum single wait slice while blocked in `take`.
///
/// Cancellation has no direct hook into the condvar, so waits are bounded
/// to this slice and the cancel flag is re-checked between slices.
const TAKE_WAIT_SLICE_MS: u64 = 10;

/// The access discipline currently attached to a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Perspective {
    /// Last-in first-out (the default; Forth-style)
    Lifo,
    /// First-in first-out (queue)
    Fifo,
    /// Random access by integer index
    Indexed,
    /// Keyed by string
    Hash,
}

impl std::fmt::Display for Perspective {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Perspective::Lifo => write!(f, "LIFO"),
            Perspective::Fifo => write!(f, "FIFO"),
            Perspective::Indexed => write!(f, "Indexed"),
            Perspective::Hash => write!(f, "Hash"),
        }
    }
}

/// Errors surfaced by the fallible stack operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackError {
    /// Pop/peek on an empty stack
    Underflow,
    /// Write to a frozen stack
    Frozen,
    /// Push past a declared capacity
    CapacityExceeded,
    /// Index outside the current element range
    IndexOutOfRange,
    /// Hash key not present
    MissingKey(String),
    /// Operation not meaningful under the current perspective
    WrongPerspective,
}

impl std::fmt::Display for StackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StackError::Underflow => write!(f, "stack underflow"),
            StackError::Frozen => write!(f, "stack is frozen"),
            StackError::CapacityExceeded => write!(f, "stack capacity exceeded"),
            StackError::IndexOutOfRange => write!(f, "stack index out of range"),
            StackError::MissingKey(k) => write!(f, "no value for key '{}'", k),
            StackError::WrongPerspective => write!(f, "operation not valid for this perspective"),
        }
    }
}

impl std::error::Error for StackError {}

/// Outcome of a blocking `take`.
///
/// `Cancelled` is observable but is not an error: a losing `select` case
/// sees it when the winning case cancels the shared context.
#[derive(Debug, Clone, PartialEq)]
pub enum TakeResult<T> {
    /// A value arrived
    Value(T),
    /// The timeout elapsed with no value
    Timeout,
    /// The context was cancelled while waiting
    Cancelled,
}

/// A slot in a Hash-perspective stack.
///
/// Scalar entries hold one element. Buffer entries hold a contiguous byte
/// vector that compute kernels view as a typed slice without copying.
#[derive(Debug, Clone, PartialEq)]
pub enum HashSlot<T> {
    Scalar(T),
    Buffer(Vec<u8>),
}

#[derive(Debug)]
struct Inner<T> {
    items: Vec<T>,
    hash: HashMap<String, HashSlot<T>>,
    perspective: Perspective,
    frozen: bool,
    capacity: Option<usize>,
}

/// A typed, named container with an access perspective.
///
/// All operations take `&self`; the stack synchronizes internally.
#[derive(Debug)]
pub struct Stack<T> {
    inner: Mutex<Inner<T>>,
    arrivals: Condvar,
}

impl<T: Clone + Default> Default for Stack<T> {
    fn default() -> Self {
        Self::new(Perspective::Lifo)
    }
}

impl<T: Clone + Default> Stack<T> {
    pub fn new(perspective: Perspective) -> Self {
        Self::with_capacity(perspective, None)
    }

    pub fn with_capacity(perspective: Perspective, capacity: Option<usize>) -> Self {
        Stack {
            inner: Mutex::new(Inner {
                items: Vec::new(),
                hash: HashMap::new(),
                perspective,
                frozen: false,
                capacity,
            }),
            arrivals: Condvar::new(),
        }
    }

    fn locked(&self) -> MutexGuard<'_, Inner<T>> {
        // A poisoned lock means another task panicked mid-operation; the
        // stack contents are still structurally sound (no operation leaves
        // a torn state), so recover the guard rather than cascading.
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Push a value. Panics on a frozen or full stack.
    pub fn push(&self, value: T) {
        if let Err(e) = self.try_push(value) {
            panic!("push: {}", e);
        }
    }

    /// Push a value, returning an error instead of panicking.
    pub fn try_push(&self, value: T) -> Result<(), StackError> {
        let mut inner = self.locked();
        if inner.frozen {
            return Err(StackError::Frozen);
        }
        if let Some(cap) = inner.capacity {
            if inner.items.len() >= cap {
                return Err(StackError::CapacityExceeded);
            }
        }
        inner.items.push(value);
        drop(inner);
        self.arrivals.notify_all();
        Ok(())
    }

    /// Pop a value according to the live perspective. Panics on underflow.
    pub fn pop(&self) -> T {
        match self.try_pop() {
            Ok(v) => v,
            Err(e) => panic!("pop: {}", e),
        }
    }

    /// Pop a value, returning an error instead of panicking.
    pub fn try_pop(&self) -> Result<T, StackError> {
        let mut inner = self.locked();
        if inner.frozen {
            return Err(StackError::Frozen);
        }
        Self::pop_locked(&mut *inner)
    }

    fn pop_locked(inner: &mut Inner<T>) -> Result<T, StackError> {
        if inner.items.is_empty() {
            return Err(StackError::Underflow);
        }
        match inner.perspective {
            Perspective::Fifo => Ok(inner.items.remove(0)),
            Perspective::Lifo | Perspective::Indexed => Ok(inner.items.pop().unwrap()),
            Perspective::Hash => Err(StackError::WrongPerspective),
        }
    }

    /// Read the value `pop` would return, without removing it.
    pub fn peek(&self) -> T {
        let inner = self.locked();
        let v = match inner.perspective {
            Perspective::Fifo => inner.items.first(),
            Perspective::Lifo | Perspective::Indexed => inner.items.last(),
            Perspective::Hash => None,
        };
        match v {
            Some(v) => v.clone(),
            None => panic!("peek: {}", StackError::Underflow),
        }
    }

    /// Read the element at `index` (bottom is 0).
    pub fn peek_at(&self, index: usize) -> T {
        let inner = self.locked();
        match inner.items.get(index) {
            Some(v) => v.clone(),
            None => panic!("peek_at: {}", StackError::IndexOutOfRange),
        }
    }

    /// Write the element at `index`, growing the stack with default values
    /// as needed. This is the write half of the stack-resident variable
    /// scheme: a variable is a fixed slot on a type-specific stack.
    pub fn push_at(&self, index: usize, value: T) {
        let mut inner = self.locked();
        if inner.frozen {
            panic!("push_at: {}", StackError::Frozen);
        }
        if inner.items.len() <= index {
            inner.items.resize_with(index + 1, T::default);
        }
        inner.items[index] = value;
        drop(inner);
        self.arrivals.notify_all();
    }

    pub fn len(&self) -> usize {
        self.locked().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locked().items.is_empty()
    }

    pub fn clear(&self) {
        let mut inner = self.locked();
        if inner.frozen {
            panic!("clear: {}", StackError::Frozen);
        }
        inner.items.clear();
        inner.hash.clear();
    }

    /// Mark the stack immutable. Further writes panic with a state error.
    pub fn freeze(&self) {
        self.locked().frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.locked().frozen
    }

    /// The live perspective.
    pub fn perspective(&self) -> Perspective {
        self.locked().perspective
    }

    /// Change the live perspective. Idempotent: re-applying the current
    /// perspective is a no-op.
    pub fn set_perspective(&self, perspective: Perspective) {
        self.locked().perspective = perspective;
    }

    /// Copy of the element sequence, bottom to top. Iteration in emitted
    /// code runs over a snapshot so the loop body may mutate the stack.
    pub fn snapshot(&self) -> Vec<T> {
        self.locked().items.clone()
    }

    /// Duplicate the top element.
    pub fn dup(&self) {
        let mut inner = self.locked();
        if inner.frozen {
            panic!("dup: {}", StackError::Frozen);
        }
        match inner.items.last().cloned() {
            Some(v) => inner.items.push(v),
            None => panic!("dup: {}", StackError::Underflow),
        }
    }

    /// Discard the top element.
    pub fn drop_top(&self) {
        let mut inner = self.locked();
        if inner.frozen {
            panic!("drop: {}", StackError::Frozen);
        }
        if inner.items.pop().is_none() {
            panic!("drop: {}", StackError::Underflow);
        }
    }

    /// Exchange the top two elements.
    pub fn swap(&self) {
        let mut inner = self.locked();
        let n = inner.items.len();
        if n < 2 {
            panic!("swap: {}", StackError::Underflow);
        }
        inner.items.swap(n - 1, n - 2);
    }

    /// Copy the second element to the top.
    pub fn over(&self) {
        let mut inner = self.locked();
        let n = inner.items.len();
        if n < 2 {
            panic!("over: {}", StackError::Underflow);
        }
        let v = inner.items[n - 2].clone();
        inner.items.push(v);
    }

    /// Rotate the third element to the top: ( a b c -- b c a ).
    pub fn rot(&self) {
        let mut inner = self.locked();
        let n = inner.items.len();
        if n < 3 {
            panic!("rot: {}", StackError::Underflow);
        }
        let v = inner.items.remove(n - 3);
        inner.items.push(v);
    }

    /// Pop under a temporary perspective override (view operations).
    pub fn pop_with(&self, perspective: Perspective) -> T {
        let mut inner = self.locked();
        let saved = inner.perspective;
        inner.perspective = perspective;
        let result = Self::pop_locked(&mut inner);
        inner.perspective = saved;
        match result {
            Ok(v) => v,
            Err(e) => panic!("pop: {}", e),
        }
    }

    /// Peek under a temporary perspective override.
    pub fn peek_with(&self, perspective: Perspective) -> T {
        let inner = self.locked();
        let v = match perspective {
            Perspective::Fifo => inner.items.first(),
            _ => inner.items.last(),
        };
        match v {
            Some(v) => v.clone(),
            None => panic!("peek: {}", StackError::Underflow),
        }
    }

    /// Blocking pop. `timeout_ms == 0` means wait indefinitely.
    pub fn take(&self, timeout_ms: u64) -> TakeResult<T> {
        self.take_with_context(&Context::background(), timeout_ms)
    }

    /// The expression form of take: a timeout or cancellation unwinds
    /// instead of returning a sentinel.
    pub fn take_value(&self, timeout_ms: u64) -> T {
        match self.take(timeout_ms) {
            TakeResult::Value(v) => v,
            TakeResult::Timeout => panic!("take: timeout after {} ms", timeout_ms),
            TakeResult::Cancelled => panic!("take: cancelled"),
        }
    }

    /// Blocking pop that also observes `ctx`. Returns `Cancelled` when the
    /// context is cancelled before a value arrives, `Timeout` when
    /// `timeout_ms > 0` and the interval elapses first.
    pub fn take_with_context(&self, ctx: &Context, timeout_ms: u64) -> TakeResult<T> {
        let deadline = if timeout_ms > 0 {
            Some(Instant::now() + Duration::from_millis(timeout_ms))
        } else {
            None
        };
        let mut inner = self.locked();
        loop {
            if let Ok(v) = Self::pop_locked(&mut *inner) {
                return TakeResult::Value(v);
            }
            if ctx.is_cancelled() {
                return TakeResult::Cancelled;
            }
            let slice = Duration::from_millis(TAKE_WAIT_SLICE_MS);
            let wait = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return TakeResult::Timeout;
                    }
                    slice.min(d - now)
                }
                None => slice,
            };
            inner = match self.arrivals.wait_timeout(inner, wait) {
                Ok((g, _)) => g,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Store a scalar under `key` (Hash perspective).
    pub fn set(&self, key: &str, value: T) {
        let mut inner = self.locked();
        if inner.frozen {
            panic!("set: {}", StackError::Frozen);
        }
        inner.hash.insert(key.to_string(), HashSlot::Scalar(value));
    }

    /// Read the scalar stored under `key`. Panics if absent.
    pub fn get(&self, key: &str) -> T {
        let inner = self.locked();
        match inner.hash.get(key) {
            Some(HashSlot::Scalar(v)) => v.clone(),
            _ => panic!("get: {}", StackError::MissingKey(key.to_string())),
        }
    }

    /// Whether `key` holds any slot.
    pub fn has_key(&self, key: &str) -> bool {
        self.locked().hash.contains_key(key)
    }

    /// Store a raw byte buffer under `key`. Compute kernels view buffers
    /// as typed slices without copying.
    pub fn set_buffer(&self, key: &str, bytes: Vec<u8>) {
        let mut inner = self.locked();
        if inner.frozen {
            panic!("set_buffer: {}", StackError::Frozen);
        }
        inner.hash.insert(key.to_string(), HashSlot::Buffer(bytes));
    }

    /// Acquire the stack's lock for the duration of a compute kernel.
    /// All access inside the kernel goes through the returned guard.
    pub fn lock(&self) -> StackGuard<'_, T> {
        StackGuard {
            inner: self.locked(),
        }
    }
}

/// Exclusive access to a stack for the duration of a compute kernel.
///
/// The guard exposes the raw operations the generated kernel body uses:
/// the lock is held once for the whole body instead of per-operation.
pub struct StackGuard<'a, T> {
    inner: MutexGuard<'a, Inner<T>>,
}

impl<T: Clone + Default> StackGuard<'_, T> {
    /// Pop under the held lock. Kernel bindings are popped in LIFO order.
    pub fn pop_raw(&mut self) -> T {
        match Stack::pop_locked(&mut *self.inner) {
            Ok(v) => v,
            Err(e) => panic!("pop_raw: {}", e),
        }
    }

    /// Push under the held lock (kernel `return` on non-Hash stacks).
    pub fn push_raw(&mut self, value: T) {
        self.inner.items.push(value);
    }

    /// Read a scalar hash entry under the held lock (`self.prop`).
    pub fn get_raw(&self, key: &str) -> T {
        match self.inner.hash.get(key) {
            Some(HashSlot::Scalar(v)) => v.clone(),
            _ => panic!("get_raw: {}", StackError::MissingKey(key.to_string())),
        }
    }

    /// Write a scalar hash entry under the held lock (kernel `return` on
    /// Hash stacks, stored under synthetic `__result_N__` keys).
    pub fn set_raw(&mut self, key: &str, value: T) {
        self.inner
            .hash
            .insert(key.to_string(), HashSlot::Scalar(value));
    }

    /// Read the element at `index` under the held lock (`self[i]`).
    pub fn get_at_raw(&self, index: usize) -> T {
        match self.inner.items.get(index) {
            Some(v) => v.clone(),
            None => panic!("get_at_raw: {}", StackError::IndexOutOfRange),
        }
    }

    pub fn len_raw(&self) -> usize {
        self.inner.items.len()
    }
}

impl<T: Copy + 'static> StackGuard<'_, T> {
    /// Zero-copy typed view over the byte buffer stored under `key`
    /// (`self.prop[i]` in a kernel body). The buffer length must be a
    /// whole multiple of the element size.
    ///
    /// The view reads and writes the entry's bytes in place. It is valid
    /// only while this guard is held and the entry is neither removed nor
    /// resized; emitted kernels materialize all views up front and drop
    /// them with the guard, which preserves both conditions.
    pub fn slice_raw(&mut self, key: &str) -> SliceView<T> {
        let elem = std::mem::size_of::<T>();
        match self.inner.hash.get_mut(key) {
            Some(HashSlot::Buffer(bytes)) => {
                assert!(
                    bytes.len() % elem == 0,
                    "buffer '{}' is not a whole number of elements",
                    key
                );
                SliceView {
                    ptr: bytes.as_mut_ptr() as *mut T,
                    len: bytes.len() / elem,
                }
            }
            _ => panic!("slice_raw: {}", StackError::MissingKey(key.to_string())),
        }
    }
}

/// A typed window over a Hash entry's byte buffer.
///
/// Holds a raw pointer into the buffer; see [`StackGuard::slice_raw`] for
/// the validity conditions. Reads and writes are bounds-checked.
pub struct SliceView<T> {
    ptr: *mut T,
    len: usize,
}

impl<T: Copy> SliceView<T> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: usize) -> T {
        assert!(index < self.len, "slice view index {} out of range", index);
        // SAFETY: index checked above; the pointer is valid while the
        // originating StackGuard is held (slice_raw's contract). The
        // byte buffer carries no alignment guarantee, so the access is
        // unaligned.
        unsafe { self.ptr.add(index).read_unaligned() }
    }

    pub fn set(&self, index: usize, value: T) {
        assert!(index < self.len, "slice view index {} out of range", index);
        // SAFETY: as in get; the guard serializes all other access.
        unsafe { self.ptr.add(index).write_unaligned(value) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifo_push_pop() {
        let s: Stack<i64> = Stack::new(Perspective::Lifo);
        s.push(1);
        s.push(2);
        s.push(3);
        assert_eq!(s.pop(), 3);
        assert_eq!(s.pop(), 2);
        assert_eq!(s.pop(), 1);
    }

    #[test]
    fn test_fifo_pop_order() {
        let s: Stack<i64> = Stack::new(Perspective::Fifo);
        s.push(1);
        s.push(2);
        s.push(3);
        assert_eq!(s.pop(), 1);
        assert_eq!(s.pop(), 2);
        assert_eq!(s.pop(), 3);
    }

    #[test]
    fn test_underflow_is_error() {
        let s: Stack<i64> = Stack::new(Perspective::Lifo);
        assert_eq!(s.try_pop(), Err(StackError::Underflow));
    }

    #[test]
    fn test_capacity_bound() {
        let s: Stack<i64> = Stack::with_capacity(Perspective::Lifo, Some(2));
        s.push(1);
        s.push(2);
        assert_eq!(s.try_push(3), Err(StackError::CapacityExceeded));
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn test_freeze_rejects_writes() {
        let s: Stack<i64> = Stack::new(Perspective::Lifo);
        s.push(1);
        s.freeze();
        assert_eq!(s.try_push(2), Err(StackError::Frozen));
        assert_eq!(s.try_pop(), Err(StackError::Frozen));
        // Reads still work on a frozen stack.
        assert_eq!(s.peek(), 1);
    }

    #[test]
    fn test_set_perspective_idempotent() {
        let s: Stack<i64> = Stack::new(Perspective::Lifo);
        s.push(1);
        s.push(2);
        s.set_perspective(Perspective::Fifo);
        s.set_perspective(Perspective::Fifo);
        assert_eq!(s.perspective(), Perspective::Fifo);
        assert_eq!(s.pop(), 1);
    }

    #[test]
    fn test_push_at_grows_with_defaults() {
        let s: Stack<i64> = Stack::new(Perspective::Indexed);
        s.push_at(2, 42);
        assert_eq!(s.len(), 3);
        assert_eq!(s.peek_at(0), 0);
        assert_eq!(s.peek_at(2), 42);
    }

    #[test]
    fn test_hash_scalar_roundtrip() {
        let s: Stack<f64> = Stack::new(Perspective::Hash);
        s.set("mass", 2.0);
        assert!(s.has_key("mass"));
        assert_eq!(s.get("mass"), 2.0);
    }

    #[test]
    fn test_take_timeout() {
        let s: Stack<i64> = Stack::new(Perspective::Lifo);
        let start = Instant::now();
        assert_eq!(s.take(30), TakeResult::Timeout);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_take_sees_concurrent_push() {
        let s: std::sync::Arc<Stack<i64>> = std::sync::Arc::new(Stack::new(Perspective::Lifo));
        let producer = s.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.push(42);
        });
        assert_eq!(s.take(1000), TakeResult::Value(42));
        handle.join().unwrap();
    }

    #[test]
    fn test_take_cancelled() {
        let s: std::sync::Arc<Stack<i64>> = std::sync::Arc::new(Stack::new(Perspective::Lifo));
        let ctx = Context::with_cancel();
        let canceller = ctx.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            canceller.cancel();
        });
        assert_eq!(s.take_with_context(&ctx, 0), TakeResult::Cancelled);
        handle.join().unwrap();
    }

    #[test]
    fn test_guard_kernel_access() {
        let s: Stack<f64> = Stack::new(Perspective::Lifo);
        s.push(1.5);
        s.push(2.5);
        let mut g = s.lock();
        let b = g.pop_raw();
        let a = g.pop_raw();
        g.push_raw(a * b);
        drop(g);
        assert_eq!(s.pop(), 3.75);
    }

    #[test]
    fn test_slice_view_reads_and_writes() {
        let s: Stack<f64> = Stack::new(Perspective::Hash);
        let mut bytes = Vec::new();
        for v in [1.0f64, 2.0, 3.0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        s.set_buffer("xs", bytes);
        let mut g = s.lock();
        let view = g.slice_raw("xs");
        assert_eq!(view.len(), 3);
        assert_eq!(view.get(1), 2.0);
        view.set(1, 9.0);
        assert_eq!(view.get(1), 9.0);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let s: Stack<i64> = Stack::new(Perspective::Lifo);
        s.push(1);
        s.push(2);
        let snap = s.snapshot();
        s.clear();
        assert_eq!(snap, vec![1, 2]);
        assert_eq!(s.len(), 0);
    }
}
