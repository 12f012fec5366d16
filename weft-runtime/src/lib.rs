//! # weft-runtime
//!
//! Runtime support for weft-instrumented programs.
//!
//! Generated trampolines reference this crate's exported surface: the
//! [`HookContext`] passed to user hooks, the thread-local context storage used
//! to carry parameter mutations back to the rewritten call site, the
//! enabled-rules registry behind the dispatch guard, and panic reporting.
//!
//! Nothing here is invoked by the instrumentation core at compile time; the
//! core only emits code against this ABI.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};

use once_cell::sync::Lazy;

/// One positional, type-erased value cell of a [`HookContext`].
///
/// Slots are write-once at construction and replaced wholesale by
/// `set_param`; the contained type is recovered by downcast at the accessor.
pub struct Slot {
    value: Option<Box<dyn Any>>,
}

impl Slot {
    pub fn new<T: Any>(value: T) -> Self {
        Self {
            value: Some(Box::new(value)),
        }
    }

    /// An empty cell, used when a position is intentionally unpopulated.
    pub fn empty() -> Self {
        Self { value: None }
    }

    fn get<T: Any + Clone>(&self) -> Option<T> {
        self.value.as_ref()?.downcast_ref::<T>().cloned()
    }

    fn take<T: Any>(&mut self) -> Option<T> {
        let boxed = self.value.take()?;
        match boxed.downcast::<T>() {
            Ok(v) => Some(*v),
            Err(boxed) => {
                // Wrong type requested: put the value back untouched.
                self.value = Some(boxed);
                None
            }
        }
    }
}

struct ContextInner {
    params: Mutex<Vec<Slot>>,
    returns: Mutex<Vec<Slot>>,
    data: Mutex<Option<Box<dyn Any>>>,
}

/// Opaque per-call context handed to user hooks.
///
/// A `HookContext` is a cheap `Arc`-backed handle over positional slots: the
/// target's inputs (receiver first, when present) and, on the after side, its
/// outputs. Hooks observe inputs with [`param`](HookContext::param), reassign
/// them with [`set_param`](HookContext::set_param), read outputs with
/// [`return_val`](HookContext::return_val), and may stash arbitrary per-call
/// data in the user data slot.
#[derive(Clone)]
pub struct HookContext {
    inner: Arc<ContextInner>,
}

impl HookContext {
    /// Build a context over the target's input slots.
    pub fn new(params: Vec<Slot>) -> Self {
        Self::with_returns(params, Vec::new())
    }

    /// Build a context over input and output slots (after-side dispatch).
    pub fn with_returns(params: Vec<Slot>, returns: Vec<Slot>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                params: Mutex::new(params),
                returns: Mutex::new(returns),
                data: Mutex::new(None),
            }),
        }
    }

    /// Cloning read of input `i`. `None` when the index is out of range, the
    /// slot is empty, or `T` is not the stored type.
    pub fn param<T: Any + Clone>(&self, i: usize) -> Option<T> {
        let params = self.inner.params.lock().expect("param slots poisoned");
        params.get(i).and_then(Slot::get)
    }

    /// Reassign input `i`. Out-of-range writes are ignored.
    pub fn set_param<T: Any>(&self, i: usize, value: T) {
        let mut params = self.inner.params.lock().expect("param slots poisoned");
        if let Some(slot) = params.get_mut(i) {
            *slot = Slot::new(value);
        }
    }

    /// Consuming read of input `i`, leaving the slot empty. Rewritten call
    /// sites use this to fold hook mutations back into the live arguments.
    pub fn take_param<T: Any>(&self, i: usize) -> Option<T> {
        let mut params = self.inner.params.lock().expect("param slots poisoned");
        params.get_mut(i).and_then(Slot::take)
    }

    /// Cloning read of output `i`.
    pub fn return_val<T: Any + Clone>(&self, i: usize) -> Option<T> {
        let returns = self.inner.returns.lock().expect("return slots poisoned");
        returns.get(i).and_then(Slot::get)
    }

    pub fn return_val_count(&self) -> usize {
        self.inner.returns.lock().expect("return slots poisoned").len()
    }

    pub fn param_count(&self) -> usize {
        self.inner.params.lock().expect("param slots poisoned").len()
    }

    /// Store per-call user data, replacing any previous value.
    pub fn set_data<T: Any>(&self, value: T) {
        let mut data = self.inner.data.lock().expect("data slot poisoned");
        *data = Some(Box::new(value));
    }

    /// Cloning read of the per-call user data slot.
    pub fn data<T: Any + Clone>(&self) -> Option<T> {
        let data = self.inner.data.lock().expect("data slot poisoned");
        data.as_ref()?.downcast_ref::<T>().cloned()
    }
}

thread_local! {
    static PENDING: RefCell<Vec<HookContext>> = const { RefCell::new(Vec::new()) };
}

/// Publish a before-side context for the enclosing rewritten call site.
///
/// Storage is a thread-local LIFO stack so that nested instrumented calls
/// pair each `store_context` with the innermost pending `take_context`.
pub fn store_context(ctx: HookContext) {
    PENDING.with(|stack| stack.borrow_mut().push(ctx));
}

/// Consume the most recently published context, if any.
pub fn take_context() -> Option<HookContext> {
    PENDING.with(|stack| stack.borrow_mut().pop())
}

static DISABLED_RULES: Lazy<RwLock<HashSet<String>>> = Lazy::new(|| RwLock::new(HashSet::new()));

/// Dispatch guard predicate emitted in front of every generated hook call.
/// Rules are enabled unless explicitly switched off.
pub fn hook_enabled(rule: &str) -> bool {
    let disabled = DISABLED_RULES.read().expect("rule registry poisoned");
    !disabled.contains(rule)
}

/// Switch a rule's hooks on or off at runtime.
pub fn set_hook_enabled(rule: &str, enabled: bool) {
    let mut disabled = DISABLED_RULES.write().expect("rule registry poisoned");
    if enabled {
        disabled.remove(rule);
    } else {
        disabled.insert(rule.to_string());
    }
}

/// Record a panic caught inside generated dispatch. Never panics; the
/// instrumented call proceeds regardless.
pub fn report_hook_panic(rule: &str, payload: Box<dyn Any + Send>) {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    tracing::warn!(rule, panic = %message, "hook panicked; continuing");
}
