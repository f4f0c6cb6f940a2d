//! Native closures callable from foreign code.
//!
//! Tokens are unique across every session of the process. A session keeps
//! its closures until it terminates.
//!
//! A closure runs while the routine call that triggered it still holds the
//! outbound channel, so it must not call back into the same session.

use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use winecall_abi::{Arch, CallbackSignature, CallbackToken, Scalar, TypeDescriptor, Value};

/// A native callback body. It receives the decoded C arguments and returns
/// the value handed back to the foreign caller.
pub type CallbackFn = dyn Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Sessions with a callback running on this thread, innermost last
    static RUNNING: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

/// Marks the current thread as running a callback of one session until
/// dropped.
pub(crate) struct RunningCallback;

impl RunningCallback {
    pub(crate) fn enter(session_id: &str) -> Self {
        RUNNING.with(|running| running.borrow_mut().push(session_id.to_string()));
        RunningCallback
    }
}

impl Drop for RunningCallback {
    fn drop(&mut self) {
        RUNNING.with(|running| {
            running.borrow_mut().pop();
        });
    }
}

/// Whether the current thread is inside a callback of `session_id`.
pub(crate) fn in_callback_of(session_id: &str) -> bool {
    RUNNING.with(|running| running.borrow().iter().any(|id| id == session_id))
}

struct Entry {
    signature: CallbackSignature,
    closure: Arc<CallbackFn>,
}

#[derive(Default)]
pub struct CallbackRegistry {
    entries: Mutex<HashMap<CallbackToken, Entry>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, signature: CallbackSignature, closure: Arc<CallbackFn>) -> CallbackToken {
        let token = CallbackToken(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().insert(token, Entry { signature, closure });
        log::debug!("registered callback {token}");
        token
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Runs the closure behind `token` and converts its result to the
    /// declared return type. The table lock is not held while the closure
    /// runs, so closures may register further callbacks.
    pub fn invoke(&self, token: CallbackToken, args: &[Value], arch: Arch) -> Result<Value, String> {
        let (signature, closure) = {
            let entries = self.entries.lock();
            let entry = entries
                .get(&token)
                .ok_or_else(|| format!("unknown callback token {token}"))?;
            (entry.signature.clone(), Arc::clone(&entry.closure))
        };
        if args.len() != signature.args.len() {
            return Err(format!(
                "callback {token} takes {} arguments, got {}",
                signature.args.len(),
                args.len()
            ));
        }
        let result = panic::catch_unwind(AssertUnwindSafe(|| closure(args)))
            .map_err(|_| format!("callback {token} panicked"))?
            .map_err(|e| format!("callback {token} failed: {e:#}"))?;
        coerce_result(&signature.ret, result, arch)
            .map_err(|detail| format!("callback {token} returned {detail}"))
    }
}

fn coerce_result(ret: &TypeDescriptor, value: Value, arch: Arch) -> Result<Value, String> {
    match ret {
        TypeDescriptor::Void => Ok(Value::Void),
        TypeDescriptor::Fundamental(kind) => {
            let scalar = match value {
                Value::Scalar(scalar) => scalar,
                Value::Void => Scalar::zero(*kind),
                other => return Err(format!("a {} where {kind} was declared", other.shape())),
            };
            scalar
                .coerce(*kind, arch)
                .map(Value::Scalar)
                .ok_or_else(|| format!("{scalar:?}, which does not fit in {kind}"))
        }
        other => Err(format!("a value for unsupported type {other}")),
    }
}
