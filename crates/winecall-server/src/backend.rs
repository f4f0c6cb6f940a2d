//! Seams between the dispatcher and whatever actually runs routines.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use winecall_abi::{
    CallbackToken, CallingConvention, DescriptorError, MemsyncError, MemsyncPlan, RoutineSignature, Value,
    ValueError,
};

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("{0}")]
    Load(String),
    #[error("{0}")]
    Resolve(String),
    #[error("{0}")]
    Configure(String),
    #[error("{0}")]
    Call(String),
    #[error("callback failed: {0}")]
    Callback(String),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error(transparent)]
    Value(#[from] ValueError),
    #[error(transparent)]
    Memsync(#[from] MemsyncError),
}

/// Opens libraries.
pub trait RoutineBackend: Send + Sync {
    fn open(
        &self,
        path: &str,
        convention: CallingConvention,
    ) -> Result<Box<dyn LoadedLibrary>, BackendError>;
}

pub trait LoadedLibrary: Send {
    fn resolve(&self, name: &str) -> Result<Box<dyn BoundRoutine>, BackendError>;
}

pub trait BoundRoutine: Send {
    /// Called once, when the routine's types are registered.
    fn configure(
        &mut self,
        _signature: &RoutineSignature,
        _plan: &MemsyncPlan,
    ) -> Result<(), BackendError> {
        Ok(())
    }

    /// Runs the routine. On return `frame.args` must hold the arguments as
    /// they look after the call, with synchronized memory filled in.
    fn invoke(&mut self, frame: &mut CallFrame<'_>) -> Result<Value, BackendError>;
}

/// Everything a backend needs for one call.
pub struct CallFrame<'a> {
    pub signature: &'a RoutineSignature,
    pub plan: &'a MemsyncPlan,
    pub args: Vec<Value>,
    pub callbacks: &'a Arc<CallbackHub>,
}

/// Delivers callback invocations to the native side.
pub trait CallbackInvoker: Send + Sync {
    fn invoke(&self, token: CallbackToken, args: Vec<Value>) -> Result<Value, BackendError>;
}

/// Shared entry point for callbacks fired during a routine call.
///
/// The first failure of a call is kept so the dispatcher can report it even
/// when the callback ran inside foreign code that cannot propagate errors.
pub struct CallbackHub {
    invoker: Arc<dyn CallbackInvoker>,
    failure: Mutex<Option<String>>,
}

impl CallbackHub {
    pub fn new(invoker: Arc<dyn CallbackInvoker>) -> Self {
        Self {
            invoker,
            failure: Mutex::new(None),
        }
    }

    pub fn invoke(&self, token: CallbackToken, args: Vec<Value>) -> Result<Value, BackendError> {
        let result = self.invoker.invoke(token, args);
        if let Err(err) = &result {
            self.record_failure(err.to_string());
        }
        result
    }

    /// Keeps `message` unless the current call already failed.
    pub(crate) fn record_failure(&self, message: String) {
        self.failure.lock().get_or_insert(message);
    }

    pub(crate) fn begin_call(&self) {
        self.failure.lock().take();
    }

    pub(crate) fn take_failure(&self) -> Option<String> {
        self.failure.lock().take()
    }
}

/// Invoker for servers that have no native peer to call back into.
pub struct NoCallbacks;

impl CallbackInvoker for NoCallbacks {
    fn invoke(&self, token: CallbackToken, _args: Vec<Value>) -> Result<Value, BackendError> {
        Err(BackendError::Callback(format!("no callback channel for {token}")))
    }
}
