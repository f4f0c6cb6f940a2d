//! Callback invocations sent back to the native side.

use std::sync::Arc;

use winecall_abi::{CallbackToken, Value};
use winecall_rpc::{InvokeCallback, Reply, Request, RpcClient, RpcError};

use crate::backend::{BackendError, CallbackInvoker};

/// Forwards callbacks over the foreign-to-native channel.
pub struct RpcCallbackInvoker {
    client: Arc<RpcClient>,
}

impl RpcCallbackInvoker {
    pub fn new(client: Arc<RpcClient>) -> Self {
        Self { client }
    }
}

impl CallbackInvoker for RpcCallbackInvoker {
    fn invoke(&self, token: CallbackToken, args: Vec<Value>) -> Result<Value, BackendError> {
        log::trace!("invoking {token} with {} argument(s)", args.len());
        match self
            .client
            .call(Request::InvokeCallback(InvokeCallback { token, args }))
        {
            Ok(Reply::Returned(value)) => Ok(value),
            Ok(other) => Err(BackendError::Callback(format!(
                "unexpected reply to {token}: {other:?}"
            ))),
            Err(RpcError::Remote(failure)) => Err(BackendError::Callback(failure.message)),
            Err(err) => Err(BackendError::Callback(format!(
                "native side unreachable while invoking {token}: {err}"
            ))),
        }
    }
}
