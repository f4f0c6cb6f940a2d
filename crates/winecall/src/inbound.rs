//! Handler for requests the foreign server sends to the native side.

use std::sync::Arc;

use winecall_abi::Arch;
use winecall_logging::{forward_foreign_record, ForeignRecord};
use winecall_rpc::{FailureKind, Handler, RemoteFailure, Reply, Request, ServerControl};

use crate::callback::{CallbackRegistry, RunningCallback};

pub struct InboundHandler {
    session_id: String,
    arch: Arch,
    callbacks: Arc<CallbackRegistry>,
}

impl InboundHandler {
    pub fn new(session_id: impl Into<String>, arch: Arch, callbacks: Arc<CallbackRegistry>) -> Self {
        Self {
            session_id: session_id.into(),
            arch,
            callbacks,
        }
    }
}

impl Handler for InboundHandler {
    fn handle(&self, request: Request, _control: &ServerControl) -> Result<Reply, RemoteFailure> {
        match request {
            Request::InvokeCallback(call) => {
                log::trace!("invoking callback {}", call.token);
                let _running = RunningCallback::enter(&self.session_id);
                self.callbacks
                    .invoke(call.token, &call.args, self.arch)
                    .map(Reply::Returned)
                    .map_err(|message| {
                        log::warn!("{message}");
                        RemoteFailure::new(FailureKind::Callback, message)
                    })
            }
            Request::DeliverLogLine(line) => {
                if line.session_id != self.session_id {
                    return Err(RemoteFailure::protocol(format!(
                        "log line for session {} delivered to session {}",
                        line.session_id, self.session_id
                    )));
                }
                forward_foreign_record(&ForeignRecord {
                    session_id: &line.session_id,
                    stream: &line.stream_name,
                    timestamp: &line.timestamp,
                    level: &line.level,
                    target: &line.target,
                    message: &line.message,
                });
                Ok(Reply::Ack)
            }
            other => Err(RemoteFailure::protocol(format!(
                "{} is not accepted on the inbound channel",
                other.name()
            ))),
        }
    }
}
