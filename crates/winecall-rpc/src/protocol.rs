//! Messages exchanged between the native client and the foreign server.
//!
//! Two channels carry the same envelope format. The outbound channel
//! (native to foreign) carries library, routine and lifecycle requests; the
//! inbound channel (foreign to native) carries callback invocations and
//! forwarded log lines.

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use winecall_abi::{Arch, CallbackToken, CallingConvention, MemBlock, RoutineSignature, Value};

/// Wire protocol version; both sides must agree.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on a single frame's payload.
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// Versioned wrapper around every request and response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope<T> {
    /// Protocol version of the sender
    pub version: u32,
    /// Correlates a response with its request
    pub id: String,
    /// Request or response payload
    pub body: T,
}

impl<T> Envelope<T> {
    pub fn new(body: T) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            id: Uuid::new_v4().to_string(),
            body,
        }
    }

    /// Wraps a response to this envelope, reusing its id.
    pub fn reply<U>(&self, body: U) -> Envelope<U> {
        Envelope {
            version: PROTOCOL_VERSION,
            id: self.id.clone(),
            body,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "params", rename_all = "snake_case", deny_unknown_fields)]
pub enum Request {
    // Outbound channel
    GetStatus,
    AccessLibrary(AccessLibrary),
    RegisterRoutine(RoutineRef),
    RegisterTypes(RegisterTypes),
    CallRoutine(CallRoutine),
    Terminate,

    // Inbound channel
    InvokeCallback(InvokeCallback),
    DeliverLogLine(LogLine),
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::GetStatus => "get_status",
            Request::AccessLibrary(_) => "access_library",
            Request::RegisterRoutine(_) => "register_routine",
            Request::RegisterTypes(_) => "register_types",
            Request::CallRoutine(_) => "call_routine",
            Request::Terminate => "terminate",
            Request::InvokeCallback(_) => "invoke_callback",
            Request::DeliverLogLine(_) => "deliver_log_line",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccessLibrary {
    /// Library path as the foreign process sees it
    pub path: String,
    /// Library path on the native side; the key routines refer to
    pub path_native: String,
    /// File name of the library
    pub name: String,
    pub convention: CallingConvention,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutineRef {
    /// `path_native` of the library the routine lives in
    pub library: String,
    pub routine: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterTypes {
    pub routine: RoutineRef,
    pub signature: RoutineSignature,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CallRoutine {
    pub routine: RoutineRef,
    /// Arguments with synchronized memory stripped out
    pub args: Vec<Value>,
    /// Synchronized memory, in plan order
    pub memory: Vec<MemBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CallResult {
    pub ret: Value,
    /// Arguments as read back after the call
    pub args: Vec<Value>,
    pub memory: Vec<MemBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InvokeCallback {
    pub token: CallbackToken,
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogLine {
    pub session_id: String,
    /// "out" for informational records, "err" for warnings and errors
    pub stream_name: String,
    /// RFC 3339, as recorded by the emitting side
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
}

impl LogLine {
    /// Stream a record of `level` belongs to.
    pub fn stream_for(level: &str) -> &'static str {
        if level.eq_ignore_ascii_case("error") || level.eq_ignore_ascii_case("warn") {
            "err"
        } else {
            "out"
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerStatus {
    /// Always "up" for a server able to answer
    pub state: String,
    pub protocol_version: u32,
    pub server_version: String,
    pub arch: Arch,
    pub pid: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case", deny_unknown_fields)]
pub enum Reply {
    Status(ServerStatus),
    Ack,
    Called(CallResult),
    Returned(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    LibraryLoad,
    RoutineResolution,
    TypeRegistration,
    Call,
    Callback,
    Protocol,
}

/// Failure raised by the peer while handling a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl RemoteFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Protocol, message)
    }
}

impl std::fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "payload", rename_all = "snake_case", deny_unknown_fields)]
pub enum Response {
    Ok(Reply),
    Err(RemoteFailure),
}

impl From<Result<Reply, RemoteFailure>> for Response {
    fn from(result: Result<Reply, RemoteFailure>) -> Self {
        match result {
            Ok(reply) => Response::Ok(reply),
            Err(failure) => Response::Err(failure),
        }
    }
}
