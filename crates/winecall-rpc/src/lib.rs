//! Transport between the native winecall client and its foreign server.
//!
//! Messages are JSON envelopes in length-prefixed frames over loopback TCP.
//! Each direction has its own connection and carries one request at a time.

use thiserror::Error;

pub mod client;
pub mod connection;
pub mod frame;
pub mod protocol;
pub mod server;

pub use client::RpcClient;
pub use connection::ConnectionInfo;
pub use protocol::{
    AccessLibrary, CallResult, CallRoutine, Envelope, FailureKind, InvokeCallback, LogLine,
    RegisterTypes, RemoteFailure, Reply, Request, Response, RoutineRef, ServerStatus,
    PROTOCOL_VERSION,
};
pub use server::{Handler, RpcServer, ServerControl};

/// Transport errors
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame of {0} bytes exceeds the size limit")]
    FrameTooLarge(usize),

    #[error("protocol version mismatch: expected {expected}, found {found}")]
    Version { expected: u32, found: u64 },

    #[error("peer closed the connection")]
    Disconnected,

    #[error("reply {found} does not answer request {expected}")]
    Mismatch { expected: String, found: String },

    #[error("connection error: {0}")]
    Connection(String),

    #[error("remote failure: {0}")]
    Remote(RemoteFailure),
}

impl RpcError {
    /// True when the channel itself is broken, as opposed to the peer
    /// reporting a failure.
    pub fn is_transport(&self) -> bool {
        !matches!(self, RpcError::Remote(_))
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
