use thiserror::Error;
use winecall_abi::{MemsyncError, SignatureError, ValueError};
use winecall_rpc::{FailureKind, RpcError};

/// Errors surfaced to callers of the bridge
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WinecallError {
    #[error("session failed to start: {0}")]
    Startup(String),

    #[error("cannot load library: {0}")]
    LibraryLoad(String),

    #[error("cannot resolve routine: {0}")]
    RoutineResolution(String),

    #[error("type registration failed: {0}")]
    TypeRegistration(String),

    #[error("argument mismatch: {0}")]
    ArgumentMismatch(String),

    #[error("session lost: {0}")]
    SessionLost(String),

    #[error("memory synchronization failed: {0}")]
    Memsync(String),

    #[error("callback failed: {0}")]
    Callback(String),

    #[error("routine call failed: {0}")]
    CallFailed(String),

    #[error("routine {routine} is unusable: {reason}")]
    Poisoned { routine: String, reason: String },

    #[error("session {0} has been terminated")]
    Terminated(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl WinecallError {
    /// Maps a transport result to the caller-facing taxonomy. Failures the
    /// foreign side reports keep their kind; a broken channel means the
    /// session is gone.
    pub fn from_rpc(err: RpcError) -> Self {
        match err {
            RpcError::Remote(failure) => match failure.kind {
                FailureKind::LibraryLoad => WinecallError::LibraryLoad(failure.message),
                FailureKind::RoutineResolution => {
                    WinecallError::RoutineResolution(failure.message)
                }
                FailureKind::TypeRegistration => WinecallError::TypeRegistration(failure.message),
                FailureKind::Call => WinecallError::CallFailed(failure.message),
                FailureKind::Callback => WinecallError::Callback(failure.message),
                FailureKind::Protocol => {
                    WinecallError::CallFailed(format!("protocol error: {}", failure.message))
                }
            },
            other => WinecallError::SessionLost(other.to_string()),
        }
    }

    pub fn is_session_lost(&self) -> bool {
        matches!(self, WinecallError::SessionLost(_))
    }
}

impl From<std::io::Error> for WinecallError {
    fn from(err: std::io::Error) -> Self {
        WinecallError::Io(err.to_string())
    }
}

impl From<MemsyncError> for WinecallError {
    fn from(err: MemsyncError) -> Self {
        WinecallError::Memsync(err.to_string())
    }
}

impl From<ValueError> for WinecallError {
    fn from(err: ValueError) -> Self {
        WinecallError::ArgumentMismatch(err.to_string())
    }
}

impl From<SignatureError> for WinecallError {
    fn from(err: SignatureError) -> Self {
        WinecallError::TypeRegistration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WinecallError>;

#[cfg(test)]
mod tests {
    use super::*;
    use winecall_rpc::RemoteFailure;

    #[test]
    fn test_remote_failures_keep_their_kind() {
        let err = WinecallError::from_rpc(RpcError::Remote(RemoteFailure::new(
            FailureKind::RoutineResolution,
            "no export named `missing`",
        )));
        assert_eq!(
            err,
            WinecallError::RoutineResolution("no export named `missing`".into())
        );

        let err = WinecallError::from_rpc(RpcError::Remote(RemoteFailure::new(
            FailureKind::Call,
            "routine panicked",
        )));
        assert!(matches!(err, WinecallError::CallFailed(_)));
    }

    #[test]
    fn test_transport_errors_lose_the_session() {
        let err = WinecallError::from_rpc(RpcError::Disconnected);
        assert!(err.is_session_lost());
    }
}
