//! Foreign side of the winecall bridge.
//!
//! The server runs inside the Wine prefix, loads the DLLs the native client
//! asks for and executes routine calls on its behalf. Execution is delegated
//! to a [`RoutineBackend`]; the `ffi` feature provides the real one.
//!
//! # Channels
//!
//! The server listens on `port_out` for routine requests and connects to the
//! native listener on `port_in` to deliver callback invocations and its own
//! log records.

use std::net::SocketAddr;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

use winecall_abi::Arch;
use winecall_rpc::{ConnectionInfo, LogLine, RpcClient, RpcServer};

pub mod backend;
pub mod callbacks;
pub mod dispatch;
pub mod forward;

#[cfg(feature = "ffi")]
pub mod ffi;

pub use backend::{
    BackendError, BoundRoutine, CallFrame, CallbackHub, CallbackInvoker, LoadedLibrary,
    NoCallbacks, RoutineBackend,
};
pub use callbacks::RpcCallbackInvoker;
pub use dispatch::{Dispatcher, SERVER_VERSION};
pub use forward::{install_log_hook, LogForwarder};

/// How long to wait for the native listener
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const CONNECT_POLL: Duration = Duration::from_millis(10);

/// A running foreign server: the outbound request server plus the client
/// half of the inbound channel.
pub struct ForeignServer {
    server: RpcServer,
    inbound: Arc<RpcClient>,
    forwarder: Option<LogForwarder>,
}

impl ForeignServer {
    /// Connects to the native listener and starts serving requests.
    pub fn start(
        connection: &ConnectionInfo,
        arch: Arch,
        backend: Box<dyn RoutineBackend>,
    ) -> winecall_rpc::Result<Self> {
        connection.validate()?;
        let inbound = Arc::new(RpcClient::connect(
            &connection.inbound_addr(),
            CONNECT_TIMEOUT,
            CONNECT_POLL,
        )?);
        let callbacks = Arc::new(CallbackHub::new(Arc::new(RpcCallbackInvoker::new(
            Arc::clone(&inbound),
        ))));
        let dispatcher = Dispatcher::new(connection.session_id.clone(), arch, backend, callbacks);
        let server = RpcServer::bind(
            "winecall-server",
            connection.outbound_addr(),
            Arc::new(dispatcher),
        )?;
        log::info!(
            "session {} serving {} on {}",
            connection.session_id,
            arch,
            server.local_addr()
        );
        Ok(Self {
            server,
            inbound,
            forwarder: None,
        })
    }

    /// Starts delivering queued log records over the inbound channel.
    pub fn forward_logs(&mut self, lines: Receiver<LogLine>) -> std::io::Result<()> {
        self.forwarder = Some(LogForwarder::spawn(lines, Arc::clone(&self.inbound))?);
        Ok(())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Blocks until a `terminate` request arrives.
    pub fn wait(&mut self) {
        self.server.wait();
        self.finish();
    }

    pub fn stop(&mut self) {
        self.server.shutdown();
        self.finish();
    }

    fn finish(&mut self) {
        // A callback in flight holds the inbound channel the forwarder
        // delivers on; closing it first lets both finish.
        self.inbound.close();
        if let Some(mut forwarder) = self.forwarder.take() {
            forwarder.stop();
        }
    }
}

impl Drop for ForeignServer {
    fn drop(&mut self) {
        self.stop();
    }
}
