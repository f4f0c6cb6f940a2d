//! Blocking request server
//!
//! Accepts connections on one listener and serves each on its own thread.
//! Requests on a connection are handled strictly one after another.

use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::frame::{read_frame, write_frame};
use crate::protocol::{Envelope, RemoteFailure, Reply, Request, Response, PROTOCOL_VERSION};
use crate::Result;

/// Request handler plugged into an [`RpcServer`].
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: Request, control: &ServerControl) -> std::result::Result<Reply, RemoteFailure>;
}

/// Lets a handler stop the server once the current reply is written.
#[derive(Clone)]
pub struct ServerControl {
    stopping: Arc<AtomicBool>,
    addr: SocketAddr,
}

impl ServerControl {
    /// A control not attached to any listener, for driving handlers directly.
    pub fn detached() -> Self {
        Self {
            stopping: Arc::new(AtomicBool::new(false)),
            addr: SocketAddr::from((std::net::Ipv4Addr::LOCALHOST, 0)),
        }
    }

    pub fn shutdown(&self) {
        if !self.stopping.swap(true, Ordering::SeqCst) && self.addr.port() != 0 {
            // Wake the accept loop.
            let _ = TcpStream::connect(self.addr);
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }
}

pub struct RpcServer {
    name: String,
    addr: SocketAddr,
    control: ServerControl,
    /// Clones of accepted streams, closed on shutdown
    connections: Arc<Mutex<Vec<TcpStream>>>,
    accept_task: Option<JoinHandle<()>>,
}

impl RpcServer {
    /// Binds `addr` and starts serving with `handler`.
    pub fn bind(name: &str, addr: impl ToSocketAddrs, handler: Arc<dyn Handler>) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        let mut local = listener.local_addr()?;
        if local.ip().is_unspecified() {
            local.set_ip(std::net::Ipv4Addr::LOCALHOST.into());
        }
        let control = ServerControl {
            stopping: Arc::new(AtomicBool::new(false)),
            addr: local,
        };
        let connections = Arc::new(Mutex::new(Vec::new()));

        let accept_task = {
            let name = name.to_string();
            let control = control.clone();
            let connections = Arc::clone(&connections);
            thread::Builder::new()
                .name(format!("{name}-accept"))
                .spawn(move || accept_loop(&name, listener, handler, control, connections))?
        };

        log::debug!("{name} listening on {local}");
        Ok(Self {
            name: name.to_string(),
            addr: local,
            control,
            connections,
            accept_task: Some(accept_task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn control(&self) -> ServerControl {
        self.control.clone()
    }

    /// Blocks until a handler or another thread requests shutdown.
    pub fn wait(&mut self) {
        if let Some(task) = self.accept_task.take() {
            if task.join().is_err() {
                log::error!("{} accept loop panicked", self.name);
            }
        }
        self.close_connections();
    }

    pub fn shutdown(&mut self) {
        self.control.shutdown();
        self.wait();
    }

    fn close_connections(&self) {
        for stream in self.connections.lock().drain(..) {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(
    name: &str,
    listener: TcpListener,
    handler: Arc<dyn Handler>,
    control: ServerControl,
    connections: Arc<Mutex<Vec<TcpStream>>>,
) {
    for stream in listener.incoming() {
        if control.is_stopping() {
            break;
        }
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("{name}: failed to accept connection: {e}");
                continue;
            }
        };
        let _ = stream.set_nodelay(true);
        match stream.try_clone() {
            Ok(clone) => connections.lock().push(clone),
            Err(e) => log::warn!("{name}: cannot track connection: {e}"),
        }
        let handler = Arc::clone(&handler);
        let control = control.clone();
        let thread_name = format!("{name}-conn");
        let spawned = thread::Builder::new()
            .name(thread_name)
            .spawn(move || serve_connection(stream, handler, control));
        if let Err(e) = spawned {
            log::error!("{name}: failed to spawn connection thread: {e}");
        }
    }
    log::debug!("{name}: accept loop finished");
}

fn serve_connection(mut stream: TcpStream, handler: Arc<dyn Handler>, control: ServerControl) {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    loop {
        let request: Envelope<Request> = match read_frame(&mut stream) {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                if !control.is_stopping() {
                    log::warn!("dropping connection from {peer}: {e}");
                }
                break;
            }
        };
        let Envelope { id, body, .. } = request;
        let name = body.name();
        let response: Response = handler.handle(body, &control).into();
        if let Response::Err(failure) = &response {
            log::debug!("{name} failed: {failure}");
        }
        let reply = Envelope {
            version: PROTOCOL_VERSION,
            id,
            body: response,
        };
        if let Err(e) = write_frame(&mut stream, &reply) {
            log::warn!("failed to reply to {peer}: {e}");
            break;
        }
        if control.is_stopping() {
            break;
        }
    }
    let _ = stream.shutdown(Shutdown::Both);
}
