use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace};
use parking_lot::Mutex;

use crate::frame::{read_frame, write_frame};
use crate::protocol::{Envelope, Reply, Request, Response};
use crate::{Result, RpcError};

/// Blocking request/response client for one channel.
///
/// Calls are serialized: at most one request is in flight at a time.
pub struct RpcClient {
    peer: SocketAddr,
    stream: Mutex<TcpStream>,
    closer: TcpStream,
}

impl RpcClient {
    /// Connects to `addr`, retrying every `poll` until `timeout` elapses.
    pub fn connect(addr: &str, timeout: Duration, poll: Duration) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        let peer = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| RpcError::Connection(format!("cannot resolve {addr}")))?;
        loop {
            match TcpStream::connect(peer) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    debug!("connected to {peer}");
                    let closer = stream.try_clone()?;
                    return Ok(Self {
                        peer,
                        stream: Mutex::new(stream),
                        closer,
                    });
                }
                Err(err) if Instant::now() < deadline => {
                    trace!("connect to {peer} failed ({err}), retrying");
                    thread::sleep(poll);
                }
                Err(err) => {
                    return Err(RpcError::Connection(format!(
                        "could not connect to {peer} within {:.1}s: {err}",
                        timeout.as_secs_f64()
                    )))
                }
            }
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Sends a request and waits for its reply. A failure reported by the
    /// peer comes back as [`RpcError::Remote`].
    pub fn call(&self, request: Request) -> Result<Reply> {
        let mut stream = self.stream.lock();
        exchange(&mut stream, request)
    }

    /// Like [`RpcClient::call`], but returns `None` without sending anything
    /// while another call holds the channel.
    pub fn try_call(&self, request: Request) -> Option<Result<Reply>> {
        let mut stream = self.stream.try_lock()?;
        Some(exchange(&mut stream, request))
    }

    /// Bounds how long [`RpcClient::call`] waits for a reply; `None` waits
    /// indefinitely.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.closer.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Closes the connection; a call in flight and any later call fail.
    pub fn close(&self) {
        let _ = self.closer.shutdown(std::net::Shutdown::Both);
    }
}

fn exchange(stream: &mut TcpStream, request: Request) -> Result<Reply> {
    let name = request.name();
    let envelope = Envelope::new(request);
    trace!("-> {name} ({})", envelope.id);
    write_frame(&mut *stream, &envelope)?;
    let response: Envelope<Response> =
        read_frame(&mut *stream)?.ok_or(RpcError::Disconnected)?;
    if response.id != envelope.id {
        return Err(RpcError::Mismatch {
            expected: envelope.id,
            found: response.id,
        });
    }
    trace!("<- {name} ({})", response.id);
    match response.body {
        Response::Ok(reply) => Ok(reply),
        Response::Err(failure) => Err(RpcError::Remote(failure)),
    }
}
