//! Session lifecycle.
//!
//! A session owns one foreign server, the two channels to it and every
//! library, routine and callback created through it. Dropping the
//! [`Session`] terminates it.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use winecall_abi::{Arch, CallbackSignature, CallingConvention, Value};
use winecall_rpc::{
    AccessLibrary, ConnectionInfo, Reply, Request, RpcClient, RpcServer, ServerStatus,
    PROTOCOL_VERSION,
};

use crate::callback::{self, CallbackRegistry};
use crate::config::SessionConfig;
use crate::error::{Result, WinecallError};
use crate::hooks;
use crate::host::{ForeignHost, WineHost};
use crate::inbound::InboundHandler;
use crate::library::LibraryHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Running,
    Terminating,
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Terminating => "terminating",
            SessionState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

pub(crate) struct SessionInner {
    pub(crate) id: String,
    pub(crate) config: SessionConfig,
    state: Mutex<SessionState>,
    /// Why the channel to the server broke, once it has
    lost: Mutex<Option<String>>,
    host: Mutex<Box<dyn ForeignHost>>,
    client: OnceCell<RpcClient>,
    status: OnceCell<ServerStatus>,
    inbound: Mutex<Option<RpcServer>>,
    pub(crate) callbacks: Arc<CallbackRegistry>,
    libraries: Mutex<HashMap<PathBuf, LibraryHandle>>,
}

impl SessionInner {
    pub(crate) fn arch(&self) -> Arch {
        self.config.arch
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub(crate) fn ensure_running(&self) -> Result<()> {
        match self.state() {
            SessionState::Running => {}
            SessionState::Starting => {
                return Err(WinecallError::Startup(format!(
                    "session {} is still starting",
                    self.id
                )))
            }
            SessionState::Terminating | SessionState::Terminated => {
                return Err(WinecallError::Terminated(self.id.clone()))
            }
        }
        match self.lost.lock().as_ref() {
            Some(reason) => Err(WinecallError::SessionLost(reason.clone())),
            None => Ok(()),
        }
    }

    /// Fails when the current thread runs a callback of this session. The
    /// routine call that triggered the callback holds the outbound channel
    /// until the callback returns, so a nested request would never be sent.
    pub(crate) fn ensure_not_in_callback(&self, what: &str) -> Result<()> {
        if callback::in_callback_of(&self.id) {
            return Err(WinecallError::Callback(format!(
                "{what} from inside a callback of session {}: re-entrant calls are not supported",
                self.id
            )));
        }
        Ok(())
    }

    /// Sends one request on the outbound channel. A broken channel marks
    /// the session lost; every later request fails the same way. A channel
    /// closed by `terminate` reports the session as terminated instead.
    pub(crate) fn request(&self, request: Request) -> Result<Reply> {
        self.ensure_running()?;
        self.ensure_not_in_callback(request.name())?;
        let client = self
            .client
            .get()
            .ok_or_else(|| WinecallError::Terminated(self.id.clone()))?;
        client.call(request).map_err(|err| {
            let err = WinecallError::from_rpc(err);
            if !err.is_session_lost() {
                return err;
            }
            if self.state() != SessionState::Running {
                return WinecallError::Terminated(self.id.clone());
            }
            if let WinecallError::SessionLost(reason) = &err {
                log::error!("session {} lost: {reason}", self.id);
                self.lost.lock().get_or_insert_with(|| reason.clone());
            }
            err
        })
    }

    fn launch(&self, connection: &ConnectionInfo) -> Result<()> {
        self.host.lock().launch(connection)?;

        let timeout = self.config.startup_timeout();
        let poll = self.config.poll_interval();
        let deadline = Instant::now() + timeout;
        let client = RpcClient::connect(&connection.outbound_addr(), timeout, poll)
            .map_err(|e| WinecallError::Startup(format!("cannot reach the server: {e}")))?;
        client
            .set_read_timeout(Some(timeout))
            .map_err(|e| WinecallError::Startup(e.to_string()))?;

        let status = loop {
            match client.call(Request::GetStatus) {
                Ok(Reply::Status(status)) if status.state == "up" => break status,
                Ok(reply) => log::debug!("server not ready yet: {reply:?}"),
                Err(e) if e.is_transport() => {
                    return Err(WinecallError::Startup(format!(
                        "server closed the connection during startup: {e}"
                    )))
                }
                Err(e) => log::debug!("status request failed: {e}"),
            }
            if Instant::now() >= deadline {
                return Err(WinecallError::Startup(format!(
                    "server did not come up within {:.1}s",
                    timeout.as_secs_f64()
                )));
            }
            thread::sleep(poll);
        };
        self.check_status(&status)?;
        // Routine calls may run for as long as the callee needs.
        client
            .set_read_timeout(None)
            .map_err(|e| WinecallError::Startup(e.to_string()))?;
        log::info!(
            "session {}: server {} ({}) up with pid {}",
            self.id,
            status.server_version,
            status.arch,
            status.pid
        );
        let _ = self.status.set(status);
        let _ = self.client.set(client);
        Ok(())
    }

    fn check_status(&self, status: &ServerStatus) -> Result<()> {
        if status.protocol_version != PROTOCOL_VERSION {
            return Err(WinecallError::Startup(format!(
                "server speaks protocol {}, expected {PROTOCOL_VERSION}",
                status.protocol_version
            )));
        }
        if status.arch != self.config.arch {
            return Err(WinecallError::Startup(format!(
                "server runs as {}, session expects {}",
                status.arch, self.config.arch
            )));
        }
        if status.server_version != self.config.server_version {
            return Err(WinecallError::Startup(format!(
                "server version {} does not match required {}",
                status.server_version, self.config.server_version
            )));
        }
        Ok(())
    }

    /// Terminates the session. Later calls return immediately.
    ///
    /// The server is asked to stop only when the outbound channel is idle.
    /// With a call in flight the channel is closed under it instead; the
    /// caller gets [`WinecallError::Terminated`] and the host stops the
    /// server.
    pub(crate) fn terminate(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                SessionState::Terminating | SessionState::Terminated => return,
                _ => *state = SessionState::Terminating,
            }
        }
        log::info!("terminating session {}", self.id);
        if self.lost.lock().is_none() {
            if let Some(client) = self.client.get() {
                match client.try_call(Request::Terminate) {
                    Some(Ok(_)) => {}
                    Some(Err(e)) => log::debug!("terminate request failed: {e}"),
                    None => log::info!(
                        "session {}: a call is in flight, closing the channel under it",
                        self.id
                    ),
                }
            }
        }
        self.teardown();
        log::info!("session {} terminated", self.id);
    }

    fn teardown(&self) {
        if let Some(client) = self.client.get() {
            client.close();
        }
        self.host.lock().shutdown();
        if let Some(mut inbound) = self.inbound.lock().take() {
            inbound.shutdown();
        }
        self.callbacks.clear();
        self.libraries.lock().clear();
        *self.state.lock() = SessionState::Terminated;
    }
}

/// A running bridge to one foreign server.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Starts a session whose server runs under Wine.
    pub fn start(config: SessionConfig) -> Result<Self> {
        let host = WineHost::new(&config);
        Self::start_with_host(config, Box::new(host))
    }

    /// Starts a session on an arbitrary [`ForeignHost`].
    ///
    /// The inbound listener is bound first so the server can reach it as
    /// soon as it runs. Any failure tears down what was started and is
    /// reported as [`WinecallError::Startup`].
    pub fn start_with_host(config: SessionConfig, host: Box<dyn ForeignHost>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| WinecallError::Config(format!("{e:#}")))?;
        log::info!("starting session {} ({})", config.id, config.arch);

        let callbacks = Arc::new(CallbackRegistry::new());
        let mut connection = ConnectionInfo::new(config.id.clone());
        connection.log_level = config.log_level.clone();
        let handler = Arc::new(InboundHandler::new(
            config.id.clone(),
            config.arch,
            Arc::clone(&callbacks),
        ));
        let inbound = RpcServer::bind("winecall-inbound", (connection.ip.as_str(), 0), handler)
            .map_err(|e| WinecallError::Startup(format!("cannot open the inbound channel: {e}")))?;
        connection.port_in = inbound.local_addr().port();
        connection
            .assign_ports()
            .map_err(|e| WinecallError::Startup(e.to_string()))?;

        let inner = Arc::new(SessionInner {
            id: config.id.clone(),
            config,
            state: Mutex::new(SessionState::Starting),
            lost: Mutex::new(None),
            host: Mutex::new(host),
            client: OnceCell::new(),
            status: OnceCell::new(),
            inbound: Mutex::new(Some(inbound)),
            callbacks,
            libraries: Mutex::new(HashMap::new()),
        });

        if let Err(err) = inner.launch(&connection) {
            log::error!("session {} failed to start: {err}", inner.id);
            *inner.state.lock() = SessionState::Terminating;
            inner.teardown();
            return Err(match err {
                WinecallError::Startup(_) => err,
                other => WinecallError::Startup(other.to_string()),
            });
        }
        *inner.state.lock() = SessionState::Running;
        if inner.config.exit_hooks {
            hooks::register(&inner);
        }
        Ok(Self { inner })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn arch(&self) -> Arch {
        self.inner.arch()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Status the server reported during startup.
    pub fn server_status(&self) -> Option<&ServerStatus> {
        self.inner.status.get()
    }

    /// Whether the channel to the server broke while the session ran.
    pub fn is_lost(&self) -> bool {
        self.inner.lost.lock().is_some()
    }

    /// Path under which the foreign side sees `path`.
    pub fn translate_path(&self, path: impl AsRef<Path>) -> Result<String> {
        self.inner.host.lock().translate_path(path.as_ref())
    }

    /// Native file behind a path the foreign side reported.
    pub fn native_path(&self, foreign: &str) -> Result<PathBuf> {
        self.inner.host.lock().native_path(foreign)
    }

    /// Loads a library into the server. Loading the same file again returns
    /// the handle from the first load, whatever the convention.
    pub fn load_library(
        &self,
        path: impl AsRef<Path>,
        convention: CallingConvention,
    ) -> Result<LibraryHandle> {
        self.inner.ensure_running()?;
        let path = path.as_ref();
        let canonical = fs::canonicalize(path)
            .map_err(|e| WinecallError::LibraryLoad(format!("{}: {e}", path.display())))?;

        let mut libraries = self.inner.libraries.lock();
        if let Some(handle) = libraries.get(&canonical) {
            if handle.convention() != convention {
                log::warn!(
                    "{} is already loaded as {}, ignoring {convention}",
                    canonical.display(),
                    handle.convention()
                );
            }
            return Ok(handle.clone());
        }

        let foreign_path = self.translate_path(&canonical)?;
        let handle = LibraryHandle::new(
            Arc::downgrade(&self.inner),
            canonical.clone(),
            foreign_path,
            convention,
        );
        self.inner.request(Request::AccessLibrary(AccessLibrary {
            path: handle.foreign_path().to_string(),
            path_native: handle.path_native().to_string(),
            name: handle.name().to_string(),
            convention,
        }))?;
        log::info!(
            "loaded {} as {}",
            canonical.display(),
            handle.foreign_path()
        );
        libraries.insert(canonical, handle.clone());
        Ok(handle)
    }

    /// Registers `closure` as a callback the foreign side can call. The
    /// returned value is passed where the signature declares the callback.
    pub fn callback<F>(&self, signature: CallbackSignature, closure: F) -> Result<Value>
    where
        F: Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.inner.ensure_running()?;
        signature
            .validate()
            .map_err(|e| WinecallError::TypeRegistration(e.to_string()))?;
        let token = self.inner.callbacks.register(signature, Arc::new(closure));
        Ok(Value::Callback(token))
    }

    /// Stops the server and releases everything the session owns. Calling
    /// it again has no effect.
    pub fn terminate(&self) {
        self.inner.terminate();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.inner.terminate();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("arch", &self.inner.config.arch)
            .field("state", &self.state())
            .finish()
    }
}
