//! In-process foreign host for integration tests.
//!
//! The server runs on threads of the test process and executes routines
//! with a scripted backend that works directly on argument values, so the
//! whole native path (channels, memsync, callbacks) is exercised without
//! Wine.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;
use winecall::{
    Arch, CallbackSignature, CallingConvention, ConnectionInfo, ForeignHost, Scalar, ScalarKind,
    Session, SessionConfig, TypeDescriptor, Value, WinecallError,
};
use winecall_abi::{pack_scalars, unpack_scalars};
use winecall_server::{
    BackendError, BoundRoutine, CallFrame, ForeignServer, LoadedLibrary, RoutineBackend,
};

#[derive(Default)]
pub struct HostStats {
    pub launches: AtomicUsize,
    pub shutdowns: AtomicUsize,
    pub opens: AtomicUsize,
    pub configures: AtomicUsize,
    pub invocations: AtomicUsize,
    /// Foreign paths the backend was asked to open
    pub opened: Mutex<Vec<String>>,
}

impl HostStats {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

type SharedServer = Arc<Mutex<Option<ForeignServer>>>;

pub struct InProcessHost {
    arch: Arch,
    server: SharedServer,
    stats: Arc<HostStats>,
}

impl InProcessHost {
    pub fn new(arch: Arch) -> (Self, Arc<HostStats>, Crash) {
        let stats = Arc::new(HostStats::default());
        let server: SharedServer = Arc::new(Mutex::new(None));
        let host = Self {
            arch,
            server: Arc::clone(&server),
            stats: Arc::clone(&stats),
        };
        (host, stats, Crash(server))
    }
}

impl ForeignHost for InProcessHost {
    fn launch(&mut self, connection: &ConnectionInfo) -> winecall::Result<()> {
        self.stats.launches.fetch_add(1, Ordering::SeqCst);
        let backend = ScriptedBackend {
            arch: self.arch,
            stats: Arc::clone(&self.stats),
        };
        let server = ForeignServer::start(connection, self.arch, Box::new(backend))
            .map_err(|e| WinecallError::Startup(e.to_string()))?;
        *self.server.lock() = Some(server);
        Ok(())
    }

    fn translate_path(&self, path: &Path) -> winecall::Result<String> {
        winecall::wine::translate_path(path, 'Z')
    }

    fn native_path(&self, foreign: &str) -> winecall::Result<PathBuf> {
        winecall::wine::wine_to_unix(foreign, 'Z', Path::new("/nonexistent-prefix"))
    }

    fn shutdown(&mut self) {
        self.stats.shutdowns.fetch_add(1, Ordering::SeqCst);
        if let Some(mut server) = self.server.lock().take() {
            server.stop();
        }
    }
}

/// Stops the server behind the session's back.
pub struct Crash(SharedServer);

impl Crash {
    pub fn now(&self) {
        if let Some(mut server) = self.0.lock().take() {
            server.stop();
        }
    }
}

struct ScriptedBackend {
    arch: Arch,
    stats: Arc<HostStats>,
}

impl RoutineBackend for ScriptedBackend {
    fn open(
        &self,
        path: &str,
        _convention: CallingConvention,
    ) -> Result<Box<dyn LoadedLibrary>, BackendError> {
        if path.ends_with("broken.dll") {
            return Err(BackendError::Load(format!("{path}: not a valid image")));
        }
        self.stats.opens.fetch_add(1, Ordering::SeqCst);
        self.stats.opened.lock().push(path.to_string());
        Ok(Box::new(ScriptedLibrary {
            arch: self.arch,
            stats: Arc::clone(&self.stats),
        }))
    }
}

struct ScriptedLibrary {
    arch: Arch,
    stats: Arc<HostStats>,
}

const ROUTINES: &[&str] = &[
    "add_ints",
    "square_int_array_with_struct",
    "invoke_n",
    "fill_bytes",
    "increment",
    "int_range",
    "report_bytes",
    "unconfigurable",
];

impl LoadedLibrary for ScriptedLibrary {
    fn resolve(&self, name: &str) -> Result<Box<dyn BoundRoutine>, BackendError> {
        if !ROUTINES.contains(&name) && !name.starts_with("echo_") {
            return Err(BackendError::Resolve(format!("no export named `{name}`")));
        }
        Ok(Box::new(ScriptedRoutine {
            name: name.to_string(),
            arch: self.arch,
            stats: Arc::clone(&self.stats),
        }))
    }
}

struct ScriptedRoutine {
    name: String,
    arch: Arch,
    stats: Arc<HostStats>,
}

fn call_error(message: impl Into<String>) -> BackendError {
    BackendError::Call(message.into())
}

fn int(value: Option<&Value>) -> Result<i128, BackendError> {
    value
        .and_then(Value::as_scalar)
        .and_then(|s| s.as_i128())
        .ok_or_else(|| call_error("expected an integer"))
}

impl BoundRoutine for ScriptedRoutine {
    fn configure(
        &mut self,
        _signature: &winecall::RoutineSignature,
        _plan: &winecall_abi::MemsyncPlan,
    ) -> Result<(), BackendError> {
        self.stats.configures.fetch_add(1, Ordering::SeqCst);
        if self.name == "unconfigurable" {
            return Err(BackendError::Configure(
                "unsupported argument layout".to_string(),
            ));
        }
        Ok(())
    }

    fn invoke(&mut self, frame: &mut CallFrame<'_>) -> Result<Value, BackendError> {
        self.stats.invocations.fetch_add(1, Ordering::SeqCst);
        let args = &mut frame.args;
        match self.name.as_str() {
            "add_ints" => {
                let sum = int(args.first())? + int(args.get(1))?;
                Ok(Value::from(sum as i16))
            }
            name if name.starts_with("echo_") => {
                args.first().cloned().ok_or_else(|| call_error("no argument"))
            }
            "square_int_array_with_struct" => {
                let input = args[0]
                    .field("data")
                    .and_then(Value::as_memory)
                    .ok_or_else(|| call_error("input data is not memory"))?;
                let len = int(args[0].field("len"))? as usize;
                let squared: Vec<Scalar> = unpack_scalars(input, ScalarKind::I16, self.arch)
                    .into_iter()
                    .take(len)
                    .map(|s| {
                        let x = s.as_i128().unwrap_or(0);
                        Scalar::I16((x * x) as i16)
                    })
                    .collect();
                let count = squared.len() as i16;
                let out = args[1]
                    .field_mut("data")
                    .ok_or_else(|| call_error("output has no data field"))?;
                *out = Value::memory(pack_scalars(&squared, self.arch));
                let out_len = args[1]
                    .field_mut("len")
                    .ok_or_else(|| call_error("output has no len field"))?;
                *out_len = Value::from(count);
                Ok(Value::Void)
            }
            "invoke_n" => {
                let token = match args.first() {
                    Some(Value::Callback(token)) => *token,
                    _ => return Err(call_error("expected a callback")),
                };
                let n = int(args.get(1))?;
                let mut total = 0i128;
                for i in 0..n {
                    let result = frame.callbacks.invoke(token, vec![Value::from(i as i32)])?;
                    total += int(Some(&result))?;
                }
                Ok(Value::from(total as i32))
            }
            "fill_bytes" => {
                let len = int(args.get(1))? as usize;
                let buffer = args[0]
                    .as_memory()
                    .ok_or_else(|| call_error("buffer is not memory"))?;
                if buffer.len() < len {
                    return Err(call_error("buffer shorter than its length"));
                }
                args[0] = Value::memory((0..len).map(|i| i as u8 + 1).collect());
                Ok(Value::from(len as i32))
            }
            "increment" => {
                let current = int(args[0].pointee())?;
                args[0] = Value::by_ref(Value::from((current + 1) as i32));
                Ok(Value::from(0i32))
            }
            "int_range" => {
                // Returns a struct pointer holding 1..=n and n.
                let n = int(args.first())?;
                let values: Vec<Scalar> = (1..=n).map(|v| Scalar::I16(v as i16)).collect();
                Ok(Value::by_ref(Value::structure([
                    ("data", Value::memory(pack_scalars(&values, self.arch))),
                    ("len", Value::from(n as i16)),
                ])))
            }
            "report_bytes" => {
                // Writes `count` bytes whatever the caller allocated and
                // reports the count through the length pointer.
                let count = int(args.get(2))? as usize;
                args[0] = Value::memory((0..count).map(|i| 0xA0 + i as u8).collect());
                args[1] = Value::by_ref(Value::from(count as i32));
                Ok(Value::Void)
            }
            other => Err(call_error(format!("{other} cannot be called"))),
        }
    }
}

pub fn test_config() -> SessionConfig {
    SessionConfig {
        arch: Arch::host(),
        exit_hooks: false,
        startup_timeout_secs: 10,
        ..SessionConfig::default()
    }
}

pub struct Fixture {
    pub session: Session,
    pub stats: Arc<HostStats>,
    pub crash: Crash,
    pub dir: TempDir,
}

impl Fixture {
    pub fn start() -> Self {
        Self::start_with(test_config())
    }

    pub fn start_with(config: SessionConfig) -> Self {
        let (host, stats, crash) = InProcessHost::new(config.arch);
        let session = Session::start_with_host(config, Box::new(host)).unwrap();
        let dir = tempfile::tempdir().unwrap();
        Self {
            session,
            stats,
            crash,
            dir,
        }
    }

    /// Creates an empty file standing in for a DLL.
    pub fn dll(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::write(&path, b"MZ").unwrap();
        path
    }

    pub fn demo(&self) -> winecall::LibraryHandle {
        let path = self.dll("demo.dll");
        self.session
            .load_library(&path, CallingConvention::Cdecl)
            .unwrap()
    }

    /// Calls `invoke_n` once on another thread with a callback that sleeps
    /// for `nap`. Returns when the callback has started.
    pub fn call_with_sleeping_callback(&self, nap: Duration) -> JoinHandle<winecall::Result<Value>> {
        let invoke = self.demo().routine("invoke_n").unwrap();
        let i32_t = TypeDescriptor::scalar(ScalarKind::I32);
        let signature = CallbackSignature::new(vec![i32_t.clone()], i32_t.clone());
        invoke
            .set_args(vec![TypeDescriptor::Callback(signature.clone()), i32_t.clone()])
            .set_return(i32_t);

        let (entered, entered_rx) = mpsc::channel();
        let sleeper = self
            .session
            .callback(signature, move |_: &[Value]| {
                let _ = entered.send(());
                thread::sleep(nap);
                Ok(Value::from(1i32))
            })
            .unwrap();
        let caller = thread::spawn(move || invoke.call(&mut [sleeper, Value::from(1i32)]));
        entered_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        caller
    }
}
