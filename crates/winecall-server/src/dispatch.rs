//! Request dispatcher
//!
//! Owns the libraries and routines of one session and turns outbound
//! requests into backend operations.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use winecall_abi::{Arch, MemsyncPlan, Phase, RoutineSignature};
use winecall_rpc::{
    AccessLibrary, CallResult, CallRoutine, FailureKind, Handler, RegisterTypes, RemoteFailure,
    Reply, Request, RoutineRef, ServerControl, ServerStatus, PROTOCOL_VERSION,
};

use crate::backend::{BackendError, BoundRoutine, CallFrame, CallbackHub, LoadedLibrary, RoutineBackend};

pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

struct LibraryEntry {
    library: Box<dyn LoadedLibrary>,
    routines: HashMap<String, RoutineEntry>,
}

struct RoutineEntry {
    routine: Box<dyn BoundRoutine>,
    configured: Option<(RoutineSignature, MemsyncPlan)>,
    calls: u64,
}

pub struct Dispatcher {
    session_id: String,
    arch: Arch,
    backend: Box<dyn RoutineBackend>,
    callbacks: Arc<CallbackHub>,
    libraries: Mutex<HashMap<String, LibraryEntry>>,
}

impl Dispatcher {
    pub fn new(
        session_id: impl Into<String>,
        arch: Arch,
        backend: Box<dyn RoutineBackend>,
        callbacks: Arc<CallbackHub>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            arch,
            backend,
            callbacks,
            libraries: Mutex::new(HashMap::new()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn status(&self) -> ServerStatus {
        ServerStatus {
            state: "up".to_string(),
            protocol_version: PROTOCOL_VERSION,
            server_version: SERVER_VERSION.to_string(),
            arch: self.arch,
            pid: std::process::id(),
        }
    }

    /// Opens `request.path` and files it under `request.path_native`, the
    /// key later requests name the library by.
    fn access_library(&self, request: AccessLibrary) -> Result<Reply, RemoteFailure> {
        let mut libraries = self.libraries.lock();
        if libraries.contains_key(&request.path_native) {
            log::debug!("library {} already loaded", request.name);
            return Ok(Reply::Ack);
        }
        let library = self
            .backend
            .open(&request.path, request.convention)
            .map_err(|e| RemoteFailure::new(FailureKind::LibraryLoad, e.to_string()))?;
        log::info!(
            "loaded {} from {} ({})",
            request.name,
            request.path,
            request.convention
        );
        libraries.insert(
            request.path_native,
            LibraryEntry {
                library,
                routines: HashMap::new(),
            },
        );
        Ok(Reply::Ack)
    }

    fn register_routine(&self, request: RoutineRef) -> Result<Reply, RemoteFailure> {
        let mut libraries = self.libraries.lock();
        let entry = libraries.get_mut(&request.library).ok_or_else(|| {
            RemoteFailure::new(
                FailureKind::LibraryLoad,
                format!("library {} is not loaded", request.library),
            )
        })?;
        if entry.routines.contains_key(&request.routine) {
            return Ok(Reply::Ack);
        }
        let routine = entry
            .library
            .resolve(&request.routine)
            .map_err(|e| RemoteFailure::new(FailureKind::RoutineResolution, e.to_string()))?;
        log::debug!("resolved {} in {}", request.routine, request.library);
        entry.routines.insert(
            request.routine,
            RoutineEntry {
                routine,
                configured: None,
                calls: 0,
            },
        );
        Ok(Reply::Ack)
    }

    fn register_types(&self, request: RegisterTypes) -> Result<Reply, RemoteFailure> {
        let failure = |message: String| RemoteFailure::new(FailureKind::TypeRegistration, message);
        let mut libraries = self.libraries.lock();
        let entry = routine_entry(&mut libraries, &request.routine)?;

        if let Some((existing, _)) = &entry.configured {
            return if *existing == request.signature {
                Ok(Reply::Ack)
            } else {
                Err(failure(format!(
                    "{} is already configured with different types",
                    request.routine.routine
                )))
            };
        }

        let plan = request
            .signature
            .compile(self.arch)
            .map_err(|e| failure(e.to_string()))?;
        entry
            .routine
            .configure(&request.signature, &plan)
            .map_err(|e| failure(e.to_string()))?;
        log::debug!(
            "configured {} with {} argument(s), {} memsync rule(s)",
            request.routine.routine,
            request.signature.args.len(),
            plan.rules().len()
        );
        entry.configured = Some((request.signature, plan));
        Ok(Reply::Ack)
    }

    fn call_routine(&self, request: CallRoutine) -> Result<Reply, RemoteFailure> {
        let call_failure = |message: String| RemoteFailure::new(FailureKind::Call, message);
        let mut libraries = self.libraries.lock();
        let entry = routine_entry(&mut libraries, &request.routine)?;
        let Some((signature, plan)) = &entry.configured else {
            return Err(RemoteFailure::new(
                FailureKind::TypeRegistration,
                format!("{} has no registered types", request.routine.routine),
            ));
        };
        if request.args.len() != signature.args.len() {
            return Err(call_failure(format!(
                "{} takes {} argument(s), got {}",
                request.routine.routine,
                signature.args.len(),
                request.args.len()
            )));
        }

        let mut args = request.args;
        plan.apply(&mut args, None, request.memory)
            .map_err(|e| call_failure(e.to_string()))?;

        let mut frame = CallFrame {
            signature,
            plan,
            args,
            callbacks: &self.callbacks,
        };
        self.callbacks.begin_call();
        let routine = &mut entry.routine;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| routine.invoke(&mut frame)));
        entry.calls += 1;
        log::trace!("{} call #{}", request.routine.routine, entry.calls);

        let mut ret = match outcome {
            Ok(Ok(ret)) => ret,
            Ok(Err(BackendError::Callback(message))) => {
                return Err(RemoteFailure::new(FailureKind::Callback, message))
            }
            Ok(Err(err)) => return Err(call_failure(err.to_string())),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                log::error!("{} panicked: {message}", request.routine.routine);
                return Err(call_failure(format!("routine panicked: {message}")));
            }
        };
        if let Some(message) = self.callbacks.take_failure() {
            return Err(RemoteFailure::new(FailureKind::Callback, message));
        }

        let mut args = frame.args;
        let memory = plan
            .collect(&args, Some(&ret), Phase::After)
            .map_err(|e| call_failure(e.to_string()))?;
        plan.strip(&mut args, Some(&mut ret), Phase::After)
            .map_err(|e| call_failure(e.to_string()))?;

        Ok(Reply::Called(CallResult { ret, args, memory }))
    }
}

fn routine_entry<'a>(
    libraries: &'a mut HashMap<String, LibraryEntry>,
    routine: &RoutineRef,
) -> Result<&'a mut RoutineEntry, RemoteFailure> {
    libraries
        .get_mut(&routine.library)
        .and_then(|library| library.routines.get_mut(&routine.routine))
        .ok_or_else(|| {
            RemoteFailure::new(
                FailureKind::RoutineResolution,
                format!(
                    "{} is not registered in {}",
                    routine.routine, routine.library
                ),
            )
        })
}

impl Handler for Dispatcher {
    fn handle(&self, request: Request, control: &ServerControl) -> Result<Reply, RemoteFailure> {
        match request {
            Request::GetStatus => Ok(Reply::Status(self.status())),
            Request::AccessLibrary(request) => self.access_library(request),
            Request::RegisterRoutine(request) => self.register_routine(request),
            Request::RegisterTypes(request) => self.register_types(request),
            Request::CallRoutine(request) => self.call_routine(request),
            Request::Terminate => {
                log::info!("session {} terminating", self.session_id);
                control.shutdown();
                Ok(Reply::Ack)
            }
            other => Err(RemoteFailure::protocol(format!(
                "{} is not served on this channel",
                other.name()
            ))),
        }
    }
}
