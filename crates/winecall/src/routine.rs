//! Routine handles and the call path.
//!
//! A routine is configured with argument types, a return type and memsync
//! rules, then called any number of times. The first call freezes the
//! configuration and registers it with the server; if that registration
//! fails the routine is poisoned and every later call fails the same way.
//!
//! A call goes through these steps:
//! 1. arguments are checked against the signature and coerced
//! 2. memory blocks of the memsync rules are collected and the arguments
//!    stripped of them
//! 3. the server calls the routine and sends back the result, the
//!    arguments as the callee left them and the after-call blocks
//! 4. out-parameters and synchronized memory are written into the
//!    caller's arguments

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use winecall_abi::{
    Arch, MemsyncPlan, MemsyncRule, Phase, RoutineSignature, TypeDescriptor, Value,
};
use winecall_rpc::{CallResult, CallRoutine, RegisterTypes, Reply, Request, RoutineRef};

use crate::error::{Result, WinecallError};
use crate::marshal;
use crate::session::SessionInner;

#[derive(Default)]
struct RoutineState {
    signature: RoutineSignature,
    plan: Option<MemsyncPlan>,
    /// Set by the first call; later configuration is ignored
    frozen: bool,
    registered: bool,
    poisoned: Option<String>,
    calls: u64,
}

struct RoutineInner {
    session: Weak<SessionInner>,
    reference: RoutineRef,
    arch: Arch,
    state: Mutex<RoutineState>,
}

/// A resolved routine. Clones share configuration and state.
#[derive(Clone)]
pub struct Routine {
    inner: Arc<RoutineInner>,
}

impl Routine {
    pub(crate) fn new(session: Weak<SessionInner>, reference: RoutineRef, arch: Arch) -> Self {
        Self {
            inner: Arc::new(RoutineInner {
                session,
                reference,
                arch,
                state: Mutex::new(RoutineState::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.reference.routine
    }

    pub fn library(&self) -> &str {
        &self.inner.reference.library
    }

    pub fn set_args(&self, args: Vec<TypeDescriptor>) -> &Self {
        self.configure("argument types", |signature| signature.args = args)
    }

    pub fn set_return(&self, ret: TypeDescriptor) -> &Self {
        self.configure("return type", |signature| signature.ret = ret)
    }

    pub fn add_memsync(&self, rule: MemsyncRule) -> &Self {
        self.configure("memsync rule", |signature| signature.memsync.push(rule))
    }

    /// Replaces the whole configuration at once.
    pub fn set_signature(&self, signature: RoutineSignature) -> &Self {
        self.configure("signature", |current| *current = signature)
    }

    pub fn signature(&self) -> RoutineSignature {
        self.inner.state.lock().signature.clone()
    }

    /// Whether the first call has fixed the configuration
    pub fn is_frozen(&self) -> bool {
        self.inner.state.lock().frozen
    }

    pub fn is_poisoned(&self) -> bool {
        self.inner.state.lock().poisoned.is_some()
    }

    /// Number of calls that completed
    pub fn call_count(&self) -> u64 {
        self.inner.state.lock().calls
    }

    fn configure(&self, what: &str, change: impl FnOnce(&mut RoutineSignature)) -> &Self {
        let mut state = self.inner.state.lock();
        if state.frozen {
            log::warn!(
                "{}: ignoring new {what}, the configuration of the first call stays",
                self.name()
            );
        } else {
            change(&mut state.signature);
        }
        self
    }

    /// Calls the routine. Pointer arguments are updated in place with what
    /// the callee wrote; the return value is returned.
    pub fn call(&self, args: &mut [Value]) -> Result<Value> {
        let session = self
            .inner
            .session
            .upgrade()
            .ok_or_else(|| WinecallError::Terminated(self.inner.reference.library.clone()))?;
        session.ensure_running()?;
        session.ensure_not_in_callback(self.name())?;

        let mut guard = self.inner.state.lock();
        if let Some(reason) = &guard.poisoned {
            return Err(self.poisoned(reason));
        }
        if !guard.frozen {
            guard.frozen = true;
            match guard.signature.compile(self.inner.arch) {
                Ok(plan) => guard.plan = Some(plan),
                Err(e) => {
                    let reason = e.to_string();
                    log::error!("{}: {reason}", self.name());
                    guard.poisoned = Some(reason.clone());
                    return Err(WinecallError::TypeRegistration(reason));
                }
            }
        }
        let RoutineState {
            signature,
            plan,
            registered,
            poisoned,
            calls,
            ..
        } = &mut *guard;
        let Some(plan) = plan.as_ref() else {
            return Err(self.poisoned("no compiled configuration"));
        };

        let mut outbound = marshal::conform(signature, plan, args, self.inner.arch)?;
        let memory = plan.collect(&outbound, None, Phase::Before)?;
        plan.strip(&mut outbound, None, Phase::Before)?;

        if !*registered {
            let request = Request::RegisterTypes(RegisterTypes {
                routine: self.inner.reference.clone(),
                signature: signature.clone(),
            });
            match session.request(request) {
                Ok(_) => *registered = true,
                Err(e) if e.is_session_lost() || matches!(e, WinecallError::Terminated(_)) => {
                    return Err(e)
                }
                Err(e) => {
                    let reason = match e {
                        WinecallError::TypeRegistration(reason) => reason,
                        other => other.to_string(),
                    };
                    log::error!("{}: type registration failed: {reason}", self.name());
                    *poisoned = Some(reason.clone());
                    return Err(WinecallError::TypeRegistration(reason));
                }
            }
        }

        log::trace!("calling {} with {} memory blocks", self.name(), memory.len());
        let reply = session.request(Request::CallRoutine(CallRoutine {
            routine: self.inner.reference.clone(),
            args: outbound,
            memory,
        }))?;
        let Reply::Called(CallResult {
            mut ret,
            args: returned,
            memory,
        }) = reply
        else {
            return Err(WinecallError::CallFailed(format!(
                "unexpected reply to {}",
                self.name()
            )));
        };
        if returned.len() != args.len() {
            return Err(WinecallError::CallFailed(format!(
                "server returned {} arguments for {}, expected {}",
                returned.len(),
                self.name(),
                args.len()
            )));
        }

        for ((descriptor, caller), returned) in signature.args.iter().zip(args.iter_mut()).zip(returned) {
            if matches!(descriptor, TypeDescriptor::Pointer(_)) {
                marshal::restore(descriptor, caller, returned);
            }
        }
        plan.apply(args, Some(&mut ret), memory)?;
        *calls += 1;
        Ok(ret)
    }

    fn poisoned(&self, reason: &str) -> WinecallError {
        WinecallError::Poisoned {
            routine: self.name().to_string(),
            reason: reason.to_string(),
        }
    }
}

impl fmt::Debug for Routine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Routine")
            .field("library", &self.inner.reference.library)
            .field("name", &self.inner.reference.routine)
            .finish()
    }
}
