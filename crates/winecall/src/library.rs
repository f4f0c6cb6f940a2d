use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use winecall_abi::CallingConvention;
use winecall_rpc::{Request, RoutineRef};

use crate::error::{Result, WinecallError};
use crate::routine::Routine;
use crate::session::SessionInner;

struct LibraryInner {
    session: Weak<SessionInner>,
    path: PathBuf,
    /// `path` as sent to the server; routines name the library by it
    path_native: String,
    name: String,
    foreign_path: String,
    convention: CallingConvention,
    routines: Mutex<HashMap<String, Routine>>,
}

/// A library loaded into a session's server. Cloning is cheap and every
/// clone shares the routine cache.
#[derive(Clone)]
pub struct LibraryHandle {
    inner: Arc<LibraryInner>,
}

impl LibraryHandle {
    pub(crate) fn new(
        session: Weak<SessionInner>,
        path: PathBuf,
        foreign_path: String,
        convention: CallingConvention,
    ) -> Self {
        let path_native = path.to_string_lossy().into_owned();
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path_native.clone());
        Self {
            inner: Arc::new(LibraryInner {
                session,
                path,
                path_native,
                name,
                foreign_path,
                convention,
                routines: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Canonical native path of the library file
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// File name of the library
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub(crate) fn path_native(&self) -> &str {
        &self.inner.path_native
    }

    /// Path the server opened the library under
    pub fn foreign_path(&self) -> &str {
        &self.inner.foreign_path
    }

    pub fn convention(&self) -> CallingConvention {
        self.inner.convention
    }

    /// Resolves `name` in the library. The server is asked once per name;
    /// later lookups return the same routine.
    pub fn routine(&self, name: &str) -> Result<Routine> {
        let mut routines = self.inner.routines.lock();
        if let Some(routine) = routines.get(name) {
            return Ok(routine.clone());
        }
        let session = self
            .inner
            .session
            .upgrade()
            .ok_or_else(|| WinecallError::Terminated(self.inner.foreign_path.clone()))?;
        let reference = RoutineRef {
            library: self.inner.path_native.clone(),
            routine: name.to_string(),
        };
        session.request(Request::RegisterRoutine(reference.clone()))?;
        log::debug!("resolved {name} in {}", self.inner.name);
        let routine = Routine::new(Arc::downgrade(&session), reference, session.arch());
        routines.insert(name.to_string(), routine.clone());
        Ok(routine)
    }
}

impl fmt::Debug for LibraryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibraryHandle")
            .field("path", &self.inner.path)
            .field("foreign_path", &self.inner.foreign_path)
            .field("convention", &self.inner.convention)
            .finish()
    }
}
