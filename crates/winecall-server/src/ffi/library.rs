//! Library loading and symbol lookup.

use std::ffi::CString;
use std::path::Path;
use std::sync::Arc;

use libloading::Library;

use crate::backend::BackendError;

/// A loaded DLL. Clones share the handle; the library is unloaded when the
/// last clone goes away.
#[derive(Clone)]
pub struct NativeLibrary {
    library: Arc<Library>,
    path: String,
}

impl NativeLibrary {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        let path = path.as_ref();
        // SAFETY: loading runs the library's initialisers; the client asked
        // for this library explicitly.
        let library = unsafe { Library::new(path) }.map_err(|e| {
            BackendError::Load(format!("failed to load library '{}': {e}", path.display()))
        })?;
        Ok(Self {
            library: Arc::new(library),
            path: path.display().to_string(),
        })
    }

    /// Address of an exported routine.
    pub fn symbol(&self, name: &str) -> Result<usize, BackendError> {
        let c_name = CString::new(name)
            .map_err(|_| BackendError::Resolve(format!("invalid routine name: {name:?}")))?;
        // SAFETY: the symbol is only used as an address; its type is given
        // later by the registered signature.
        let symbol = unsafe {
            self.library
                .get::<unsafe extern "C" fn()>(c_name.as_bytes_with_nul())
        }
        .map_err(|e| {
            BackendError::Resolve(format!("routine '{name}' not found in '{}': {e}", self.path))
        })?;
        Ok(*symbol as usize)
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_library() {
        let dir = tempfile::tempdir().unwrap();
        let err = match NativeLibrary::load(dir.path().join("missing.dll")) {
            Ok(_) => panic!("loaded a library that does not exist"),
            Err(err) => err,
        };
        assert!(matches!(err, BackendError::Load(_)));
        assert!(err.to_string().contains("missing.dll"));
    }
}
