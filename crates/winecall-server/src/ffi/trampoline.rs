//! C function pointers that forward to native callbacks.
//!
//! Each (token, signature) pair gets one libffi closure, created the first
//! time the token is passed to foreign code and kept for the life of the
//! server. A callback that fails returns zero to its caller; the failure is
//! recorded on the [`CallbackHub`] and reported with the routine call.

use std::collections::HashMap;
use std::ffi::c_void;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use libffi::low::ffi_cif;
use libffi::middle::Closure;
use libffi::raw::ffi_arg;
use parking_lot::Mutex;
use winecall_abi::codec::decode_plain;
use winecall_abi::{Arch, CallbackSignature, CallbackToken, Scalar, TypeDescriptor, Value};

use super::memory::{read_bytes, CodePointers};
use super::types::build_cif;
use crate::backend::{BackendError, CallbackHub};

struct Trampoline {
    token: CallbackToken,
    signature: CallbackSignature,
    arch: Arch,
    hub: Arc<CallbackHub>,
}

struct Entry {
    signature: CallbackSignature,
    code: usize,
    _closure: Closure<'static>,
}

// Closures are created and dropped only under the table lock, and their
// code pointers never change.
unsafe impl Send for Entry {}

pub struct ClosureTable {
    arch: Arch,
    closures: Mutex<HashMap<CallbackToken, Vec<Entry>>>,
}

impl ClosureTable {
    pub fn new(arch: Arch) -> Self {
        Self {
            arch,
            closures: Mutex::new(HashMap::new()),
        }
    }

    pub fn code_pointer(
        &self,
        token: CallbackToken,
        signature: &CallbackSignature,
        hub: &Arc<CallbackHub>,
    ) -> Result<usize, BackendError> {
        let mut closures = self.closures.lock();
        let entries = closures.entry(token).or_default();
        if let Some(entry) = entries.iter().find(|entry| entry.signature == *signature) {
            return Ok(entry.code);
        }

        signature.validate()?;
        let cif = build_cif(&signature.args, &signature.ret, signature.convention, self.arch)?;
        // Closures live as long as the server, so their data does too.
        let data: &'static Trampoline = Box::leak(Box::new(Trampoline {
            token,
            signature: signature.clone(),
            arch: self.arch,
            hub: Arc::clone(hub),
        }));
        let closure = Closure::new(cif, trampoline, data);
        let code = *closure.code_ptr() as usize;
        log::debug!("created trampoline for {token} at {code:#x}");
        entries.push(Entry {
            signature: signature.clone(),
            code,
            _closure: closure,
        });
        Ok(code)
    }

    pub fn len(&self) -> usize {
        self.closures.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// [`CodePointers`] for one routine call.
pub struct CallbackCode<'a> {
    pub table: &'a ClosureTable,
    pub hub: &'a Arc<CallbackHub>,
}

impl CodePointers for CallbackCode<'_> {
    fn code_pointer(
        &mut self,
        token: CallbackToken,
        signature: &CallbackSignature,
    ) -> Result<usize, BackendError> {
        self.table.code_pointer(token, signature, self.hub)
    }
}

unsafe extern "C" fn trampoline(
    _cif: &ffi_cif,
    result: &mut ffi_arg,
    args: *const *const c_void,
    data: &Trampoline,
) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| data.run(args)));
    let value = match outcome {
        Ok(Ok(value)) => Some(value),
        // Already recorded by the hub.
        Ok(Err(_)) => None,
        Err(_) => {
            data.hub
                .record_failure(format!("callback {} panicked", data.token));
            None
        }
    };
    write_return(result as *mut ffi_arg as *mut u8, &data.signature.ret, value, data.arch);
}

impl Trampoline {
    fn run(&self, args: *const *const c_void) -> Result<Value, BackendError> {
        let mut values = Vec::with_capacity(self.signature.args.len());
        for (i, descriptor) in self.signature.args.iter().enumerate() {
            let size = descriptor.size(self.arch)?;
            // SAFETY: libffi passes one pointer per declared argument.
            let bytes = unsafe { read_bytes(*args.add(i) as usize, size) };
            values.push(decode_argument(descriptor, &bytes, self.arch)?);
        }
        self.hub.invoke(self.token, values)
    }
}

fn decode_argument(
    descriptor: &TypeDescriptor,
    bytes: &[u8],
    arch: Arch,
) -> Result<Value, BackendError> {
    let TypeDescriptor::Pointer(target) = descriptor else {
        return Ok(decode_plain(descriptor, bytes, arch)?);
    };
    let address = match Scalar::from_le_bytes(winecall_abi::ScalarKind::Handle, arch, bytes)? {
        Scalar::Handle(address) => address as usize,
        _ => 0,
    };
    if address == 0 {
        return Ok(Value::null());
    }
    let size = target.size(arch)?;
    // SAFETY: the foreign caller passes a pointer to a live object of the
    // declared type.
    let pointee = unsafe { read_bytes(address, size) };
    Ok(Value::by_ref(decode_plain(target, &pointee, arch)?))
}

/// Stores a callback result the way libffi expects: integers widened to a
/// full `ffi_arg`, floats at their own width. Missing or unconvertible
/// results become zero.
///
/// # Safety
///
/// `out` must be libffi's result buffer for a return of type `ret`.
unsafe fn write_return(out: *mut u8, ret: &TypeDescriptor, value: Option<Value>, arch: Arch) {
    let TypeDescriptor::Fundamental(kind) = ret else {
        return;
    };
    let scalar = value
        .and_then(|value| value.as_scalar())
        .and_then(|scalar| scalar.coerce(*kind, arch))
        .unwrap_or_else(|| Scalar::zero(*kind));
    let bytes = if kind.is_float() {
        scalar.to_le_bytes(arch)
    } else {
        let wide = scalar.as_i128().unwrap_or_default();
        let word = if kind.is_signed() {
            (wide as i64).to_le_bytes()
        } else {
            (wide as u64).to_le_bytes()
        };
        word[..mem::size_of::<ffi_arg>()].to_vec()
    };
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), out, bytes.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CallbackInvoker;
    use winecall_abi::ScalarKind;

    struct Summing;

    impl CallbackInvoker for Summing {
        fn invoke(&self, _token: CallbackToken, args: Vec<Value>) -> Result<Value, BackendError> {
            let mut total = 0i128;
            for arg in &args {
                let scalar = match arg {
                    Value::Pointer(winecall_abi::Pointer::Ref(inner)) => inner.as_scalar(),
                    other => other.as_scalar(),
                };
                total += scalar.and_then(|s| s.as_i128()).unwrap_or_default();
            }
            if total < 0 {
                return Err(BackendError::Callback("negative total".into()));
            }
            Ok(Value::from(total as i32))
        }
    }

    fn i32_t() -> TypeDescriptor {
        TypeDescriptor::scalar(ScalarKind::I32)
    }

    #[test]
    fn test_trampoline_forwards_to_hub() {
        let arch = Arch::host();
        let hub = Arc::new(CallbackHub::new(Arc::new(Summing)));
        let table = ClosureTable::new(arch);
        let signature = CallbackSignature::new(
            vec![i32_t(), TypeDescriptor::pointer_to(i32_t())],
            i32_t(),
        )
        .with_convention(winecall_abi::CallingConvention::Cdecl);
        let code = table.code_pointer(CallbackToken(1), &signature, &hub).unwrap();
        assert_eq!(table.code_pointer(CallbackToken(1), &signature, &hub).unwrap(), code);
        assert_eq!(table.len(), 1);

        // SAFETY: the closure was built for exactly this signature.
        let function: extern "C" fn(i32, *const i32) -> i32 = unsafe { mem::transmute(code) };
        let extra = 5i32;
        assert_eq!(function(3, &extra), 8);
        assert_eq!(function(4, std::ptr::null()), 4);

        hub.begin_call();
        assert_eq!(function(-10, std::ptr::null()), 0);
        assert_eq!(hub.take_failure().as_deref(), Some("callback failed: negative total"));
    }

    #[test]
    fn test_return_widening() {
        let mut slot: ffi_arg = ffi_arg::MAX;
        unsafe {
            write_return(
                &mut slot as *mut ffi_arg as *mut u8,
                &TypeDescriptor::scalar(ScalarKind::I8),
                Some(Value::from(-1i8)),
                Arch::host(),
            )
        };
        assert_eq!(slot, ffi_arg::MAX);

        unsafe {
            write_return(
                &mut slot as *mut ffi_arg as *mut u8,
                &TypeDescriptor::scalar(ScalarKind::U16),
                None,
                Arch::host(),
            )
        };
        assert_eq!(slot, 0);
    }
}
