//! Production backend: DLLs loaded with libloading, routines called
//! through libffi.

use std::ffi::c_void;
use std::mem;
use std::sync::Arc;

use libffi::middle::{Cif, CodePtr};
use libffi::raw;
use winecall_abi::{
    Arch, CallingConvention, MemsyncPlan, RoutineSignature, TypeDescriptor, Value, ValuePath,
};

use crate::backend::{BackendError, BoundRoutine, CallFrame, LoadedLibrary, RoutineBackend};

pub mod library;
pub mod memory;
pub mod trampoline;
pub mod types;

pub use library::NativeLibrary;
use memory::Materializer;
use trampoline::{CallbackCode, ClosureTable};

pub struct FfiBackend {
    arch: Arch,
    closures: Arc<ClosureTable>,
}

impl FfiBackend {
    pub fn new(arch: Arch) -> Self {
        Self {
            arch,
            closures: Arc::new(ClosureTable::new(arch)),
        }
    }
}

impl RoutineBackend for FfiBackend {
    fn open(
        &self,
        path: &str,
        convention: CallingConvention,
    ) -> Result<Box<dyn LoadedLibrary>, BackendError> {
        let library = NativeLibrary::load(path)?;
        Ok(Box::new(FfiLibrary {
            library,
            convention,
            arch: self.arch,
            closures: Arc::clone(&self.closures),
        }))
    }
}

struct FfiLibrary {
    library: NativeLibrary,
    convention: CallingConvention,
    arch: Arch,
    closures: Arc<ClosureTable>,
}

impl LoadedLibrary for FfiLibrary {
    fn resolve(&self, name: &str) -> Result<Box<dyn BoundRoutine>, BackendError> {
        let address = self.library.symbol(name)?;
        Ok(Box::new(FfiRoutine {
            name: name.to_string(),
            address,
            _library: Some(self.library.clone()),
            convention: self.convention,
            arch: self.arch,
            closures: Arc::clone(&self.closures),
            cif: None,
        }))
    }
}

struct FfiRoutine {
    name: String,
    address: usize,
    /// Keeps the code at `address` mapped
    _library: Option<NativeLibrary>,
    convention: CallingConvention,
    arch: Arch,
    closures: Arc<ClosureTable>,
    cif: Option<Cif>,
}

// The cif is only touched by the thread that holds the dispatcher's lock.
unsafe impl Send for FfiRoutine {}

impl BoundRoutine for FfiRoutine {
    fn configure(
        &mut self,
        signature: &RoutineSignature,
        plan: &MemsyncPlan,
    ) -> Result<(), BackendError> {
        if plan.arch() != self.arch {
            return Err(BackendError::Configure(format!(
                "types were laid out for {} but this server runs {}",
                plan.arch(),
                self.arch
            )));
        }
        self.cif = Some(types::build_cif(
            &signature.args,
            &signature.ret,
            self.convention,
            self.arch,
        )?);
        Ok(())
    }

    fn invoke(&mut self, frame: &mut CallFrame<'_>) -> Result<Value, BackendError> {
        let cif = self
            .cif
            .as_ref()
            .ok_or_else(|| BackendError::Configure(format!("{} is not configured", self.name)))?;
        let signature = frame.signature;
        let plan = frame.plan;
        let mut code = CallbackCode {
            table: &self.closures,
            hub: frame.callbacks,
        };
        let mut memory = Materializer::new(plan, &mut code);

        let mut storage = Vec::with_capacity(signature.args.len());
        for (i, (descriptor, value)) in signature.args.iter().zip(&frame.args).enumerate() {
            let bytes = memory.encode(descriptor, value, &ValuePath::arg(i))?;
            storage.push(to_words(&bytes));
        }
        let mut arg_ptrs: Vec<*mut c_void> = storage
            .iter_mut()
            .map(|words| words.as_mut_ptr() as *mut c_void)
            .collect();

        let ret_size = match &signature.ret {
            TypeDescriptor::Void => 0,
            descriptor => descriptor.size(self.arch)?,
        };
        let mut ret_words = vec![0u64; ret_size.max(mem::size_of::<raw::ffi_arg>()).div_ceil(8)];

        log::debug!("calling {} at {:#x}", self.name, self.address);
        let code_ptr = CodePtr(self.address as *mut c_void);
        // SAFETY: the cif was built from the registered signature, every
        // argument slot holds a value of its declared type, and the return
        // buffer covers both the return type and a full ffi_arg.
        unsafe {
            raw::ffi_call(
                cif.as_raw_ptr(),
                Some(*code_ptr.as_safe_fun()),
                ret_words.as_mut_ptr() as *mut c_void,
                arg_ptrs.as_mut_ptr(),
            );
        }

        let mut args = Vec::with_capacity(signature.args.len());
        for (i, descriptor) in signature.args.iter().enumerate() {
            if descriptor.is_plain() {
                args.push(frame.args[i].clone());
                continue;
            }
            let bytes = from_words(&storage[i], descriptor.size(self.arch)?);
            args.push(memory.decode(descriptor, &bytes, &ValuePath::arg(i))?);
        }
        let mut ret = match &signature.ret {
            TypeDescriptor::Void => Value::Void,
            descriptor => memory.decode(descriptor, &from_words(&ret_words, ret_size), &ValuePath::ret())?,
        };
        memory.sync_memory(&mut args, Some(&mut ret))?;

        frame.args = args;
        Ok(ret)
    }
}

fn to_words(bytes: &[u8]) -> Vec<u64> {
    let mut words = vec![0u64; bytes.len().div_ceil(8).max(1)];
    for (word, chunk) in words.iter_mut().zip(bytes.chunks(8)) {
        let mut buf = [0u8; 8];
        buf[..chunk.len()].copy_from_slice(chunk);
        *word = u64::from_ne_bytes(buf);
    }
    words
}

fn from_words(words: &[u64], len: usize) -> Vec<u8> {
    words
        .iter()
        .flat_map(|word| word.to_ne_bytes())
        .take(len)
        .collect()
}
