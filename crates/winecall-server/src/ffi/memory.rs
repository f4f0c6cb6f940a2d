//! Materialisation of argument trees in this process's memory.
//!
//! Values are written as C data: pointees and synchronized blocks get their
//! own heap blocks and the enclosing pointer slot receives the address.
//! After the call the same descriptors are used to read everything back,
//! following whatever addresses the callee left behind.

use std::collections::HashMap;

use winecall_abi::codec::{decode_plain, encode_plain};
use winecall_abi::memsync::terminated_len;
use winecall_abi::{
    Arch, CallbackSignature, CallbackToken, Extent, MemBlock, MemsyncPlan, Pointer, Scalar,
    TypeDescriptor, Value, ValueError, ValuePath,
};

use crate::backend::BackendError;

/// Upper bound when scanning for a terminator in callee-owned memory.
const MAX_TERMINATED_LEN: usize = 64 * 1024 * 1024;

/// Heap blocks that stay put until the call has been read back.
#[derive(Default)]
pub struct Arena {
    blocks: Vec<Vec<u64>>,
}

impl Arena {
    /// Copies `bytes` into a fresh word-aligned block and returns its address.
    pub fn alloc(&mut self, bytes: &[u8]) -> usize {
        let words = bytes.len().div_ceil(8).max(1);
        let mut block = vec![0u64; words];
        // SAFETY: the block holds at least `bytes.len()` bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), block.as_mut_ptr() as *mut u8, bytes.len());
        }
        let address = block.as_ptr() as usize;
        self.blocks.push(block);
        address
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Resolves callback tokens to code pointers callable from C.
pub trait CodePointers {
    fn code_pointer(
        &mut self,
        token: CallbackToken,
        signature: &CallbackSignature,
    ) -> Result<usize, BackendError>;
}

/// Writes one call's values into memory and reads them back afterwards.
pub struct Materializer<'a> {
    plan: &'a MemsyncPlan,
    arch: Arch,
    arena: Arena,
    code: &'a mut dyn CodePointers,
    tokens: HashMap<usize, CallbackToken>,
    /// Synchronized blocks found during read-back: (rule, address)
    pending: Vec<(usize, usize)>,
}

impl<'a> Materializer<'a> {
    pub fn new(plan: &'a MemsyncPlan, code: &'a mut dyn CodePointers) -> Self {
        Self {
            plan,
            arch: plan.arch(),
            arena: Arena::default(),
            code,
            tokens: HashMap::new(),
            pending: Vec::new(),
        }
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    /// C representation of `value`, allocating blocks for everything it
    /// points to.
    pub fn encode(
        &mut self,
        descriptor: &TypeDescriptor,
        value: &Value,
        path: &ValuePath,
    ) -> Result<Vec<u8>, BackendError> {
        if descriptor.is_plain() {
            return Ok(encode_plain(descriptor, value, self.arch)?);
        }
        match (descriptor, value) {
            (TypeDescriptor::Pointer(target), value) => {
                let address = self.pointer(target, value, path)?;
                Ok(self.address_bytes(address))
            }
            (TypeDescriptor::Callback(signature), Value::Callback(token)) => {
                let address = self.code.code_pointer(*token, signature)?;
                self.tokens.insert(address, *token);
                Ok(self.address_bytes(address))
            }
            (TypeDescriptor::Callback(_), Value::Pointer(Pointer::Null)) => {
                Ok(self.address_bytes(0))
            }
            (TypeDescriptor::Struct(structure), Value::Struct(_)) => {
                let size = descriptor.size(self.arch)?;
                let offsets = structure.offsets(self.arch)?;
                let mut out = vec![0u8; size];
                for (field, offset) in structure.fields.iter().zip(offsets) {
                    if field.is_padding() {
                        continue;
                    }
                    let item = value.field(&field.name).ok_or_else(|| ValueError::MissingField {
                        structure: structure.name.clone(),
                        field: field.name.clone(),
                    })?;
                    let bytes = self.encode(&field.ty, item, &path.clone().field(&field.name))?;
                    out[offset..offset + bytes.len()].copy_from_slice(&bytes);
                }
                Ok(out)
            }
            (descriptor, value) => Err(ValueError::Shape {
                expected: descriptor.to_string(),
                found: value.shape(),
            }
            .into()),
        }
    }

    fn pointer(
        &mut self,
        target: &TypeDescriptor,
        value: &Value,
        path: &ValuePath,
    ) -> Result<usize, BackendError> {
        let covered = self.plan.covers(path);
        match value {
            Value::Pointer(Pointer::Null) => Ok(0),
            Value::Pointer(Pointer::Memory(bytes)) if covered => Ok(self.arena.alloc(bytes)),
            Value::Pointer(Pointer::Ref(inner)) if !covered => {
                let bytes = self.encode(target, inner, &pointee_path(target, path))?;
                Ok(self.arena.alloc(&bytes))
            }
            Value::Pointer(Pointer::Memory(_)) => Err(BackendError::Call(format!(
                "{path} carries raw memory but has no memsync rule"
            ))),
            Value::Pointer(Pointer::Ref(_)) => Err(BackendError::Call(format!(
                "{path} is synchronized memory but carries a reference"
            ))),
            other => Err(ValueError::Shape {
                expected: format!("{target}*"),
                found: other.shape(),
            }
            .into()),
        }
    }

    /// Reads a value of `descriptor` from `bytes`, dereferencing pointers.
    /// Synchronized pointers become empty blocks filled in by
    /// [`Materializer::sync_memory`].
    pub fn decode(
        &mut self,
        descriptor: &TypeDescriptor,
        bytes: &[u8],
        path: &ValuePath,
    ) -> Result<Value, BackendError> {
        if descriptor.is_plain() {
            return Ok(decode_plain(descriptor, bytes, self.arch)?);
        }
        match descriptor {
            TypeDescriptor::Pointer(target) => {
                let address = self.read_address(bytes)?;
                if let Some(rule) = self.plan.rule_for(path) {
                    if address == 0 {
                        return Ok(Value::null());
                    }
                    self.pending.push((rule, address));
                    return Ok(Value::memory(Vec::new()));
                }
                if address == 0 {
                    return Ok(Value::null());
                }
                let size = target.size(self.arch)?;
                // SAFETY: the callee hands back a pointer to a live object of
                // the declared type.
                let pointee = unsafe { read_bytes(address, size) };
                let inner = self.decode(target, &pointee, &pointee_path(target, path))?;
                Ok(Value::by_ref(inner))
            }
            TypeDescriptor::Callback(_) => {
                let address = self.read_address(bytes)?;
                Ok(match self.tokens.get(&address) {
                    Some(token) => Value::Callback(*token),
                    None => {
                        if address != 0 {
                            log::debug!("{path} holds an unknown function pointer");
                        }
                        Value::null()
                    }
                })
            }
            TypeDescriptor::Struct(structure) => {
                let offsets = structure.offsets(self.arch)?;
                let mut fields = Vec::new();
                for (field, offset) in structure.fields.iter().zip(offsets) {
                    if field.is_padding() {
                        continue;
                    }
                    let value = self.decode(
                        &field.ty,
                        bytes.get(offset..).unwrap_or(&[]),
                        &path.clone().field(&field.name),
                    )?;
                    fields.push((field.name.clone(), value));
                }
                Ok(Value::Struct(fields))
            }
            other => Err(ValueError::NotPlain(format!("cannot read {other} back")).into()),
        }
    }

    /// Copies the synchronized blocks discovered by [`Materializer::decode`]
    /// into the read-back values, in plan order.
    pub fn sync_memory(
        &mut self,
        args: &mut [Value],
        mut ret: Option<&mut Value>,
    ) -> Result<(), BackendError> {
        let pending: HashMap<usize, usize> = self.pending.drain(..).collect();
        for &rule in self.plan.order() {
            let Some(&address) = pending.get(&rule) else {
                continue;
            };
            let extent = self.plan.eval_length(rule, args, ret.as_deref())?;
            let unit = self.plan.element_size(rule);
            let bytes = match extent {
                Extent::Elements(count) => {
                    let len = self.plan.byte_len(rule, extent, &[])?;
                    log::trace!("reading {count} element(s) of rule {rule}");
                    // SAFETY: the length rule describes the callee's buffer.
                    unsafe { read_bytes(address, len) }
                }
                // SAFETY: as above; the scan stops at the terminator.
                Extent::Terminated => unsafe { read_terminated(address, unit) },
            };
            self.plan.apply(
                args,
                ret.as_deref_mut(),
                vec![MemBlock {
                    rule,
                    data: Some(bytes),
                }],
            )?;
        }
        Ok(())
    }

    fn address_bytes(&self, address: usize) -> Vec<u8> {
        Scalar::Handle(address as u64).to_le_bytes(self.arch)
    }

    fn read_address(&self, bytes: &[u8]) -> Result<usize, BackendError> {
        match Scalar::from_le_bytes(winecall_abi::ScalarKind::Handle, self.arch, bytes)? {
            Scalar::Handle(address) => Ok(address as usize),
            _ => Ok(0),
        }
    }
}

/// Path of the object a pointer at `path` refers to. Field steps see
/// through pointers to structs, so those keep the pointer's path.
fn pointee_path(target: &TypeDescriptor, path: &ValuePath) -> ValuePath {
    match target {
        TypeDescriptor::Struct(_) => path.clone(),
        _ => path.clone().deref(),
    }
}

/// # Safety
///
/// `address` must be valid for reads of `len` bytes.
pub unsafe fn read_bytes(address: usize, len: usize) -> Vec<u8> {
    if len == 0 {
        return Vec::new();
    }
    std::slice::from_raw_parts(address as *const u8, len).to_vec()
}

/// Reads `unit`-sized elements up to and including the first all-zero one.
///
/// # Safety
///
/// `address` must point at a terminated run of elements.
pub unsafe fn read_terminated(address: usize, unit: usize) -> Vec<u8> {
    let mut out = Vec::new();
    while out.len() < MAX_TERMINATED_LEN {
        let chunk = std::slice::from_raw_parts((address + out.len()) as *const u8, unit);
        out.extend_from_slice(chunk);
        if terminated_len(chunk, unit).is_some() {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use winecall_abi::{
        LengthSource, MemsyncRule, RoutineSignature, ScalarKind, StructDescriptor,
    };

    struct FixedCode;

    impl CodePointers for FixedCode {
        fn code_pointer(
            &mut self,
            token: CallbackToken,
            _signature: &CallbackSignature,
        ) -> Result<usize, BackendError> {
            Ok(0x1000 + token.0 as usize)
        }
    }

    fn i32_t() -> TypeDescriptor {
        TypeDescriptor::scalar(ScalarKind::I32)
    }

    unsafe fn write_i32(address: usize, value: i32) {
        std::ptr::write_unaligned(address as *mut i32, value);
    }

    fn address_in(bytes: &[u8]) -> usize {
        let mut buf = [0u8; 8];
        let width = Arch::host().pointer_size();
        buf[..width].copy_from_slice(&bytes[..width]);
        u64::from_le_bytes(buf) as usize
    }

    #[test]
    fn test_reference_round_trip() {
        let signature = RoutineSignature::new(vec![TypeDescriptor::pointer_to(i32_t())]);
        let plan = signature.compile(Arch::host()).unwrap();
        let mut code = FixedCode;
        let mut mat = Materializer::new(&plan, &mut code);

        let path = ValuePath::arg(0);
        let bytes = mat
            .encode(&signature.args[0], &Value::by_ref(5i32), &path)
            .unwrap();
        assert_eq!(mat.arena().len(), 1);

        // Callee overwrites the pointee.
        unsafe { write_i32(address_in(&bytes), 42) };
        let back = mat.decode(&signature.args[0], &bytes, &path).unwrap();
        assert_eq!(back, Value::by_ref(42i32));
    }

    #[test]
    fn test_null_and_memory_pointers() {
        let signature = RoutineSignature::new(vec![
            TypeDescriptor::pointer_to(TypeDescriptor::scalar(ScalarKind::U8)),
            i32_t(),
        ])
        .with_memsync(MemsyncRule::new(
            ValuePath::arg(0),
            LengthSource::Path(ValuePath::arg(1)),
        ));
        let plan = signature.compile(Arch::host()).unwrap();
        let mut code = FixedCode;
        let mut mat = Materializer::new(&plan, &mut code);

        let null = mat
            .encode(&signature.args[0], &Value::null(), &ValuePath::arg(0))
            .unwrap();
        assert!(null.iter().all(|b| *b == 0));
        assert_eq!(
            mat.decode(&signature.args[0], &null, &ValuePath::arg(0)).unwrap(),
            Value::null()
        );

        let block = mat
            .encode(&signature.args[0], &Value::memory(vec![1, 2, 3, 4]), &ValuePath::arg(0))
            .unwrap();
        let mut args = vec![
            mat.decode(&signature.args[0], &block, &ValuePath::arg(0)).unwrap(),
            Value::from(3i32),
        ];
        assert_eq!(args[0], Value::memory(Vec::new()));
        mat.sync_memory(&mut args, None).unwrap();
        assert_eq!(args[0], Value::memory(vec![1, 2, 3]));
    }

    #[test]
    fn test_memory_without_rule_is_rejected() {
        let signature = RoutineSignature::new(vec![TypeDescriptor::pointer_to(i32_t())]);
        let plan = signature.compile(Arch::host()).unwrap();
        let mut code = FixedCode;
        let mut mat = Materializer::new(&plan, &mut code);
        let err = mat
            .encode(&signature.args[0], &Value::memory(vec![0; 4]), &ValuePath::arg(0))
            .unwrap_err();
        assert!(err.to_string().contains("no memsync rule"));
    }

    #[test]
    fn test_struct_with_pointer_and_callback_fields() {
        let arch = Arch::host();
        let callback = TypeDescriptor::Callback(CallbackSignature::new(vec![i32_t()], i32_t()));
        let holder = TypeDescriptor::Struct(
            StructDescriptor::c_layout(
                "holder",
                vec![
                    ("count".into(), i32_t()),
                    ("value".into(), TypeDescriptor::pointer_to(i32_t())),
                    ("notify".into(), callback),
                ],
                arch,
            )
            .unwrap(),
        );
        let signature = RoutineSignature::new(vec![TypeDescriptor::pointer_to(holder.clone())]);
        let plan = signature.compile(arch).unwrap();
        let mut code = FixedCode;
        let mut mat = Materializer::new(&plan, &mut code);

        let value = Value::by_ref(Value::structure([
            ("count", Value::from(2i32)),
            ("value", Value::by_ref(7i32)),
            ("notify", Value::Callback(CallbackToken(9))),
        ]));
        let bytes = mat.encode(&signature.args[0], &value, &ValuePath::arg(0)).unwrap();
        // Struct block plus the pointee of `value`.
        assert_eq!(mat.arena().len(), 2);

        let back = mat.decode(&signature.args[0], &bytes, &ValuePath::arg(0)).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_terminated_read() {
        let mut arena = Arena::default();
        let address = arena.alloc(&[b'h', 0, b'i', 0, 0, 0, b'x', 0]);
        let bytes = unsafe { read_terminated(address, 2) };
        assert_eq!(bytes, vec![b'h', 0, b'i', 0, 0, 0]);
        let narrow = unsafe { read_terminated(address, 1) };
        assert_eq!(narrow, vec![b'h', 0]);
    }
}
