//! libffi type descriptions for descriptors.

use std::iter;

use libffi::middle::{Cif, Type};
use libffi::raw;
use winecall_abi::{Arch, CallingConvention, ScalarKind, StructDescriptor, TypeDescriptor};

use crate::backend::BackendError;

pub fn scalar_type(kind: ScalarKind) -> Type {
    match kind {
        ScalarKind::I8 | ScalarKind::Char => Type::i8(),
        ScalarKind::U8 | ScalarKind::Bool => Type::u8(),
        ScalarKind::I16 => Type::i16(),
        ScalarKind::U16 => Type::u16(),
        ScalarKind::I32 => Type::i32(),
        ScalarKind::U32 => Type::u32(),
        ScalarKind::I64 => Type::i64(),
        ScalarKind::U64 => Type::u64(),
        ScalarKind::F32 => Type::f32(),
        ScalarKind::F64 => Type::f64(),
        ScalarKind::Handle => Type::usize(),
    }
}

pub fn ffi_type(descriptor: &TypeDescriptor) -> Result<Type, BackendError> {
    Ok(match descriptor {
        TypeDescriptor::Void => Type::void(),
        TypeDescriptor::Fundamental(kind) => scalar_type(*kind),
        TypeDescriptor::Pointer(_) | TypeDescriptor::Callback(_) => Type::pointer(),
        TypeDescriptor::Struct(structure) => struct_type(structure)?,
        TypeDescriptor::FixedArray(..) | TypeDescriptor::Padding(_) => {
            return Err(BackendError::Configure(format!(
                "{descriptor} cannot be passed by value"
            )))
        }
    })
}

/// Struct type whose members mirror the descriptor's fields. Arrays and
/// padding are flattened into repeated element members.
fn struct_type(structure: &StructDescriptor) -> Result<Type, BackendError> {
    let mut members = Vec::new();
    for field in &structure.fields {
        push_members(&field.ty, &mut members)?;
    }
    Ok(Type::structure(members))
}

fn push_members(descriptor: &TypeDescriptor, members: &mut Vec<Type>) -> Result<(), BackendError> {
    match descriptor {
        TypeDescriptor::Padding(bytes) => members.extend(iter::repeat_with(Type::u8).take(*bytes)),
        TypeDescriptor::FixedArray(element, len) => {
            for _ in 0..*len {
                push_members(element, members)?;
            }
        }
        other => members.push(ffi_type(other)?),
    }
    Ok(())
}

/// Checks that libffi lays a by-value struct out exactly like the descriptor.
pub fn check_struct_layout(structure: &StructDescriptor, arch: Arch) -> Result<(), BackendError> {
    let expected = structure.layout(arch)?;
    let mut expected_offsets = Vec::new();
    for (field, offset) in structure.fields.iter().zip(structure.offsets(arch)?) {
        flat_offsets(&field.ty, offset, arch, &mut expected_offsets)?;
    }

    let mut members = Vec::new();
    for field in &structure.fields {
        push_members(&field.ty, &mut members)?;
    }
    let ty = Type::structure(members);
    let raw_type = ty.as_raw_ptr();
    let mut offsets = vec![0usize; expected_offsets.len()];
    // SAFETY: `offsets` has one slot per member of the struct type.
    let status = unsafe {
        raw::ffi_get_struct_offsets(raw::ffi_abi_FFI_DEFAULT_ABI, raw_type, offsets.as_mut_ptr())
    };
    if status != raw::ffi_status_FFI_OK {
        return Err(BackendError::Configure(format!(
            "libffi cannot lay out struct {}",
            structure.name
        )));
    }
    // SAFETY: initialised by ffi_get_struct_offsets.
    let (size, align) = unsafe { ((*raw_type).size, (*raw_type).alignment as usize) };
    if offsets != expected_offsets || size != expected.size || align != expected.align {
        return Err(BackendError::Configure(format!(
            "struct {} has a {}-byte layout but C would use {size} bytes aligned to {align}; \
             declare it with explicit padding",
            structure.name, expected.size
        )));
    }
    Ok(())
}

/// Offsets of the flattened members produced by [`push_members`].
fn flat_offsets(
    descriptor: &TypeDescriptor,
    base: usize,
    arch: Arch,
    out: &mut Vec<usize>,
) -> Result<(), BackendError> {
    match descriptor {
        TypeDescriptor::Padding(bytes) => out.extend((0..*bytes).map(|i| base + i)),
        TypeDescriptor::FixedArray(element, len) => {
            let stride = element.size(arch)?;
            for i in 0..*len {
                flat_offsets(element, base + i * stride, arch, out)?;
            }
        }
        _ => out.push(base),
    }
    Ok(())
}

/// Call interface for a routine or callback.
pub fn build_cif(
    args: &[TypeDescriptor],
    ret: &TypeDescriptor,
    convention: CallingConvention,
    arch: Arch,
) -> Result<Cif, BackendError> {
    for descriptor in args.iter().chain(iter::once(ret)) {
        if let TypeDescriptor::Struct(structure) = descriptor {
            check_struct_layout(structure, arch)?;
        }
    }
    let arg_types = args.iter().map(ffi_type).collect::<Result<Vec<_>, _>>()?;
    #[allow(unused_mut)]
    let mut cif = Cif::new(arg_types, ffi_type(ret)?);
    #[cfg(all(windows, target_arch = "x86"))]
    {
        if convention == CallingConvention::Stdcall {
            cif.set_abi(raw::ffi_abi_FFI_STDCALL);
        }
    }
    #[cfg(not(all(windows, target_arch = "x86")))]
    {
        // stdcall and cdecl coincide everywhere else.
        let _ = convention;
    }
    Ok(cif)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_natural_struct_passes_layout_check() {
        let arch = Arch::host();
        let structure = StructDescriptor::c_layout(
            "sample",
            vec![
                ("flag".into(), TypeDescriptor::scalar(ScalarKind::U8)),
                ("value".into(), TypeDescriptor::scalar(ScalarKind::F64)),
                (
                    "pair".into(),
                    TypeDescriptor::array_of(TypeDescriptor::scalar(ScalarKind::I16), 3),
                ),
            ],
            arch,
        )
        .unwrap();
        check_struct_layout(&structure, arch).unwrap();
    }

    #[test]
    fn test_packed_struct_is_rejected() {
        let structure = StructDescriptor::new(
            "packed",
            vec![
                winecall_abi::StructField::new("flag", TypeDescriptor::scalar(ScalarKind::U8)),
                winecall_abi::StructField::new("value", TypeDescriptor::scalar(ScalarKind::I32)),
            ],
        );
        let err = check_struct_layout(&structure, Arch::host()).unwrap_err();
        assert!(matches!(err, BackendError::Configure(_)));
    }

    #[test]
    fn test_arrays_are_not_passed_by_value() {
        let array = TypeDescriptor::array_of(TypeDescriptor::scalar(ScalarKind::I32), 2);
        assert!(ffi_type(&array).is_err());
    }
}
