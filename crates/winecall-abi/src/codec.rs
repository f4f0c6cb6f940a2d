//! Byte-level encoding of pointer-free values.

use crate::descriptor::{Arch, TypeDescriptor};
use crate::value::{Scalar, Value};
use crate::ValueError;

/// Encodes a value of a plain descriptor into exactly `descriptor.size()` bytes.
pub fn encode_plain(
    descriptor: &TypeDescriptor,
    value: &Value,
    arch: Arch,
) -> Result<Vec<u8>, ValueError> {
    let size = descriptor.size(arch)?;
    let mut out = vec![0u8; size];
    write_plain(descriptor, value, arch, &mut out)?;
    Ok(out)
}

fn write_plain(
    descriptor: &TypeDescriptor,
    value: &Value,
    arch: Arch,
    out: &mut [u8],
) -> Result<(), ValueError> {
    match (descriptor, value) {
        (TypeDescriptor::Fundamental(kind), Value::Scalar(scalar)) => {
            let scalar = scalar
                .coerce(*kind, arch)
                .ok_or_else(|| ValueError::OutOfRange {
                    kind: *kind,
                    value: format!("{scalar:?}"),
                })?;
            let bytes = scalar.to_le_bytes(arch);
            out[..bytes.len()].copy_from_slice(&bytes);
            Ok(())
        }
        (TypeDescriptor::Padding(_), _) => Ok(()),
        (TypeDescriptor::FixedArray(element, len), Value::Array(items)) => {
            if items.len() != *len {
                return Err(ValueError::ArrayLength {
                    expected: *len,
                    found: items.len(),
                });
            }
            let stride = element.size(arch)?;
            for (i, item) in items.iter().enumerate() {
                write_plain(element, item, arch, &mut out[i * stride..(i + 1) * stride])?;
            }
            Ok(())
        }
        (TypeDescriptor::Struct(descriptor), Value::Struct(values)) => {
            let offsets = descriptor.offsets(arch)?;
            let mut values = values.iter();
            for (field, offset) in descriptor.fields.iter().zip(offsets) {
                if field.is_padding() {
                    continue;
                }
                let (name, item) = values.next().ok_or_else(|| ValueError::MissingField {
                    structure: descriptor.name.clone(),
                    field: field.name.clone(),
                })?;
                if *name != field.name {
                    return Err(ValueError::FieldName {
                        expected: field.name.clone(),
                        found: name.clone(),
                    });
                }
                let size = field.ty.size(arch)?;
                write_plain(&field.ty, item, arch, &mut out[offset..offset + size])?;
            }
            if let Some((extra, _)) = values.next() {
                return Err(ValueError::UnexpectedField {
                    structure: descriptor.name.clone(),
                    field: extra.clone(),
                });
            }
            Ok(())
        }
        (descriptor, value) if !descriptor.is_plain() => Err(ValueError::NotPlain(
            format!("{descriptor} cannot be encoded as raw bytes ({})", value.shape()),
        )),
        (descriptor, value) => Err(ValueError::Shape {
            expected: descriptor.to_string(),
            found: value.shape(),
        }),
    }
}

/// Decodes a plain descriptor from the front of `bytes`.
pub fn decode_plain(
    descriptor: &TypeDescriptor,
    bytes: &[u8],
    arch: Arch,
) -> Result<Value, ValueError> {
    let size = descriptor.size(arch)?;
    if bytes.len() < size {
        return Err(ValueError::Truncated {
            expected: size,
            found: bytes.len(),
        });
    }
    match descriptor {
        TypeDescriptor::Fundamental(kind) => {
            Ok(Value::Scalar(Scalar::from_le_bytes(*kind, arch, bytes)?))
        }
        TypeDescriptor::FixedArray(element, len) => {
            let stride = element.size(arch)?;
            (0..*len)
                .map(|i| decode_plain(element, &bytes[i * stride..], arch))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array)
        }
        TypeDescriptor::Struct(descriptor) => {
            let offsets = descriptor.offsets(arch)?;
            let mut fields = Vec::new();
            for (field, offset) in descriptor.fields.iter().zip(offsets) {
                if field.is_padding() {
                    continue;
                }
                fields.push((field.name.clone(), decode_plain(&field.ty, &bytes[offset..], arch)?));
            }
            Ok(Value::Struct(fields))
        }
        other => Err(ValueError::NotPlain(format!(
            "{other} cannot be decoded from raw bytes"
        ))),
    }
}

/// Decodes `count` consecutive elements.
pub fn decode_elements(
    element: &TypeDescriptor,
    bytes: &[u8],
    count: usize,
    arch: Arch,
) -> Result<Vec<Value>, ValueError> {
    let stride = element.size(arch)?;
    (0..count)
        .map(|i| decode_plain(element, bytes.get(i * stride..).unwrap_or(&[]), arch))
        .collect()
}
