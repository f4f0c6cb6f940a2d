//! Marshallable values.
//!
//! A [`Value`] mirrors the shape of a [`TypeDescriptor`]. Pointers carry either
//! a pointee that is passed by reference, or a block of raw bytes whose size
//! is governed by a memsync rule.
//!
//! [`TypeDescriptor`]: crate::TypeDescriptor

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::descriptor::{Arch, ScalarKind};
use crate::ValueError;

/// Identifies a native callback registered with a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallbackToken(pub u64);

impl fmt::Display for CallbackToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cb#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scalar {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(#[serde(with = "f32_text")] f32),
    F64(#[serde(with = "f64_text")] f64),
    Char(u8),
    Bool(bool),
    Handle(u64),
}

impl Scalar {
    pub fn kind(&self) -> ScalarKind {
        match self {
            Scalar::I8(_) => ScalarKind::I8,
            Scalar::U8(_) => ScalarKind::U8,
            Scalar::I16(_) => ScalarKind::I16,
            Scalar::U16(_) => ScalarKind::U16,
            Scalar::I32(_) => ScalarKind::I32,
            Scalar::U32(_) => ScalarKind::U32,
            Scalar::I64(_) => ScalarKind::I64,
            Scalar::U64(_) => ScalarKind::U64,
            Scalar::F32(_) => ScalarKind::F32,
            Scalar::F64(_) => ScalarKind::F64,
            Scalar::Char(_) => ScalarKind::Char,
            Scalar::Bool(_) => ScalarKind::Bool,
            Scalar::Handle(_) => ScalarKind::Handle,
        }
    }

    pub fn zero(kind: ScalarKind) -> Self {
        match kind {
            ScalarKind::I8 => Scalar::I8(0),
            ScalarKind::U8 => Scalar::U8(0),
            ScalarKind::I16 => Scalar::I16(0),
            ScalarKind::U16 => Scalar::U16(0),
            ScalarKind::I32 => Scalar::I32(0),
            ScalarKind::U32 => Scalar::U32(0),
            ScalarKind::I64 => Scalar::I64(0),
            ScalarKind::U64 => Scalar::U64(0),
            ScalarKind::F32 => Scalar::F32(0.0),
            ScalarKind::F64 => Scalar::F64(0.0),
            ScalarKind::Char => Scalar::Char(0),
            ScalarKind::Bool => Scalar::Bool(false),
            ScalarKind::Handle => Scalar::Handle(0),
        }
    }

    /// Integer view of the scalar; `None` for floats.
    pub fn as_i128(&self) -> Option<i128> {
        Some(match *self {
            Scalar::I8(v) => v as i128,
            Scalar::U8(v) => v as i128,
            Scalar::I16(v) => v as i128,
            Scalar::U16(v) => v as i128,
            Scalar::I32(v) => v as i128,
            Scalar::U32(v) => v as i128,
            Scalar::I64(v) => v as i128,
            Scalar::U64(v) => v as i128,
            Scalar::Char(v) => v as i128,
            Scalar::Bool(v) => v as i128,
            Scalar::Handle(v) => v as i128,
            Scalar::F32(_) | Scalar::F64(_) => return None,
        })
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            Scalar::F32(v) => v as f64,
            Scalar::F64(v) => v,
            other => other.as_i128().unwrap_or_default() as f64,
        }
    }

    /// Converts to `kind` when the value is representable without loss.
    ///
    /// Integers convert between widths when in range; integers widen to
    /// floats; floats never narrow to integers.
    pub fn coerce(self, kind: ScalarKind, arch: Arch) -> Option<Scalar> {
        if self.kind() == kind && kind != ScalarKind::Handle {
            return Some(self);
        }
        if kind.is_float() {
            return Some(match kind {
                ScalarKind::F32 => match self {
                    Scalar::F64(v) => {
                        let narrowed = v as f32;
                        if v.is_finite() && !narrowed.is_finite() {
                            return None;
                        }
                        Scalar::F32(narrowed)
                    }
                    other => Scalar::F32(other.as_f64() as f32),
                },
                _ => Scalar::F64(self.as_f64()),
            });
        }
        let v = self.as_i128()?;
        let in_range = |min: i128, max: i128| v >= min && v <= max;
        Some(match kind {
            ScalarKind::I8 if in_range(i8::MIN as i128, i8::MAX as i128) => Scalar::I8(v as i8),
            ScalarKind::U8 if in_range(0, u8::MAX as i128) => Scalar::U8(v as u8),
            ScalarKind::I16 if in_range(i16::MIN as i128, i16::MAX as i128) => {
                Scalar::I16(v as i16)
            }
            ScalarKind::U16 if in_range(0, u16::MAX as i128) => Scalar::U16(v as u16),
            ScalarKind::I32 if in_range(i32::MIN as i128, i32::MAX as i128) => {
                Scalar::I32(v as i32)
            }
            ScalarKind::U32 if in_range(0, u32::MAX as i128) => Scalar::U32(v as u32),
            ScalarKind::I64 if in_range(i64::MIN as i128, i64::MAX as i128) => {
                Scalar::I64(v as i64)
            }
            ScalarKind::U64 if in_range(0, u64::MAX as i128) => Scalar::U64(v as u64),
            ScalarKind::Char if in_range(0, u8::MAX as i128) => Scalar::Char(v as u8),
            ScalarKind::Bool if in_range(0, 1) => Scalar::Bool(v == 1),
            ScalarKind::Handle => {
                let max = match arch {
                    Arch::Win32 => u32::MAX as i128,
                    Arch::Win64 => u64::MAX as i128,
                };
                if !in_range(0, max) {
                    return None;
                }
                Scalar::Handle(v as u64)
            }
            _ => return None,
        })
    }

    /// Little-endian encoding with the width of the scalar's kind.
    pub fn to_le_bytes(&self, arch: Arch) -> Vec<u8> {
        match *self {
            Scalar::I8(v) => v.to_le_bytes().to_vec(),
            Scalar::U8(v) | Scalar::Char(v) => vec![v],
            Scalar::Bool(v) => vec![v as u8],
            Scalar::I16(v) => v.to_le_bytes().to_vec(),
            Scalar::U16(v) => v.to_le_bytes().to_vec(),
            Scalar::I32(v) => v.to_le_bytes().to_vec(),
            Scalar::U32(v) => v.to_le_bytes().to_vec(),
            Scalar::I64(v) => v.to_le_bytes().to_vec(),
            Scalar::U64(v) => v.to_le_bytes().to_vec(),
            Scalar::F32(v) => v.to_le_bytes().to_vec(),
            Scalar::F64(v) => v.to_le_bytes().to_vec(),
            Scalar::Handle(v) => match arch {
                Arch::Win32 => (v as u32).to_le_bytes().to_vec(),
                Arch::Win64 => v.to_le_bytes().to_vec(),
            },
        }
    }

    pub fn from_le_bytes(kind: ScalarKind, arch: Arch, bytes: &[u8]) -> Result<Self, ValueError> {
        let size = kind.size(arch);
        if bytes.len() < size {
            return Err(ValueError::Truncated {
                expected: size,
                found: bytes.len(),
            });
        }
        let b = &bytes[..size];
        let mut buf = [0u8; 8];
        buf[..size].copy_from_slice(b);
        Ok(match kind {
            ScalarKind::I8 => Scalar::I8(b[0] as i8),
            ScalarKind::U8 => Scalar::U8(b[0]),
            ScalarKind::Char => Scalar::Char(b[0]),
            ScalarKind::Bool => Scalar::Bool(b[0] != 0),
            ScalarKind::I16 => Scalar::I16(i16::from_le_bytes([b[0], b[1]])),
            ScalarKind::U16 => Scalar::U16(u16::from_le_bytes([b[0], b[1]])),
            ScalarKind::I32 => Scalar::I32(i32::from_le_bytes([b[0], b[1], b[2], b[3]])),
            ScalarKind::U32 => Scalar::U32(u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
            ScalarKind::F32 => Scalar::F32(f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
            ScalarKind::I64 => Scalar::I64(i64::from_le_bytes(buf)),
            ScalarKind::U64 => Scalar::U64(u64::from_le_bytes(buf)),
            ScalarKind::F64 => Scalar::F64(f64::from_le_bytes(buf)),
            ScalarKind::Handle => Scalar::Handle(u64::from_le_bytes(buf)),
        })
    }
}

macro_rules! scalar_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Scalar {
                fn from(value: $ty) -> Self {
                    Scalar::$variant(value)
                }
            }

            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Value::Scalar(Scalar::$variant(value))
                }
            }
        )*
    };
}

scalar_from! {
    i8 => I8,
    u8 => U8,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    f32 => F32,
    f64 => F64,
    bool => Bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pointer {
    Null,
    /// Pointee marshalled by value and written back after the call.
    Ref(Box<Value>),
    /// Raw bytes whose extent is decided by a memsync rule.
    Memory(#[serde(with = "base64_bytes")] Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Void,
    Scalar(Scalar),
    Array(Vec<Value>),
    /// Named field values in declaration order, padding omitted.
    Struct(Vec<(String, Value)>),
    Pointer(Pointer),
    Callback(CallbackToken),
}

impl Value {
    pub fn null() -> Self {
        Value::Pointer(Pointer::Null)
    }

    pub fn by_ref(pointee: impl Into<Value>) -> Self {
        Value::Pointer(Pointer::Ref(Box::new(pointee.into())))
    }

    pub fn memory(bytes: Vec<u8>) -> Self {
        Value::Pointer(Pointer::Memory(bytes))
    }

    pub fn structure<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        Value::Struct(
            fields
                .into_iter()
                .map(|(name, value)| (name.into(), value))
                .collect(),
        )
    }

    pub fn as_scalar(&self) -> Option<Scalar> {
        match self {
            Value::Scalar(scalar) => Some(*scalar),
            _ => None,
        }
    }

    pub fn as_memory(&self) -> Option<&[u8]> {
        match self {
            Value::Pointer(Pointer::Memory(bytes)) => Some(bytes),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Pointer(Pointer::Null))
    }

    /// Pointee of a by-reference pointer.
    pub fn pointee(&self) -> Option<&Value> {
        match self {
            Value::Pointer(Pointer::Ref(inner)) => Some(inner),
            _ => None,
        }
    }

    /// Looks up a struct field, following a by-reference pointer first.
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Struct(fields) => fields.iter().find(|(n, _)| n == name).map(|(_, v)| v),
            Value::Pointer(Pointer::Ref(inner)) => inner.field(name),
            _ => None,
        }
    }

    pub fn field_mut(&mut self, name: &str) -> Option<&mut Value> {
        match self {
            Value::Struct(fields) => fields
                .iter_mut()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v),
            Value::Pointer(Pointer::Ref(inner)) => inner.field_mut(name),
            _ => None,
        }
    }

    /// Short name of the value's shape, for diagnostics.
    pub fn shape(&self) -> &'static str {
        match self {
            Value::Void => "void",
            Value::Scalar(_) => "scalar",
            Value::Array(_) => "array",
            Value::Struct(_) => "struct",
            Value::Pointer(Pointer::Null) => "null pointer",
            Value::Pointer(Pointer::Ref(_)) => "reference",
            Value::Pointer(Pointer::Memory(_)) => "memory block",
            Value::Callback(_) => "callback",
        }
    }
}

impl From<Scalar> for Value {
    fn from(value: Scalar) -> Self {
        Value::Scalar(value)
    }
}

impl From<CallbackToken> for Value {
    fn from(value: CallbackToken) -> Self {
        Value::Callback(value)
    }
}

/// Packs scalars of a single kind into a contiguous little-endian buffer.
pub fn pack_scalars(values: &[Scalar], arch: Arch) -> Vec<u8> {
    values
        .iter()
        .flat_map(|scalar| scalar.to_le_bytes(arch))
        .collect()
}

/// Splits a buffer into scalars of `kind`; trailing bytes that do not make
/// up a whole element are ignored.
pub fn unpack_scalars(bytes: &[u8], kind: ScalarKind, arch: Arch) -> Vec<Scalar> {
    let size = kind.size(arch);
    bytes
        .chunks_exact(size)
        .filter_map(|chunk| Scalar::from_le_bytes(kind, arch, chunk).ok())
        .collect()
}

pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

pub(crate) mod base64_opt {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(text) => STANDARD
                .decode(text)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

// JSON numbers cannot hold NaN or the infinities. Those travel as strings:
// "inf", "-inf", and "nan:0x<bits>" so NaN payloads survive.
macro_rules! float_text {
    ($module:ident, $ty:ident, $bits:ident, $serialize:ident) => {
        pub(crate) mod $module {
            use serde::{Deserialize, Deserializer, Serializer};

            #[derive(Deserialize)]
            #[serde(untagged)]
            enum Repr {
                Number($ty),
                Text(String),
            }

            pub fn serialize<S: Serializer>(value: &$ty, serializer: S) -> Result<S::Ok, S::Error> {
                if value.is_nan() {
                    serializer.serialize_str(&format!("nan:{:#x}", value.to_bits()))
                } else if value.is_infinite() {
                    serializer.serialize_str(if *value > 0.0 { "inf" } else { "-inf" })
                } else {
                    serializer.$serialize(*value)
                }
            }

            pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<$ty, D::Error> {
                let text = match Repr::deserialize(deserializer)? {
                    Repr::Number(value) => return Ok(value),
                    Repr::Text(text) => text,
                };
                let invalid = || -> D::Error {
                    serde::de::Error::custom(format!("`{text}` is not a floating-point value"))
                };
                match text.as_str() {
                    "inf" => Ok($ty::INFINITY),
                    "-inf" => Ok($ty::NEG_INFINITY),
                    "nan" => Ok($ty::NAN),
                    other => {
                        let hex = other.strip_prefix("nan:0x").ok_or_else(invalid)?;
                        let value = $bits::from_str_radix(hex, 16)
                            .map($ty::from_bits)
                            .map_err(|_| invalid())?;
                        if value.is_nan() {
                            Ok(value)
                        } else {
                            Err(invalid())
                        }
                    }
                }
            }
        }
    };
}

float_text!(f32_text, f32, u32, serialize_f32);
float_text!(f64_text, f64, u64, serialize_f64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coerce_in_range() {
        let arch = Arch::Win64;
        assert_eq!(
            Scalar::I32(7).coerce(ScalarKind::I16, arch),
            Some(Scalar::I16(7))
        );
        assert_eq!(Scalar::I32(70000).coerce(ScalarKind::I16, arch), None);
        assert_eq!(Scalar::I32(-1).coerce(ScalarKind::U32, arch), None);
        assert_eq!(
            Scalar::I32(3).coerce(ScalarKind::F64, arch),
            Some(Scalar::F64(3.0))
        );
        assert_eq!(Scalar::F64(3.0).coerce(ScalarKind::I32, arch), None);
        assert_eq!(
            Scalar::I32(1).coerce(ScalarKind::Bool, arch),
            Some(Scalar::Bool(true))
        );
        assert_eq!(Scalar::I32(2).coerce(ScalarKind::Bool, arch), None);
    }

    #[test]
    fn test_handle_width_depends_on_arch() {
        let big = Scalar::U64(u64::from(u32::MAX) + 1);
        assert_eq!(big.coerce(ScalarKind::Handle, Arch::Win32), None);
        assert_eq!(
            big.coerce(ScalarKind::Handle, Arch::Win64),
            Some(Scalar::Handle(u64::from(u32::MAX) + 1))
        );
        assert_eq!(Scalar::Handle(5).to_le_bytes(Arch::Win32).len(), 4);
        assert_eq!(Scalar::Handle(5).to_le_bytes(Arch::Win64).len(), 8);
    }

    #[test]
    fn test_extreme_values_survive_encoding() {
        let arch = Arch::Win32;
        let samples = [
            Scalar::I8(i8::MIN),
            Scalar::I8(i8::MAX),
            Scalar::U16(u16::MAX),
            Scalar::I32(i32::MIN),
            Scalar::U32(u32::MAX),
            Scalar::I64(i64::MIN),
            Scalar::U64(u64::MAX),
            Scalar::F32(f32::MIN_POSITIVE),
            Scalar::F64(f64::MAX),
            Scalar::Bool(true),
            Scalar::Char(b'z'),
        ];
        for sample in samples {
            let bytes = sample.to_le_bytes(arch);
            assert_eq!(bytes.len(), sample.kind().size(arch));
            let back = Scalar::from_le_bytes(sample.kind(), arch, &bytes).unwrap();
            assert_eq!(back, sample);
        }
    }

    #[test]
    fn test_from_le_bytes_truncated() {
        let err = Scalar::from_le_bytes(ScalarKind::I32, Arch::Win64, &[1, 2]).unwrap_err();
        assert!(matches!(
            err,
            ValueError::Truncated {
                expected: 4,
                found: 2
            }
        ));
    }

    #[test]
    fn test_pack_and_unpack_scalars() {
        let values = [Scalar::I16(1), Scalar::I16(-2), Scalar::I16(300)];
        let bytes = pack_scalars(&values, Arch::Win64);
        assert_eq!(bytes.len(), 6);
        assert_eq!(
            unpack_scalars(&bytes, ScalarKind::I16, Arch::Win64),
            values.to_vec()
        );
        assert_eq!(unpack_scalars(&bytes[..5], ScalarKind::I16, Arch::Win64).len(), 2);
    }

    #[test]
    fn test_field_lookup_follows_reference() {
        let value = Value::by_ref(Value::structure([("x", Value::from(1i32))]));
        assert_eq!(value.field("x"), Some(&Value::from(1i32)));
        assert_eq!(value.field("y"), None);
    }

    #[test]
    fn test_float_edges_survive_json() {
        let samples = [
            Scalar::F32(f32::MIN_POSITIVE),
            Scalar::F32(f32::MAX),
            Scalar::F32(f32::MIN),
            Scalar::F32(-0.0),
            Scalar::F32(f32::INFINITY),
            Scalar::F32(f32::NEG_INFINITY),
            Scalar::F64(f64::MIN_POSITIVE),
            Scalar::F64(-0.0),
            Scalar::F64(f64::NEG_INFINITY),
        ];
        for sample in samples {
            let json = serde_json::to_string(&Value::Scalar(sample)).unwrap();
            let back: Value = serde_json::from_str(&json).unwrap();
            let back = back.as_scalar().unwrap();
            assert_eq!(back, sample, "{json}");
            assert_eq!(back.as_f64().to_bits(), sample.as_f64().to_bits(), "{json}");
        }

        let payload = f32::from_bits(0x7fc0_0123);
        let json = serde_json::to_string(&Scalar::F32(payload)).unwrap();
        assert_eq!(json, r#"{"f32":"nan:0x7fc00123"}"#);
        match serde_json::from_str::<Scalar>(&json).unwrap() {
            Scalar::F32(v) => assert_eq!(v.to_bits(), 0x7fc0_0123),
            other => panic!("unexpected {other:?}"),
        }
        match serde_json::from_str::<Scalar>(r#"{"f64":"nan"}"#).unwrap() {
            Scalar::F64(v) => assert!(v.is_nan()),
            other => panic!("unexpected {other:?}"),
        }
        assert!(serde_json::from_str::<Scalar>(r#"{"f64":"lots"}"#).is_err());
        // Bits of a number are not a NaN.
        assert!(serde_json::from_str::<Scalar>(r#"{"f32":"nan:0x3f800000"}"#).is_err());
    }

    #[test]
    fn test_memory_serializes_as_base64() {
        let value = Value::memory(vec![0, 1, 2, 255]);
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(json, r#"{"pointer":{"memory":"AAEC/w=="}}"#);
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }
}
