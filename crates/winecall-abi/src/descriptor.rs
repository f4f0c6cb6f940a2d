//! Type descriptors and their layout under a given architecture.
//!
//! Descriptors form a closed tree. Structs are laid out packed in the order
//! their fields are declared; alignment holes must be spelled out with
//! [`TypeDescriptor::Padding`] fields, or produced by [`StructDescriptor::c_layout`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::DescriptorError;

/// Target architecture of the foreign process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    Win32,
    #[default]
    Win64,
}

impl Arch {
    pub fn pointer_size(self) -> usize {
        match self {
            Arch::Win32 => 4,
            Arch::Win64 => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Arch::Win32 => "win32",
            Arch::Win64 => "win64",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "win32" | "32" | "x86" | "i386" => Some(Arch::Win32),
            "win64" | "64" | "x64" | "x86_64" | "amd64" => Some(Arch::Win64),
            _ => None,
        }
    }

    /// Architecture of the running process.
    pub fn host() -> Self {
        if cfg!(target_pointer_width = "32") {
            Arch::Win32
        } else {
            Arch::Win64
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Calling convention of a library's exported routines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CallingConvention {
    /// Callee cleans the stack (`WINAPI`). Identical to cdecl on 64-bit.
    #[default]
    Stdcall,
    Cdecl,
}

impl CallingConvention {
    pub fn as_str(self) -> &'static str {
        match self {
            CallingConvention::Stdcall => "stdcall",
            CallingConvention::Cdecl => "cdecl",
        }
    }
}

impl fmt::Display for CallingConvention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fundamental C scalar types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarKind {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    /// Narrow character (`char`), one byte.
    Char,
    /// C `_Bool`, one byte.
    Bool,
    /// Pointer-sized opaque integer (`HANDLE`, `size_t`).
    Handle,
}

impl ScalarKind {
    pub fn size(self, arch: Arch) -> usize {
        match self {
            ScalarKind::I8 | ScalarKind::U8 | ScalarKind::Char | ScalarKind::Bool => 1,
            ScalarKind::I16 | ScalarKind::U16 => 2,
            ScalarKind::I32 | ScalarKind::U32 | ScalarKind::F32 => 4,
            ScalarKind::I64 | ScalarKind::U64 | ScalarKind::F64 => 8,
            ScalarKind::Handle => arch.pointer_size(),
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, ScalarKind::F32 | ScalarKind::F64)
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            ScalarKind::I8 | ScalarKind::I16 | ScalarKind::I32 | ScalarKind::I64
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            ScalarKind::I8 => "i8",
            ScalarKind::U8 => "u8",
            ScalarKind::I16 => "i16",
            ScalarKind::U16 => "u16",
            ScalarKind::I32 => "i32",
            ScalarKind::U32 => "u32",
            ScalarKind::I64 => "i64",
            ScalarKind::U64 => "u64",
            ScalarKind::F32 => "f32",
            ScalarKind::F64 => "f64",
            ScalarKind::Char => "char",
            ScalarKind::Bool => "bool",
            ScalarKind::Handle => "handle",
        }
    }
}

impl fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Size and alignment of a described type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub size: usize,
    pub align: usize,
}

/// A C type, as far as the bridge needs to understand it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum TypeDescriptor {
    Void,
    Fundamental(ScalarKind),
    Pointer(Box<TypeDescriptor>),
    FixedArray(Box<TypeDescriptor>, usize),
    Struct(StructDescriptor),
    Callback(CallbackSignature),
    /// Unnamed filler bytes inside a struct.
    Padding(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StructDescriptor {
    pub name: String,
    pub fields: Vec<StructField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StructField {
    pub name: String,
    pub ty: TypeDescriptor,
}

/// Signature of a native function handed to foreign code as a function pointer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CallbackSignature {
    pub args: Vec<TypeDescriptor>,
    pub ret: Box<TypeDescriptor>,
    #[serde(default)]
    pub convention: CallingConvention,
}

impl TypeDescriptor {
    pub fn scalar(kind: ScalarKind) -> Self {
        TypeDescriptor::Fundamental(kind)
    }

    pub fn pointer_to(target: TypeDescriptor) -> Self {
        TypeDescriptor::Pointer(Box::new(target))
    }

    pub fn array_of(element: TypeDescriptor, len: usize) -> Self {
        TypeDescriptor::FixedArray(Box::new(element), len)
    }

    pub fn layout(&self, arch: Arch) -> Result<Layout, DescriptorError> {
        match self {
            TypeDescriptor::Void => Err(DescriptorError::Unsized("void".to_string())),
            TypeDescriptor::Fundamental(kind) => {
                let size = kind.size(arch);
                Ok(Layout { size, align: size })
            }
            TypeDescriptor::Pointer(_) | TypeDescriptor::Callback(_) => Ok(Layout {
                size: arch.pointer_size(),
                align: arch.pointer_size(),
            }),
            TypeDescriptor::FixedArray(element, len) => {
                let inner = element.layout(arch)?;
                Ok(Layout {
                    size: inner.size * len,
                    align: inner.align,
                })
            }
            TypeDescriptor::Struct(descriptor) => descriptor.layout(arch),
            TypeDescriptor::Padding(bytes) => Ok(Layout {
                size: *bytes,
                align: 1,
            }),
        }
    }

    pub fn size(&self, arch: Arch) -> Result<usize, DescriptorError> {
        self.layout(arch).map(|layout| layout.size)
    }

    /// True if the type contains no pointers or callbacks, so its bytes can
    /// be copied between processes verbatim.
    pub fn is_plain(&self) -> bool {
        match self {
            TypeDescriptor::Void => false,
            TypeDescriptor::Fundamental(_) | TypeDescriptor::Padding(_) => true,
            TypeDescriptor::Pointer(_) | TypeDescriptor::Callback(_) => false,
            TypeDescriptor::FixedArray(element, _) => element.is_plain(),
            TypeDescriptor::Struct(descriptor) => {
                descriptor.fields.iter().all(|field| field.ty.is_plain())
            }
        }
    }

    /// Checks the descriptor is usable as a routine argument.
    pub fn validate_argument(&self) -> Result<(), DescriptorError> {
        match self {
            TypeDescriptor::Void => Err(DescriptorError::Misplaced {
                what: "void",
                place: "an argument",
            }),
            TypeDescriptor::Padding(_) => Err(DescriptorError::Misplaced {
                what: "padding",
                place: "an argument",
            }),
            TypeDescriptor::FixedArray(..) => Err(DescriptorError::Misplaced {
                what: "a fixed array",
                place: "an argument (pass a pointer instead)",
            }),
            other => other.validate_nested(),
        }
    }

    /// Checks the descriptor is usable as a routine return type.
    pub fn validate_return(&self) -> Result<(), DescriptorError> {
        match self {
            TypeDescriptor::Void => Ok(()),
            TypeDescriptor::Padding(_) => Err(DescriptorError::Misplaced {
                what: "padding",
                place: "a return type",
            }),
            TypeDescriptor::FixedArray(..) => Err(DescriptorError::Misplaced {
                what: "a fixed array",
                place: "a return type",
            }),
            TypeDescriptor::Callback(_) => Err(DescriptorError::Misplaced {
                what: "a callback",
                place: "a return type",
            }),
            other => other.validate_nested(),
        }
    }

    fn validate_nested(&self) -> Result<(), DescriptorError> {
        match self {
            TypeDescriptor::Void => Err(DescriptorError::Misplaced {
                what: "void",
                place: "a value position",
            }),
            TypeDescriptor::Fundamental(_) | TypeDescriptor::Padding(_) => Ok(()),
            TypeDescriptor::Pointer(target) => match target.as_ref() {
                TypeDescriptor::Void => Ok(()),
                TypeDescriptor::Padding(_) => Err(DescriptorError::Misplaced {
                    what: "padding",
                    place: "a pointer target",
                }),
                other => other.validate_nested(),
            },
            TypeDescriptor::FixedArray(element, len) => {
                if *len == 0 {
                    return Err(DescriptorError::EmptyArray);
                }
                if matches!(element.as_ref(), TypeDescriptor::Padding(_)) {
                    return Err(DescriptorError::Misplaced {
                        what: "padding",
                        place: "an array element",
                    });
                }
                element.validate_nested()
            }
            TypeDescriptor::Struct(descriptor) => descriptor.validate(),
            TypeDescriptor::Callback(signature) => signature.validate(),
        }
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeDescriptor::Void => f.write_str("void"),
            TypeDescriptor::Fundamental(kind) => write!(f, "{kind}"),
            TypeDescriptor::Pointer(target) => write!(f, "{target}*"),
            TypeDescriptor::FixedArray(element, len) => write!(f, "{element}[{len}]"),
            TypeDescriptor::Struct(descriptor) => write!(f, "struct {}", descriptor.name),
            TypeDescriptor::Callback(signature) => {
                write!(f, "{} (*)(", signature.ret)?;
                for (i, arg) in signature.args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                f.write_str(")")
            }
            TypeDescriptor::Padding(bytes) => write!(f, "pad[{bytes}]"),
        }
    }
}

impl StructDescriptor {
    pub fn new(name: impl Into<String>, fields: Vec<StructField>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    /// Builds a struct with natural C alignment, inserting padding fields
    /// between members and at the tail as needed.
    pub fn c_layout(
        name: impl Into<String>,
        members: Vec<(String, TypeDescriptor)>,
        arch: Arch,
    ) -> Result<Self, DescriptorError> {
        let mut fields = Vec::with_capacity(members.len());
        let mut offset = 0usize;
        let mut max_align = 1usize;
        let mut pad_index = 0usize;

        for (field_name, ty) in members {
            let layout = ty.layout(arch)?;
            max_align = max_align.max(layout.align);
            let misalignment = offset % layout.align;
            if misalignment != 0 {
                let gap = layout.align - misalignment;
                fields.push(StructField::padding(pad_index, gap));
                pad_index += 1;
                offset += gap;
            }
            offset += layout.size;
            fields.push(StructField::new(field_name, ty));
        }

        let tail = offset % max_align;
        if tail != 0 {
            fields.push(StructField::padding(pad_index, max_align - tail));
        }

        Ok(Self::new(name, fields))
    }

    pub fn layout(&self, arch: Arch) -> Result<Layout, DescriptorError> {
        let mut size = 0;
        let mut align = 1;
        for field in &self.fields {
            let layout = field.ty.layout(arch)?;
            size += layout.size;
            align = align.max(layout.align);
        }
        Ok(Layout { size, align })
    }

    /// Byte offset of every field, in declaration order.
    pub fn offsets(&self, arch: Arch) -> Result<Vec<usize>, DescriptorError> {
        let mut offsets = Vec::with_capacity(self.fields.len());
        let mut offset = 0;
        for field in &self.fields {
            offsets.push(offset);
            offset += field.ty.size(arch)?;
        }
        Ok(offsets)
    }

    pub fn field(&self, name: &str) -> Option<&StructField> {
        self.fields
            .iter()
            .find(|field| !field.is_padding() && field.name == name)
    }

    /// Fields that carry values, skipping padding.
    pub fn value_fields(&self) -> impl Iterator<Item = &StructField> {
        self.fields.iter().filter(|field| !field.is_padding())
    }

    fn validate(&self) -> Result<(), DescriptorError> {
        if self.value_fields().next().is_none() {
            return Err(DescriptorError::EmptyStruct(self.name.clone()));
        }
        let mut seen = std::collections::HashSet::new();
        for field in self.value_fields() {
            if !seen.insert(field.name.as_str()) {
                return Err(DescriptorError::DuplicateField {
                    structure: self.name.clone(),
                    field: field.name.clone(),
                });
            }
        }
        for field in &self.fields {
            field.ty.validate_nested()?;
        }
        Ok(())
    }
}

impl StructField {
    pub fn new(name: impl Into<String>, ty: TypeDescriptor) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }

    fn padding(index: usize, bytes: usize) -> Self {
        Self::new(format!("_pad{index}"), TypeDescriptor::Padding(bytes))
    }

    pub fn is_padding(&self) -> bool {
        matches!(self.ty, TypeDescriptor::Padding(_))
    }
}

impl CallbackSignature {
    pub fn new(args: Vec<TypeDescriptor>, ret: TypeDescriptor) -> Self {
        Self {
            args,
            ret: Box::new(ret),
            convention: CallingConvention::default(),
        }
    }

    pub fn with_convention(mut self, convention: CallingConvention) -> Self {
        self.convention = convention;
        self
    }

    /// Callbacks exchange values only: scalars and plain structs by value,
    /// or pointers to them which the callback sees as references.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        for arg in &self.args {
            let ok = match arg {
                TypeDescriptor::Fundamental(_) => true,
                TypeDescriptor::Struct(_) => arg.is_plain(),
                TypeDescriptor::Pointer(target) => {
                    matches!(
                        target.as_ref(),
                        TypeDescriptor::Fundamental(_) | TypeDescriptor::Struct(_)
                    ) && target.is_plain()
                }
                _ => false,
            };
            if !ok {
                return Err(DescriptorError::UnsupportedCallback(format!(
                    "argument type {arg} is not supported in callbacks"
                )));
            }
            arg.validate_nested()?;
        }
        match self.ret.as_ref() {
            TypeDescriptor::Void | TypeDescriptor::Fundamental(_) => Ok(()),
            other => Err(DescriptorError::UnsupportedCallback(format!(
                "return type {other} is not supported in callbacks"
            ))),
        }
    }
}
