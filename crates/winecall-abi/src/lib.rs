//! Shared vocabulary of the winecall bridge: type descriptors, marshallable
//! values, value paths and memory synchronization plans.

use thiserror::Error;

pub mod codec;
pub mod descriptor;
pub mod memsync;
pub mod path;
pub mod signature;
pub mod text;
pub mod value;

pub use descriptor::{
    Arch, CallbackSignature, CallingConvention, Layout, ScalarKind, StructDescriptor, StructField,
    TypeDescriptor,
};
pub use memsync::{Extent, LengthExpr, LengthSource, MemBlock, MemsyncPlan, MemsyncRule, Phase};
pub use path::{PathRoot, PathStep, ValuePath};
pub use signature::RoutineSignature;
pub use value::{pack_scalars, unpack_scalars, CallbackToken, Pointer, Scalar, Value};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DescriptorError {
    #[error("{0} has no size")]
    Unsized(String),
    #[error("{what} is not allowed as {place}")]
    Misplaced {
        what: &'static str,
        place: &'static str,
    },
    #[error("fixed arrays need at least one element")]
    EmptyArray,
    #[error("struct `{0}` has no fields")]
    EmptyStruct(String),
    #[error("struct `{structure}` declares field `{field}` twice")]
    DuplicateField { structure: String, field: String },
    #[error("unsupported callback signature: {0}")]
    UnsupportedCallback(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValueError {
    #[error("expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },
    #[error("{value} does not fit in {kind}")]
    OutOfRange { kind: ScalarKind, value: String },
    #[error("expected an array of {expected} elements, found {found}")]
    ArrayLength { expected: usize, found: usize },
    #[error("struct `{structure}` is missing field `{field}`")]
    MissingField { structure: String, field: String },
    #[error("expected field `{expected}`, found `{found}`")]
    FieldName { expected: String, found: String },
    #[error("struct `{structure}` has no field `{field}`")]
    UnexpectedField { structure: String, field: String },
    #[error("{0}")]
    NotPlain(String),
    #[error("expected a value of type {expected}, found a {found}")]
    Shape {
        expected: String,
        found: &'static str,
    },
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MemsyncError {
    #[error("path {path} is invalid: {reason}")]
    UnknownPath { path: String, reason: String },
    #[error("memsync target {path} is {found}, not a pointer")]
    NotAPointer { path: String, found: String },
    #[error("more than one memsync rule targets {0}")]
    DuplicateTarget(String),
    #[error("memsync target {inner} lies inside the memory of {outer}")]
    NestedTarget { outer: String, inner: String },
    #[error("memsync element for {path} is invalid: {reason}")]
    InvalidElement { path: String, reason: String },
    #[error("length path {path} does not lead to an integer")]
    LengthNotInteger { path: String },
    #[error("length of {target} cannot depend on the return value ({length})")]
    LengthFromReturn { target: String, length: String },
    #[error("memsync rules depend on each other in a cycle: {}", .0.join(", "))]
    Cycle(Vec<String>),
    #[error("pointer {path} to {target} has no memsync rule")]
    UncoveredPointer { path: String, target: String },
    #[error("length of {target} is unavailable: {length}")]
    LengthUnavailable { target: String, length: String },
    #[error("length of {target} evaluated to {value}")]
    NegativeLength { target: String, value: i128 },
    #[error("length of {target} overflows")]
    LengthOverflow { target: String },
    #[error("buffer for {target} holds {available} bytes but {needed} are required")]
    BufferTooSmall {
        target: String,
        needed: usize,
        available: usize,
    },
    #[error("{target} must be a memory block, found a {found}")]
    NotMemory {
        target: String,
        found: &'static str,
    },
    #[error("no memsync rule with index {0}")]
    UnknownRule(usize),
    #[error(transparent)]
    Value(#[from] ValueError),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SignatureError {
    #[error("argument {index}: {source}")]
    Argument {
        index: usize,
        source: DescriptorError,
    },
    #[error("return type: {0}")]
    Return(DescriptorError),
    #[error(transparent)]
    Memsync(#[from] MemsyncError),
}
