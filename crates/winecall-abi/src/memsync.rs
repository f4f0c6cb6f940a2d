//! Memory synchronization rules.
//!
//! A rule names a pointer inside a call's arguments or return value whose
//! pointee is a block of memory, together with a way to compute the block's
//! length. A [`MemsyncPlan`] is the compiled, ordered form of a routine's
//! rules: lengths that are read from memory owned by another rule are only
//! evaluated after that rule has been synchronized.

use std::borrow::Cow;
use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::codec::decode_plain;
use crate::descriptor::{Arch, ScalarKind, TypeDescriptor};
use crate::path::{PathRoot, PathStep, ValuePath};
use crate::signature::RoutineSignature;
use crate::value::{Pointer, Value};
use crate::MemsyncError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LengthSource {
    /// Constant element count.
    Fixed(usize),
    /// Element count read from an integer elsewhere in the call.
    Path(ValuePath),
    /// `product(factors) * multiplier + offset` elements.
    Expr(LengthExpr),
    /// Elements up to and including the first all-zero element.
    NullTerminated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LengthExpr {
    pub factors: Vec<ValuePath>,
    #[serde(default = "default_multiplier")]
    pub multiplier: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_multiplier() -> i64 {
    1
}

fn default_element() -> TypeDescriptor {
    TypeDescriptor::Fundamental(ScalarKind::U8)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemsyncRule {
    pub target: ValuePath,
    pub length: LengthSource,
    #[serde(default = "default_element")]
    pub element: TypeDescriptor,
    /// Two-byte character data.
    #[serde(default)]
    pub wide: bool,
    /// Not copied back after the call.
    #[serde(default)]
    pub readonly: bool,
}

impl MemsyncRule {
    pub fn new(target: ValuePath, length: LengthSource) -> Self {
        Self {
            target,
            length,
            element: default_element(),
            wide: false,
            readonly: false,
        }
    }

    pub fn element(mut self, element: TypeDescriptor) -> Self {
        self.element = element;
        self
    }

    pub fn wide(mut self) -> Self {
        self.wide = true;
        self.element = TypeDescriptor::Fundamental(ScalarKind::U16);
        self
    }

    pub fn readonly(mut self) -> Self {
        self.readonly = true;
        self
    }

    fn length_paths(&self) -> Vec<&ValuePath> {
        match &self.length {
            LengthSource::Path(path) => vec![path],
            LengthSource::Expr(expr) => expr.factors.iter().collect(),
            LengthSource::Fixed(_) | LengthSource::NullTerminated => Vec::new(),
        }
    }
}

/// Which side of the call a set of blocks belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Before,
    After,
}

/// Bytes of one rule's target; `None` stands for a null pointer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemBlock {
    pub rule: usize,
    #[serde(with = "crate::value::base64_opt")]
    pub data: Option<Vec<u8>>,
}

/// Extent of a block as decided by its length source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extent {
    Elements(usize),
    Terminated,
}

#[derive(Debug, Clone)]
pub struct MemsyncPlan {
    arch: Arch,
    args: Vec<TypeDescriptor>,
    ret: TypeDescriptor,
    rules: Vec<MemsyncRule>,
    element_sizes: Vec<usize>,
    order: Vec<usize>,
}

impl MemsyncPlan {
    pub fn compile(signature: &RoutineSignature, arch: Arch) -> Result<Self, MemsyncError> {
        let args = &signature.args;
        let ret = &signature.ret;
        let rules = &signature.memsync;
        let mut element_sizes = Vec::with_capacity(rules.len());

        for (i, rule) in rules.iter().enumerate() {
            let target = resolve_descriptor(args, ret, &rule.target)?;
            if !matches!(target, TypeDescriptor::Pointer(_)) {
                return Err(MemsyncError::NotAPointer {
                    path: rule.target.to_string(),
                    found: target.to_string(),
                });
            }

            for (j, other) in rules.iter().enumerate() {
                if i == j {
                    continue;
                }
                if other.target == rule.target {
                    return Err(MemsyncError::DuplicateTarget(rule.target.to_string()));
                }
                if other.target.is_prefix_of(&rule.target) {
                    return Err(MemsyncError::NestedTarget {
                        outer: other.target.to_string(),
                        inner: rule.target.to_string(),
                    });
                }
            }

            let invalid_element = |reason: String| MemsyncError::InvalidElement {
                path: rule.target.to_string(),
                reason,
            };
            if !rule.element.is_plain() {
                return Err(invalid_element(format!(
                    "{} contains pointers",
                    rule.element
                )));
            }
            let size = rule
                .element
                .size(arch)
                .map_err(|err| invalid_element(err.to_string()))?;
            if size == 0 {
                return Err(invalid_element("element has zero size".to_string()));
            }
            if rule.wide && size != 2 {
                return Err(invalid_element(
                    "wide data needs a two-byte element".to_string(),
                ));
            }
            element_sizes.push(size);

            for length in rule.length_paths() {
                if rule.target.root != PathRoot::Return && length.root == PathRoot::Return {
                    return Err(MemsyncError::LengthFromReturn {
                        target: rule.target.to_string(),
                        length: length.to_string(),
                    });
                }
                let mut descriptor = resolve_descriptor(args, ret, length)?;
                if let TypeDescriptor::Pointer(inner) = descriptor {
                    descriptor = &**inner;
                }
                match descriptor {
                    TypeDescriptor::Fundamental(kind) if !kind.is_float() => {}
                    _ => {
                        return Err(MemsyncError::LengthNotInteger {
                            path: length.to_string(),
                        })
                    }
                }
            }
        }

        let order = order_rules(rules)?;
        let plan = Self {
            arch,
            args: args.clone(),
            ret: ret.clone(),
            rules: rules.clone(),
            element_sizes,
            order,
        };
        plan.check_pointers()?;
        Ok(plan)
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn rules(&self) -> &[MemsyncRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rule indices in synchronization order.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    pub fn element_size(&self, rule: usize) -> usize {
        self.element_sizes[rule]
    }

    /// Index of the rule targeting exactly `path`.
    pub fn rule_for(&self, path: &ValuePath) -> Option<usize> {
        self.rules.iter().position(|rule| &rule.target == path)
    }

    pub fn covers(&self, path: &ValuePath) -> bool {
        self.rule_for(path).is_some()
    }

    /// Every pointer that no rule covers must point at a scalar or a struct,
    /// which then travels by reference.
    fn check_pointers(&self) -> Result<(), MemsyncError> {
        for (i, arg) in self.args.iter().enumerate() {
            self.check_pointer(arg, ValuePath::arg(i))?;
        }
        self.check_pointer(&self.ret, ValuePath::ret())
    }

    fn check_pointer(&self, descriptor: &TypeDescriptor, path: ValuePath) -> Result<(), MemsyncError> {
        match descriptor {
            TypeDescriptor::Pointer(target) => {
                if self.covers(&path) {
                    return Ok(());
                }
                match target.as_ref() {
                    TypeDescriptor::Fundamental(_) => Ok(()),
                    TypeDescriptor::Struct(descriptor) => {
                        for field in descriptor.value_fields() {
                            self.check_pointer(&field.ty, path.clone().field(&field.name))?;
                        }
                        Ok(())
                    }
                    other => Err(MemsyncError::UncoveredPointer {
                        path: path.to_string(),
                        target: other.to_string(),
                    }),
                }
            }
            TypeDescriptor::Struct(descriptor) => {
                for field in descriptor.value_fields() {
                    self.check_pointer(&field.ty, path.clone().field(&field.name))?;
                }
                Ok(())
            }
            TypeDescriptor::FixedArray(element, _) if !element.is_plain() => {
                if contains_pointer(element) {
                    Err(MemsyncError::UncoveredPointer {
                        path: path.to_string(),
                        target: format!("array of {element}"),
                    })
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    /// Extent of a rule's block given the current state of the call.
    pub fn eval_length(
        &self,
        rule: usize,
        args: &[Value],
        ret: Option<&Value>,
    ) -> Result<Extent, MemsyncError> {
        let definition = &self.rules[rule];
        let read = |path: &ValuePath| -> Result<i128, MemsyncError> {
            self.read_integer(path, args, ret)?
                .ok_or_else(|| MemsyncError::LengthUnavailable {
                    target: definition.target.to_string(),
                    length: path.to_string(),
                })
        };
        let count = match &definition.length {
            LengthSource::Fixed(n) => return Ok(Extent::Elements(*n)),
            LengthSource::NullTerminated => return Ok(Extent::Terminated),
            LengthSource::Path(path) => read(path)?,
            LengthSource::Expr(expr) => {
                let overflow = || MemsyncError::LengthOverflow {
                    target: definition.target.to_string(),
                };
                let mut product: i128 = 1;
                for factor in &expr.factors {
                    product = product.checked_mul(read(factor)?).ok_or_else(overflow)?;
                }
                product
                    .checked_mul(expr.multiplier as i128)
                    .and_then(|v| v.checked_add(expr.offset as i128))
                    .ok_or_else(overflow)?
            }
        };
        if count < 0 {
            return Err(MemsyncError::NegativeLength {
                target: definition.target.to_string(),
                value: count,
            });
        }
        usize::try_from(count)
            .map(Extent::Elements)
            .map_err(|_| MemsyncError::LengthOverflow {
                target: definition.target.to_string(),
            })
    }

    /// Byte length of a block with the given extent; `bytes` is only
    /// consulted for terminated blocks.
    pub fn byte_len(&self, rule: usize, extent: Extent, bytes: &[u8]) -> Result<usize, MemsyncError> {
        let unit = self.element_sizes[rule];
        match extent {
            Extent::Elements(n) => n.checked_mul(unit).ok_or_else(|| MemsyncError::LengthOverflow {
                target: self.rules[rule].target.to_string(),
            }),
            Extent::Terminated => Ok(terminated_len(bytes, unit).unwrap_or(bytes.len() / unit * unit)),
        }
    }

    /// Reads every synchronized block out of the call, in plan order.
    ///
    /// Before the call, rules targeting the return value are skipped; after
    /// the call, read-only rules are.
    pub fn collect(
        &self,
        args: &[Value],
        ret: Option<&Value>,
        phase: Phase,
    ) -> Result<Vec<MemBlock>, MemsyncError> {
        let mut blocks = Vec::new();
        for &index in &self.order {
            let rule = &self.rules[index];
            if !self.in_phase(rule, phase) {
                continue;
            }
            let data = match target_value(args, ret, &rule.target)? {
                None | Some(Value::Pointer(Pointer::Null)) => None,
                Some(Value::Pointer(Pointer::Memory(bytes))) => {
                    let extent = self.eval_length(index, args, ret)?;
                    let needed = self.byte_len(index, extent, bytes)?;
                    if needed > bytes.len() {
                        return Err(MemsyncError::BufferTooSmall {
                            target: rule.target.to_string(),
                            needed,
                            available: bytes.len(),
                        });
                    }
                    Some(bytes[..needed].to_vec())
                }
                Some(other) => {
                    return Err(MemsyncError::NotMemory {
                        target: rule.target.to_string(),
                        found: other.shape(),
                    })
                }
            };
            blocks.push(MemBlock { rule: index, data });
        }
        Ok(blocks)
    }

    /// Empties the memory blocks of the phase's rules, leaving placeholders
    /// that [`MemsyncPlan::apply`] refills.
    pub fn strip(
        &self,
        args: &mut [Value],
        mut ret: Option<&mut Value>,
        phase: Phase,
    ) -> Result<(), MemsyncError> {
        for rule in &self.rules {
            if !self.in_phase(rule, phase) {
                continue;
            }
            if let Some(Value::Pointer(Pointer::Memory(bytes))) =
                target_slot(args, ret.as_deref_mut(), &rule.target)?
            {
                *bytes = Vec::new();
            }
        }
        Ok(())
    }

    /// Writes blocks back into their targets, resizing buffers as needed.
    pub fn apply(
        &self,
        args: &mut [Value],
        mut ret: Option<&mut Value>,
        blocks: Vec<MemBlock>,
    ) -> Result<(), MemsyncError> {
        for block in blocks {
            let rule = self
                .rules
                .get(block.rule)
                .ok_or(MemsyncError::UnknownRule(block.rule))?;
            let slot = target_slot(args, ret.as_deref_mut(), &rule.target)?;
            match (slot, block.data) {
                (None, None) => {}
                (None, Some(_)) => {
                    return Err(MemsyncError::LengthUnavailable {
                        target: rule.target.to_string(),
                        length: "enclosing pointer is null".to_string(),
                    })
                }
                (Some(slot), None) => *slot = Value::null(),
                (Some(Value::Pointer(Pointer::Memory(buffer))), Some(data)) => {
                    buffer.clear();
                    buffer.extend_from_slice(&data);
                }
                (Some(slot), Some(data)) => *slot = Value::memory(data),
            }
        }
        Ok(())
    }

    fn in_phase(&self, rule: &MemsyncRule, phase: Phase) -> bool {
        match phase {
            Phase::Before => rule.target.root != PathRoot::Return,
            Phase::After => !rule.readonly,
        }
    }

    fn root_descriptor(&self, root: PathRoot) -> Option<&TypeDescriptor> {
        match root {
            PathRoot::Arg(i) => self.args.get(i),
            PathRoot::Return => Some(&self.ret),
        }
    }

    /// Reads an integer at `path`, decoding through synchronized memory where
    /// the path crosses it. `None` if a null pointer lies on the way.
    fn read_integer(
        &self,
        path: &ValuePath,
        args: &[Value],
        ret: Option<&Value>,
    ) -> Result<Option<i128>, MemsyncError> {
        let unknown = |reason: &str| MemsyncError::UnknownPath {
            path: path.to_string(),
            reason: reason.to_string(),
        };
        let mut descriptor = self
            .root_descriptor(path.root)
            .ok_or_else(|| unknown("no such argument"))?;
        let mut value: Cow<'_, Value> = match path.root {
            PathRoot::Arg(i) => Cow::Borrowed(args.get(i).ok_or_else(|| unknown("no such argument"))?),
            PathRoot::Return => match ret {
                Some(ret) => Cow::Borrowed(ret),
                None => return Ok(None),
            },
        };

        for step in &path.steps {
            if let PathStep::Field(name) = step {
                if let TypeDescriptor::Pointer(target) = descriptor {
                    match self.deref_value(value, target)? {
                        Some(inner) => value = inner,
                        None => return Ok(None),
                    }
                    descriptor = &**target;
                }
                let TypeDescriptor::Struct(structure) = descriptor else {
                    return Err(unknown("not a struct"));
                };
                descriptor = &structure
                    .field(name)
                    .ok_or_else(|| unknown("no such field"))?
                    .ty;
                value = match value {
                    Cow::Borrowed(v) => Cow::Borrowed(v.field(name).ok_or_else(|| unknown("missing field value"))?),
                    Cow::Owned(v) => Cow::Owned(
                        v.field(name)
                            .cloned()
                            .ok_or_else(|| unknown("missing field value"))?,
                    ),
                };
            } else {
                let TypeDescriptor::Pointer(target) = descriptor else {
                    return Err(unknown("not a pointer"));
                };
                match self.deref_value(value, target)? {
                    Some(inner) => value = inner,
                    None => return Ok(None),
                }
                descriptor = &**target;
            }
        }

        if let TypeDescriptor::Pointer(target) = descriptor {
            match self.deref_value(value, target)? {
                Some(inner) => value = inner,
                None => return Ok(None),
            }
        }

        match value.as_scalar().and_then(|scalar| scalar.as_i128()) {
            Some(v) => Ok(Some(v)),
            None => Err(MemsyncError::LengthNotInteger {
                path: path.to_string(),
            }),
        }
    }

    fn deref_value<'v>(
        &self,
        value: Cow<'v, Value>,
        target: &TypeDescriptor,
    ) -> Result<Option<Cow<'v, Value>>, MemsyncError> {
        match value {
            Cow::Borrowed(Value::Pointer(Pointer::Ref(inner))) => Ok(Some(Cow::Borrowed(inner))),
            Cow::Owned(Value::Pointer(Pointer::Ref(inner))) => Ok(Some(Cow::Owned(*inner))),
            Cow::Borrowed(Value::Pointer(Pointer::Null)) | Cow::Owned(Value::Pointer(Pointer::Null)) => {
                Ok(None)
            }
            other => match other.as_ref() {
                Value::Pointer(Pointer::Memory(bytes)) => {
                    Ok(Some(Cow::Owned(decode_plain(target, bytes, self.arch)?)))
                }
                found => Err(MemsyncError::NotMemory {
                    target: target.to_string(),
                    found: found.shape(),
                }),
            },
        }
    }
}

/// Byte length of a zero-terminated run of `unit`-sized elements, including
/// the terminator.
pub fn terminated_len(bytes: &[u8], unit: usize) -> Option<usize> {
    bytes
        .chunks_exact(unit)
        .position(|chunk| chunk.iter().all(|b| *b == 0))
        .map(|index| (index + 1) * unit)
}

fn contains_pointer(descriptor: &TypeDescriptor) -> bool {
    match descriptor {
        TypeDescriptor::Pointer(_) | TypeDescriptor::Callback(_) => true,
        TypeDescriptor::FixedArray(element, _) => contains_pointer(element),
        TypeDescriptor::Struct(structure) => {
            structure.fields.iter().any(|field| contains_pointer(&field.ty))
        }
        _ => false,
    }
}

/// Walks descriptors along `path`, following pointers to structs implicitly
/// on field steps.
pub fn resolve_descriptor<'a>(
    args: &'a [TypeDescriptor],
    ret: &'a TypeDescriptor,
    path: &ValuePath,
) -> Result<&'a TypeDescriptor, MemsyncError> {
    let unknown = |reason: &str| MemsyncError::UnknownPath {
        path: path.to_string(),
        reason: reason.to_string(),
    };
    let mut current = match path.root {
        PathRoot::Arg(i) => args.get(i).ok_or_else(|| unknown("no such argument"))?,
        PathRoot::Return => ret,
    };
    for step in &path.steps {
        current = match (step, current) {
            (PathStep::Deref, TypeDescriptor::Pointer(target)) => {
                if matches!(target.as_ref(), TypeDescriptor::Void) {
                    return Err(unknown("cannot dereference void*"));
                }
                &**target
            }
            (PathStep::Deref, _) => return Err(unknown("not a pointer")),
            (PathStep::Field(name), descriptor) => {
                let structure = match descriptor {
                    TypeDescriptor::Struct(structure) => structure,
                    TypeDescriptor::Pointer(target) => match target.as_ref() {
                        TypeDescriptor::Struct(structure) => structure,
                        _ => return Err(unknown("not a struct")),
                    },
                    _ => return Err(unknown("not a struct")),
                };
                &structure
                    .field(name)
                    .ok_or_else(|| unknown("no such field"))?
                    .ty
            }
        };
    }
    Ok(current)
}

fn root_value<'v>(args: &'v [Value], ret: Option<&'v Value>, root: PathRoot) -> Option<&'v Value> {
    match root {
        PathRoot::Arg(i) => args.get(i),
        PathRoot::Return => ret,
    }
}

/// The pointer value a rule targets; `None` when a null pointer encloses it.
fn target_value<'v>(
    args: &'v [Value],
    ret: Option<&'v Value>,
    path: &ValuePath,
) -> Result<Option<&'v Value>, MemsyncError> {
    let Some(mut value) = root_value(args, ret, path.root) else {
        return Ok(None);
    };
    for step in &path.steps {
        let inner = match value {
            Value::Pointer(Pointer::Null) => return Ok(None),
            Value::Pointer(Pointer::Ref(inner)) => &**inner,
            Value::Pointer(Pointer::Memory(_)) => return Err(through_memory(path)),
            other => match step {
                PathStep::Deref => return Err(through_memory(path)),
                PathStep::Field(_) => other,
            },
        };
        value = match step {
            PathStep::Deref => inner,
            PathStep::Field(name) => match inner {
                Value::Struct(fields) => fields
                    .iter()
                    .find(|(n, _)| n == name)
                    .map(|(_, v)| v)
                    .ok_or_else(|| missing_field(path, name))?,
                _ => return Err(missing_field(path, name)),
            },
        };
    }
    Ok(Some(value))
}

fn target_slot<'v>(
    args: &'v mut [Value],
    ret: Option<&'v mut Value>,
    path: &ValuePath,
) -> Result<Option<&'v mut Value>, MemsyncError> {
    let root = match path.root {
        PathRoot::Arg(i) => args.get_mut(i),
        PathRoot::Return => ret,
    };
    match root {
        Some(value) => walk_mut(value, &path.steps, path),
        None => Ok(None),
    }
}

fn walk_mut<'v>(
    value: &'v mut Value,
    steps: &[PathStep],
    path: &ValuePath,
) -> Result<Option<&'v mut Value>, MemsyncError> {
    let Some((step, rest)) = steps.split_first() else {
        return Ok(Some(value));
    };
    let inner: &mut Value = match value {
        Value::Pointer(Pointer::Null) => return Ok(None),
        Value::Pointer(Pointer::Ref(inner)) => inner,
        Value::Pointer(Pointer::Memory(_)) => return Err(through_memory(path)),
        other => {
            if *step == PathStep::Deref {
                return Err(through_memory(path));
            }
            other
        }
    };
    match step {
        PathStep::Deref => walk_mut(inner, rest, path),
        PathStep::Field(name) => match inner {
            Value::Struct(fields) => {
                let field = fields
                    .iter_mut()
                    .find(|(n, _)| n == name)
                    .map(|(_, v)| v)
                    .ok_or_else(|| missing_field(path, name))?;
                walk_mut(field, rest, path)
            }
            _ => Err(missing_field(path, name)),
        },
    }
}

fn through_memory(path: &ValuePath) -> MemsyncError {
    MemsyncError::UnknownPath {
        path: path.to_string(),
        reason: "path does not lead through a reference".to_string(),
    }
}

fn missing_field(path: &ValuePath, name: &str) -> MemsyncError {
    MemsyncError::UnknownPath {
        path: path.to_string(),
        reason: format!("value has no field `{name}`"),
    }
}

/// Topological order of rules: a rule comes after every rule whose target
/// one of its length paths reads through. Ties go to the lower argument
/// index, then the return value, then declaration order.
fn order_rules(rules: &[MemsyncRule]) -> Result<Vec<usize>, MemsyncError> {
    let n = rules.len();
    let mut dependents: Vec<HashSet<usize>> = vec![HashSet::new(); n];
    let mut pending = vec![0usize; n];

    for (i, rule) in rules.iter().enumerate() {
        for length in rule.length_paths() {
            for (j, other) in rules.iter().enumerate() {
                if other.target.is_prefix_of(length) {
                    if i == j {
                        return Err(MemsyncError::Cycle(vec![rule.target.to_string()]));
                    }
                    if dependents[j].insert(i) {
                        pending[i] += 1;
                    }
                }
            }
        }
    }

    let rank = |i: usize| {
        let root = match rules[i].target.root {
            PathRoot::Arg(index) => index,
            PathRoot::Return => usize::MAX,
        };
        (root, i)
    };

    let mut ready: BTreeSet<(usize, usize)> = (0..n)
        .filter(|&i| pending[i] == 0)
        .map(rank)
        .collect();
    let mut order = Vec::with_capacity(n);
    while let Some(next) = ready.pop_first() {
        let index = next.1;
        order.push(index);
        for &dependent in &dependents[index] {
            pending[dependent] -= 1;
            if pending[dependent] == 0 {
                ready.insert(rank(dependent));
            }
        }
    }

    if order.len() != n {
        let stuck = (0..n)
            .filter(|i| !order.contains(i))
            .map(|i| rules[i].target.to_string())
            .collect();
        return Err(MemsyncError::Cycle(stuck));
    }
    Ok(order)
}
