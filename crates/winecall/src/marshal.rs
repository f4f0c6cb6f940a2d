//! Argument checking before a call and out-parameter restoration after it.

use winecall_abi::{Arch, MemsyncPlan, Pointer, RoutineSignature, TypeDescriptor, Value, ValuePath};

use crate::error::{Result, WinecallError};

/// Checks `args` against the signature and coerces scalars to their
/// declared kinds. Runs before anything is sent, so a mismatch never
/// reaches the foreign side.
pub fn conform(
    signature: &RoutineSignature,
    plan: &MemsyncPlan,
    args: &[Value],
    arch: Arch,
) -> Result<Vec<Value>> {
    if args.len() != signature.args.len() {
        return Err(WinecallError::ArgumentMismatch(format!(
            "expected {} arguments, got {}",
            signature.args.len(),
            args.len()
        )));
    }
    let conformer = Conformer { plan, arch };
    signature
        .args
        .iter()
        .zip(args)
        .enumerate()
        .map(|(i, (descriptor, value))| conformer.value(descriptor, value, &ValuePath::arg(i)))
        .collect()
}

struct Conformer<'a> {
    plan: &'a MemsyncPlan,
    arch: Arch,
}

impl Conformer<'_> {
    fn value(&self, descriptor: &TypeDescriptor, value: &Value, path: &ValuePath) -> Result<Value> {
        let mismatch = |detail: String| WinecallError::ArgumentMismatch(format!("{path}: {detail}"));
        match (descriptor, value) {
            (TypeDescriptor::Fundamental(kind), Value::Scalar(scalar)) => scalar
                .coerce(*kind, self.arch)
                .map(Value::Scalar)
                .ok_or_else(|| mismatch(format!("{scalar:?} does not fit in {kind}"))),
            (TypeDescriptor::Pointer(_), Value::Pointer(Pointer::Null)) => Ok(Value::null()),
            (TypeDescriptor::Pointer(_), Value::Pointer(Pointer::Memory(bytes))) => {
                if self.plan.covers(path) {
                    Ok(Value::memory(bytes.clone()))
                } else {
                    Err(mismatch("memory block without a memsync rule".to_string()))
                }
            }
            (TypeDescriptor::Pointer(target), Value::Pointer(Pointer::Ref(inner))) => {
                if self.plan.covers(path) {
                    return Err(mismatch(
                        "synchronized pointer needs a memory block, not a reference".to_string(),
                    ));
                }
                let inner = self.value(target, inner, &pointee_path(target, path))?;
                Ok(Value::by_ref(inner))
            }
            (TypeDescriptor::Struct(structure), Value::Struct(fields)) => {
                for (name, _) in fields {
                    if structure.value_fields().all(|field| field.name != *name) {
                        return Err(mismatch(format!(
                            "struct {} has no field `{name}`",
                            structure.name
                        )));
                    }
                }
                let mut out = Vec::with_capacity(fields.len());
                for field in structure.value_fields() {
                    let value = value.field(&field.name).ok_or_else(|| {
                        mismatch(format!("missing field `{}`", field.name))
                    })?;
                    let value = self.value(&field.ty, value, &path.clone().field(&field.name))?;
                    out.push((field.name.clone(), value));
                }
                Ok(Value::Struct(out))
            }
            (TypeDescriptor::FixedArray(element, len), Value::Array(items)) => {
                if items.len() != *len {
                    return Err(mismatch(format!(
                        "expected {len} array elements, got {}",
                        items.len()
                    )));
                }
                items
                    .iter()
                    .map(|item| self.value(element, item, path))
                    .collect::<Result<Vec<_>>>()
                    .map(Value::Array)
            }
            (TypeDescriptor::Callback(_), Value::Callback(token)) => Ok(Value::Callback(*token)),
            (TypeDescriptor::Callback(_), Value::Pointer(Pointer::Null)) => Ok(Value::null()),
            (descriptor, value) => Err(mismatch(format!(
                "expected {descriptor}, got a {}",
                value.shape()
            ))),
        }
    }
}

/// Path of a pointer's target: field steps already look through pointers
/// to structs, anything else needs an explicit dereference.
fn pointee_path(target: &TypeDescriptor, path: &ValuePath) -> ValuePath {
    match target {
        TypeDescriptor::Struct(_) => path.clone(),
        _ => path.clone().deref(),
    }
}

/// Copies what the callee wrote through by-reference pointers back into
/// the caller's values. Synchronized memory is left alone; it comes back
/// through the memsync blocks.
pub fn restore(descriptor: &TypeDescriptor, caller: &mut Value, returned: Value) {
    match (descriptor, caller, returned) {
        (TypeDescriptor::Fundamental(_), caller, returned) if matches!(returned, Value::Scalar(_)) => {
            *caller = returned
        }
        (TypeDescriptor::Pointer(_), Value::Pointer(Pointer::Memory(_)), _) => {}
        (TypeDescriptor::Pointer(_), _, Value::Pointer(Pointer::Memory(_))) => {}
        (
            TypeDescriptor::Pointer(target),
            Value::Pointer(Pointer::Ref(mine)),
            Value::Pointer(Pointer::Ref(theirs)),
        ) => restore(target, mine, *theirs),
        (TypeDescriptor::Pointer(_), caller, returned) => *caller = returned,
        (TypeDescriptor::Struct(structure), caller, returned) if matches!(caller, Value::Struct(_)) => {
            for field in structure.value_fields() {
                let Some(theirs) = returned.field(&field.name).cloned() else {
                    continue;
                };
                if let Some(mine) = caller.field_mut(&field.name) {
                    restore(&field.ty, mine, theirs);
                }
            }
        }
        (TypeDescriptor::FixedArray(element, _), Value::Array(mine), Value::Array(theirs)) => {
            for (mine, theirs) in mine.iter_mut().zip(theirs) {
                restore(element, mine, theirs);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use winecall_abi::{
        LengthSource, MemsyncRule, Scalar, ScalarKind, StructDescriptor, StructField,
    };

    fn i16_t() -> TypeDescriptor {
        TypeDescriptor::scalar(ScalarKind::I16)
    }

    fn int_array() -> TypeDescriptor {
        TypeDescriptor::Struct(StructDescriptor::new(
            "int_array_data",
            vec![
                StructField::new("data", TypeDescriptor::pointer_to(i16_t())),
                StructField::new("len", i16_t()),
            ],
        ))
    }

    fn plan_for(signature: &RoutineSignature) -> MemsyncPlan {
        signature.compile(Arch::Win64).unwrap()
    }

    #[test]
    fn test_argument_count_is_checked() {
        let signature = RoutineSignature::new(vec![i16_t(), i16_t()]);
        let plan = plan_for(&signature);
        let err = conform(&signature, &plan, &[Value::from(1i16)], Arch::Win64).unwrap_err();
        assert_eq!(
            err,
            WinecallError::ArgumentMismatch("expected 2 arguments, got 1".into())
        );
    }

    #[test]
    fn test_scalars_are_coerced() {
        let signature = RoutineSignature::new(vec![i16_t(), TypeDescriptor::scalar(ScalarKind::F64)]);
        let plan = plan_for(&signature);
        let args = conform(
            &signature,
            &plan,
            &[Value::from(3i64), Value::from(2i32)],
            Arch::Win64,
        )
        .unwrap();
        assert_eq!(args, vec![Value::from(3i16), Value::Scalar(Scalar::F64(2.0))]);

        let err = conform(
            &signature,
            &plan,
            &[Value::from(70000i32), Value::from(0.5f64)],
            Arch::Win64,
        )
        .unwrap_err();
        assert!(matches!(err, WinecallError::ArgumentMismatch(msg) if msg.starts_with("arg0")));
    }

    #[test]
    fn test_struct_fields_are_checked() {
        let signature = RoutineSignature::new(vec![TypeDescriptor::pointer_to(int_array())])
            .with_memsync(
                MemsyncRule::new(
                    ValuePath::arg(0).field("data"),
                    LengthSource::Path(ValuePath::arg(0).field("len")),
                )
                .element(i16_t()),
            );
        let plan = plan_for(&signature);

        let good = Value::by_ref(Value::structure([
            ("len", Value::from(2i32)),
            ("data", Value::memory(vec![1, 0, 2, 0])),
        ]));
        let args = conform(&signature, &plan, &[good], Arch::Win64).unwrap();
        assert_eq!(
            args[0],
            Value::by_ref(Value::structure([
                ("data", Value::memory(vec![1, 0, 2, 0])),
                ("len", Value::from(2i16)),
            ]))
        );

        let missing = Value::by_ref(Value::structure([("len", Value::from(2i16))]));
        assert!(conform(&signature, &plan, &[missing], Arch::Win64).is_err());

        let by_ref = Value::by_ref(Value::structure([
            ("data", Value::by_ref(1i16)),
            ("len", Value::from(1i16)),
        ]));
        assert!(conform(&signature, &plan, &[by_ref], Arch::Win64).is_err());
    }

    #[test]
    fn test_memory_needs_a_rule() {
        let signature = RoutineSignature::new(vec![TypeDescriptor::pointer_to(i16_t())]);
        let plan = plan_for(&signature);
        let err = conform(&signature, &plan, &[Value::memory(vec![0; 4])], Arch::Win64).unwrap_err();
        assert!(err.to_string().contains("memsync"));
        assert!(conform(&signature, &plan, &[Value::by_ref(5i16)], Arch::Win64).is_ok());
    }

    #[test]
    fn test_restore_out_parameters() {
        let descriptor = TypeDescriptor::pointer_to(int_array());
        let mut caller = Value::by_ref(Value::structure([
            ("data", Value::memory(vec![9, 9])),
            ("len", Value::from(1i16)),
        ]));
        let returned = Value::by_ref(Value::structure([
            ("data", Value::memory(Vec::new())),
            ("len", Value::from(4i16)),
        ]));
        restore(&descriptor, &mut caller, returned);
        assert_eq!(caller.field("len"), Some(&Value::from(4i16)));
        assert_eq!(caller.field("data"), Some(&Value::memory(vec![9, 9])));

        let mut out = Value::by_ref(0i32);
        restore(
            &TypeDescriptor::pointer_to(TypeDescriptor::scalar(ScalarKind::I32)),
            &mut out,
            Value::by_ref(42i32),
        );
        assert_eq!(out, Value::by_ref(42i32));
    }
}
