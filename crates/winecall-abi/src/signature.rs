use serde::{Deserialize, Serialize};

use crate::descriptor::{Arch, ScalarKind, TypeDescriptor};
use crate::memsync::{MemsyncPlan, MemsyncRule};
use crate::SignatureError;

/// Argument types, return type and memsync rules of one routine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutineSignature {
    pub args: Vec<TypeDescriptor>,
    #[serde(default = "default_return")]
    pub ret: TypeDescriptor,
    #[serde(default)]
    pub memsync: Vec<MemsyncRule>,
}

fn default_return() -> TypeDescriptor {
    TypeDescriptor::Fundamental(ScalarKind::I32)
}

impl Default for RoutineSignature {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl RoutineSignature {
    /// A signature returning `i32`, the C default.
    pub fn new(args: Vec<TypeDescriptor>) -> Self {
        Self {
            args,
            ret: default_return(),
            memsync: Vec::new(),
        }
    }

    pub fn returns(mut self, ret: TypeDescriptor) -> Self {
        self.ret = ret;
        self
    }

    pub fn with_memsync(mut self, rule: MemsyncRule) -> Self {
        self.memsync.push(rule);
        self
    }

    /// Validates every descriptor and compiles the memsync rules.
    pub fn compile(&self, arch: Arch) -> Result<MemsyncPlan, SignatureError> {
        for (index, arg) in self.args.iter().enumerate() {
            arg.validate_argument()
                .map_err(|source| SignatureError::Argument { index, source })?;
            arg.layout(arch)
                .map_err(|source| SignatureError::Argument { index, source })?;
        }
        self.ret.validate_return().map_err(SignatureError::Return)?;
        Ok(MemsyncPlan::compile(self, arch)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::CallbackSignature;

    #[test]
    fn test_default_return_is_i32() {
        let signature = RoutineSignature::new(vec![]);
        assert_eq!(signature.ret, TypeDescriptor::scalar(ScalarKind::I32));

        let parsed: RoutineSignature = serde_json::from_str(r#"{"args":[]}"#).unwrap();
        assert_eq!(parsed.ret, TypeDescriptor::scalar(ScalarKind::I32));
        assert!(parsed.memsync.is_empty());
    }

    #[test]
    fn test_compile_reports_argument_position() {
        let signature = RoutineSignature::new(vec![
            TypeDescriptor::scalar(ScalarKind::I32),
            TypeDescriptor::Void,
        ]);
        match signature.compile(Arch::Win64) {
            Err(SignatureError::Argument { index, .. }) => assert_eq!(index, 1),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_compile_rejects_bad_callback_argument() {
        let callback = TypeDescriptor::Callback(CallbackSignature::new(
            vec![TypeDescriptor::array_of(TypeDescriptor::scalar(ScalarKind::I8), 2)],
            TypeDescriptor::Void,
        ));
        let signature = RoutineSignature::new(vec![callback]);
        assert!(signature.compile(Arch::Win32).is_err());
    }

    #[test]
    fn test_compile_rejects_unknown_json_fields() {
        let json = r#"{"args":[],"ret":"void","calling":"cdecl"}"#;
        assert!(serde_json::from_str::<RoutineSignature>(json).is_err());
    }
}
