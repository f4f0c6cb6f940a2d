//! Addresses of values inside a call's argument list or return value.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathRoot {
    Arg(usize),
    Return,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathStep {
    /// Struct member; a pointer to a struct is followed implicitly.
    Field(String),
    /// Explicit pointer dereference.
    Deref,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValuePath {
    pub root: PathRoot,
    #[serde(default)]
    pub steps: Vec<PathStep>,
}

impl ValuePath {
    pub fn arg(index: usize) -> Self {
        Self {
            root: PathRoot::Arg(index),
            steps: Vec::new(),
        }
    }

    pub fn ret() -> Self {
        Self {
            root: PathRoot::Return,
            steps: Vec::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>) -> Self {
        self.steps.push(PathStep::Field(name.into()));
        self
    }

    pub fn deref(mut self) -> Self {
        self.steps.push(PathStep::Deref);
        self
    }

    /// Parses the dotted form produced by `Display`, e.g. `arg0.data.*`.
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.split('.');
        let root = match parts.next()? {
            "return" | "ret" => PathRoot::Return,
            head => PathRoot::Arg(head.strip_prefix("arg")?.parse().ok()?),
        };
        let mut steps = Vec::new();
        for part in parts {
            if part.is_empty() {
                return None;
            }
            steps.push(if part == "*" {
                PathStep::Deref
            } else {
                PathStep::Field(part.to_string())
            });
        }
        Some(Self { root, steps })
    }

    /// True if `self` addresses `other` or something that contains it.
    pub fn is_prefix_of(&self, other: &ValuePath) -> bool {
        self.root == other.root
            && self.steps.len() <= other.steps.len()
            && self.steps.iter().zip(&other.steps).all(|(a, b)| a == b)
    }
}

impl fmt::Display for ValuePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.root {
            PathRoot::Arg(index) => write!(f, "arg{index}")?,
            PathRoot::Return => f.write_str("return")?,
        }
        for step in &self.steps {
            match step {
                PathStep::Field(name) => write!(f, ".{name}")?,
                PathStep::Deref => f.write_str(".*")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_parse() {
        let path = ValuePath::arg(1).field("data").deref();
        assert_eq!(path.to_string(), "arg1.data.*");
        assert_eq!(ValuePath::parse("arg1.data.*"), Some(path));
        assert_eq!(ValuePath::parse("return"), Some(ValuePath::ret()));
        assert_eq!(ValuePath::parse("argx"), None);
        assert_eq!(ValuePath::parse("arg0..x"), None);
    }

    #[test]
    fn test_prefix() {
        let base = ValuePath::arg(0);
        let nested = ValuePath::arg(0).field("len");
        assert!(base.is_prefix_of(&nested));
        assert!(base.is_prefix_of(&base));
        assert!(!nested.is_prefix_of(&base));
        assert!(!ValuePath::arg(1).is_prefix_of(&nested));
        assert!(!ValuePath::ret().is_prefix_of(&nested));
    }
}
