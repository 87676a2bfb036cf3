use crate::script::registry::SourceOrigin;
use crate::script::value::{FunctionCell, FunctionId};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Where a definition lives: origin plus an inclusive 1-based line range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceLocation {
    pub origin: SourceOrigin,
    pub start_line: usize,
    pub end_line: usize,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}-{}", self.origin, self.start_line, self.end_line)
    }
}

/// Definition source of a custom type, when it could be recovered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeSource {
    pub location: SourceLocation,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CustomTypeInfo {
    pub name: String,
    pub source: Option<TypeSource>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArgumentInfo {
    pub name: String,
    /// Annotation as written, if any.
    pub declared_type: Option<String>,
    /// Non-builtin leaves of the annotation, first appearance first.
    pub custom_types: Vec<CustomTypeInfo>,
}

/// Snapshot of one function as it currently reads in its source.
///
/// Always computed fresh: a durable rewrite shifts line ranges, so a
/// descriptor is never reused across a patch.
#[derive(Debug, Clone, Serialize)]
pub struct FunctionDescriptor {
    /// The live function this describes.
    #[serde(skip)]
    pub function: Arc<FunctionCell>,
    pub id: FunctionId,
    pub name: String,
    pub qualname: String,
    pub location: SourceLocation,
    /// Verbatim lines, newline-terminated; `location.end_line` is the last.
    pub source: Vec<String>,
    pub signature: String,
    pub docstring: Option<String>,
    pub decorators: Vec<String>,
    pub is_method: bool,
    /// Every declared parameter, including `self` and collectors.
    pub param_count: usize,
    pub arguments: Vec<ArgumentInfo>,
}

impl FunctionDescriptor {
    pub fn source_text(&self) -> String {
        self.source.concat()
    }

    /// Union of custom types across this function's own arguments.
    pub fn custom_types(&self) -> Vec<&CustomTypeInfo> {
        let mut seen: Vec<&CustomTypeInfo> = Vec::new();
        for info in self.arguments.iter().flat_map(|a| a.custom_types.iter()) {
            if !seen.iter().any(|s| s.name == info.name) {
                seen.push(info);
            }
        }
        seen
    }
}

/// One calling context: the function running there and the line it was on.
#[derive(Debug, Clone, Serialize)]
pub struct CallStackFrame {
    pub descriptor: FunctionDescriptor,
    pub line: usize,
}
