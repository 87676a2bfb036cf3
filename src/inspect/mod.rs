//! Function descriptor extraction
//!
//! Turns a live callable back into source: where it is defined, what it
//! says, and which user-defined types its parameters mention.

mod chain;
mod types;

pub use chain::capture_chain;
pub use types::{ArgumentInfo, CallStackFrame, CustomTypeInfo, FunctionDescriptor, SourceLocation, TypeSource};

use crate::error::{PatchError, Result};
use crate::script::ast::{FunctionDef, TypeExpr};
use crate::script::registry;
use crate::script::value::{FunctionCell, Scope, Value};
use std::sync::Arc;

/// Builtin and typing names that are never reported as custom types.
const BUILTIN_TYPES: &[&str] = &[
    "int", "float", "str", "bool", "bytes", "complex", "object", "type", "list", "dict", "set", "tuple",
    "frozenset", "None", "NoneType", "Any", "Optional", "Union", "List", "Dict", "Set", "Tuple", "FrozenSet",
    "Type", "Callable", "Iterable", "Iterator", "Sequence", "Mapping", "MutableMapping", "Generator",
    "Literal", "Self",
];

/// Module prefixes whose members count as standard library.
const STDLIB_PREFIXES: &[&str] = &["typing.", "collections.", "collections.abc.", "builtins.", "types."];

/// Describe a callable, unwrapping decorators and bound methods.
pub fn describe(callable: &Value) -> Result<FunctionDescriptor> {
    let cell = innermost(callable)?;
    describe_function(&cell)
}

fn innermost(callable: &Value) -> Result<Arc<FunctionCell>> {
    match callable {
        Value::Function(cell) => Ok(cell.clone()),
        Value::Decorated(wrapper) => innermost(&wrapper.inner),
        Value::BoundMethod(bound) => innermost(&bound.method),
        Value::Native(native) => Err(PatchError::NotInspectable {
            name: native.name.clone(),
            reason: "native function has no script source".into(),
        }),
        other => Err(PatchError::NotInspectable {
            name: other.repr(),
            reason: "not a plain function or method".into(),
        }),
    }
}

/// Describe a function cell from the current text of its module.
pub fn describe_function(cell: &Arc<FunctionCell>) -> Result<FunctionDescriptor> {
    let def = locate(cell);
    let arguments = def
        .params
        .iter()
        .filter(|p| !p.is_variadic())
        .map(|param| {
            let mut custom_types = Vec::new();
            if let Some(annotation) = &param.annotation {
                collect_custom(&annotation.expr, &cell.globals, &mut custom_types);
            }
            ArgumentInfo {
                name: param.name.clone(),
                declared_type: param.annotation.as_ref().map(|a| a.text.clone()),
                custom_types,
            }
        })
        .collect();

    Ok(FunctionDescriptor {
        function: cell.clone(),
        id: cell.id,
        name: cell.name.clone(),
        qualname: cell.qualname.clone(),
        location: SourceLocation {
            origin: cell.module.origin.clone(),
            start_line: def.span.start_line,
            end_line: def.span.end_line,
        },
        source: def.span.lines.clone(),
        signature: def.signature(),
        docstring: def.docstring.clone(),
        decorators: def.decorators.iter().map(|d| d.text.clone()).collect(),
        is_method: cell.is_method,
        param_count: def.params.len(),
        arguments,
    })
}

/// The function's definition as the source currently reads; falls back to
/// the load-time snapshot, then to the executing body.
fn locate(cell: &FunctionCell) -> Arc<FunctionDef> {
    if cell.name != "<lambda>" {
        for parsed in [cell.module.parse_current(), cell.module.parse_snapshot()] {
            match parsed {
                Ok(module) => {
                    if let Some(def) = registry::find_function(&module, &cell.qualname, cell.def_line) {
                        return def;
                    }
                }
                Err(err) => tracing::debug!(function = %cell.qualname, "source unavailable: {}", err),
            }
        }
    }
    cell.body().def.clone()
}

fn is_builtin_type(name: &str) -> bool {
    BUILTIN_TYPES.contains(&name) || STDLIB_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// Walk a type expression, recording non-builtin leaves in first-seen order.
fn collect_custom(expr: &TypeExpr, globals: &Scope, out: &mut Vec<CustomTypeInfo>) {
    match expr {
        TypeExpr::Name(name) => record_leaf(name, name, globals, out),
        TypeExpr::Dotted(path) => {
            if !is_builtin_type(path) {
                let leaf = path.rsplit('.').next().unwrap_or(path);
                record_leaf(path, leaf, globals, out);
            }
        }
        TypeExpr::Generic { base, args } => {
            collect_custom(base, globals, out);
            for arg in args {
                collect_custom(arg, globals, out);
            }
        }
        TypeExpr::Union(members) => {
            for member in members {
                collect_custom(member, globals, out);
            }
        }
        TypeExpr::None | TypeExpr::Opaque(_) => {}
    }
}

fn record_leaf(written: &str, leaf: &str, globals: &Scope, out: &mut Vec<CustomTypeInfo>) {
    if is_builtin_type(written) || out.iter().any(|t| t.name == written) {
        return;
    }
    let source = match globals.get(leaf) {
        Some(Value::Class(class)) if class.builtin => return,
        Some(Value::Class(class)) => class_source(&class),
        _ => None,
    };
    out.push(CustomTypeInfo {
        name: written.to_string(),
        source,
    });
}

fn class_source(class: &crate::script::value::Class) -> Option<TypeSource> {
    let record = class.module.as_ref()?;
    let hint = class.def.as_ref().map(|d| d.span.start_line).unwrap_or(0);
    let def = record
        .parse_current()
        .ok()
        .and_then(|m| registry::find_class(&m, &class.qualname, hint))
        .or_else(|| class.def.clone())?;
    Some(TypeSource {
        location: SourceLocation {
            origin: record.origin.clone(),
            start_line: def.span.start_line,
            end_line: def.span.end_line,
        },
        lines: def.span.lines.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{Interpreter, OutputSink};

    const SOURCE: &str = "\
from dataclasses import dataclass
from typing import Optional

@dataclass
class Token:
    kind: str
    text: str

class Expr:
    pass

def parse(tokens: list[Token], root: Optional[Expr] = None, depth: int = 0, *rest, **opts) -> Expr:
    \"\"\"Build an expression tree.\"\"\"
    raise NotImplementedError

def shout(text):
    return text.upper()

def outer():
    def inner(x):
        raise NotImplementedError
    return inner
";

    fn load() -> (Interpreter, crate::script::LoadedModule) {
        let mut interp = Interpreter::new().with_output(OutputSink::buffer());
        let module = interp.load_source("parsing", SOURCE).unwrap();
        (interp, module)
    }

    #[test]
    fn test_describe_location_and_source() {
        let (_interp, module) = load();
        let desc = describe(&module.get("parse").unwrap()).unwrap();
        assert_eq!(desc.location.start_line, 12);
        assert_eq!(desc.location.end_line, 14);
        assert_eq!(desc.source.len(), 3);
        assert_eq!(
            desc.location.end_line,
            desc.location.start_line + desc.source.len() - 1
        );
        assert!(desc.source[0].starts_with("def parse("));
        assert_eq!(desc.docstring.as_deref(), Some("Build an expression tree."));
        assert_eq!(desc.param_count, 5);
    }

    #[test]
    fn test_arguments_skip_collectors_and_find_custom_types() {
        let (_interp, module) = load();
        let desc = describe(&module.get("parse").unwrap()).unwrap();
        let names: Vec<&str> = desc.arguments.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["tokens", "root", "depth"]);

        let tokens = &desc.arguments[0];
        assert_eq!(tokens.declared_type.as_deref(), Some("list[Token]"));
        assert_eq!(tokens.custom_types.len(), 1);
        let token = &tokens.custom_types[0];
        assert_eq!(token.name, "Token");
        let source = token.source.as_ref().unwrap();
        assert_eq!(source.location.start_line, 5);
        assert!(source.lines[0].starts_with("class Token"));

        let root = &desc.arguments[1];
        assert_eq!(root.custom_types.len(), 1);
        assert_eq!(root.custom_types[0].name, "Expr");
        assert!(desc.arguments[2].custom_types.is_empty());
    }

    #[test]
    fn test_unknown_type_degrades_to_name_only() {
        let mut interp = Interpreter::new().with_output(OutputSink::buffer());
        let module = interp
            .load_source("m", "def f(x: Missing, y: 'Later') -> None:\n    pass\n")
            .unwrap();
        let desc = describe(&module.get("f").unwrap()).unwrap();
        assert_eq!(desc.arguments[0].custom_types[0].name, "Missing");
        assert!(desc.arguments[0].custom_types[0].source.is_none());
        assert_eq!(desc.arguments[1].custom_types[0].name, "Later");
    }

    #[test]
    fn test_native_and_non_callables_are_not_inspectable() {
        let (interp, _module) = load();
        let len = interp.builtin("len").unwrap();
        assert!(matches!(describe(&len), Err(PatchError::NotInspectable { .. })));
        assert!(matches!(
            describe(&Value::Int(3)),
            Err(PatchError::NotInspectable { .. })
        ));
    }

    #[test]
    fn test_nested_function_qualname() {
        let (mut interp, module) = load();
        let inner = interp.call(&module.get("outer").unwrap(), vec![]).unwrap();
        let desc = describe(&inner).unwrap();
        assert_eq!(desc.qualname, "outer.<locals>.inner");
        assert_eq!(desc.location.start_line, 20);
        assert!(!desc.is_method);
    }
}
