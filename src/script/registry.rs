//! Source registry: where each loaded module came from and what it said
//!
//! Inspection asks the registry for the *current* text of a module, which
//! re-reads file origins so line ranges stay correct after a durable rewrite.

use super::ast::{ClassDef, FunctionDef, Module, Stmt, StmtKind};
use super::parser;
use crate::error::Result;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SourceOrigin {
    File(PathBuf),
    Memory(String),
}

impl SourceOrigin {
    pub fn path(&self) -> Option<&Path> {
        match self {
            SourceOrigin::File(p) => Some(p),
            SourceOrigin::Memory(_) => None,
        }
    }
}

impl fmt::Display for SourceOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceOrigin::File(p) => write!(f, "{}", p.display()),
            SourceOrigin::Memory(label) => write!(f, "<{}>", label),
        }
    }
}

#[derive(Debug)]
pub struct ModuleRecord {
    pub id: usize,
    pub name: String,
    pub origin: SourceOrigin,
    /// Text as it was when the module was loaded.
    pub snapshot: String,
}

impl ModuleRecord {
    /// Current text: the file on disk when readable, else the load-time snapshot.
    pub fn current_text(&self) -> String {
        if let SourceOrigin::File(path) = &self.origin {
            match std::fs::read_to_string(path) {
                Ok(text) => return text,
                Err(err) => {
                    tracing::debug!(path = %path.display(), "falling back to snapshot: {}", err);
                }
            }
        }
        self.snapshot.clone()
    }

    pub fn parse_current(&self) -> Result<Module> {
        parser::parse_module(&self.current_text(), &self.origin.to_string())
    }

    pub fn parse_snapshot(&self) -> Result<Module> {
        parser::parse_module(&self.snapshot, &self.origin.to_string())
    }
}

#[derive(Debug, Default)]
pub struct SourceRegistry {
    modules: RwLock<Vec<Arc<ModuleRecord>>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, origin: SourceOrigin, text: &str) -> Arc<ModuleRecord> {
        let mut modules = match self.modules.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let record = Arc::new(ModuleRecord {
            id: modules.len(),
            name: name.to_string(),
            origin,
            snapshot: text.to_string(),
        });
        modules.push(record.clone());
        record
    }

    pub fn modules(&self) -> Vec<Arc<ModuleRecord>> {
        match self.modules.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn by_path(&self, path: &Path) -> Option<Arc<ModuleRecord>> {
        self.modules()
            .into_iter()
            .find(|m| m.origin.path() == Some(path))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  DEFINITION LOOKUP
// ═══════════════════════════════════════════════════════════════════════════

/// Split a qualified name into definition path segments (`<locals>` dropped).
pub fn qualname_path(qualname: &str) -> Vec<&str> {
    qualname.split('.').filter(|s| *s != "<locals>").collect()
}

/// Find the function at `qualname`, preferring the candidate nearest `hint_line`.
pub fn find_function(module: &Module, qualname: &str, hint_line: usize) -> Option<Arc<FunctionDef>> {
    let path = qualname_path(qualname);
    let mut found = Vec::new();
    collect_functions(&module.body, &path, &mut found);
    found
        .into_iter()
        .min_by_key(|def| def.span.start_line.abs_diff(hint_line))
}

/// Find a class by qualified name, preferring the candidate nearest `hint_line`.
pub fn find_class(module: &Module, qualname: &str, hint_line: usize) -> Option<Arc<ClassDef>> {
    let path = qualname_path(qualname);
    let mut found = Vec::new();
    collect_classes(&module.body, &path, &mut found);
    found
        .into_iter()
        .min_by_key(|def| def.span.start_line.abs_diff(hint_line))
}

/// Statement lists reachable without entering another definition.
fn nested_blocks(stmt: &Stmt) -> Vec<&[Stmt]> {
    match &stmt.kind {
        StmtKind::If { branches, orelse } => {
            let mut blocks: Vec<&[Stmt]> = branches.iter().map(|(_, b)| b.as_slice()).collect();
            blocks.push(orelse.as_slice());
            blocks
        }
        StmtKind::While { body, orelse, .. } | StmtKind::For { body, orelse, .. } => {
            vec![body.as_slice(), orelse.as_slice()]
        }
        StmtKind::Try {
            body,
            handlers,
            orelse,
            finally,
        } => {
            let mut blocks: Vec<&[Stmt]> = vec![body.as_slice(), orelse.as_slice(), finally.as_slice()];
            blocks.extend(handlers.iter().map(|h| h.body.as_slice()));
            blocks
        }
        StmtKind::With { body, .. } => vec![body.as_slice()],
        _ => Vec::new(),
    }
}

fn collect_functions(stmts: &[Stmt], path: &[&str], out: &mut Vec<Arc<FunctionDef>>) {
    let Some((head, rest)) = path.split_first() else {
        return;
    };
    for stmt in stmts {
        match &stmt.kind {
            StmtKind::FunctionDef(def) if def.name == *head => {
                if rest.is_empty() {
                    out.push(def.clone());
                } else {
                    collect_functions(&def.body, rest, out);
                }
            }
            StmtKind::ClassDef(class) if class.name == *head && !rest.is_empty() => {
                collect_functions(&class.body, rest, out);
            }
            _ => {
                for block in nested_blocks(stmt) {
                    collect_functions(block, path, out);
                }
            }
        }
    }
}

fn collect_classes(stmts: &[Stmt], path: &[&str], out: &mut Vec<Arc<ClassDef>>) {
    let Some((head, rest)) = path.split_first() else {
        return;
    };
    for stmt in stmts {
        match &stmt.kind {
            StmtKind::ClassDef(class) if class.name == *head => {
                if rest.is_empty() {
                    out.push(class.clone());
                } else {
                    collect_classes(&class.body, rest, out);
                }
            }
            StmtKind::FunctionDef(def) if def.name == *head && !rest.is_empty() => {
                collect_classes(&def.body, rest, out);
            }
            _ => {
                for block in nested_blocks(stmt) {
                    collect_classes(block, path, out);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "\
def outer():
    def inner():
        raise NotImplementedError
    return inner

class Shape:
    def area(self):
        raise NotImplementedError

if True:
    def late():
        pass
";

    #[test]
    fn test_qualname_path_drops_locals() {
        assert_eq!(qualname_path("outer.<locals>.inner"), vec!["outer", "inner"]);
        assert_eq!(qualname_path("Shape.area"), vec!["Shape", "area"]);
    }

    #[test]
    fn test_find_nested_and_method_definitions() {
        let module = parser::parse_module(SOURCE, "<test>").unwrap();
        let inner = find_function(&module, "outer.<locals>.inner", 0).unwrap();
        assert_eq!(inner.span.start_line, 2);
        let area = find_function(&module, "Shape.area", 0).unwrap();
        assert_eq!(area.span.start_line, 7);
        let late = find_function(&module, "late", 0).unwrap();
        assert_eq!(late.span.start_line, 11);
        assert!(find_function(&module, "missing", 0).is_none());
        assert_eq!(find_class(&module, "Shape", 0).unwrap().span.start_line, 6);
    }

    #[test]
    fn test_current_text_rereads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mod.py");
        std::fs::write(&path, "x = 1\n").unwrap();
        let registry = SourceRegistry::new();
        let record = registry.register("mod", SourceOrigin::File(path.clone()), "x = 1\n");
        std::fs::write(&path, "x = 2\n").unwrap();
        assert_eq!(record.current_text(), "x = 2\n");
        std::fs::remove_file(&path).unwrap();
        assert_eq!(record.current_text(), "x = 1\n");
        assert!(registry.by_path(&path).is_some());
    }
}
