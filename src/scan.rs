//! Finds placeholder functions in script files without running them

use crate::error::Result;
use crate::script::ast::{ExprKind, Stmt, StmtKind};
use crate::script::parser::parse_module;
use serde::Serialize;
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

/// A function whose body raises `NotImplementedError`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Placeholder {
    pub path: String,
    pub line: usize,
    pub qualname: String,
}

impl std::fmt::Display for Placeholder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} {}", self.path, self.line, self.qualname)
    }
}

pub struct PlaceholderScanner {
    ignore_dirs: Vec<String>,
}

impl Default for PlaceholderScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaceholderScanner {
    pub fn new() -> Self {
        let ignore_dirs = vec![
            "__pycache__".to_string(),
            ".venv".to_string(),
            "venv".to_string(),
            "node_modules".to_string(),
            "target".to_string(),
            "build".to_string(),
            "dist".to_string(),
        ];
        Self { ignore_dirs }
    }

    /// Scan every `.py` file under `root`. Files that fail to parse are
    /// skipped with a warning.
    pub fn scan(&self, root: &Path) -> Vec<Placeholder> {
        let mut found = Vec::new();

        for entry in WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !self.should_ignore(e))
        {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let path = entry.path();
            if !entry.file_type().is_file() || path.extension().and_then(|e| e.to_str()) != Some("py") {
                continue;
            }

            let relative = path
                .strip_prefix(root)
                .ok()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(path)
                .to_string_lossy()
                .to_string();
            let text = match fs::read_to_string(path) {
                Ok(text) => text,
                Err(err) => {
                    tracing::warn!(path = %path.display(), "skipping unreadable file: {}", err);
                    continue;
                }
            };
            match scan_source(&text, &relative) {
                Ok(mut placeholders) => found.append(&mut placeholders),
                Err(err) => tracing::warn!("skipping {}: {}", relative, err),
            }
        }

        found.sort_by(|a, b| a.path.cmp(&b.path).then(a.line.cmp(&b.line)));
        found
    }

    fn should_ignore(&self, entry: &walkdir::DirEntry) -> bool {
        entry
            .file_name()
            .to_str()
            .map(|name| self.ignore_dirs.iter().any(|d| d == name) || name.starts_with('.'))
            .unwrap_or(false)
    }
}

/// Placeholders defined in one source text, in definition order.
pub fn scan_source(text: &str, path: &str) -> Result<Vec<Placeholder>> {
    let module = parse_module(text, path)?;
    let mut found = Vec::new();
    visit(&module.body, "", path, &mut found);
    Ok(found)
}

fn visit(body: &[Stmt], prefix: &str, path: &str, found: &mut Vec<Placeholder>) {
    for stmt in body {
        match &stmt.kind {
            StmtKind::FunctionDef(def) => {
                let qualname = format!("{}{}", prefix, def.name);
                if raises_placeholder(&def.body) {
                    found.push(Placeholder {
                        path: path.to_string(),
                        line: def.span.start_line,
                        qualname: qualname.clone(),
                    });
                }
                visit(&def.body, &format!("{}.<locals>.", qualname), path, found);
            }
            StmtKind::ClassDef(class) => {
                visit(&class.body, &format!("{}{}.", prefix, class.name), path, found);
            }
            StmtKind::If { branches, orelse } => {
                for (_, branch) in branches {
                    visit(branch, prefix, path, found);
                }
                visit(orelse, prefix, path, found);
            }
            _ => {}
        }
    }
}

/// A top-level `raise NotImplementedError` or `raise NotImplementedError(...)`
/// in the function body.
fn raises_placeholder(body: &[Stmt]) -> bool {
    body.iter().any(|stmt| match &stmt.kind {
        StmtKind::Raise(Some(expr)) => match &expr.kind {
            ExprKind::Name(name) => name == "NotImplementedError",
            ExprKind::Call { func, .. } => matches!(&func.kind, ExprKind::Name(name) if name == "NotImplementedError"),
            _ => false,
        },
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SRC: &str = "\
def ready(x):
    return x

def todo(x):
    \"\"\"Later.\"\"\"
    raise NotImplementedError(\"soon\")

class Shape:
    def area(self):
        raise NotImplementedError

def outer():
    def inner():
        raise NotImplementedError
    return inner
";

    #[test]
    fn test_scan_source_finds_placeholders() {
        let found = scan_source(SRC, "shapes.py").unwrap();
        let names: Vec<&str> = found.iter().map(|p| p.qualname.as_str()).collect();
        assert_eq!(names, vec!["todo", "Shape.area", "outer.<locals>.inner"]);
        assert_eq!(found[0].line, 4);
        assert_eq!(found[0].to_string(), "shapes.py:4 todo");
    }

    #[test]
    fn test_conditional_raise_is_not_a_placeholder() {
        let src = "def check(x):\n    if x:\n        raise NotImplementedError\n    return x\n";
        assert!(scan_source(src, "m.py").unwrap().is_empty());
    }

    #[test]
    fn test_scan_walks_py_files_and_skips_bad_ones() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.py"), SRC).unwrap();
        fs::create_dir(dir.path().join("pkg")).unwrap();
        fs::write(dir.path().join("pkg").join("b.py"), "def b():\n    raise NotImplementedError\n").unwrap();
        fs::write(dir.path().join("broken.py"), "def (:\n").unwrap();
        fs::write(dir.path().join("notes.txt"), "raise NotImplementedError\n").unwrap();
        fs::create_dir(dir.path().join("__pycache__")).unwrap();
        fs::write(dir.path().join("__pycache__").join("c.py"), "def c():\n    raise NotImplementedError\n").unwrap();

        let found = PlaceholderScanner::new().scan(dir.path());
        let rendered: Vec<String> = found.iter().map(|p| format!("{} {}", p.path.replace('\\', "/"), p.qualname)).collect();
        assert_eq!(
            rendered,
            vec!["a.py todo", "a.py Shape.area", "a.py outer.<locals>.inner", "pkg/b.py b"]
        );
    }
}
