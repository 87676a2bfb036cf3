//! Candidate parsing and the arity-only compatibility rule

use crate::error::{PatchError, Result};
use crate::inspect::FunctionDescriptor;
use crate::script::ast::{FunctionDef, StmtKind};
use crate::script::parser;
use crate::util::{dedent, strip_code_fence};
use std::sync::Arc;

/// A parsed candidate: its single definition plus the text that will be
/// written to disk for a durable patch.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub def: Arc<FunctionDef>,
    /// The definition's own lines, dedented to column 0 (decorators excluded).
    pub text: String,
}

impl Candidate {
    pub fn param_count(&self) -> usize {
        self.def.params.len()
    }
}

/// Unfence, dedent and drop surrounding blank lines.
pub fn normalize(source: &str) -> String {
    let dedented = dedent(&strip_code_fence(source));
    let lines: Vec<&str> = dedented.lines().collect();
    let first = lines.iter().position(|l| !l.trim().is_empty());
    let last = lines.iter().rposition(|l| !l.trim().is_empty());
    match (first, last) {
        (Some(first), Some(last)) => {
            let mut out = lines[first..=last].join("\n");
            out.push('\n');
            out
        }
        _ => String::new(),
    }
}

/// Parse candidate text that must hold exactly one top-level function.
pub fn parse_candidate(source: &str) -> Result<Candidate> {
    let text = normalize(source);
    if text.is_empty() {
        return Err(PatchError::EmptyCandidate);
    }
    let module = parser::parse_module(&text, "<candidate>").map_err(|err| match err {
        PatchError::Parse { line, message, .. } => {
            PatchError::MalformedCandidate(format!("line {}: {}", line, message))
        }
        other => PatchError::MalformedCandidate(other.to_string()),
    })?;

    let mut defs = module.body.iter().filter_map(|s| match &s.kind {
        StmtKind::FunctionDef(def) => Some(def.clone()),
        _ => None,
    });
    let def = match (defs.next(), defs.next()) {
        (Some(def), None) => def,
        (None, _) => {
            return Err(PatchError::MalformedCandidate(
                "no function definition found".to_string(),
            ))
        }
        (Some(_), Some(_)) => {
            return Err(PatchError::MalformedCandidate(format!(
                "expected exactly one function definition, found {}",
                2 + defs.count()
            )))
        }
    };
    if module.body.len() > 1 {
        tracing::debug!(
            statements = module.body.len() - 1,
            "ignoring top-level statements outside the candidate definition"
        );
    }

    Ok(Candidate {
        text: def.span.text(),
        def,
    })
}

/// True when the candidate declares as many parameters as the original.
///
/// Names, defaults, annotations and parameter kinds are not compared.
pub fn compatible(original: &FunctionDescriptor, candidate_source: &str) -> Result<bool> {
    let candidate = parse_candidate(candidate_source)?;
    Ok(candidate.param_count() == original.param_count)
}

/// [`compatible`] for an already-parsed candidate, as an error.
pub fn check(original: &FunctionDescriptor, candidate: &Candidate) -> Result<()> {
    if candidate.param_count() == original.param_count {
        Ok(())
    } else {
        Err(PatchError::StructuralMismatch {
            original: original.param_count,
            candidate: candidate.param_count(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspect::describe;
    use crate::script::{Interpreter, OutputSink};

    fn params(n: usize, prefix: &str) -> String {
        (0..n).map(|i| format!("{}{}: int", prefix, i)).collect::<Vec<_>>().join(", ")
    }

    fn descriptor_with_arity(n: usize) -> FunctionDescriptor {
        let mut interp = Interpreter::new().with_output(OutputSink::buffer());
        let source = format!("def target({}):\n    raise NotImplementedError\n", params(n, "a"));
        let module = interp.load_source("arity", &source).unwrap();
        describe(&module.get("target").unwrap()).unwrap()
    }

    #[test]
    fn test_arity_only_compatibility() {
        for n in 0..=5 {
            let original = descriptor_with_arity(n);
            // Renamed and retyped parameters with the same count are fine.
            let same = format!("def other({}) -> str:\n    return 'x'\n", params(n, "renamed_"));
            assert!(compatible(&original, &same).unwrap(), "arity {}", n);

            let more = format!("def target({}):\n    return 0\n", params(n + 1, "a"));
            assert!(!compatible(&original, &more).unwrap(), "arity {} vs {}", n, n + 1);

            if n > 0 {
                let fewer = format!("def target({}):\n    return 0\n", params(n - 1, "a"));
                assert!(!compatible(&original, &fewer).unwrap(), "arity {} vs {}", n, n - 1);
            }
        }
    }

    #[test]
    fn test_defaults_and_collectors_count_as_parameters() {
        let original = descriptor_with_arity(2);
        assert!(compatible(&original, "def target(a, b=3):\n    return a\n").unwrap());
        assert!(compatible(&original, "def target(a, *rest):\n    return a\n").unwrap());
        assert!(!compatible(&original, "def target(a, b, **kw):\n    return a\n").unwrap());
    }

    #[test]
    fn test_malformed_candidates() {
        let original = descriptor_with_arity(1);
        for bad in [
            "x = 1\n",
            "def a(x):\n    return x\n\ndef b(x):\n    return x\n",
            "def broken(x:\n    return\n",
        ] {
            assert!(matches!(
                compatible(&original, bad),
                Err(PatchError::MalformedCandidate(_))
            ));
        }
        assert!(matches!(compatible(&original, "\n  \n"), Err(PatchError::EmptyCandidate)));
    }

    #[test]
    fn test_parse_candidate_normalizes_text() {
        let fenced = "```python\n\n    @trace\n    def f(x):\n        return x\n\n```";
        let candidate = parse_candidate(fenced).unwrap();
        assert_eq!(candidate.text, "def f(x):\n    return x\n");
        assert_eq!(candidate.param_count(), 1);
    }

    #[test]
    fn test_check_reports_counts() {
        let original = descriptor_with_arity(2);
        let candidate = parse_candidate("def target(a):\n    return a\n").unwrap();
        match check(&original, &candidate) {
            Err(PatchError::StructuralMismatch { original, candidate }) => {
                assert_eq!((original, candidate), (2, 1));
            }
            other => panic!("expected a mismatch, got {:?}", other),
        }
    }
}
