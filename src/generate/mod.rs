//! Implementation requests and the generators that answer them

mod client;
mod parse;
mod prompts;

pub use client::OpenRouterGenerator;
pub use parse::parse_suggestion;

use crate::error::{PatchError, Result};
use crate::inspect::{CallStackFrame, FunctionDescriptor};
use crate::script::value::lock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write;
use std::sync::Mutex;

/// Callers kept in a request; older frames are dropped first.
pub const MAX_CHAIN_FRAMES: usize = 10;

/// Everything a generator needs to implement one placeholder.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub target: FunctionDescriptor,
    /// Retained frames, root-first, ending at the failing function.
    pub chain: Vec<CallStackFrame>,
    pub system_instructions: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImplementationSuggestion {
    pub implementation: String,
    #[serde(default)]
    pub explanation: String,
}

pub trait ImplementationGenerator: Send + Sync {
    fn suggest(&self, request: &GenerationRequest) -> Result<ImplementationSuggestion>;
}

/// Build a request keeping the last [`MAX_CHAIN_FRAMES`] callers.
pub fn build_request(target: &FunctionDescriptor, chain: &[CallStackFrame]) -> GenerationRequest {
    build_request_with_limit(target, chain, MAX_CHAIN_FRAMES)
}

/// Same as [`build_request`] with an explicit frame budget.
///
/// Pure: the same descriptor and chain always render byte-identical text.
pub fn build_request_with_limit(target: &FunctionDescriptor, chain: &[CallStackFrame], limit: usize) -> GenerationRequest {
    let kept = &chain[chain.len().saturating_sub(limit)..];
    GenerationRequest {
        target: target.clone(),
        chain: kept.to_vec(),
        system_instructions: prompts::IMPLEMENT_SYSTEM.to_string(),
        description: render_description(target, kept, chain.len()),
    }
}

fn render_description(target: &FunctionDescriptor, chain: &[CallStackFrame], total_frames: usize) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "FUNCTION: {}", target.qualname);
    let _ = writeln!(out, "SIGNATURE: {}", target.signature);
    let _ = writeln!(
        out,
        "PARAMETERS: {} (the implementation must take exactly this many)",
        target.param_count
    );
    if target.is_method {
        let _ = writeln!(out, "KIND: method (keep `self` as the first parameter)");
    }
    if let Some(doc) = &target.docstring {
        let _ = writeln!(out, "\nDOCSTRING:\n{}", doc);
    }

    let _ = writeln!(out, "\nCURRENT DEFINITION ({}):", target.location);
    push_code(&mut out, &target.source);

    let types = target.custom_types();
    if !types.is_empty() {
        let _ = writeln!(out, "\nCUSTOM TYPES USED BY THE ARGUMENTS:");
        for info in types {
            match &info.source {
                Some(source) => {
                    let _ = writeln!(out, "\n{} ({}):", info.name, source.location);
                    push_code(&mut out, &source.lines);
                }
                None => {
                    let _ = writeln!(out, "\n{} (definition not available)", info.name);
                }
            }
        }
    }

    if !chain.is_empty() {
        let omitted = total_frames.saturating_sub(chain.len());
        let _ = write!(out, "\nCALL CHAIN (root first, {} frame(s)", chain.len());
        if omitted > 0 {
            let _ = write!(out, ", {} older frame(s) omitted", omitted);
        }
        let _ = writeln!(out, "):");
        let last = chain.len() - 1;
        for (depth, frame) in chain.iter().enumerate() {
            let role = if depth == last { " <- raised here" } else { "" };
            let _ = writeln!(
                out,
                "\n[depth {}] {} at {}:{}{}",
                depth, frame.descriptor.qualname, frame.descriptor.location.origin, frame.line, role
            );
            push_code(&mut out, &frame.descriptor.source);
        }
    }
    out
}

fn push_code(out: &mut String, lines: &[String]) {
    out.push_str("```python\n");
    for line in lines {
        out.push_str(line);
        if !line.ends_with('\n') {
            out.push('\n');
        }
    }
    out.push_str("```\n");
}

// ═══════════════════════════════════════════════════════════════════════════
//  STATIC GENERATOR
// ═══════════════════════════════════════════════════════════════════════════

/// Canned suggestions keyed by qualified name (or plain name).
#[derive(Default)]
pub struct StaticGenerator {
    suggestions: HashMap<String, ImplementationSuggestion>,
    requests: Mutex<Vec<String>>,
}

impl StaticGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, implementation: &str) -> Self {
        self.suggestions.insert(
            name.to_string(),
            ImplementationSuggestion {
                implementation: implementation.to_string(),
                explanation: format!("canned implementation for {}", name),
            },
        );
        self
    }

    /// Qualified names requested so far, in order.
    pub fn requests(&self) -> Vec<String> {
        lock(&self.requests).clone()
    }
}

impl ImplementationGenerator for StaticGenerator {
    fn suggest(&self, request: &GenerationRequest) -> Result<ImplementationSuggestion> {
        let target = &request.target;
        lock(&self.requests).push(target.qualname.clone());
        self.suggestions
            .get(&target.qualname)
            .or_else(|| self.suggestions.get(&target.name))
            .cloned()
            .ok_or_else(|| PatchError::GeneratorUnavailable(format!("no canned implementation for {}", target.qualname)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspect::{capture_chain, describe};
    use crate::script::{Interpreter, OutputSink, Unwind};

    fn chain_source(depth: usize) -> String {
        let mut src = String::new();
        for i in 0..depth - 1 {
            src.push_str(&format!("def f{}(n):\n    return f{}(n)\n\n", i, i + 1));
        }
        src.push_str(&format!(
            "def f{}(n: int) -> int:\n    \"\"\"Last link.\"\"\"\n    raise NotImplementedError\n",
            depth - 1
        ));
        src
    }

    fn captured(depth: usize) -> (FunctionDescriptor, Vec<CallStackFrame>) {
        let mut interp = Interpreter::new().with_output(OutputSink::buffer());
        let module = interp.load_source("chain", &chain_source(depth)).unwrap();
        let signal = match interp.call_value(&module.get("f0").unwrap(), vec![crate::script::Value::Int(1)], vec![]) {
            Err(Unwind::Raise(exc)) => exc,
            other => panic!("expected a raise, got {:?}", other),
        };
        let target = describe(&module.get(&format!("f{}", depth - 1)).unwrap()).unwrap();
        (target, capture_chain(&signal))
    }

    #[test]
    fn test_request_is_deterministic() {
        let (target, chain) = captured(4);
        let first = build_request(&target, &chain);
        let second = build_request(&target, &chain);
        assert_eq!(first.description, second.description);
        assert_eq!(first.system_instructions, second.system_instructions);
        assert!(first.description.contains("SIGNATURE: f3(n: int) -> int"));
        assert!(first.description.contains("Last link."));
    }

    #[test]
    fn test_chain_truncation_keeps_tail() {
        let (target, chain) = captured(25);
        assert_eq!(chain.len(), 25);
        let request = build_request(&target, &chain);
        assert_eq!(request.chain.len(), 10);
        let names: Vec<String> = request.chain.iter().map(|f| f.descriptor.name.clone()).collect();
        let expected: Vec<String> = (15..25).map(|i| format!("f{}", i)).collect();
        assert_eq!(names, expected);
        assert!(request.description.contains("15 older frame(s) omitted"));
        assert!(request.description.contains("[depth 0] f15"));
        assert!(!request.description.contains("[depth 0] f0 "));
        assert!(request.description.contains("[depth 9] f24"));
    }

    #[test]
    fn test_static_generator_falls_back_to_plain_name() {
        let (target, chain) = captured(2);
        let generator = StaticGenerator::new().with("f1", "def f1(n):\n    return n\n");
        let suggestion = generator.suggest(&build_request(&target, &chain)).unwrap();
        assert!(suggestion.implementation.starts_with("def f1"));
        assert_eq!(generator.requests(), vec!["f1".to_string()]);

        let empty = StaticGenerator::new();
        assert!(matches!(
            empty.suggest(&build_request(&target, &chain)),
            Err(PatchError::GeneratorUnavailable(_))
        ));
    }
}
