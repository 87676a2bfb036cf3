use super::describe_function;
use super::types::CallStackFrame;
use crate::script::value::ExceptionValue;
use std::collections::HashSet;

/// Reconstruct how execution reached a placeholder failure.
///
/// Frames come from the snapshot taken when the signal was raised, walked
/// deepest first with one entry per function identity (a recursive function
/// keeps its deepest occurrence), then returned root-first so the raising
/// function is last. Anything other than a placeholder yields an empty chain.
pub fn capture_chain(signal: &ExceptionValue) -> Vec<CallStackFrame> {
    if !signal.is_placeholder() {
        return Vec::new();
    }
    let mut seen = HashSet::new();
    let mut chain = Vec::new();
    for frame in signal.trace().iter().rev() {
        if !seen.insert(frame.function.id) {
            continue;
        }
        match describe_function(&frame.function) {
            Ok(descriptor) => chain.push(CallStackFrame {
                descriptor,
                line: frame.line,
            }),
            Err(err) => tracing::debug!(function = %frame.function.qualname, "frame skipped: {}", err),
        }
    }
    chain.reverse();
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{Interpreter, OutputSink, Unwind, Value};
    use std::sync::Arc;

    fn raise_from(src: &str, entry: &str, args: Vec<Value>) -> Arc<ExceptionValue> {
        let mut interp = Interpreter::new().with_output(OutputSink::buffer());
        let module = interp.load_source("chain", src).unwrap();
        match interp.call_value(&module.get(entry).unwrap(), args, vec![]) {
            Err(Unwind::Raise(exc)) => exc,
            other => panic!("expected a raise, got {:?}", other),
        }
    }

    #[test]
    fn test_chain_is_root_first_and_ends_at_raiser() {
        let src = "\
def top():
    return middle()

def middle():
    x = 1
    return leaf(x)

def leaf(x):
    raise NotImplementedError
";
        let signal = raise_from(src, "top", vec![]);
        let chain = capture_chain(&signal);
        let names: Vec<&str> = chain.iter().map(|f| f.descriptor.name.as_str()).collect();
        assert_eq!(names, vec!["top", "middle", "leaf"]);
        assert_eq!(chain[1].line, 6);
        assert_eq!(chain[2].line, 9);
    }

    #[test]
    fn test_recursive_frames_collapse_to_one_identity() {
        let src = "\
def countdown(n):
    if n == 0:
        raise NotImplementedError
    return countdown(n - 1)
";
        let signal = raise_from(src, "countdown", vec![Value::Int(4)]);
        let chain = capture_chain(&signal);
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].line, 3);
    }

    #[test]
    fn test_method_and_nested_attribution() {
        let src = "\
class Lexer:
    def next_token(self):
        def scan():
            raise NotImplementedError
        return scan()

def run():
    return Lexer().next_token()
";
        let signal = raise_from(src, "run", vec![]);
        let chain = capture_chain(&signal);
        let qualnames: Vec<&str> = chain.iter().map(|f| f.descriptor.qualname.as_str()).collect();
        assert_eq!(
            qualnames,
            vec!["run", "Lexer.next_token", "Lexer.next_token.<locals>.scan"]
        );
        assert!(chain[1].descriptor.is_method);
        assert_eq!(chain[2].descriptor.location.start_line, 3);
    }

    #[test]
    fn test_other_failures_yield_empty_chain() {
        let signal = raise_from("def f():\n    raise ValueError('no')\n", "f", vec![]);
        assert!(capture_chain(&signal).is_empty());
    }
}
