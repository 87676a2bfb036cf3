//! Confirmation surfaces: where a person accepts, edits or writes a patch

use crate::generate::ImplementationSuggestion;
use crate::inspect::FunctionDescriptor;
use crate::script::value::lock;
use crate::util::truncate;
use std::collections::VecDeque;
use std::io::{self, BufRead, Write};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Review {
    Accept,
    Reject,
    Edit(String),
}

pub trait ConfirmationSurface: Send + Sync {
    /// Whether to ask the generator before manual authoring.
    fn wants_generator(&self, target: &FunctionDescriptor) -> bool;

    fn review(&self, target: &FunctionDescriptor, suggestion: &ImplementationSuggestion) -> Review;

    /// Manual authoring, seeded with a draft and the problem to fix.
    /// `None` declines.
    fn author(&self, target: &FunctionDescriptor, draft: Option<&str>, problem: Option<&str>) -> Option<String>;

    fn notify(&self, message: &str);

    /// Boolean form of [`review`](Self::review).
    fn present(&self, target: &FunctionDescriptor, suggested_text: &str) -> bool {
        let suggestion = ImplementationSuggestion {
            implementation: suggested_text.to_string(),
            explanation: String::new(),
        };
        matches!(self.review(target, &suggestion), Review::Accept)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  TERMINAL
// ═══════════════════════════════════════════════════════════════════════════

const COLUMN_WIDTH: usize = 48;

/// Prompts on stderr and reads stdin, so script output on stdout stays clean.
#[derive(Debug, Default)]
pub struct TerminalSurface;

impl TerminalSurface {
    pub fn new() -> Self {
        Self
    }
}

impl ConfirmationSurface for TerminalSurface {
    fn wants_generator(&self, target: &FunctionDescriptor) -> bool {
        eprintln!();
        eprintln!("  {} is not implemented yet ({})", target.qualname, target.location);
        ask_yes_no(&mut io::stdin().lock(), "  Generate implementation with AI? [Y/n] ", true)
    }

    fn review(&self, target: &FunctionDescriptor, suggestion: &ImplementationSuggestion) -> Review {
        eprintln!();
        eprint!("{}", side_by_side(&target.source, &suggestion.implementation));
        if !suggestion.explanation.is_empty() {
            eprintln!();
            eprintln!("  {}", suggestion.explanation);
        }
        eprintln!();
        let mut stdin = io::stdin().lock();
        match prompt_line(&mut stdin, "  [a]ccept, [e]dit or [r]eject? ")
            .as_deref()
            .map(str::trim)
        {
            Some("a") | Some("accept") | Some("") => Review::Accept,
            Some("e") | Some("edit") => {
                eprintln!("  Enter the implementation; finish with an empty line.");
                match read_block(&mut stdin) {
                    Some(text) => Review::Edit(text),
                    None => Review::Edit(suggestion.implementation.clone()),
                }
            }
            _ => Review::Reject,
        }
    }

    fn author(&self, target: &FunctionDescriptor, draft: Option<&str>, problem: Option<&str>) -> Option<String> {
        eprintln!();
        if let Some(problem) = problem {
            eprintln!("  Problem: {}", problem);
        }
        if let Some(draft) = draft {
            eprintln!("  Previous attempt:");
            for (i, line) in draft.lines().enumerate() {
                eprintln!("  {:>3} | {}", i + 1, line);
            }
        }
        eprintln!(
            "  Write {} ({} parameter(s)); finish with an empty line. Empty input declines.",
            target.signature, target.param_count
        );
        read_block(&mut io::stdin().lock())
    }

    fn notify(&self, message: &str) {
        eprintln!("  {}", message);
    }
}

fn prompt_line(reader: &mut impl BufRead, prompt: &str) -> Option<String> {
    eprint!("{}", prompt);
    let _ = io::stderr().flush();
    let mut line = String::new();
    match reader.read_line(&mut line) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line),
    }
}

fn ask_yes_no(reader: &mut impl BufRead, prompt: &str, default: bool) -> bool {
    match prompt_line(reader, prompt) {
        Some(answer) => match answer.trim().to_lowercase().as_str() {
            "" => default,
            "y" | "yes" => true,
            _ => false,
        },
        None => false,
    }
}

/// Read lines until an empty line or end of input. `None` when nothing was typed.
fn read_block(reader: &mut impl BufRead) -> Option<String> {
    let mut text = String::new();
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        if line.trim().is_empty() {
            break;
        }
        text.push_str(line.trim_end_matches(['\r', '\n']));
        text.push('\n');
    }
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Numbered two-column view of the current source and a suggestion.
pub fn side_by_side(original: &[String], suggestion: &str) -> String {
    let left: Vec<&str> = original.iter().map(|l| l.trim_end_matches(['\r', '\n'])).collect();
    let right: Vec<&str> = suggestion.lines().collect();
    let rows = left.len().max(right.len());

    let mut out = format!(
        "  {:<width$} | {}\n",
        "CURRENT",
        "SUGGESTED",
        width = COLUMN_WIDTH + 5
    );
    out.push_str(&format!("  {}\n", "-".repeat(COLUMN_WIDTH * 2 + 13)));
    for i in 0..rows {
        let cell = |lines: &[&str]| match lines.get(i) {
            Some(line) => format!("{:>3} {}", i + 1, truncate(&line.replace('\t', "    "), COLUMN_WIDTH)),
            None => String::new(),
        };
        out.push_str(&format!(
            "  {:<width$} | {}\n",
            cell(left.as_slice()),
            cell(right.as_slice()),
            width = COLUMN_WIDTH + 5
        ));
    }
    out
}

// ═══════════════════════════════════════════════════════════════════════════
//  SCRIPTED
// ═══════════════════════════════════════════════════════════════════════════

/// Pre-programmed answers, consumed in order.
///
/// When a queue runs dry: the generator is wanted (unless built with
/// [`declining`](Self::declining)), reviews accept and
/// authoring declines.
#[derive(Default)]
pub struct ScriptedSurface {
    generator_answers: Mutex<VecDeque<bool>>,
    reviews: Mutex<VecDeque<Review>>,
    authored: Mutex<VecDeque<Option<String>>>,
    notices: Mutex<Vec<String>>,
    events: Mutex<Vec<String>>,
    decline_all: bool,
}

impl ScriptedSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decline everything: no generator, no manual code.
    pub fn declining() -> Self {
        Self {
            decline_all: true,
            ..Self::default()
        }
    }

    pub fn wants_generator_answer(self, answer: bool) -> Self {
        lock(&self.generator_answers).push_back(answer);
        self
    }

    pub fn then_review(self, review: Review) -> Self {
        lock(&self.reviews).push_back(review);
        self
    }

    pub fn then_author(self, text: Option<&str>) -> Self {
        lock(&self.authored).push_back(text.map(str::to_string));
        self
    }

    pub fn notices(&self) -> Vec<String> {
        lock(&self.notices).clone()
    }

    /// Every call made on the surface, as `kind:qualname`.
    pub fn events(&self) -> Vec<String> {
        lock(&self.events).clone()
    }

    fn record(&self, kind: &str, target: &FunctionDescriptor) {
        lock(&self.events).push(format!("{}:{}", kind, target.qualname));
    }
}

impl ConfirmationSurface for ScriptedSurface {
    fn wants_generator(&self, target: &FunctionDescriptor) -> bool {
        self.record("generate?", target);
        lock(&self.generator_answers).pop_front().unwrap_or(!self.decline_all)
    }

    fn review(&self, target: &FunctionDescriptor, _suggestion: &ImplementationSuggestion) -> Review {
        self.record("review", target);
        lock(&self.reviews).pop_front().unwrap_or(Review::Accept)
    }

    fn author(&self, target: &FunctionDescriptor, _draft: Option<&str>, _problem: Option<&str>) -> Option<String> {
        self.record("author", target);
        lock(&self.authored).pop_front().flatten()
    }

    fn notify(&self, message: &str) {
        lock(&self.notices).push(message.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_read_block_stops_at_empty_line() {
        let mut input = Cursor::new("def f(x):\r\n    return x\n\nignored\n");
        assert_eq!(read_block(&mut input).as_deref(), Some("def f(x):\n    return x\n"));
        let mut empty = Cursor::new("\n");
        assert_eq!(read_block(&mut empty), None);
    }

    #[test]
    fn test_ask_yes_no_defaults() {
        assert!(ask_yes_no(&mut Cursor::new("\n"), "", true));
        assert!(!ask_yes_no(&mut Cursor::new("n\n"), "", true));
        assert!(ask_yes_no(&mut Cursor::new("YES\n"), "", false));
        assert!(!ask_yes_no(&mut Cursor::new(""), "", true));
    }

    #[test]
    fn test_side_by_side_numbers_both_columns() {
        let original = vec!["def f(x):\n".to_string(), "    raise NotImplementedError\n".to_string()];
        let view = side_by_side(&original, "def f(x):\n    y = x\n    return y\n");
        let rows: Vec<&str> = view.lines().collect();
        assert_eq!(rows.len(), 5);
        assert!(rows[2].contains("  1 def f(x):"));
        assert!(rows[3].contains("raise NotImplementedError") && rows[3].contains("  2     y = x"));
        assert!(rows[4].trim_start().starts_with('|'));
        assert!(rows[4].ends_with("  3     return y"));
    }
}
