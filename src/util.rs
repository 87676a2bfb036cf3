use regex::Regex;
use std::sync::OnceLock;

pub fn truncate(s: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }

    let char_count = s.chars().count();
    if char_count <= max {
        return s.to_string();
    }

    if max <= 3 {
        return s.chars().take(max).collect();
    }

    let truncated: String = s.chars().take(max - 3).collect();
    format!("{}...", truncated)
}

/// Leading whitespace of a line.
pub fn indentation_of(line: &str) -> &str {
    let trimmed = line.trim_start_matches([' ', '\t']);
    &line[..line.len() - trimmed.len()]
}

/// Remove the whitespace prefix common to every non-blank line.
pub fn dedent(text: &str) -> String {
    let prefix = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(indentation_of)
        .reduce(|common, next| {
            let shared = common
                .char_indices()
                .zip(next.chars())
                .take_while(|((_, a), b)| a == b)
                .last()
                .map(|((i, c), _)| i + c.len_utf8())
                .unwrap_or(0);
            &common[..shared]
        })
        .unwrap_or("");

    let mut out = String::with_capacity(text.len());
    for line in text.split_inclusive('\n') {
        if line.trim().is_empty() {
            out.push_str(if line.ends_with('\n') { "\n" } else { "" });
        } else {
            out.push_str(line.strip_prefix(prefix).unwrap_or(line));
        }
    }
    out
}

fn fence_pattern() -> Option<&'static Regex> {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    FENCE
        .get_or_init(|| Regex::new(r"(?s)```[A-Za-z0-9_+-]*[ \t]*\r?\n(.*?)\r?\n?[ \t]*```").ok())
        .as_ref()
}

/// Unwrap code held in a markdown fence; text without a fence is returned as is.
pub fn strip_code_fence(text: &str) -> String {
    match fence_pattern()
        .and_then(|re| re.captures(text))
        .and_then(|c| c.get(1))
    {
        Some(body) => {
            let mut code = body.as_str().to_string();
            code.push('\n');
            code
        }
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_unicode_safe() {
        let input = "ééééé";
        assert_eq!(truncate(input, 4), "é...");
    }

    #[test]
    fn test_truncate_small_max() {
        let input = "こんにちは";
        assert_eq!(truncate(input, 3), "こんに");
        assert_eq!(truncate(input, 0), "");
    }

    #[test]
    fn test_dedent_keeps_relative_nesting() {
        let text = "    def f(x):\n\n        return x\n";
        assert_eq!(dedent(text), "def f(x):\n\n    return x\n");
    }

    #[test]
    fn test_indentation_of() {
        assert_eq!(indentation_of("\t  x = 1"), "\t  ");
        assert_eq!(indentation_of("x"), "");
    }

    #[test]
    fn test_strip_code_fence() {
        let fenced = "Here you go:\n```python\ndef f():\n    return 1\n```\n";
        assert_eq!(strip_code_fence(fenced), "def f():\n    return 1\n");
        assert_eq!(strip_code_fence("def g(): pass\n"), "def g(): pass\n");
    }
}
