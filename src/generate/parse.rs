use super::ImplementationSuggestion;
use crate::error::{PatchError, Result};
use crate::util::{strip_code_fence, truncate};
use serde::Deserialize;

#[derive(Deserialize)]
struct SuggestionJson {
    implementation: String,
    #[serde(default)]
    explanation: String,
}

/// Strip markdown code fences from a response
fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let clean = if trimmed.starts_with("```json") {
        trimmed.strip_prefix("```json").unwrap_or(trimmed)
    } else if trimmed.starts_with("```") {
        trimmed.strip_prefix("```").unwrap_or(trimmed)
    } else {
        trimmed
    };
    let clean = clean.strip_suffix("```").unwrap_or(clean);
    clean.trim()
}

/// Extract a JSON fragment between matching delimiters
fn extract_json_fragment(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    if start <= end {
        Some(&text[start..=end])
    } else {
        None
    }
}

/// Try to fix common JSON issues from model responses
fn fix_json_issues(json: &str) -> String {
    let mut fixed = json.to_string();

    fixed = fixed.replace(",]", "]");
    fixed = fixed.replace(",}", "}");

    // Smart quotes around keys
    fixed = fixed.replace('\u{201C}', "\"");
    fixed = fixed.replace('\u{201D}', "\"");

    fixed
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}

/// Turn a generator response into a suggestion.
///
/// The implementation field is unwrapped from any code fence the model put
/// inside the JSON string. Anything unusable counts as the generator being
/// unavailable so the caller falls back to manual authoring.
pub fn parse_suggestion(response: &str) -> Result<ImplementationSuggestion> {
    let clean = strip_markdown_fences(response);
    let fragment = extract_json_fragment(clean, '{', '}').ok_or_else(|| {
        PatchError::GeneratorUnavailable(format!(
            "response contained no JSON object: {}",
            truncate(clean, 200)
        ))
    })?;

    let parsed: SuggestionJson = match serde_json::from_str(fragment) {
        Ok(v) => v,
        Err(first) => serde_json::from_str(&fix_json_issues(fragment)).map_err(|_| {
            PatchError::GeneratorUnavailable(format!(
                "response did not match the expected schema ({}): {}",
                first,
                truncate(fragment, 200)
            ))
        })?,
    };

    let implementation = strip_code_fence(&parsed.implementation);
    if implementation.trim().is_empty() {
        return Err(PatchError::GeneratorUnavailable(
            "response had an empty implementation".to_string(),
        ));
    }

    Ok(ImplementationSuggestion {
        implementation,
        explanation: parsed.explanation.trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_object() {
        let response = r#"{"implementation": "def add(a, b):\n    return a + b\n", "explanation": "Adds."}"#;
        let s = parse_suggestion(response).unwrap();
        assert_eq!(s.implementation, "def add(a, b):\n    return a + b\n");
        assert_eq!(s.explanation, "Adds.");
    }

    #[test]
    fn test_parse_fenced_response_with_prose() {
        let response = "```json\nSure! {\"implementation\": \"def f(x):\\n    return x\",}\n```";
        let s = parse_suggestion(response).unwrap();
        assert_eq!(s.implementation, "def f(x):\n    return x");
        assert_eq!(s.explanation, "");
    }

    #[test]
    fn test_parse_unwraps_code_fence_inside_field() {
        let response = r#"{"implementation": "```python\ndef g():\n    return 1\n```"}"#;
        let s = parse_suggestion(response).unwrap();
        assert_eq!(s.implementation, "def g():\n    return 1\n");
    }

    #[test]
    fn test_parse_rejects_unusable_responses() {
        for bad in ["no json here", r#"{"code": "def f(): pass"}"#, r#"{"implementation": "   "}"#] {
            assert!(matches!(
                parse_suggestion(bad),
                Err(PatchError::GeneratorUnavailable(_))
            ));
        }
    }
}
