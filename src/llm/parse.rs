//! Recovery of a JSON document from free-form model output.

use serde_json::{json, Value};

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

/// Replace every line break, together with the whitespace that follows it,
/// by a single space.
///
/// Lossy for multi-line string values, which the analyzer prompt forbids.
fn collapse_line_breaks(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\n' {
            out.push(c);
            continue;
        }
        if out.ends_with('\r') {
            out.pop();
        }
        out.push(' ');
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
    }
    out
}

/// Turn raw model text into a document: the parsed object, or an error
/// document carrying the raw text.
///
/// Takes the greedy span from the first `{` to the last `}`, collapses line
/// breaks inside it and parses the result.
pub fn repair_proposal_json(raw: &str) -> Value {
    let Some(fragment) = extract_json_fragment(raw, '{', '}') else {
        return json!({
            "error": "Could not parse JSON response",
            "raw_response": raw,
        });
    };

    match serde_json::from_str::<Value>(&collapse_line_breaks(fragment)) {
        Ok(doc) => doc,
        Err(e) => json!({
            "error": format!("JSON parsing failed: {}", e),
            "raw_response": raw,
            "attempted_cleanup": true,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIFIED: &str = r#"{"feedback_analysis":"Make the header say Hello","files_to_examine":["index.html"],"proposed_changes":[{"file_path":"index.html","change_type":"modify","line_number":3,"current_code":"<h1>Hi</h1>","new_code":"<h1>Hello</h1>","reason":"greeting","impact":"header"}],"additional_recommendations":""}"#;

    #[test]
    fn test_minified_json_is_unchanged() {
        let expected: Value = serde_json::from_str(MINIFIED).unwrap();
        assert_eq!(repair_proposal_json(MINIFIED), expected);
        assert_eq!(
            repair_proposal_json(&repair_proposal_json(MINIFIED).to_string()),
            expected
        );
    }

    #[test]
    fn test_surrounding_prose_and_fences_are_ignored() {
        let raw = format!("Here is the plan:\n```json\n{}\n```\nLet me know!", MINIFIED);
        assert_eq!(
            repair_proposal_json(&raw)["proposed_changes"][0]["new_code"],
            json!("<h1>Hello</h1>")
        );
    }

    #[test]
    fn test_pretty_printed_json_is_accepted() {
        let raw = "{\n  \"feedback_analysis\": \"x\",\r\n  \"proposed_changes\": []\n}";
        let doc = repair_proposal_json(raw);
        assert_eq!(doc["feedback_analysis"], json!("x"));
        assert!(doc.get("error").is_none());
    }

    #[test]
    fn test_line_break_inside_string_value_is_collapsed() {
        let raw = "{\"new_code\": \"<p>one\n      two</p>\"}";
        assert_eq!(repair_proposal_json(raw)["new_code"], json!("<p>one two</p>"));
    }

    #[test]
    fn test_no_braces_is_could_not_parse() {
        let doc = repair_proposal_json("I could not find anything to change.");
        assert_eq!(doc["error"], json!("Could not parse JSON response"));
        assert_eq!(
            doc["raw_response"],
            json!("I could not find anything to change.")
        );
        assert!(doc.get("attempted_cleanup").is_none());
    }

    #[test]
    fn test_reversed_braces_is_could_not_parse() {
        let doc = repair_proposal_json("} nothing {");
        assert_eq!(doc["error"], json!("Could not parse JSON response"));
    }

    #[test]
    fn test_invalid_json_reports_parser_error() {
        let raw = "{\"feedback_analysis\": \"x\", \"proposed_changes\": [,]}";
        let doc = repair_proposal_json(raw);
        assert!(doc["error"]
            .as_str()
            .unwrap()
            .starts_with("JSON parsing failed: "));
        assert_eq!(doc["raw_response"], json!(raw));
        assert_eq!(doc["attempted_cleanup"], json!(true));
    }

    #[test]
    fn test_collapse_line_breaks() {
        assert_eq!(collapse_line_breaks("a\n   b\r\n\tc"), "a b c");
        assert_eq!(collapse_line_breaks("a\n\n\nb"), "a b");
        assert_eq!(collapse_line_breaks("no breaks"), "no breaks");
    }
}
