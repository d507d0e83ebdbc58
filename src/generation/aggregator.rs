//! Per-line decode and merge.
//!
//! Pure functions: [`decode_line`] turns raw worker bytes into text, [`aggregate`] folds one
//! decoded line into the running [`Aggregate`]. Neither ever aborts a stream.

use std::borrow::Cow;

use serde_json::Value;

use super::Aggregate;
use crate::error::GenerationError;

/// Strip the line terminator and decode as UTF-8, falling back to Latin-1.
///
/// Latin-1 maps every byte (NUL included) to a code point, so every line decodes;
/// [`GenerationError::Decode`] is reserved for a stricter fallback.
pub fn decode_line(raw: &[u8]) -> Result<Cow<'_, str>, GenerationError> {
    let raw = trim_terminator(raw);

    match std::str::from_utf8(raw) {
        Ok(text) => Ok(Cow::Borrowed(text)),
        Err(utf8_err) => {
            tracing::debug!(error = %utf8_err, "line is not UTF-8, decoding as Latin-1");
            Ok(Cow::Owned(raw.iter().map(|&b| char::from(b)).collect()))
        }
    }
}

fn trim_terminator(raw: &[u8]) -> &[u8] {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    raw.strip_suffix(b"\r").unwrap_or(raw)
}

/// Fold one decoded line into the accumulator.
///
/// Free text appends `line + "\n"`. Structured mode parses the line as a single JSON object
/// and overwrites each of its top-level keys in the accumulator; a line that is not a JSON
/// object yields exactly one [`GenerationError::Parse`] and leaves the accumulator as it was.
pub fn aggregate(line: &str, acc: Aggregate) -> (Aggregate, Vec<GenerationError>) {
    match acc {
        Aggregate::Text(mut text) => {
            text.push_str(line);
            text.push('\n');
            (Aggregate::Text(text), Vec::new())
        }
        Aggregate::Facets(mut facets) => {
            if line.trim().is_empty() {
                return (Aggregate::Facets(facets), Vec::new());
            }
            match serde_json::from_str::<Value>(line) {
                Ok(Value::Object(object)) => {
                    for (key, value) in object {
                        facets.insert(key, value);
                    }
                    (Aggregate::Facets(facets), Vec::new())
                }
                Ok(other) => {
                    let err = GenerationError::Parse {
                        message: format!("expected a JSON object, got {}", json_kind(&other)),
                        line: line.to_string(),
                    };
                    (Aggregate::Facets(facets), vec![err])
                }
                Err(e) => {
                    let err = GenerationError::Parse {
                        message: e.to_string(),
                        line: line.to_string(),
                    };
                    (Aggregate::Facets(facets), vec![err])
                }
            }
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::Mode;
    use serde_json::json;

    fn fold(lines: &[&str], mode: Mode) -> (Aggregate, Vec<GenerationError>) {
        let mut acc = Aggregate::empty(mode);
        let mut errors = Vec::new();
        for line in lines {
            let (next, line_errors) = aggregate(line, acc);
            acc = next;
            errors.extend(line_errors);
        }
        (acc, errors)
    }

    #[test]
    fn free_text_appends_with_newlines() {
        let (acc, errors) = fold(&["Hello", "", "there"], Mode::FreeText);
        assert_eq!(acc, Aggregate::Text("Hello\n\nthere\n".into()));
        assert!(errors.is_empty());
    }

    #[test]
    fn free_text_never_parses() {
        let (acc, errors) = fold(&["{bad json"], Mode::FreeText);
        assert_eq!(acc.as_text(), Some("{bad json\n"));
        assert!(errors.is_empty());
    }

    #[test]
    fn structured_last_write_wins_per_key() {
        let (acc, errors) = fold(
            &[
                r#"{"CurrentState": {"newValue": "a"}, "KnowledgeGap": "x"}"#,
                r#"{"CurrentState": {"newValue": "b"}}"#,
            ],
            Mode::Structured,
        );
        assert!(errors.is_empty());
        let facets = acc.into_facets().unwrap();
        assert_eq!(facets["CurrentState"], json!({"newValue": "b"}));
        assert_eq!(facets["KnowledgeGap"], json!("x"));
    }

    #[test]
    fn structured_merge_is_shallow() {
        let (acc, _) = fold(
            &[
                r#"{"CurrentState": {"newValue": "a", "note": "keep?"}}"#,
                r#"{"CurrentState": {"newValue": "b"}}"#,
            ],
            Mode::Structured,
        );
        let facets = acc.into_facets().unwrap();
        assert_eq!(facets["CurrentState"], json!({"newValue": "b"}));
    }

    #[test]
    fn malformed_lines_each_yield_one_error() {
        let lines = [
            r#"{"A": 1}"#,
            "{bad json",
            r#"{"B": 2}"#,
            "not json at all",
            r#"{"A": 3}"#,
        ];
        let (acc, errors) = fold(&lines, Mode::Structured);
        assert_eq!(errors.len(), 2);
        let facets = acc.into_facets().unwrap();
        assert_eq!(facets.len(), 2);
        assert_eq!(facets["A"], json!(3));
        assert_eq!(facets["B"], json!(2));
        match &errors[0] {
            GenerationError::Parse { line, .. } => assert_eq!(line, "{bad json"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn non_object_json_is_a_parse_error() {
        let (acc, errors) = fold(&["[1, 2]", "\"text\""], Mode::Structured);
        assert!(acc.is_empty());
        assert_eq!(errors.len(), 2);
        assert!(errors[0].to_string().contains("an array"));
    }

    #[test]
    fn blank_structured_lines_are_ignored() {
        let (acc, errors) = fold(&["", "   ", r#"{"A": 1}"#], Mode::Structured);
        assert!(errors.is_empty());
        assert_eq!(acc.into_facets().unwrap().len(), 1);
    }

    #[test]
    fn decode_prefers_utf8() {
        let line = decode_line("caf\u{e9}\n".as_bytes()).unwrap();
        assert!(matches!(line, Cow::Borrowed(_)));
        assert_eq!(line, "caf\u{e9}");
    }

    #[test]
    fn decode_falls_back_to_latin1() {
        let line = decode_line(b"caf\xe9 cr\xe8me\r\n").unwrap();
        assert_eq!(line, "caf\u{e9} cr\u{e8}me");
    }

    #[test]
    fn decode_latin1_keeps_nul_bytes() {
        assert_eq!(decode_line(b"caf\xe9\x00ok\n").unwrap(), "caf\u{e9}\u{0}ok");
        assert_eq!(decode_line(b"\xff\x00\xfe\n").unwrap(), "\u{ff}\u{0}\u{fe}");
    }

    #[test]
    fn decode_keeps_interior_whitespace() {
        assert_eq!(decode_line(b"  indented  \n").unwrap(), "  indented  ");
    }
}
