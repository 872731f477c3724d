//! Strategies for pulling an identifier out of delegate stdout

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::config::OutputFormat;
use crate::error::{QnaError, Result};

// Opaque ids in any script; no whitespace, control characters, path separators
// or leading dot.
static ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[^\s\p{Cc}/\\.][^\s\p{Cc}/\\]*$").expect("id regex should compile")
});

/// True for strings that are safe to use as a record file name stem
pub fn is_identifier(candidate: &str) -> bool {
    ID_RE.is_match(candidate) && !candidate.contains("..")
}

/// Extracts the identifier a delegate verb reports on stdout
pub trait OutputParser: Send + Sync {
    fn extract_id(&self, verb: &str, output: &str) -> Result<String>;
}

fn last_non_empty_line(output: &str) -> Option<&str> {
    output.lines().map(str::trim).rev().find(|l| !l.is_empty())
}

/// The delegate prints diagnostics and then the id alone on its final line
#[derive(Debug, Clone, Copy, Default)]
pub struct TrailingLineParser;

impl OutputParser for TrailingLineParser {
    fn extract_id(&self, verb: &str, output: &str) -> Result<String> {
        let line = last_non_empty_line(output).ok_or_else(|| QnaError::UnexpectedOutput {
            verb: verb.to_string(),
            message: "delegate produced no output".into(),
        })?;
        if !is_identifier(line) {
            return Err(QnaError::UnexpectedOutput {
                verb: verb.to_string(),
                message: format!("last output line is not an identifier: {:?}", line),
            });
        }
        Ok(line.to_string())
    }
}

/// The delegate's final line is a JSON object carrying `id` or `question_id`
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLineParser;

impl OutputParser for JsonLineParser {
    fn extract_id(&self, verb: &str, output: &str) -> Result<String> {
        let unexpected = |message: String| QnaError::UnexpectedOutput {
            verb: verb.to_string(),
            message,
        };
        let line = last_non_empty_line(output)
            .ok_or_else(|| unexpected("delegate produced no output".into()))?;
        let value: Value = serde_json::from_str(line)
            .map_err(|e| unexpected(format!("last output line is not JSON: {}", e)))?;
        value
            .get("id")
            .or_else(|| value.get("question_id"))
            .and_then(Value::as_str)
            .filter(|id| is_identifier(id))
            .map(str::to_string)
            .ok_or_else(|| unexpected("JSON line has no identifier field".into()))
    }
}

pub fn parser_for(format: OutputFormat) -> Box<dyn OutputParser> {
    match format {
        OutputFormat::TrailingLine => Box::new(TrailingLineParser),
        OutputFormat::JsonLine => Box::new(JsonLineParser),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_line_takes_last_non_empty_line() {
        let id = TrailingLineParser
            .extract_id("create_question", "creating...\nq_001\n\n")
            .unwrap();
        assert_eq!(id, "q_001");
    }

    #[test]
    fn test_trailing_line_rejects_empty_output() {
        let err = TrailingLineParser
            .extract_id("remove_last_answer", " \n\n")
            .unwrap_err();
        assert!(matches!(err, QnaError::UnexpectedOutput { .. }));
    }

    #[test]
    fn test_trailing_line_rejects_sentence() {
        let err = TrailingLineParser
            .extract_id("create_question", "done\nno answers to remove")
            .unwrap_err();
        assert!(err.to_string().contains("not an identifier"));
    }

    #[test]
    fn test_json_line_reads_id_fields() {
        assert_eq!(
            JsonLineParser
                .extract_id("create_question", "log\n{\"id\":\"q_7\"}\n")
                .unwrap(),
            "q_7"
        );
        assert_eq!(
            JsonLineParser
                .extract_id("remove_last_answer", "{\"question_id\":\"q_2\"}")
                .unwrap(),
            "q_2"
        );
        assert!(JsonLineParser.extract_id("x", "q_2").is_err());
    }

    #[test]
    fn test_identifier_shape() {
        assert!(is_identifier("q_001"));
        assert!(is_identifier("2024-01-01T10:00"));
        assert!(!is_identifier("../state"));
        assert!(!is_identifier("a/b"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("a..b"));
        assert!(!is_identifier("a\\b"));
        assert!(!is_identifier(".hidden"));
        assert!(!is_identifier("two words"));
        assert!(!is_identifier("q\u{7}1"));
    }

    #[test]
    fn test_non_ascii_ids_are_accepted() {
        assert!(is_identifier("вопрос_1"));
        assert_eq!(
            TrailingLineParser
                .extract_id("create_question", "создаю...\nвопрос_1\n")
                .unwrap(),
            "вопрос_1"
        );
    }
}
