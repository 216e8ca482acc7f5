/// Strict JSON parsing of model output
///
/// The whole reply must be one JSON document, optionally wrapped in a
/// ```` ```json ```` fence. Anything else is a `Parse` error and goes to the
/// format-repair path.

use regex::Regex;
use serde::de::DeserializeOwned;
use std::sync::OnceLock;

use super::ExtractionError;

pub fn parse_json<T: DeserializeOwned>(text: &str) -> Result<T, ExtractionError> {
    let trimmed = text.trim();
    match serde_json::from_str(trimmed) {
        Ok(value) => Ok(value),
        Err(strict) => match unfence(trimmed) {
            Some(inner) => serde_json::from_str(inner).map_err(|e| parse_error(text, e)),
            None => Err(parse_error(text, strict)),
        },
    }
}

/// Body of a reply that is exactly one fenced block.
fn unfence(text: &str) -> Option<&str> {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    let fence = FENCE
        .get_or_init(|| Regex::new(r"(?s)\A```[A-Za-z]*[ \t]*\n(.*?)\n?```\z").ok())
        .as_ref()?;
    fence.captures(text).and_then(|c| c.get(1)).map(|m| m.as_str())
}

fn parse_error(text: &str, e: serde_json::Error) -> ExtractionError {
    ExtractionError::Parse {
        text: text.to_string(),
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::Digest;

    #[test]
    fn test_plain_json() {
        let digest: Digest = parse_json(r#" {"summary": "s", "topic": "t"} "#).unwrap();
        assert_eq!(digest.topic, "t");
    }

    #[test]
    fn test_fenced_json() {
        let digest: Digest = parse_json("```json\n{\"summary\": \"s\", \"topic\": \"t\"}\n```").unwrap();
        assert_eq!(digest.summary, "s");

        let bare_fence: Digest = parse_json("```\n{\"summary\": \"s\"}```").unwrap();
        assert_eq!(bare_fence.summary, "s");
    }

    #[test]
    fn test_prose_is_rejected() {
        let err = parse_json::<Digest>("Here is the JSON: {\"summary\": \"s\"}").unwrap_err();
        assert!(matches!(err, ExtractionError::Parse { .. }));

        let wrong_shape = parse_json::<Digest>("[1, 2]").unwrap_err();
        assert!(matches!(wrong_shape, ExtractionError::Parse { .. }));
    }
}
