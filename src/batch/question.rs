//! Locating the question text inside a source record

use serde_json::{Map, Value};

/// Column names checked first, in priority order
pub const QUESTION_FIELDS: &[&str] = &[
    "REDACTEDQUESTION",
    "question",
    "Question",
    "QUESTION",
    "problemDetails",
    "Problem Details",
    "query",
    "Query",
];

/// Message recorded for rows without usable text
pub const NO_QUESTION_MESSAGE: &str = "No question text found in row";

/// Extract the question from a row
///
/// Known columns are tried in [`QUESTION_FIELDS`] order; otherwise the first
/// non-empty string value in the record's own column order is used. Returns
/// `None` when the row has no usable text.
pub fn extract_question(record: &Map<String, Value>) -> Option<&str> {
    QUESTION_FIELDS
        .iter()
        .filter_map(|field| record.get(*field))
        .find_map(non_empty_text)
        .or_else(|| record.values().find_map(non_empty_text))
}

fn non_empty_text(value: &Value) -> Option<&str> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim()),
        _ => None,
    }
}
