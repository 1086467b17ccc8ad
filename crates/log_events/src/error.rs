use thiserror::Error;

/// Why a line was stored verbatim instead of as a structured event.
///
/// These are recovered locally: the line still produces an
/// [`UnstructuredLogRecord`](crate::UnstructuredLogRecord).
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum MalformedLine {
    #[error("line is not valid JSON: {summary}")]
    InvalidJson { summary: String },
    #[error("line is JSON but not an object (found {found})")]
    NotAnObject { found: &'static str },
    #[error("JSON object lacks event/level markers")]
    MissingMarkers,
}

impl MalformedLine {
    /// Short stable label for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            MalformedLine::InvalidJson { .. } => "invalid_json",
            MalformedLine::NotAnObject { .. } => "not_an_object",
            MalformedLine::MissingMarkers => "missing_markers",
        }
    }
}

/// A sub-field exceeded its serialized size budget and was replaced by a sentinel.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
#[error("`{field}` serialized to {observed_bytes} bytes (max_bytes={max_bytes})")]
pub struct FieldTooLarge {
    pub field: &'static str,
    pub observed_bytes: usize,
    pub max_bytes: usize,
}

#[derive(Debug, Error, Clone, Eq, PartialEq)]
#[error("`{value}` is not an RFC 3339 or ISO-8601 timestamp")]
pub struct TimestampParseError {
    pub value: String,
}

/// A `[classifier]` setting that cannot be used.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ClassifierConfigError {
    #[error("classifier.message_keys must name at least one key")]
    NoMessageKeys,
    #[error("classifier.level_keys must name at least one key")]
    NoLevelKeys,
    #[error("classifier.function_kwargs_max_bytes must be at least {min} (got {got})")]
    KwargsBudgetTooSmall { min: usize, got: usize },
}
