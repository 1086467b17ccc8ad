use serde_json::{json, Map, Value};

use crate::{
    ClassifierConfig, FieldTooLarge, LogRecord, MalformedLine, StructuredLogRecord, Timestamp,
    UnstructuredLogRecord,
};

/// Raw keys that map onto fixed record fields and therefore never land in
/// `custom_fields`. The configured marker keys are known as well.
pub const KNOWN_FIELDS: &[&str] = &[
    "timestamp",
    "service",
    "log_level",
    "message",
    "correlation_id",
    "caller_module",
    "caller_function",
    "filename",
    "func_name",
    "lineno",
    "function_kwargs",
    "custom_fields",
];

const FUNCTION_KWARGS: &str = "function_kwargs";

/// Result of classifying one line: always exactly one record.
#[derive(Debug, Clone, PartialEq)]
pub struct Classified {
    pub record: LogRecord,
    /// Set when the line fell back to unstructured storage.
    pub malformed: Option<MalformedLine>,
    /// Set when `function_kwargs` was replaced by a truncation sentinel.
    pub oversized: Option<FieldTooLarge>,
}

/// Turns raw lines into [`LogRecord`]s.
///
/// Classification is total: every input, including the empty string, yields
/// one record, and nothing here panics or returns an error.
#[derive(Debug, Clone, Default)]
pub struct LineClassifier {
    config: ClassifierConfig,
}

impl LineClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Returns `true` for keys that map to fixed fields (including marker keys).
    pub fn is_known_field(&self, key: &str) -> bool {
        KNOWN_FIELDS.contains(&key)
            || self.config.message_keys.iter().any(|k| k == key)
            || self.config.level_keys.iter().any(|k| k == key)
    }

    pub fn classify(&self, line: &str, default_source: &str, ingested_at: Timestamp) -> Classified {
        let (service, remainder) = self.split_service(line, default_source);

        let value: Value = match serde_json::from_str(remainder) {
            Ok(value) => value,
            Err(err) => {
                return unstructured(
                    line,
                    default_source,
                    ingested_at,
                    MalformedLine::InvalidJson {
                        summary: err.to_string(),
                    },
                );
            }
        };

        let object = match value {
            Value::Object(object) => object,
            other => {
                return unstructured(
                    line,
                    default_source,
                    ingested_at,
                    MalformedLine::NotAnObject {
                        found: json_kind(&other),
                    },
                );
            }
        };

        let message_key = first_present(&object, &self.config.message_keys);
        let level_key = first_present(&object, &self.config.level_keys);
        let (Some(message_key), Some(level_key)) = (message_key, level_key) else {
            return unstructured(
                line,
                default_source,
                ingested_at,
                MalformedLine::MissingMarkers,
            );
        };

        let (record, oversized) =
            self.structured(service, object, &message_key, &level_key, ingested_at);
        Classified {
            record: LogRecord::Structured(record),
            malformed: None,
            oversized,
        }
    }

    fn split_service<'a>(&self, line: &'a str, default_source: &'a str) -> (&'a str, &'a str) {
        let delimiter = self.config.service_delimiter.as_str();
        if delimiter.is_empty() {
            return (default_source, line);
        }
        match line.split_once(delimiter) {
            Some((service, remainder)) => {
                let service = service.trim();
                if service.is_empty() {
                    (default_source, remainder)
                } else {
                    (service, remainder)
                }
            }
            None => (default_source, line),
        }
    }

    fn structured(
        &self,
        service: &str,
        mut object: Map<String, Value>,
        message_key: &str,
        level_key: &str,
        ingested_at: Timestamp,
    ) -> (StructuredLogRecord, Option<FieldTooLarge>) {
        let message = object.remove(message_key).map(render_text).unwrap_or_default();
        let log_level = object.remove(level_key).map(render_text).unwrap_or_default();
        let correlation_id = take_text(&mut object, "correlation_id").unwrap_or_default();
        let caller_module = take_text(&mut object, "caller_module");
        let caller_function = take_text(&mut object, "caller_function");
        let filename = take_text(&mut object, "filename");
        let func_name = take_text(&mut object, "func_name");
        let lineno = object.remove("lineno").and_then(|value| as_line_number(&value));

        let function_kwargs = object
            .remove(FUNCTION_KWARGS)
            .filter(|value| !value.is_null())
            .unwrap_or_else(|| Value::Object(Map::new()));
        let (function_kwargs, oversized) = cap_json(
            FUNCTION_KWARGS,
            function_kwargs,
            self.config.function_kwargs_max_bytes,
        );

        // Producer-supplied bag seeds the result; top-level keys override it.
        let mut custom_fields = match object.remove("custom_fields") {
            Some(Value::Object(nested)) => nested
                .into_iter()
                .filter(|(key, _)| !self.is_known_field(key))
                .collect(),
            _ => Map::new(),
        };
        for (key, value) in object {
            if !self.is_known_field(&key) {
                custom_fields.insert(key, value);
            }
        }

        let record = StructuredLogRecord {
            timestamp: ingested_at,
            service: service.to_string(),
            log_level,
            message,
            correlation_id,
            caller_module,
            caller_function,
            filename,
            func_name,
            lineno,
            function_kwargs,
            custom_fields,
        };
        (record, oversized)
    }
}

/// Keeps `value` if its serialized form fits in `max_bytes`; otherwise
/// substitutes the largest sentinel object that fits.
pub fn cap_json(
    field: &'static str,
    value: Value,
    max_bytes: usize,
) -> (Value, Option<FieldTooLarge>) {
    let observed_bytes = serialized_len(&value);
    if observed_bytes <= max_bytes {
        return (value, None);
    }

    let oversized = FieldTooLarge {
        field,
        observed_bytes,
        max_bytes,
    };
    let candidates = [
        json!({
            "truncated": true,
            "reason": format!("{field} exceeds size budget"),
            "max_bytes": max_bytes,
            "observed_bytes": observed_bytes,
        }),
        json!({ "truncated": true }),
    ];
    let sentinel = candidates
        .into_iter()
        .find(|candidate| serialized_len(candidate) <= max_bytes)
        .unwrap_or_else(|| Value::Object(Map::new()));
    (sentinel, Some(oversized))
}

fn unstructured(
    line: &str,
    default_source: &str,
    ingested_at: Timestamp,
    reason: MalformedLine,
) -> Classified {
    Classified {
        record: LogRecord::Unstructured(UnstructuredLogRecord {
            timestamp: ingested_at,
            source: default_source.to_string(),
            log: line.to_string(),
        }),
        malformed: Some(reason),
        oversized: None,
    }
}

fn first_present(object: &Map<String, Value>, keys: &[String]) -> Option<String> {
    keys.iter().find(|key| object.contains_key(key.as_str())).cloned()
}

fn serialized_len(value: &Value) -> usize {
    serde_json::to_vec(value).map_or(usize::MAX, |bytes| bytes.len())
}

fn render_text(value: Value) -> String {
    match value {
        Value::String(text) => text,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn take_text(object: &mut Map<String, Value>, key: &str) -> Option<String> {
    match object.remove(key)? {
        Value::Null => None,
        value => Some(render_text(value)),
    }
}

/// Integral numbers and integer strings only. Anything else (`"abc"`, `3.5`)
/// is dropped: `lineno` is a known field, so it never moves to `custom_fields`.
fn as_line_number(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
