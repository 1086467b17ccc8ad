use serde::Deserialize;

use crate::ClassifierConfigError;

/// Knobs for [`LineClassifier`](crate::LineClassifier).
#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClassifierConfig {
    /// Separator between a service tag and the payload, split once.
    /// An empty delimiter disables prefix splitting.
    pub service_delimiter: String,
    /// Event-like marker keys; the first one present becomes `message`.
    pub message_keys: Vec<String>,
    /// Level-like marker keys; the first one present becomes `log_level`.
    pub level_keys: Vec<String>,
    /// Byte budget for the serialized `function_kwargs` field.
    pub function_kwargs_max_bytes: usize,
}

impl ClassifierConfig {
    pub const DEFAULT_SERVICE_DELIMITER: &'static str = " | ";
    pub const DEFAULT_FUNCTION_KWARGS_MAX_BYTES: usize = 2048;
    /// Smallest budget that still fits the truncation sentinel.
    pub const MIN_FUNCTION_KWARGS_MAX_BYTES: usize = 128;

    /// Rejects the first invalid setting.
    pub fn validate(&self) -> Result<(), ClassifierConfigError> {
        if self.message_keys.iter().all(|key| key.trim().is_empty()) {
            return Err(ClassifierConfigError::NoMessageKeys);
        }
        if self.level_keys.iter().all(|key| key.trim().is_empty()) {
            return Err(ClassifierConfigError::NoLevelKeys);
        }
        if self.function_kwargs_max_bytes < Self::MIN_FUNCTION_KWARGS_MAX_BYTES {
            return Err(ClassifierConfigError::KwargsBudgetTooSmall {
                min: Self::MIN_FUNCTION_KWARGS_MAX_BYTES,
                got: self.function_kwargs_max_bytes,
            });
        }
        Ok(())
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            service_delimiter: Self::DEFAULT_SERVICE_DELIMITER.to_string(),
            message_keys: vec!["event".to_string()],
            level_keys: vec!["level".to_string()],
            function_kwargs_max_bytes: Self::DEFAULT_FUNCTION_KWARGS_MAX_BYTES,
        }
    }
}
