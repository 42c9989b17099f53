//! Opaque key/value payload handed to commands.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::{DomainError, DomainResult};

/// Key/value payload carried by a request and passed to its command.
///
/// The engine never interprets the contents. A command replaces it only when
/// it reschedules itself as a new step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandContext(Map<String, JsonValue>);

impl CommandContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Option<JsonValue> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(JsonValue::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(JsonValue::as_i64)
    }

    /// Deserialize a single entry into a typed value.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> DomainResult<Option<T>> {
        match self.0.get(key) {
            None => Ok(None),
            Some(v) => serde_json::from_value(v.clone())
                .map(Some)
                .map_err(|e| DomainError::validation(format!("context key '{key}': {e}"))),
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &JsonValue)> {
        self.0.iter()
    }

    pub fn into_value(self) -> JsonValue {
        JsonValue::Object(self.0)
    }

    /// Build a context from a JSON value; only objects are accepted.
    pub fn from_value(value: JsonValue) -> DomainResult<Self> {
        match value {
            JsonValue::Object(map) => Ok(Self(map)),
            JsonValue::Null => Ok(Self::default()),
            other => Err(DomainError::validation(format!(
                "command context must be a JSON object, got {other}"
            ))),
        }
    }
}

impl From<Map<String, JsonValue>> for CommandContext {
    fn from(value: Map<String, JsonValue>) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_and_typed_reads() {
        let ctx = CommandContext::new()
            .with("recipient", "ops@example.com")
            .with("attempts", 3);

        assert_eq!(ctx.get_str("recipient"), Some("ops@example.com"));
        assert_eq!(ctx.get_i64("attempts"), Some(3));
        assert_eq!(ctx.get_as::<u32>("attempts").unwrap(), Some(3));
        assert_eq!(ctx.len(), 2);
    }

    #[test]
    fn from_value_rejects_non_objects() {
        assert!(CommandContext::from_value(serde_json::json!([1, 2])).is_err());
        assert!(CommandContext::from_value(JsonValue::Null).unwrap().is_empty());

        let ctx = CommandContext::from_value(serde_json::json!({"k": "v"})).unwrap();
        assert_eq!(ctx.get_str("k"), Some("v"));
    }

    #[test]
    fn typed_read_reports_key_on_mismatch() {
        let ctx = CommandContext::new().with("n", "not a number");
        let err = ctx.get_as::<u64>("n").unwrap_err();
        assert!(matches!(err, DomainError::Validation(msg) if msg.contains("'n'")));
    }
}
