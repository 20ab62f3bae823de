use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StoreError;

/// Key every metadata object read back from the store is guaranteed to carry.
pub const EXPERIENCE_KEY: &str = "experience";

/// Validated record metadata: a non-empty JSON object that survives an
/// encode/decode cycle unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Metadata(Map<String, Value>);

impl Metadata {
    pub fn new(value: Value) -> Result<Self, StoreError> {
        match value {
            Value::Object(map) => Self::from_map(map),
            other => Err(StoreError::validation(format!(
                "metadata must be a JSON object, got {}",
                json_type_name(&other)
            ))),
        }
    }

    pub fn from_map(map: Map<String, Value>) -> Result<Self, StoreError> {
        if map.is_empty() {
            return Err(StoreError::validation("metadata must not be empty"));
        }
        let metadata = Self(map);
        let encoded = metadata.to_json()?;
        let decoded: Map<String, Value> = serde_json::from_str(&encoded)
            .map_err(|e| StoreError::validation(format!("metadata is not valid JSON: {}", e)))?;
        if decoded != metadata.0 {
            return Err(StoreError::validation(
                "metadata does not survive a JSON round-trip",
            ));
        }
        Ok(metadata)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, StoreError> {
        let value: Value = serde_json::from_str(raw)?;
        Self::new(value)
    }

    pub fn to_json(&self) -> Result<String, StoreError> {
        serde_json::to_string(&self.0).map_err(StoreError::from)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    /// The object as readers see it: if no `experience` key was supplied, a
    /// copy of the whole object is nested under it.
    pub fn with_experience(self) -> Map<String, Value> {
        let mut map = self.0;
        if !map.contains_key(EXPERIENCE_KEY) {
            let copy = Value::Object(map.clone());
            map.insert(EXPERIENCE_KEY.to_string(), copy);
        }
        map
    }
}

impl TryFrom<Value> for Metadata {
    type Error = StoreError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Metadata> for Value {
    fn from(m: Metadata) -> Self {
        Value::Object(m.0)
    }
}

fn json_type_name(v: &Value) -> &'static str {
    match v {
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
    use serde_json::json;

    #[test]
    fn test_rejects_non_objects_and_empty() {
        assert!(matches!(
            Metadata::new(json!([1, 2])),
            Err(StoreError::Validation(_))
        ));
        assert!(matches!(
            Metadata::new(json!("text")),
            Err(StoreError::Validation(_))
        ));
        assert!(matches!(
            Metadata::new(json!({})),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn test_experience_is_nested_when_absent() {
        let m = Metadata::new(json!({"tag": "a", "score": 3})).expect("valid");
        let view = m.with_experience();
        assert_eq!(view["tag"], "a");
        assert_eq!(view[EXPERIENCE_KEY], json!({"tag": "a", "score": 3}));
    }

    #[test]
    fn test_existing_experience_is_kept() {
        let m = Metadata::new(json!({"experience": {"action": "click"}, "tag": "x"}))
            .expect("valid");
        let view = m.with_experience();
        assert_eq!(view[EXPERIENCE_KEY], json!({"action": "click"}));
    }

    #[test]
    fn test_json_text_round_trip() {
        let m = Metadata::new(json!({"nested": {"list": [1, 2.5, "x", null]}})).expect("valid");
        let text = m.to_json().expect("encode");
        assert_eq!(Metadata::from_json_str(&text).expect("decode"), m);
    }
}
