//! The capability model: named, schema-described invocable operations.

use crate::types::{AdapterId, InvokeError, NAMESPACE_SEPARATOR};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// An invocable unit exposed by an adapter.
///
/// Capabilities are immutable once published. Re-discovery produces a new
/// value that replaces the old one by qualified name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Capability {
    /// `{namespace}:{local_name}`
    pub qualified_name: String,

    /// The adapter that discovered this capability
    pub origin_adapter_id: AdapterId,

    /// JSON schema of the payload, if the adapter declares one
    pub input_schema: Option<Value>,

    /// JSON schema of the output, if the adapter declares one
    pub output_schema: Option<Value>,

    /// Free-form metadata (description, tags, cost hints)
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl Capability {
    /// Create a capability in `namespace` owned by `adapter_id`.
    pub fn new(namespace: &str, local_name: &str, adapter_id: impl Into<AdapterId>) -> Self {
        Self {
            qualified_name: qualify(namespace, local_name),
            origin_adapter_id: adapter_id.into(),
            input_schema: None,
            output_schema: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = Some(schema);
        self
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Namespace part of the qualified name.
    pub fn namespace(&self) -> &str {
        split_qualified(&self.qualified_name)
            .map(|(ns, _)| ns)
            .unwrap_or("")
    }

    /// Local part of the qualified name.
    pub fn local_name(&self) -> &str {
        split_qualified(&self.qualified_name)
            .map(|(_, local)| local)
            .unwrap_or(&self.qualified_name)
    }

    /// Check that a payload matches the declared input shape.
    ///
    /// Only presence is checked: a declared schema requires a non-null
    /// payload, and an object schema requires every `required` key.
    pub fn check_input(&self, payload: &Value) -> Result<(), InvokeError> {
        let Some(schema) = &self.input_schema else {
            return Ok(());
        };

        if payload.is_null() {
            return Err(InvokeError::InvalidPayload(format!(
                "{} declares an input schema but the payload is empty",
                self.qualified_name
            )));
        }

        if schema.get("type").and_then(Value::as_str) == Some("object") {
            let Some(object) = payload.as_object() else {
                return Err(InvokeError::InvalidPayload(format!(
                    "{} expects an object payload",
                    self.qualified_name
                )));
            };

            if let Some(required) = schema.get("required").and_then(Value::as_array) {
                for key in required.iter().filter_map(Value::as_str) {
                    if !object.contains_key(key) {
                        return Err(InvokeError::InvalidPayload(format!(
                            "{} is missing required field '{}'",
                            self.qualified_name, key
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// Check that an output is present when an output schema is declared.
    pub fn check_output(&self, output: &Value) -> Result<(), InvokeError> {
        if self.output_schema.is_some() && output.is_null() {
            return Err(InvokeError::RemoteError(format!(
                "{} returned no output despite declaring an output schema",
                self.qualified_name
            )));
        }
        Ok(())
    }
}

/// Build a qualified name.
pub fn qualify(namespace: &str, local_name: &str) -> String {
    format!("{}{}{}", namespace, NAMESPACE_SEPARATOR, local_name)
}

/// Split a qualified name into namespace and local name.
pub fn split_qualified(name: &str) -> Option<(&str, &str)> {
    name.split_once(NAMESPACE_SEPARATOR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn qualified_name_parts() {
        let cap = Capability::new("web", "search", "adapter-1");
        assert_eq!(cap.qualified_name, "web:search");
        assert_eq!(cap.namespace(), "web");
        assert_eq!(cap.local_name(), "search");
    }

    #[test]
    fn no_schema_accepts_anything() {
        let cap = Capability::new("web", "search", "a");
        assert!(cap.check_input(&Value::Null).is_ok());
        assert!(cap.check_output(&Value::Null).is_ok());
    }

    #[test]
    fn object_schema_requires_fields() {
        let cap = Capability::new("web", "search", "a").with_input_schema(json!({
            "type": "object",
            "properties": { "query": { "type": "string" } },
            "required": ["query"]
        }));

        assert!(cap.check_input(&json!({"query": "rust"})).is_ok());
        assert!(matches!(
            cap.check_input(&json!({"q": "rust"})),
            Err(InvokeError::InvalidPayload(_))
        ));
        assert!(matches!(
            cap.check_input(&json!("rust")),
            Err(InvokeError::InvalidPayload(_))
        ));
        assert!(matches!(
            cap.check_input(&Value::Null),
            Err(InvokeError::InvalidPayload(_))
        ));
    }

    #[test]
    fn declared_output_must_be_present() {
        let cap =
            Capability::new("web", "search", "a").with_output_schema(json!({"type": "array"}));
        assert!(cap.check_output(&json!([])).is_ok());
        assert!(cap.check_output(&Value::Null).is_err());
    }
}
