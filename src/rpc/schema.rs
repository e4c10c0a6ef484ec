//! Compiled JSON Schemas for procedure and handler payloads

use crate::error::{Error, Result};
use jsonschema::JSONSchema;
use schemars::JsonSchema;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// A compiled JSON Schema, cheap to clone
#[derive(Clone)]
pub struct Schema {
    source: Arc<Value>,
    compiled: Arc<JSONSchema>,
}

impl Schema {
    /// Compile a hand-written schema document
    pub fn new(source: Value) -> Result<Self> {
        let compiled = JSONSchema::compile(&source)
            .map_err(|e| Error::Schema(format!("Invalid schema: {}", e)))?;
        Ok(Self {
            source: Arc::new(source),
            compiled: Arc::new(compiled),
        })
    }

    /// Derive the schema of a Rust type
    pub fn of<T: JsonSchema>() -> Result<Self> {
        let root = schemars::schema_for!(T);
        Self::new(serde_json::to_value(root)?)
    }

    /// The schema document this was compiled from
    pub fn source(&self) -> &Value {
        &self.source
    }

    /// Check `instance` against the schema
    pub fn validate(&self, instance: &Value) -> std::result::Result<(), ValidationFailure> {
        match self.compiled.validate(instance) {
            Ok(()) => Ok(()),
            Err(errors) => Err(ValidationFailure {
                errors: errors
                    .map(|error| SchemaViolation {
                        path: error.instance_path.to_string(),
                        message: error.to_string(),
                    })
                    .collect(),
            }),
        }
    }
}

impl std::fmt::Debug for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Schema").field("source", &self.source).finish()
    }
}

/// One failed schema assertion
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaViolation {
    /// JSON pointer to the offending value
    pub path: String,
    pub message: String,
}

/// All assertions an instance failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationFailure {
    pub errors: Vec<SchemaViolation>,
}

impl ValidationFailure {
    /// One-line description
    pub fn summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| {
                if e.path.is_empty() {
                    e.message.clone()
                } else {
                    format!("{}: {}", e.path, e.message)
                }
            })
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Raw form attached to error responses
    pub fn to_value(&self) -> Value {
        serde_json::to_value(&self.errors).unwrap_or(Value::Null)
    }
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.summary())
    }
}
