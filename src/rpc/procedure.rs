//! Named procedures served over an RPC transport

use super::schema::Schema;
use crate::error::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// Boxed procedure body
pub type ProcedureFuture = BoxFuture<'static, std::result::Result<Value, ProcedureError>>;

type ExecuteFn = Arc<dyn Fn(Value) -> ProcedureFuture + Send + Sync>;

/// Optional input and output schemas
#[derive(Debug, Clone, Default)]
pub struct ProcedureSchema {
    pub input: Option<Schema>,
    pub output: Option<Schema>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcedureErrorKind {
    InvalidInput,
    Execution,
}

/// Failure reported by a procedure body
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ProcedureError {
    pub message: String,
    pub raw: Option<Value>,
    pub(crate) kind: ProcedureErrorKind,
}

impl ProcedureError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            raw: None,
            kind: ProcedureErrorKind::Execution,
        }
    }

    /// The input passed its schema but the body still refused it
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self {
            kind: ProcedureErrorKind::InvalidInput,
            ..Self::new(message)
        }
    }

    pub fn with_raw(mut self, raw: Value) -> Self {
        self.raw = Some(raw);
        self
    }
}

impl From<crate::Error> for ProcedureError {
    fn from(err: crate::Error) -> Self {
        Self::new(err.to_string())
    }
}

impl From<serde_json::Error> for ProcedureError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// A named, schema-guarded async function
#[derive(Clone)]
pub struct Procedure {
    name: String,
    schema: ProcedureSchema,
    execute: ExecuteFn,
}

impl Procedure {
    /// Untyped procedure over raw JSON values
    pub fn new<F, Fut>(name: impl Into<String>, execute: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, ProcedureError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            schema: ProcedureSchema::default(),
            execute: Arc::new(move |input| execute(input).boxed()),
        }
    }

    /// Procedure whose schemas are derived from `I` and `O`.
    ///
    /// Validated input is deserialized into `I` before the body runs and the
    /// body's `O` is serialized back to JSON.
    pub fn typed<I, O, F, Fut>(name: impl Into<String>, execute: F) -> Result<Self>
    where
        I: DeserializeOwned + JsonSchema + Send + 'static,
        O: Serialize + JsonSchema + Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<O, ProcedureError>> + Send + 'static,
    {
        let schema = ProcedureSchema {
            input: Some(Schema::of::<I>()?),
            output: Some(Schema::of::<O>()?),
        };
        let execute = Arc::new(execute);
        let body: ExecuteFn = Arc::new(move |input: Value| {
            let execute = execute.clone();
            async move {
                let input: I = serde_json::from_value(input)
                    .map_err(|e| ProcedureError::invalid_input(e.to_string()))?;
                let output = (*execute)(input).await?;
                Ok::<Value, ProcedureError>(serde_json::to_value(output)?)
            }
            .boxed()
        });

        Ok(Self {
            name: name.into(),
            schema,
            execute: body,
        })
    }

    pub fn with_input_schema(mut self, schema: Schema) -> Self {
        self.schema.input = Some(schema);
        self
    }

    pub fn with_output_schema(mut self, schema: Schema) -> Self {
        self.schema.output = Some(schema);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &ProcedureSchema {
        &self.schema
    }

    pub(crate) fn execute(&self, input: Value) -> ProcedureFuture {
        (self.execute)(input)
    }
}

impl std::fmt::Debug for Procedure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Procedure")
            .field("name", &self.name)
            .field("schema", &self.schema)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize, JsonSchema)]
    struct AddInput {
        a: i64,
        b: i64,
    }

    #[tokio::test]
    async fn test_untyped_procedure() {
        let procedure = Procedure::new("echo", |input| async move { Ok(input) });
        assert_eq!(procedure.name(), "echo");
        assert!(procedure.schema().input.is_none());
        assert_eq!(procedure.execute(json!(1)).await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_typed_procedure() {
        let procedure =
            Procedure::typed("add", |input: AddInput| async move { Ok(input.a + input.b) })
                .unwrap();

        let schema = procedure.schema();
        assert!(schema.input.as_ref().unwrap().validate(&json!({"a": 1, "b": 2})).is_ok());
        assert!(schema.input.as_ref().unwrap().validate(&json!({"a": 1})).is_err());
        assert!(schema.output.as_ref().unwrap().validate(&json!(3)).is_ok());

        assert_eq!(
            procedure.execute(json!({"a": 1, "b": 2})).await.unwrap(),
            json!(3)
        );
    }

    #[tokio::test]
    async fn test_typed_deserialize_failure_is_invalid_input() {
        let procedure =
            Procedure::typed("add", |input: AddInput| async move { Ok(input.a + input.b) })
                .unwrap();
        let err = procedure.execute(json!("nope")).await.unwrap_err();
        assert_eq!(err.kind, ProcedureErrorKind::InvalidInput);
    }
}
