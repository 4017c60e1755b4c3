use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{SchemaError, ToolError};

type ToolHandler = dyn Fn(String) -> BoxFuture<'static, Result<String, ToolError>> + Send + Sync;

/// A named, schema-described function the model may ask to invoke.
///
/// Cloning is cheap: the handler is shared behind an `Arc`, so the same tool can be
/// registered on several agents.
#[derive(Clone)]
pub struct Tool {
    name: String,
    description: String,
    parameters: Value,
    handler: Arc<ToolHandler>,
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("parameters", &self.parameters)
            .finish()
    }
}

impl Tool {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {},
                "required": [],
                "additionalProperties": false,
            }),
            handler: Arc::new(|_args| {
                Box::pin(async {
                    Err(ToolError::Execution(
                        "tool handler not configured".to_string(),
                    ))
                })
            }),
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Result<Self, SchemaError> {
        validate_schema(&schema)?;
        self.parameters = schema;
        Ok(self)
    }

    /// For schemas built by this crate, which are valid by construction.
    pub(crate) fn with_trusted_schema(mut self, schema: Value) -> Self {
        self.parameters = schema;
        self
    }

    /// Sets a handler that receives the raw JSON argument string chosen by the model.
    pub fn with_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, ToolError>> + Send + 'static,
    {
        self.handler = Arc::new(move |args| Box::pin(handler(args)));
        self
    }

    /// Sets a handler whose arguments are decoded into `T` before it runs.
    pub fn with_typed_handler<T, F, Fut>(mut self, handler: F) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, ToolError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let tool_name = self.name.clone();
        self.handler = Arc::new(move |args: String| {
            let handler = Arc::clone(&handler);
            let tool_name = tool_name.clone();
            Box::pin(async move {
                let params = serde_json::from_str::<T>(&args).map_err(|err| {
                    ToolError::InvalidArguments {
                        tool: tool_name,
                        message: format!("failed to parse arguments: {err}"),
                    }
                })?;
                handler(params).await
            })
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn parameters(&self) -> &Value {
        &self.parameters
    }

    /// Invokes the handler. The returned future owns everything it needs, so it can be
    /// spawned onto a task.
    pub fn call(&self, arguments: impl Into<String>) -> BoxFuture<'static, Result<String, ToolError>> {
        (self.handler)(arguments.into())
    }
}

fn validate_schema(schema: &Value) -> Result<(), SchemaError> {
    let schema_obj = schema.as_object().ok_or(SchemaError::SchemaNotObject)?;

    let root_type = schema_obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or(SchemaError::RootTypeMustBeObject)?;

    if root_type != "object" {
        return Err(SchemaError::RootTypeMustBeObject);
    }

    if let Some(required) = schema_obj.get("required") {
        let required_arr = required.as_array().ok_or(SchemaError::InvalidRequired)?;
        if required_arr.iter().any(|item| !item.is_string()) {
            return Err(SchemaError::InvalidRequired);
        }
    }

    Ok(())
}
