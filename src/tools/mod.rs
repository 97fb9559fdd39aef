use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::warn;

use crate::error::{GenerationError, SchemaError, ToolError};
use crate::llm::{ProviderToolDefinition, ToolCall};
use crate::schema;

pub(crate) const TOOL_USAGE_OPEN: &str = "<tool-usage>";
pub(crate) const TOOL_USAGE_CLOSE: &str = "</tool-usage>";

type ToolHandler = dyn Fn(Value) -> BoxFuture<'static, Result<Value, ToolError>> + Send + Sync;

/// A locally executed function the provider may call by name.
///
/// The argument schema offered to the provider is inferred from
/// `Arguments`, so it must be a struct (a JSON object at the root).
#[async_trait]
pub trait Tool: Send + Sync + 'static {
    type Arguments: Serialize + DeserializeOwned + Send;
    type Output: Serialize + Send;

    fn name(&self) -> &str;

    fn description(&self) -> &str;

    async fn call(&self, arguments: Self::Arguments) -> Result<Self::Output, ToolError>;
}

#[derive(Clone)]
pub struct ToolSpec {
    name: String,
    description: String,
    json_schema: Value,
    handler: Arc<ToolHandler>,
}

impl std::fmt::Debug for ToolSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSpec")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("json_schema", &self.json_schema)
            .finish()
    }
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            json_schema: json!({
                "type": "object",
                "properties": {},
                "required": [],
                "additionalProperties": true,
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

    /// Erases a typed [`Tool`], inferring its argument schema.
    pub fn from_tool<T: Tool>(tool: T) -> Result<Self, SchemaError> {
        let schema = schema::infer::<T::Arguments>()?.to_json();
        let spec = Self::new(tool.name(), tool.description()).with_schema(schema)?;
        let tool = Arc::new(tool);

        Ok(spec
            .with_handler(move |args| {
                let tool = Arc::clone(&tool);
                async move {
                    let arguments = serde_json::from_value::<T::Arguments>(args).map_err(|err| {
                        ToolError::InvalidArguments {
                            tool: tool.name().to_string(),
                            message: err.to_string(),
                        }
                    })?;
                    let output = tool.call(arguments).await?;
                    serde_json::to_value(output).map_err(|err| {
                        ToolError::Execution(format!("tool output is not serializable: {err}"))
                    })
                }
            }))
    }

    pub fn with_schema(mut self, schema: Value) -> Result<Self, SchemaError> {
        validate_schema(&schema)?;
        self.json_schema = schema;
        Ok(self)
    }

    pub fn with_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        self.handler = Arc::new(move |args| Box::pin(handler(args)));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn json_schema(&self) -> &Value {
        &self.json_schema
    }

    /// Decodes `arguments_json` against the schema and runs the handler.
    pub async fn execute(&self, arguments_json: &str) -> Result<Value, ToolError> {
        let args = if arguments_json.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str::<Value>(arguments_json).map_err(|err| {
                ToolError::InvalidArguments {
                    tool: self.name.clone(),
                    message: format!("arguments are not valid JSON: {err}"),
                }
            })?
        };

        validate_arguments(self.name(), &self.json_schema, &args)?;
        (self.handler)(args).await
    }

    fn definition(&self) -> ProviderToolDefinition {
        ProviderToolDefinition::function(
            self.name.clone(),
            self.description.clone(),
            self.json_schema.clone(),
        )
    }
}

/// Result of resolving one provider tool call.
#[derive(Debug, PartialEq)]
pub(crate) enum Invocation {
    Completed { output: String },
    /// The failure is reported back to the provider as `output`.
    Recovered { output: String, error: ToolError },
}

/// Immutable name → tool mapping fixed at session creation.
#[derive(Clone, Debug, Default)]
pub struct ToolRegistry {
    tools: Vec<ToolSpec>,
    by_name: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new(tools: Vec<ToolSpec>) -> Result<Self, GenerationError> {
        let mut by_name = HashMap::new();
        for (index, tool) in tools.iter().enumerate() {
            if by_name.insert(tool.name().to_string(), index).is_some() {
                return Err(GenerationError::Config(format!(
                    "duplicate tool registered: {}",
                    tool.name()
                )));
            }
        }

        Ok(Self { tools, by_name })
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.by_name.get(name).map(|index| &self.tools[*index])
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolSpec> {
        self.tools.iter()
    }

    pub(crate) fn definitions(&self) -> Vec<ProviderToolDefinition> {
        self.tools.iter().map(ToolSpec::definition).collect()
    }

    /// System-message block describing the registered tools.
    pub(crate) fn usage_instructions(&self) -> Option<String> {
        if self.tools.is_empty() {
            return None;
        }

        let listing = self
            .tools
            .iter()
            .map(|tool| format!("- {}: {}", tool.name(), tool.description()))
            .collect::<Vec<_>>()
            .join("\n");

        Some(format!(
            "{TOOL_USAGE_OPEN}\nYou can call these tools when they help with the request:\n{listing}\nCall a tool only when it is needed; otherwise answer directly.\n{TOOL_USAGE_CLOSE}"
        ))
    }

    /// Unknown tool names are a registration bug and abort the caller; every
    /// other failure is folded into a synthetic result for the provider.
    pub(crate) async fn invoke(&self, call: &ToolCall) -> Result<Invocation, ToolError> {
        let tool = self
            .get(&call.name)
            .ok_or_else(|| ToolError::NotFound(call.name.clone()))?;

        match tool.execute(&call.arguments_json).await {
            Ok(output) => Ok(Invocation::Completed {
                output: output.to_string(),
            }),
            Err(error) => {
                warn!(tool = %call.name, call_id = %call.id, error = %error, "tool call failed");
                Ok(Invocation::Recovered {
                    output: failure_output(&call.name, &error),
                    error,
                })
            }
        }
    }
}

pub(crate) fn failure_output(tool: &str, error: &ToolError) -> String {
    let kind = match error {
        ToolError::NotFound(_) => "not_found",
        ToolError::InvalidArguments { .. } => "invalid_arguments",
        ToolError::Execution(_) => "execution_failed",
    };

    json!({
        "error": error.to_string(),
        "kind": kind,
        "tool": tool,
    })
    .to_string()
}

/// Result for a call that was never run because an earlier call of the same
/// turn aborted the loop.
pub(crate) fn skipped_output(tool: &str) -> String {
    json!({
        "error": "not executed: an earlier tool call in this turn failed",
        "kind": "not_executed",
        "tool": tool,
    })
    .to_string()
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
        for item in required_arr {
            if !item.is_string() {
                return Err(SchemaError::InvalidRequired);
            }
        }
    }

    Ok(())
}

fn validate_arguments(tool_name: &str, schema: &Value, args: &Value) -> Result<(), ToolError> {
    let args_obj = args
        .as_object()
        .ok_or_else(|| ToolError::InvalidArguments {
            tool: tool_name.to_string(),
            message: "arguments must be a JSON object".to_string(),
        })?;

    let required = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|fields| fields.iter().filter_map(Value::as_str).collect::<Vec<_>>())
        .unwrap_or_default();

    for field_name in &required {
        if !args_obj.contains_key(*field_name) {
            return Err(ToolError::InvalidArguments {
                tool: tool_name.to_string(),
                message: format!("missing required field: {field_name}"),
            });
        }
    }

    let properties = schema
        .get("properties")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    if schema.get("additionalProperties").and_then(Value::as_bool) == Some(false) {
        for key in args_obj.keys() {
            if !properties.contains_key(key) {
                return Err(ToolError::InvalidArguments {
                    tool: tool_name.to_string(),
                    message: format!("unknown field: {key}"),
                });
            }
        }
    }

    for (key, value) in args_obj {
        // Optional fields may be sent as explicit nulls.
        if value.is_null() && !required.contains(&key.as_str()) {
            continue;
        }
        if let Some(type_name) = properties
            .get(key)
            .and_then(|field_schema| field_schema.get("type"))
            .and_then(Value::as_str)
        {
            if !value_matches_type(value, type_name) {
                return Err(ToolError::InvalidArguments {
                    tool: tool_name.to_string(),
                    message: format!("field '{key}' must be of type {type_name}"),
                });
            }
        }
    }

    Ok(())
}

fn value_matches_type(value: &Value, type_name: &str) -> bool {
    match type_name {
        "string" => value.is_string(),
        "integer" => value.as_i64().is_some() || value.as_u64().is_some(),
        "number" => value.as_f64().is_some(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}
