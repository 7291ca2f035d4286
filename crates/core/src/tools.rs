//! Declarative tool-schema table and name-based dispatch.
//!
//! The registry is built and validated once, then shared (behind an `Arc`) by
//! every orchestrator and streaming session. Tools never see call ids; the
//! caller correlates results back to the `ToolCall` that requested them.

use crate::error::{ToolError, ValidationError};
use crate::run::{ToolCall, ToolOutput};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Declaration of one callable tool: `{name, description, parameters}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON-Schema object describing the arguments.
    pub parameters: Value,
}

impl ToolSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    /// Builds the parameter schema from an argument struct.
    pub fn for_args<T: JsonSchema>(name: impl Into<String>, description: impl Into<String>) -> Self {
        let mut parameters = serde_json::to_value(schemars::schema_for!(T)).unwrap_or(Value::Null);
        if let Some(obj) = parameters.as_object_mut() {
            obj.remove("$schema");
            obj.remove("title");
        }
        Self::new(name, description, parameters)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        let invalid = |reason: &str| ValidationError::InvalidToolSchema {
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.name.is_empty() || self.name.len() > 64 {
            return Err(invalid("name must be 1-64 characters"));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(invalid("name may only contain letters, digits, '_' and '-'"));
        }
        let Some(params) = self.parameters.as_object() else {
            return Err(invalid("parameters must be a JSON object"));
        };
        if params.get("type").and_then(Value::as_str) != Some("object") {
            return Err(invalid("parameters must declare \"type\": \"object\""));
        }
        if let Some(props) = params.get("properties") {
            if !props.is_object() {
                return Err(invalid("\"properties\" must be an object"));
            }
        }
        if let Some(required) = params.get("required") {
            let all_strings = required
                .as_array()
                .is_some_and(|r| r.iter().all(Value::is_string));
            if !all_strings {
                return Err(invalid("\"required\" must be an array of property names"));
            }
        }
        Ok(())
    }
}

/// A local function the remote runtime may ask us to run.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn invoke(&self, args: Value) -> Result<Value, ToolError>;
}

/// Adapts an async function over a deserializable argument struct.
pub struct TypedTool<A, F> {
    f: F,
    _args: PhantomData<fn() -> A>,
}

pub fn typed<A, F, Fut>(f: F) -> TypedTool<A, F>
where
    A: DeserializeOwned + Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
{
    TypedTool {
        f,
        _args: PhantomData,
    }
}

#[async_trait]
impl<A, F, Fut> ToolHandler for TypedTool<A, F>
where
    A: DeserializeOwned + Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
{
    async fn invoke(&self, args: Value) -> Result<Value, ToolError> {
        let args: A = serde_json::from_value(args)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
        (self.f)(args).await
    }
}

/// Why a single invocation produced no result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvokeError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Tool(#[from] ToolError),
}

struct RegisteredTool {
    schema: ToolSchema,
    handler: Arc<dyn ToolHandler>,
}

/// Validated, immutable table of tools keyed by name.
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
}

#[derive(Default)]
pub struct ToolRegistryBuilder {
    tools: Vec<RegisteredTool>,
}

impl ToolRegistryBuilder {
    pub fn register(mut self, schema: ToolSchema, handler: impl ToolHandler + 'static) -> Self {
        self.tools.push(RegisteredTool {
            schema,
            handler: Arc::new(handler),
        });
        self
    }

    pub fn build(self) -> Result<ToolRegistry, ValidationError> {
        for (i, tool) in self.tools.iter().enumerate() {
            tool.schema.validate()?;
            if self.tools[..i]
                .iter()
                .any(|other| other.schema.name == tool.schema.name)
            {
                return Err(ValidationError::DuplicateTool(tool.schema.name.clone()));
            }
        }
        info!(tools = self.tools.len(), "Tool registry built");
        Ok(ToolRegistry { tools: self.tools })
    }
}

impl ToolRegistry {
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::default()
    }

    pub fn empty() -> Self {
        Self { tools: Vec::new() }
    }

    /// Declarations in registration order.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.iter().map(|t| t.schema.clone()).collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.schema.name.as_str()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    fn find(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.iter().find(|t| t.schema.name == name)
    }

    /// Parses and validates `raw_args` against the tool's schema, then runs it.
    pub async fn invoke(&self, name: &str, raw_args: &str) -> Result<Value, InvokeError> {
        let tool = self
            .find(name)
            .ok_or_else(|| ValidationError::UnknownTool(name.to_string()))?;

        let raw_args = if raw_args.trim().is_empty() { "{}" } else { raw_args };
        let args: Value =
            serde_json::from_str(raw_args).map_err(|e| ValidationError::InvalidArguments {
                tool: name.to_string(),
                reason: format!("arguments are not valid JSON: {}", e),
            })?;
        validate_arguments(name, &tool.schema.parameters, &args)?;

        debug!(tool = %name, %args, "Invoking tool");
        Ok(tool.handler.invoke(args).await?)
    }

    /// Answers every call with exactly one output, in call order.
    ///
    /// Unknown tools, malformed arguments and tool failures become error
    /// payloads instead of failing the turn.
    pub async fn dispatch(&self, calls: &[ToolCall]) -> Vec<ToolOutput> {
        let mut outputs = Vec::with_capacity(calls.len());
        for call in calls {
            let output = match self.invoke(&call.name, &call.arguments).await {
                Ok(value) => {
                    info!(tool = %call.name, call_id = %call.id, "Tool call succeeded");
                    serde_json::to_string(&value).unwrap_or_else(|e| error_payload(&e.to_string()))
                }
                Err(e) => {
                    warn!(tool = %call.name, call_id = %call.id, error = %e, "Tool call failed");
                    error_payload(&e.to_string())
                }
            };
            outputs.push(ToolOutput {
                tool_call_id: call.id.clone(),
                output,
            });
        }
        outputs
    }
}

fn error_payload(message: &str) -> String {
    json!({ "error": message }).to_string()
}

fn validate_arguments(tool: &str, schema: &Value, args: &Value) -> Result<(), ValidationError> {
    let invalid = |reason: String| ValidationError::InvalidArguments {
        tool: tool.to_string(),
        reason,
    };
    let obj = args
        .as_object()
        .ok_or_else(|| invalid("arguments must be a JSON object".into()))?;

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if !obj.contains_key(key) {
                return Err(invalid(format!("missing required property '{}'", key)));
            }
        }
    }

    let Some(props) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(());
    };
    for (key, value) in obj {
        let Some(prop) = props.get(key) else {
            continue;
        };
        if let Some(expected) = prop.get("type") {
            if !type_matches(expected, value) {
                return Err(invalid(format!("property '{}' must be of type {}", key, expected)));
            }
        }
        if let Some(allowed) = prop.get("enum").and_then(Value::as_array) {
            if !allowed.contains(value) {
                return Err(invalid(format!(
                    "property '{}' must be one of {}",
                    key,
                    Value::Array(allowed.clone())
                )));
            }
        }
    }
    Ok(())
}

fn type_matches(expected: &Value, value: &Value) -> bool {
    match expected {
        Value::String(t) => primitive_matches(t, value),
        Value::Array(types) => types
            .iter()
            .filter_map(Value::as_str)
            .any(|t| primitive_matches(t, value)),
        _ => true,
    }
}

fn primitive_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    #[derive(Deserialize, JsonSchema)]
    #[allow(dead_code)]
    struct WeatherArgs {
        /// The city and state, e.g. San Francisco, CA
        location: String,
        unit: Option<String>,
    }

    fn temperature_schema() -> ToolSchema {
        ToolSchema::new(
            "get_current_temperature",
            "Get the current temperature for a specific location",
            json!({
                "type": "object",
                "properties": {
                    "location": { "type": "string" },
                    "unit": { "type": "string", "enum": ["Celsius", "Fahrenheit"] }
                },
                "required": ["location", "unit"]
            }),
        )
    }

    #[test]
    fn test_schema_from_args_struct() {
        let schema = ToolSchema::for_args::<WeatherArgs>("weather", "Weather lookup");
        assert_eq!(schema.parameters["type"], "object");
        assert!(schema.parameters["properties"]["location"].is_object());
        assert!(schema.parameters.get("$schema").is_none());
        assert!(schema.validate().is_ok());
    }

    #[test]
    fn test_build_rejects_bad_tables() {
        let err = ToolRegistry::builder()
            .register(ToolSchema::new("bad name", "", json!({"type": "object"})), MockToolHandler::new())
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, ValidationError::InvalidToolSchema { .. }));

        let err = ToolRegistry::builder()
            .register(ToolSchema::new("no_params", "", json!("string")), MockToolHandler::new())
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, ValidationError::InvalidToolSchema { .. }));

        let err = ToolRegistry::builder()
            .register(temperature_schema(), MockToolHandler::new())
            .register(temperature_schema(), MockToolHandler::new())
            .build()
            .err()
            .unwrap();
        assert_eq!(
            err,
            ValidationError::DuplicateTool("get_current_temperature".into())
        );
    }

    #[tokio::test]
    async fn test_invoke_passes_parsed_arguments() {
        let mut handler = MockToolHandler::new();
        handler
            .expect_invoke()
            .with(eq(json!({"location": "Austin, TX", "unit": "Fahrenheit"})))
            .times(1)
            .returning(|_| Ok(json!({"temperature": "75°F"})));

        let registry = ToolRegistry::builder()
            .register(temperature_schema(), handler)
            .build()
            .unwrap();
        let result = registry
            .invoke(
                "get_current_temperature",
                r#"{"location": "Austin, TX", "unit": "Fahrenheit"}"#,
            )
            .await
            .unwrap();
        assert_eq!(result, json!({"temperature": "75°F"}));
    }

    #[tokio::test]
    async fn test_invalid_arguments_never_reach_the_handler() {
        let mut handler = MockToolHandler::new();
        handler.expect_invoke().never();
        let registry = ToolRegistry::builder()
            .register(temperature_schema(), handler)
            .build()
            .unwrap();

        for raw in [
            "not json",
            "[1, 2]",
            r#"{"location": "Austin"}"#,
            r#"{"location": 42, "unit": "Celsius"}"#,
            r#"{"location": "Austin", "unit": "Kelvin"}"#,
        ] {
            let err = registry.invoke("get_current_temperature", raw).await.unwrap_err();
            assert!(
                matches!(err, InvokeError::Validation(ValidationError::InvalidArguments { .. })),
                "{raw} should be rejected, got {err:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_dispatch_answers_every_call() {
        let mut handler = MockToolHandler::new();
        handler
            .expect_invoke()
            .returning(|_| Err(ToolError::failed("calendar unavailable")));
        let registry = ToolRegistry::builder()
            .register(temperature_schema(), handler)
            .build()
            .unwrap();

        let calls = vec![
            ToolCall::new(
                "call_1",
                "get_current_temperature",
                r#"{"location": "Paris", "unit": "Celsius"}"#,
            ),
            ToolCall::new("call_2", "launch_rocket", "{}"),
        ];
        let outputs = registry.dispatch(&calls).await;

        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].tool_call_id, "call_1");
        assert_eq!(outputs[0].output, r#"{"error":"calendar unavailable"}"#);
        assert_eq!(outputs[1].tool_call_id, "call_2");
        assert_eq!(outputs[1].output, r#"{"error":"Unknown tool 'launch_rocket'"}"#);
    }

    #[tokio::test]
    async fn test_typed_tool_deserializes_arguments() {
        let tool = typed(|args: WeatherArgs| async move {
            Ok(json!({ "echo": args.location }))
        });
        let result = tool.invoke(json!({"location": "Oslo"})).await.unwrap();
        assert_eq!(result, json!({"echo": "Oslo"}));

        let err = tool.invoke(json!({"unit": "Celsius"})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
