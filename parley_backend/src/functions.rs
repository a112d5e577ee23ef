//! Functions the model may invoke with a `FUNCTION_CALL` directive.
//!
//! Each function declares a JSON Schema for its arguments and is registered in
//! a thread-safe [`FunctionRegistry`]. The registry resolves names, checks
//! required arguments and turns failures into [`FunctionOutput::Error`].

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::directives::FunctionInvocation;

/// The result of running a function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FunctionOutput {
    Text(String),
    Json(Value),
    Error(String),
}

impl FunctionOutput {
    /// Convert to a string representation suitable for feeding back to the LLM
    pub fn to_llm_string(&self) -> String {
        match self {
            FunctionOutput::Text(s) => s.clone(),
            FunctionOutput::Json(v) => {
                serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string())
            }
            FunctionOutput::Error(e) => format!("[ERROR] {}", e),
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, FunctionOutput::Error(_))
    }
}

#[async_trait]
pub trait Function: Send + Sync {
    /// Name used in `FUNCTION_CALL` bodies (e.g. "current_time")
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema describing the function's arguments.
    fn parameters_schema(&self) -> Value;

    async fn call(&self, arguments: Value) -> Result<FunctionOutput>;
}

/// Thread-safe registry of callable functions.
pub struct FunctionRegistry {
    functions: RwLock<HashMap<String, Arc<dyn Function>>>,
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self {
            functions: RwLock::new(HashMap::new()),
        }
    }

    /// Registry preloaded with `current_time` and `word_count`.
    pub async fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(CurrentTime)).await;
        registry.register(Arc::new(WordCount)).await;
        registry
    }

    /// Register a function. Overwrites any existing one with the same name.
    pub async fn register(&self, function: Arc<dyn Function>) {
        let name = function.name().to_string();
        tracing::info!("Registered function: {}", name);
        self.functions.write().await.insert(name, function);
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Function>> {
        let functions = self.functions.read().await;
        functions.get(name).cloned().or_else(|| {
            functions
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, f)| f.clone())
        })
    }

    pub async fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// One line per function, for the system prompt.
    pub async fn describe(&self) -> String {
        let functions = self.functions.read().await;
        let mut lines: Vec<String> = functions
            .values()
            .map(|f| format!("- {}: {}", f.name(), f.description()))
            .collect();
        lines.sort();
        lines.join("\n")
    }

    pub async fn invoke(&self, invocation: &FunctionInvocation) -> FunctionOutput {
        let Some(function) = self.get(&invocation.name).await else {
            return FunctionOutput::Error(format!("Unknown function: {}", invocation.name));
        };

        let schema = function.parameters_schema();
        if let Some(missing) = missing_required(&schema, &invocation.arguments) {
            return FunctionOutput::Error(format!(
                "Missing required argument '{}' for {}",
                missing, invocation.name
            ));
        }

        let arguments = normalize_positional(&schema, &invocation.arguments);
        match function.call(arguments).await {
            Ok(output) => output,
            Err(e) => FunctionOutput::Error(format!("Function execution failed: {}", e)),
        }
    }
}

/// Map `argN` keys onto the schema's declared property order.
fn normalize_positional(schema: &Value, arguments: &Value) -> Value {
    let Some(args) = arguments.as_object() else {
        return arguments.clone();
    };
    let order = property_order(schema);
    let mut out = serde_json::Map::new();
    for (key, value) in args {
        let mapped = key
            .strip_prefix("arg")
            .and_then(|n| n.parse::<usize>().ok())
            .and_then(|n| order.get(n))
            .filter(|name| !args.contains_key(name.as_str()))
            .cloned()
            .unwrap_or_else(|| key.clone());
        out.insert(mapped, value.clone());
    }
    Value::Object(out)
}

/// Positional order is `required` first, then any remaining properties.
fn property_order(schema: &Value) -> Vec<String> {
    let mut order: Vec<String> = schema["required"]
        .as_array()
        .map(|req| req.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();
    if let Some(props) = schema["properties"].as_object() {
        for key in props.keys() {
            if !order.contains(key) {
                order.push(key.clone());
            }
        }
    }
    order
}

fn missing_required(schema: &Value, arguments: &Value) -> Option<String> {
    let normalized = normalize_positional(schema, arguments);
    schema["required"]
        .as_array()?
        .iter()
        .filter_map(Value::as_str)
        .find(|name| normalized.get(*name).map_or(true, Value::is_null))
        .map(str::to_string)
}

pub struct CurrentTime;

#[async_trait]
impl Function for CurrentTime {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Current date and time in UTC (RFC 3339)"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {}
        })
    }

    async fn call(&self, _arguments: Value) -> Result<FunctionOutput> {
        Ok(FunctionOutput::Text(chrono::Utc::now().to_rfc3339()))
    }
}

pub struct WordCount;

#[async_trait]
impl Function for WordCount {
    fn name(&self) -> &str {
        "word_count"
    }

    fn description(&self) -> &str {
        "Count words, lines and characters in a piece of text"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "text": { "type": "string", "description": "Text to count" }
            },
            "required": ["text"]
        })
    }

    async fn call(&self, arguments: Value) -> Result<FunctionOutput> {
        let text = arguments["text"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("'text' must be a string"))?;
        Ok(FunctionOutput::Json(serde_json::json!({
            "words": text.split_whitespace().count(),
            "lines": text.lines().count(),
            "characters": text.chars().count(),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(name: &str, arguments: Value) -> FunctionInvocation {
        FunctionInvocation {
            name: name.to_string(),
            arguments,
        }
    }

    #[tokio::test]
    async fn word_count_accepts_named_and_positional_text() {
        let registry = FunctionRegistry::with_builtins().await;

        let named = registry
            .invoke(&call("word_count", json!({"text": "one two\nthree"})))
            .await;
        assert_eq!(
            named,
            FunctionOutput::Json(json!({"words": 3, "lines": 2, "characters": 13}))
        );

        let positional = registry
            .invoke(&call("WORD_COUNT", json!({"arg0": "a b"})))
            .await;
        assert!(positional.is_success());
        assert!(positional.to_llm_string().contains("\"words\": 2"));
    }

    #[tokio::test]
    async fn unknown_function_and_missing_argument_are_errors() {
        let registry = FunctionRegistry::with_builtins().await;

        let unknown = registry.invoke(&call("launch_rocket", json!({}))).await;
        assert_eq!(
            unknown,
            FunctionOutput::Error("Unknown function: launch_rocket".to_string())
        );

        let missing = registry.invoke(&call("word_count", json!({}))).await;
        assert!(!missing.is_success());
        assert!(missing.to_llm_string().starts_with("[ERROR] Missing required argument 'text'"));
    }

    #[tokio::test]
    async fn current_time_is_rfc3339() {
        let registry = FunctionRegistry::with_builtins().await;
        let FunctionOutput::Text(now) = registry.invoke(&call("current_time", json!({}))).await
        else {
            panic!("expected text output");
        };
        assert!(chrono::DateTime::parse_from_rfc3339(&now).is_ok());
        assert_eq!(registry.list_names().await, vec!["current_time", "word_count"]);
    }
}
