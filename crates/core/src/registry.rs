// Tool registry: catalog, argument validation and dispatch

use crate::error::{GatewayError, GatewayResult};
use crate::types::ToolDescriptor;
use anyhow::Result;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

/// Tool executor trait
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Name, description and parameter schema
    fn descriptor(&self) -> ToolDescriptor;

    /// Execute the tool with already-validated parameters
    async fn execute(&self, params: Value) -> Result<String>;
}

struct RegisteredTool {
    descriptor: ToolDescriptor,
    tool: Arc<dyn Tool>,
}

type Catalog = BTreeMap<String, RegisteredTool>;

/// Process-wide tool catalog.
///
/// `register` swaps in a complete new catalog; readers hold an `Arc` to the
/// catalog they started with and never see a partially built one.
pub struct ToolRegistry {
    catalog: RwLock<Arc<Catalog>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            catalog: RwLock::new(Arc::new(Catalog::new())),
        }
    }

    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::default()
    }

    /// Replace the active catalog with `tools`.
    ///
    /// Callers pass the complete set every time. When two tools share a name
    /// the later one wins.
    pub fn register<I>(&self, tools: I)
    where
        I: IntoIterator<Item = Arc<dyn Tool>>,
    {
        let mut catalog = Catalog::new();
        for tool in tools {
            let descriptor = tool.descriptor();
            if catalog.contains_key(&descriptor.name) {
                tracing::warn!("Tool {} registered twice, keeping the later one", descriptor.name);
            }
            catalog.insert(descriptor.name.clone(), RegisteredTool { descriptor, tool });
        }

        let count = catalog.len();
        *self.catalog.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(catalog);
        tracing::info!("Registered {} tools", count);
    }

    fn snapshot(&self) -> Arc<Catalog> {
        self.catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Check if a tool exists
    pub fn contains(&self, name: &str) -> bool {
        self.snapshot().contains_key(name)
    }

    /// Get a tool by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.snapshot().get(name).map(|entry| entry.tool.clone())
    }

    /// Tool names in sorted order
    pub fn names(&self) -> Vec<String> {
        self.snapshot().keys().cloned().collect()
    }

    /// Descriptors of every registered tool, sorted by name
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.snapshot()
            .values()
            .map(|entry| entry.descriptor.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Check a call against the tool's schema without running it.
    pub fn validate(&self, name: &str, params: &Value) -> GatewayResult<()> {
        validate_in(&self.snapshot(), name, params).map(|_| ())
    }

    /// Validate and run a tool.
    ///
    /// Executor failures come back as [`GatewayError::ToolExecution`] unless
    /// the executor raised a gateway error itself (for instance a sandbox
    /// violation), which is passed through unchanged.
    pub async fn dispatch(&self, name: &str, params: Value) -> GatewayResult<String> {
        let catalog = self.snapshot();
        let entry = validate_in(&catalog, name, &params)?;
        let params = if params.is_null() {
            Value::Object(Default::default())
        } else {
            params
        };

        tracing::debug!(tool = name, "Dispatching tool");
        entry.tool.execute(params).await.map_err(|err| {
            match err.downcast::<GatewayError>() {
                Ok(gateway) => gateway,
                Err(other) => GatewayError::tool_execution(name, format!("{:#}", other)),
            }
        })
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_in<'a>(catalog: &'a Catalog, name: &str, params: &Value) -> GatewayResult<&'a RegisteredTool> {
    let entry = catalog.get(name).ok_or_else(|| GatewayError::UnknownTool {
        name: name.to_string(),
        available: catalog.keys().cloned().collect(),
    })?;

    // `null` stands in for an empty parameter object
    let empty = serde_json::Map::new();
    let fields = match params {
        Value::Object(map) => map,
        Value::Null => &empty,
        other => {
            return Err(GatewayError::InvalidParams(format!(
                "params for '{}' must be an object, got {}",
                name,
                json_type_name(other)
            )))
        }
    };

    let descriptor = &entry.descriptor;
    for required in descriptor.required_parameters() {
        if !fields.contains_key(required) {
            return Err(GatewayError::MissingParameter {
                tool: name.to_string(),
                parameter: required.to_string(),
            });
        }
    }

    for (field, value) in fields {
        if let Some(expected) = descriptor.parameter_type(field) {
            if !matches_type(expected, value) {
                return Err(GatewayError::InvalidParameterType {
                    tool: name.to_string(),
                    parameter: field.clone(),
                    expected: expected.to_string(),
                    actual: json_type_name(value).to_string(),
                });
            }
        }
    }

    Ok(entry)
}

fn matches_type(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Collects tools for a registry in one step
#[derive(Default)]
pub struct ToolRegistryBuilder {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistryBuilder {
    pub fn tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tools<I>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Tool>>,
    {
        self.tools.extend(tools);
        self
    }

    /// Register a closure as a tool
    pub fn function<F, Fut>(
        self,
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        run: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        self.tool(Arc::new(FnTool::new(name, description, parameters, run)))
    }

    pub fn build(self) -> ToolRegistry {
        let registry = ToolRegistry::new();
        registry.register(self.tools);
        registry
    }
}

type ToolFn = Box<dyn Fn(Value) -> BoxFuture<'static, Result<String>> + Send + Sync>;

/// A tool backed by an async closure
pub struct FnTool {
    descriptor: ToolDescriptor,
    run: ToolFn,
}

impl FnTool {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        run: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        Self {
            descriptor: ToolDescriptor {
                name: name.into(),
                description: description.into(),
                parameters,
            },
            run: Box::new(move |params| Box::pin(run(params))),
        }
    }
}

#[async_trait::async_trait]
impl Tool for FnTool {
    fn descriptor(&self) -> ToolDescriptor {
        self.descriptor.clone()
    }

    async fn execute(&self, params: Value) -> Result<String> {
        (self.run)(params).await
    }
}

// Helper functions for creating tool schemas

pub fn json_schema_object(properties: Value, required: Vec<&str>) -> Value {
    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required
    })
}

pub fn json_schema_string(description: &str) -> Value {
    serde_json::json!({
        "type": "string",
        "description": description
    })
}

pub fn json_schema_integer(description: &str) -> Value {
    serde_json::json!({
        "type": "integer",
        "description": description
    })
}

pub fn json_schema_boolean(description: &str) -> Value {
    serde_json::json!({
        "type": "boolean",
        "description": description
    })
}
