use async_trait::async_trait;
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;

pub mod builtin;
pub mod collaborators;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("Unknown function: {0}")]
    NotFound(String),
    #[error("Invalid tool parameters: {0}")]
    InvalidParameters(String),
    #[error("Tool execution failed: {0}")]
    ExecutionFailed(String),
    #[error("Access to \"{0}\" is not allowed")]
    ResourceNotAllowed(String),
    #[error("Tool panicked: {0}")]
    Panicked(String),
}

/// A remote function call issued by the service
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Success(Value),
    Error(String),
}

/// Answer to one `ToolCallRequest`, correlated by `id`
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallResult {
    pub id: String,
    pub name: String,
    pub outcome: ToolOutcome,
}

impl ToolCallResult {
    pub fn success(request: &ToolCallRequest, value: Value) -> Self {
        Self {
            id: request.id.clone(),
            name: request.name.clone(),
            outcome: ToolOutcome::Success(value),
        }
    }

    pub fn error(request: &ToolCallRequest, message: impl Into<String>) -> Self {
        Self {
            id: request.id.clone(),
            name: request.name.clone(),
            outcome: ToolOutcome::Error(message.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Error(_))
    }

    /// The structured value sent back to the service. Errors become `{"error": msg}`.
    pub fn payload(&self) -> Value {
        match &self.outcome {
            ToolOutcome::Success(value) => value.clone(),
            ToolOutcome::Error(message) => json!({ "error": message }),
        }
    }
}

// --- Declaration schema ---

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ParamType {
    Object,
    String,
    Number,
    Integer,
    Boolean,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct PropertySchema {
    #[serde(rename = "type")]
    pub kind: ParamType,
    pub description: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ParameterSchema {
    #[serde(rename = "type")]
    pub kind: ParamType,
    pub properties: BTreeMap<String, PropertySchema>,
    pub required: Vec<String>,
}

impl ParameterSchema {
    pub fn object() -> Self {
        Self {
            kind: ParamType::Object,
            properties: BTreeMap::new(),
            required: Vec::new(),
        }
    }

    pub fn required_param(mut self, name: &str, kind: ParamType, description: &str) -> Self {
        self.required.push(name.to_string());
        self.optional_param(name, kind, description)
    }

    pub fn optional_param(mut self, name: &str, kind: ParamType, description: &str) -> Self {
        self.properties.insert(
            name.to_string(),
            PropertySchema {
                kind,
                description: description.to_string(),
            },
        );
        self
    }
}

/// Schema announced to the service for one tool
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: ParameterSchema,
}

impl FunctionDeclaration {
    pub fn new(name: &str, description: &str, parameters: ParameterSchema) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
        }
    }
}

/// Local implementation of a remote-callable function
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: &Map<String, Value>) -> Result<Value, ToolError>;
}

struct RegisteredTool {
    declaration: FunctionDeclaration,
    handler: Arc<dyn ToolHandler>,
}

/// Registration table mapping tool names to handlers and their schema
#[derive(Default)]
pub struct ToolDispatcher {
    tools: Vec<RegisteredTool>,
    index: HashMap<String, usize>,
}

impl ToolDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. A later registration under the same name replaces the earlier one.
    pub fn register<H>(&mut self, declaration: FunctionDeclaration, handler: H)
    where
        H: ToolHandler + 'static,
    {
        let tool = RegisteredTool {
            declaration,
            handler: Arc::new(handler),
        };
        match self.index.get(&tool.declaration.name) {
            Some(&slot) => self.tools[slot] = tool,
            None => {
                self.index
                    .insert(tool.declaration.name.clone(), self.tools.len());
                self.tools.push(tool);
            }
        }
    }

    /// Declarations for every registered tool, in registration order
    pub fn declarations(&self) -> Vec<FunctionDeclaration> {
        self.tools.iter().map(|t| t.declaration.clone()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Run the handler for `request`. Always produces exactly one result; unknown
    /// names, handler errors and handler panics all become error results.
    pub async fn dispatch(&self, request: &ToolCallRequest) -> ToolCallResult {
        let Some(&slot) = self.index.get(&request.name) else {
            log::warn!("🔧 Unknown tool requested: {}", request.name);
            return ToolCallResult::error(request, ToolError::NotFound(request.name.clone()).to_string());
        };
        let handler = Arc::clone(&self.tools[slot].handler);

        log::debug!("🔧 Calling {} ({})", request.name, request.id);
        match AssertUnwindSafe(handler.call(&request.arguments))
            .catch_unwind()
            .await
        {
            Ok(Ok(value)) => ToolCallResult::success(request, value),
            Ok(Err(e)) => {
                log::warn!("🔧 Tool {} failed: {}", request.name, e);
                ToolCallResult::error(request, e.to_string())
            }
            Err(panic) => {
                let e = ToolError::Panicked(panic_message(panic.as_ref()));
                log::error!("🔧 Tool {} {}", request.name, e);
                ToolCallResult::error(request, e.to_string())
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Fetch a required string argument
pub(crate) fn required_str<'a>(arguments: &'a Map<String, Value>, name: &str) -> Result<&'a str, ToolError> {
    arguments
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidParameters(format!("'{}' must be a string", name)))
}

pub(crate) fn optional_str<'a>(arguments: &'a Map<String, Value>, name: &str) -> Option<&'a str> {
    arguments.get(name).and_then(Value::as_str)
}
