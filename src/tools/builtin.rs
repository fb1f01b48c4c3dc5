//! The tutor's built-in tools: navigation, content lookup, table listing and
//! speech speed.

use super::collaborators::{ContentLookup, DataQuery, NavigationTarget, Navigator};
use super::{
    optional_str, required_str, FunctionDeclaration, ParamType, ParameterSchema, ToolDispatcher, ToolError,
    ToolHandler,
};
use crate::config::{SpeechRate, SpeechRateControl};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;

pub const NAVIGATE_TO: &str = "navigateTo";
pub const FIND_CONTENT: &str = "findContent";
pub const QUERY_DATA: &str = "queryData";
pub const ADJUST_PLAYBACK_SPEED: &str = "adjustPlaybackSpeed";

/// Tables the data-query tool may read. Anything else is refused before the
/// collaborator is reached.
pub const ALLOWED_TABLES: [&str; 2] = ["question_notebooks", "sources"];

pub struct NavigateTo {
    navigator: Arc<dyn Navigator>,
    views: Vec<String>,
}

impl NavigateTo {
    pub fn new(navigator: Arc<dyn Navigator>, views: Vec<String>) -> Self {
        Self { navigator, views }
    }

    pub fn declaration() -> FunctionDeclaration {
        FunctionDeclaration::new(
            NAVIGATE_TO,
            "Navigate to a view of the app and optionally focus an item or apply a filter.",
            ParameterSchema::object()
                .required_param("viewName", ParamType::String, "Exact name of the view (e.g. \"Questões\", \"Resumos\").")
                .optional_param("id", ParamType::String, "ID of the item to open, e.g. a question notebook.")
                .optional_param("subId", ParamType::String, "ID of a sub-item to focus, e.g. a question inside a notebook.")
                .optional_param("term", ParamType::String, "Term used to filter the view's content."),
        )
    }
}

#[async_trait]
impl ToolHandler for NavigateTo {
    async fn call(&self, arguments: &Map<String, Value>) -> Result<Value, ToolError> {
        let requested = required_str(arguments, "viewName")?;
        let wanted = requested.to_lowercase();
        let view = self
            .views
            .iter()
            .find(|v| v.to_lowercase() == wanted)
            .ok_or_else(|| ToolError::ExecutionFailed(format!("View \"{}\" not found", requested)))?;

        self.navigator
            .navigate(NavigationTarget {
                view: view.clone(),
                id: optional_str(arguments, "id").map(str::to_string),
                sub_id: optional_str(arguments, "subId").map(str::to_string),
                term: optional_str(arguments, "term").map(str::to_string),
            })
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

        log::info!("🧭 Navigating to {}", view);
        Ok(json!({ "success": format!("Navigating to {}.", view) }))
    }
}

pub struct FindContent {
    lookup: Arc<dyn ContentLookup>,
}

impl FindContent {
    pub fn new(lookup: Arc<dyn ContentLookup>) -> Self {
        Self { lookup }
    }

    pub fn declaration() -> FunctionDeclaration {
        FunctionDeclaration::new(
            FIND_CONTENT,
            "Find a content item (question notebook or summary) by name and return its ID. Use this before navigateTo when you have a name but no ID.",
            ParameterSchema::object()
                .required_param("viewName", ParamType::String, "Content category to search (\"Questões\" for notebooks, \"Resumos\" for summaries).")
                .required_param("searchTerm", ParamType::String, "Name or part of the name of the content."),
        )
    }
}

#[async_trait]
impl ToolHandler for FindContent {
    async fn call(&self, arguments: &Map<String, Value>) -> Result<Value, ToolError> {
        let view = required_str(arguments, "viewName")?;
        let term = required_str(arguments, "searchTerm")?;

        match self.lookup.find(view, term).await {
            Ok(Some(found)) => Ok(json!({ "id": found.id, "name": found.name })),
            Ok(None) => Err(ToolError::ExecutionFailed(format!(
                "No content found in \"{}\" matching \"{}\"",
                view, term
            ))),
            Err(e) => Err(ToolError::ExecutionFailed(e.to_string())),
        }
    }
}

pub struct QueryData {
    data: Arc<dyn DataQuery>,
}

impl QueryData {
    pub fn new(data: Arc<dyn DataQuery>) -> Self {
        Self { data }
    }

    pub fn declaration() -> FunctionDeclaration {
        FunctionDeclaration::new(
            QUERY_DATA,
            "List the items of a database table. Useful to discover what is available, e.g. notebooks or sources.",
            ParameterSchema::object().required_param(
                "tableName",
                ParamType::String,
                "Table to read (allowed: \"question_notebooks\", \"sources\").",
            ),
        )
    }
}

#[async_trait]
impl ToolHandler for QueryData {
    async fn call(&self, arguments: &Map<String, Value>) -> Result<Value, ToolError> {
        let table = required_str(arguments, "tableName")?;
        if !ALLOWED_TABLES.contains(&table) {
            log::warn!("🔒 Refused query on table {}", table);
            return Err(ToolError::ResourceNotAllowed(table.to_string()));
        }

        let items = self
            .data
            .query(table)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("Error querying table: {}", e)))?;
        Ok(json!({ "items": items }))
    }
}

pub struct AdjustPlaybackSpeed {
    rate: SpeechRateControl,
}

impl AdjustPlaybackSpeed {
    pub fn new(rate: SpeechRateControl) -> Self {
        Self { rate }
    }

    pub fn declaration() -> FunctionDeclaration {
        FunctionDeclaration::new(
            ADJUST_PLAYBACK_SPEED,
            "Make my speech faster or slower.",
            ParameterSchema::object().required_param(
                "speed",
                ParamType::Number,
                "New playback speed. Allowed values: 0.85 (slow), 1.0 (normal), 1.15 (fast).",
            ),
        )
    }
}

#[async_trait]
impl ToolHandler for AdjustPlaybackSpeed {
    async fn call(&self, arguments: &Map<String, Value>) -> Result<Value, ToolError> {
        let rate = arguments
            .get("speed")
            .and_then(Value::as_f64)
            .and_then(SpeechRate::from_factor)
            .ok_or_else(|| {
                ToolError::InvalidParameters("Invalid speed. Allowed values are 0.85, 1.0, 1.15.".to_string())
            })?;

        self.rate.set(rate);
        log::info!("🐢 Speech rate set to {}", rate.factor());
        Ok(json!({ "success": format!("Speech speed set to {}.", rate.factor()) }))
    }
}

/// Everything the built-in tools need from the host
pub struct BuiltinCollaborators {
    pub navigator: Arc<dyn Navigator>,
    pub lookup: Arc<dyn ContentLookup>,
    pub data: Arc<dyn DataQuery>,
    pub views: Vec<String>,
    pub speech_rate: SpeechRateControl,
}

/// Register the four built-in tools
pub fn register_builtin_tools(dispatcher: &mut ToolDispatcher, collaborators: BuiltinCollaborators) {
    dispatcher.register(
        NavigateTo::declaration(),
        NavigateTo::new(collaborators.navigator, collaborators.views),
    );
    dispatcher.register(FindContent::declaration(), FindContent::new(collaborators.lookup));
    dispatcher.register(QueryData::declaration(), QueryData::new(collaborators.data));
    dispatcher.register(
        AdjustPlaybackSpeed::declaration(),
        AdjustPlaybackSpeed::new(collaborators.speech_rate),
    );
}
