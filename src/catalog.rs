//! In-memory study catalog loaded from a JSON file.
//!
//! Stands in for the platform's hosted tables when running the agent locally:
//!
//! ```json
//! {
//!   "question_notebooks": [{ "id": "nb-1", "name": "Estudos do BCB" }],
//!   "sources": [{ "id": "src-1", "title": "SFN", "summaries": [{ "id": "sum-1", "title": "COPOM" }] }]
//! }
//! ```

use crate::tools::collaborators::{CollaboratorError, ContentLookup, ContentRef, DataQuery};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Failed to read catalog: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid catalog JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Notebook {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Summary {
    pub id: String,
    pub title: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Source {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub summaries: Vec<Summary>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct StudyCatalog {
    #[serde(default)]
    pub question_notebooks: Vec<Notebook>,
    #[serde(default)]
    pub sources: Vec<Source>,
}

impl StudyCatalog {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, CatalogError> {
        Ok(serde_json::from_str(text)?)
    }

    fn rows<T: Serialize>(items: &[T]) -> Result<Vec<Value>, CollaboratorError> {
        items
            .iter()
            .map(|item| serde_json::to_value(item).map_err(|e| CollaboratorError::Query(e.to_string())))
            .collect()
    }
}

#[async_trait]
impl DataQuery for StudyCatalog {
    async fn query(&self, resource: &str) -> Result<Vec<Value>, CollaboratorError> {
        match resource {
            "question_notebooks" => Self::rows(&self.question_notebooks),
            "sources" => Self::rows(&self.sources),
            other => Err(CollaboratorError::Query(format!("no such table: {}", other))),
        }
    }
}

#[async_trait]
impl ContentLookup for StudyCatalog {
    async fn find(&self, view: &str, search_term: &str) -> Result<Option<ContentRef>, CollaboratorError> {
        let term = search_term.to_lowercase();
        let found = match view.to_lowercase().as_str() {
            "questões" => self
                .question_notebooks
                .iter()
                .find(|n| n.name.to_lowercase().contains(&term))
                .map(|n| ContentRef {
                    id: n.id.clone(),
                    name: n.name.clone(),
                }),
            "resumos" => self
                .sources
                .iter()
                .flat_map(|s| s.summaries.iter())
                .find(|s| s.title.to_lowercase().contains(&term))
                .map(|s| ContentRef {
                    id: s.id.clone(),
                    name: s.title.clone(),
                }),
            _ => None,
        };
        Ok(found)
    }
}
