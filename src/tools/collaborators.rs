//! Host application services the built-in tools act on.
//!
//! These are only ever called from tool handlers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CollaboratorError {
    #[error("Query failed: {0}")]
    Query(String),
    #[error("Unavailable: {0}")]
    Unavailable(String),
    #[error("Navigation failed: {0}")]
    Navigation(String),
}

/// Read access to the platform's data tables
#[async_trait]
pub trait DataQuery: Send + Sync {
    async fn query(&self, resource: &str) -> Result<Vec<Value>, CollaboratorError>;
}

/// Where the host should take the user
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NavigationTarget {
    pub view: String,
    pub id: Option<String>,
    pub sub_id: Option<String>,
    pub term: Option<String>,
}

/// Moves the host UI to another view
pub trait Navigator: Send + Sync {
    fn navigate(&self, target: NavigationTarget) -> Result<(), CollaboratorError>;
}

/// A piece of study content located by name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRef {
    pub id: String,
    pub name: String,
}

/// Finds content by (partial) name within a view
#[async_trait]
pub trait ContentLookup: Send + Sync {
    async fn find(&self, view: &str, search_term: &str) -> Result<Option<ContentRef>, CollaboratorError>;
}
