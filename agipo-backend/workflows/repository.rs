use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Edge, Node, Workflow};

/// A workflow as persisted: the graph plus its identity and bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredWorkflow {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_keys: Option<BTreeMap<String, String>>,
}

impl StoredWorkflow {
    pub fn new(id: impl Into<String>, name: impl Into<String>, workflow: Workflow) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            nodes: workflow.nodes,
            edges: workflow.edges,
            last_modified: None,
            api_keys: None,
        }
    }

    pub fn workflow(&self) -> Workflow {
        Workflow::new(self.nodes.clone(), self.edges.clone())
    }
}

#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    async fn list(&self) -> Vec<StoredWorkflow>;
    async fn get(&self, id: &str) -> Option<StoredWorkflow>;
    /// Persist and return the document as stored, with `last_modified` stamped.
    async fn save(&self, workflow: StoredWorkflow) -> Result<StoredWorkflow>;
    async fn delete(&self, id: &str) -> Result<bool>;
    async fn load_all(&self) -> Result<()>;
}
