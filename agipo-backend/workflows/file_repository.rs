use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::repository::{StoredWorkflow, WorkflowRepository};

/// JSON files at `<data_dir>/workflows/<id>.json`, cached in memory.
pub struct FileWorkflowRepository {
    workflows: RwLock<HashMap<String, StoredWorkflow>>,
    dir: PathBuf,
}

impl FileWorkflowRepository {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
            dir: data_dir.as_ref().join("workflows"),
        }
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !id.starts_with('.');
        if !valid {
            bail!("invalid workflow id: {id:?}");
        }
        Ok(self.dir.join(format!("{id}.json")))
    }
}

#[async_trait]
impl WorkflowRepository for FileWorkflowRepository {
    async fn list(&self) -> Vec<StoredWorkflow> {
        let mut all: Vec<_> = self.workflows.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    async fn get(&self, id: &str) -> Option<StoredWorkflow> {
        self.workflows.read().await.get(id).cloned()
    }

    async fn save(&self, mut workflow: StoredWorkflow) -> Result<StoredWorkflow> {
        let path = self.path_for(&workflow.id)?;
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;

        workflow.last_modified = Some(Utc::now());
        let content = serde_json::to_string_pretty(&workflow)?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to replace {}", path.display()))?;

        tracing::debug!(id = %workflow.id, "saved workflow");
        self.workflows
            .write()
            .await
            .insert(workflow.id.clone(), workflow.clone());
        Ok(workflow)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let path = self.path_for(id)?;
        let existed = self.workflows.write().await.remove(id).is_some();
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
        }
        Ok(existed)
    }

    async fn load_all(&self) -> Result<()> {
        if !self.dir.exists() {
            std::fs::create_dir_all(&self.dir)
                .with_context(|| format!("failed to create {}", self.dir.display()))?;
            return Ok(());
        }

        let mut map = HashMap::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(&path) {
                Ok(content) => match serde_json::from_str::<StoredWorkflow>(&content) {
                    Ok(workflow) => {
                        map.insert(workflow.id.clone(), workflow);
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "failed to parse workflow file");
                    }
                },
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to read workflow file");
                }
            }
        }

        tracing::info!(count = map.len(), "loaded workflows");
        *self.workflows.write().await = map;
        Ok(())
    }
}
