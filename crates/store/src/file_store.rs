//! Flat-file store.
//!
//! Layout under the data directory:
//!
//! ```text
//! flows/<id>.toml                 flow definitions
//! instances/<id>.json             instance header (status, current node, counters)
//! instances/<id>.steps.jsonl      one Step per line, append-only
//! ```
//!
//! Headers are replaced through a temp file and rename. Step files are only
//! ever opened in append mode.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use superego_core::error::StoreError;
use superego_core::flow::FlowDefinition;
use superego_core::instance::{FlowInstance, FlowRecord};
use superego_core::step::Step;
use superego_core::store::FlowStore;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

pub struct FileFlowStore {
    root: PathBuf,
}

impl FileFlowStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        debug!(root = %root.display(), "File flow store opened");
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn flows_dir(&self) -> PathBuf {
        self.root.join("flows")
    }

    fn instances_dir(&self) -> PathBuf {
        self.root.join("instances")
    }

    fn definition_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        Ok(self.flows_dir().join(format!("{}.toml", checked_id(id)?)))
    }

    fn header_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        Ok(self.instances_dir().join(format!("{}.json", checked_id(id)?)))
    }

    fn steps_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        Ok(self.instances_dir().join(format!("{}.steps.jsonl", checked_id(id)?)))
    }

    async fn read_header(&self, path: &Path) -> Result<FlowInstance, StoreError> {
        let text = tokio::fs::read_to_string(path).await.map_err(io_err)?;
        serde_json::from_str(&text).map_err(|e| StoreError::Corrupted {
            location: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    async fn read_steps(&self, id: &str) -> Result<FlowRecord, StoreError> {
        let path = self.steps_path(id)?;
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(FlowRecord::new()),
            Err(e) => return Err(io_err(e)),
        };

        let steps: Vec<Step> = text
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .filter_map(|(n, line)| match serde_json::from_str::<Step>(line) {
                Ok(step) => Some(step),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        line = n + 1,
                        error = %e,
                        "Skipping corrupted step line"
                    );
                    None
                }
            })
            .collect();
        Ok(FlowRecord::from(steps))
    }
}

/// Ids become file names, so anything that could escape the directory is refused.
fn checked_id(id: &str) -> Result<&str, StoreError> {
    let bad = id.is_empty()
        || id.starts_with('.')
        || id.chars().any(|c| matches!(c, '/' | '\\' | '\0'));
    if bad {
        return Err(StoreError::Storage(format!("invalid id '{id}'")));
    }
    Ok(id)
}

fn io_err(e: std::io::Error) -> StoreError {
    StoreError::Storage(e.to_string())
}

async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, contents).await.map_err(io_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(io_err)
}

#[async_trait]
impl FlowStore for FileFlowStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn load_flow_definition(&self, id: &str) -> Result<FlowDefinition, StoreError> {
        let path = self.definition_path(id)?;
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::DefinitionNotFound(id.to_string()));
            }
            Err(e) => return Err(io_err(e)),
        };
        toml::from_str(&text).map_err(|e| StoreError::Corrupted {
            location: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    async fn list_flow_definitions(&self) -> Result<Vec<FlowDefinition>, StoreError> {
        let mut entries = match tokio::fs::read_dir(self.flows_dir()).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(e)),
        };

        let mut defs = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.load_flow_definition(stem).await {
                Ok(def) => defs.push(def),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable flow definition"),
            }
        }
        defs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(defs)
    }

    async fn save_flow_definition(&self, definition: &FlowDefinition) -> Result<(), StoreError> {
        let text = toml::to_string_pretty(definition)
            .map_err(|e| StoreError::Storage(format!("serialize flow '{}': {e}", definition.id)))?;
        write_atomic(&self.definition_path(&definition.id)?, text.as_bytes()).await
    }

    async fn save_instance(&self, instance: &FlowInstance) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(&instance.header())
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        write_atomic(&self.header_path(&instance.id)?, &json).await
    }

    async fn append_step(&self, instance_id: &str, step: &Step) -> Result<(), StoreError> {
        let header = self.header_path(instance_id)?;
        if tokio::fs::metadata(&header).await.is_err() {
            return Err(StoreError::InstanceNotFound(instance_id.to_string()));
        }

        let mut line = serde_json::to_vec(step).map_err(|e| StoreError::Storage(e.to_string()))?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.steps_path(instance_id)?)
            .await
            .map_err(io_err)?;
        file.write_all(&line).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)
    }

    async fn load_instance(&self, id: &str) -> Result<FlowInstance, StoreError> {
        let header = self.header_path(id)?;
        if tokio::fs::metadata(&header).await.is_err() {
            return Err(StoreError::InstanceNotFound(id.to_string()));
        }
        let mut instance = self.read_header(&header).await?;
        instance.record = self.read_steps(id).await?;
        Ok(instance)
    }

    async fn list_instances(&self) -> Result<Vec<FlowInstance>, StoreError> {
        let mut entries = match tokio::fs::read_dir(self.instances_dir()).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(e)),
        };

        let mut headers = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.read_header(&path).await {
                Ok(h) => headers.push(h),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable instance header"),
            }
        }
        headers.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(headers)
    }
}
