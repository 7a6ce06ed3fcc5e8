use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationState {
    pub enabled: bool,
    pub cluster_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    pub work_dir: String,
    /// opaque handle identifying the manager instance that owns this
    /// container, used to route `execInContainer`/`spawnInContainer` calls
    pub manager: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeState {
    pub enabled: bool,
    pub branch: String,
    pub work_dir: String,
}
