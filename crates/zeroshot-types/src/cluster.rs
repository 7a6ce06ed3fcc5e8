use serde::{Deserialize, Serialize};

use crate::agent::AgentConfig;
use crate::isolation::{IsolationState, WorktreeState};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClusterState {
    Running,
    Stopping,
    Stopped,
    Completed,
    Failed,
    Killed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureInfo {
    pub reason: String,
    pub occurred_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// The operator-authored cluster config: named agents plus the top-level
/// isolation/worktree switches consulted at `start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    pub agents: Vec<NamedAgentConfig>,
    #[serde(default)]
    pub max_model: Option<String>,
    #[serde(default)]
    pub isolation: bool,
    #[serde(default)]
    pub worktree: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedAgentConfig {
    pub id: String,
    #[serde(flatten)]
    pub config: AgentConfig,
}

/// The persisted, on-disk shape of a cluster. The live runtime `Cluster`
/// (owning the ledger and agent handles) is assembled from this plus the
/// in-memory engine state; see `zeroshot-orchestrator`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub schema_version: u32,
    pub id: String,
    pub created_at_ms: i64,
    pub state: ClusterState,
    pub config: ClusterConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation: Option<IsolationState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree: Option<WorktreeState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<FailureInfo>,
    /// id of the agent that was mid-`execute_task` when the cluster was
    /// last stopped, consulted by `resume`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumable_agent_id: Option<String>,
}

pub const CLUSTER_RECORD_SCHEMA_VERSION: u32 = 1;

impl ClusterRecord {
    pub fn new(id: impl Into<String>, created_at_ms: i64, config: ClusterConfig) -> Self {
        Self {
            schema_version: CLUSTER_RECORD_SCHEMA_VERSION,
            id: id.into(),
            created_at_ms,
            state: ClusterState::Running,
            config,
            isolation: None,
            worktree: None,
            failure_info: None,
            resumable_agent_id: None,
        }
    }
}
