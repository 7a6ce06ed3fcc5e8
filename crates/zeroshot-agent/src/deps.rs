use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;

use zeroshot_isolation::IsolationManager;
use zeroshot_ledger::Ledger;
use zeroshot_logic::AgentSummary;
use zeroshot_types::{IsolationState, Model};

/// Everything an [`crate::AgentRuntime`] needs that isn't carried on the
/// `Agent` value itself: the cluster's shared ledger, its isolation
/// backend (if any), and the roster snapshot scripts and hooks see via
/// `cluster.getAgents()`. One `AgentDeps` is built per cluster and cloned
/// (cheaply — everything inside is `Arc`) into each agent's runtime.
#[derive(Clone)]
pub struct AgentDeps {
    pub ledger: Arc<Ledger>,
    pub isolation: Option<Arc<IsolationManager>>,
    pub isolation_state: Option<IsolationState>,
    pub worktree_enabled: bool,
    pub cwd: PathBuf,
    pub cluster_created_at_ms: i64,
    pub model_ceiling: Model,
    /// Snapshot of the operator's cluster config, surfaced to scripts and
    /// hooks via `helpers.getConfig()` — never secrets.
    pub cluster_config_snapshot: serde_json::Value,
    /// Shared across every agent in the cluster; the orchestrator keeps it
    /// current as agents start, finish iterations, and stop.
    pub agents_snapshot: Arc<RwLock<Vec<AgentSummary>>>,
    /// Legacy token-count ceiling threaded into context assembly.
    pub max_tokens: Option<u32>,
    /// Skips validator jitter sleeps; set by test harnesses only.
    pub test_mode: bool,
    /// Drives the `task` CLI on the host execution path.
    pub task_runner: Arc<dyn zeroshot_exec::TaskRunnerClient>,
}
