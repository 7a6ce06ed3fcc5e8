use std::sync::Arc;

use zeroshot_ledger::Ledger;
use zeroshot_types::Message;

/// Minimal view of one agent exposed to scripts via `cluster.getAgents()`
/// and `agent.{id,role,iteration}` — never the live `Agent` itself.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AgentSummary {
    pub id: String,
    pub role: String,
    pub iteration: u32,
}

/// Everything a single `evaluate` call needs. Built fresh by the caller
/// (the agent state machine) for every trigger evaluation — there is no
/// persistent sandbox state across calls.
pub struct LogicContext {
    pub ledger: Arc<Ledger>,
    pub cluster_id: String,
    pub cluster_created_at_ms: i64,
    pub agents: Vec<AgentSummary>,
    pub agent: AgentSummary,
    pub message: Message,
    /// Snapshot consulted by `helpers.getConfig` — operator-defined cluster
    /// metadata, not secrets or credentials.
    pub config: serde_json::Value,
}
