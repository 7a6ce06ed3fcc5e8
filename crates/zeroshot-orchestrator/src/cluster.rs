use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use zeroshot_agent::AgentRuntime;
use zeroshot_isolation::IsolationManager;
use zeroshot_ledger::{Ledger, SubscriptionId};
use zeroshot_logic::AgentSummary;
use zeroshot_types::{ClusterRecord, IsolationState};

/// One running cluster: its ledger, its agents, and the handles needed to
/// tear it down. Lives in the orchestrator's in-memory map for as long as
/// the cluster is `running`; `stop`/`kill`/auto-termination remove it.
pub struct Cluster {
    pub id: String,
    pub ledger: Arc<Ledger>,
    pub agents: HashMap<String, Arc<AgentRuntime>>,
    pub agents_snapshot: Arc<RwLock<Vec<AgentSummary>>>,
    pub isolation: Option<Arc<IsolationManager>>,
    pub isolation_state: RwLock<Option<IsolationState>>,
    pub record: RwLock<ClusterRecord>,
    /// The subscription watching for `CLUSTER_COMPLETE`/`CLUSTER_FAILED`
    /// and refreshing `agents_snapshot`; torn down alongside the cluster.
    pub watcher_subscription: RwLock<Option<SubscriptionId>>,
}

pub async fn refresh_agents_snapshot(
    agents: &HashMap<String, Arc<AgentRuntime>>,
    snapshot: &RwLock<Vec<AgentSummary>>,
) {
    let mut summaries = Vec::with_capacity(agents.len());
    for runtime in agents.values() {
        let agent = runtime.snapshot().await;
        summaries.push(AgentSummary {
            id: agent.id,
            role: agent.config.role,
            iteration: agent.iteration,
        });
    }
    *snapshot.write().await = summaries;
}
