//! The orchestrator: owns every running [`Cluster`], drives `start` /
//! `stop` / `kill` / `resume`, and auto-terminates a cluster once a
//! `CLUSTER_COMPLETE`/`CLUSTER_FAILED` message addressed to `system`
//! appears on its ledger.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use zeroshot_agent::{AgentDeps, AgentRuntime};
use zeroshot_exec::ProcessTaskRunner;
use zeroshot_isolation::{ContainerRuntime, IsolationManager, WorktreeManager};
use zeroshot_ledger::Ledger;
use zeroshot_logic::AgentSummary;
use zeroshot_observability::{emit_event, ObservabilityEvent, ProcessKind};
use zeroshot_types::{
    topics, Agent, ClusterConfig, ClusterRecord, ClusterState, Message, Model, Receiver,
    ZeroshotError,
};

use crate::cluster::{refresh_agents_snapshot, Cluster};
use crate::options::StartOptions;
use crate::store::ClusterStore;

pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Clone for Orchestrator {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner {
    store: Arc<dyn ClusterStore>,
    container_runtime: Arc<dyn ContainerRuntime>,
    clusters: RwLock<HashMap<String, Arc<Cluster>>>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn ClusterStore>, container_runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                container_runtime,
                clusters: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub async fn start(
        &self,
        config: ClusterConfig,
        initial_message: Message,
        options: StartOptions,
    ) -> Result<String, ZeroshotError> {
        let cluster_id = Uuid::new_v4().to_string();
        let created_at_ms = chrono::Utc::now().timestamp_millis();
        let ledger = Arc::new(Ledger::new(cluster_id.clone()));

        let isolation_state = if config.isolation {
            let manager = IsolationManager::new(self.inner.container_runtime.clone());
            let state = manager.create(&cluster_id, &options.source_root).await?;
            Some((Arc::new(manager), state))
        } else {
            None
        };

        let worktree_state = if config.worktree {
            let manager = WorktreeManager::new(options.source_root.clone());
            Some(manager.create(&cluster_id).await?)
        } else {
            None
        };

        let model_ceiling = resolve_model_ceiling(&config.max_model, options.default_model_ceiling)?;
        let cwd = agent_cwd(&isolation_state, &worktree_state, &options.source_root);
        let cluster_config_snapshot =
            serde_json::to_value(&config).unwrap_or(serde_json::Value::Null);
        let agents_snapshot = Arc::new(RwLock::new(Vec::new()));

        let mut agents = HashMap::new();
        for named in &config.agents {
            let deps = AgentDeps {
                ledger: ledger.clone(),
                isolation: isolation_state.as_ref().map(|(manager, _)| manager.clone()),
                isolation_state: isolation_state.as_ref().map(|(_, state)| state.clone()),
                worktree_enabled: worktree_state.is_some(),
                cwd: cwd.clone(),
                cluster_created_at_ms: created_at_ms,
                model_ceiling,
                cluster_config_snapshot: cluster_config_snapshot.clone(),
                agents_snapshot: agents_snapshot.clone(),
                max_tokens: options.max_tokens,
                test_mode: options.test_mode,
                task_runner: Arc::new(ProcessTaskRunner),
            };
            let agent = Agent::new(named.id.clone(), cluster_id.clone(), named.config.clone());
            agents.insert(named.id.clone(), AgentRuntime::new(agent, deps));
        }
        for runtime in agents.values() {
            runtime.start().await;
        }
        refresh_agents_snapshot(&agents, &agents_snapshot).await;

        let mut record = ClusterRecord::new(cluster_id.clone(), created_at_ms, config);
        record.isolation = isolation_state.as_ref().map(|(_, state)| state.clone());
        record.worktree = worktree_state;
        self.inner.store.save(&record).await?;

        let cluster = Arc::new(Cluster {
            id: cluster_id.clone(),
            ledger: ledger.clone(),
            agents,
            agents_snapshot,
            isolation: isolation_state.map(|(manager, _)| manager),
            isolation_state: RwLock::new(record.isolation.clone()),
            record: RwLock::new(record),
            watcher_subscription: RwLock::new(None),
        });

        self.install_watcher(cluster.clone()).await;
        self.inner.clusters.write().await.insert(cluster_id.clone(), cluster.clone());

        ledger.publish(initial_message).await;

        emit_event(
            tracing::Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "orchestrator.cluster.started",
                component: "zeroshot.orchestrator",
                cluster_id: Some(&cluster_id),
                agent_id: None,
                task_id: None,
                status: Some("running"),
                error_code: None,
                detail: None,
            },
        );

        Ok(cluster_id)
    }

    /// Stops every agent, tears down the container (workspace preserved),
    /// and persists the record as `stopped`. Records which agent (if any)
    /// was mid-`execute_task` so `resume` can pick it back up.
    pub async fn stop(&self, cluster_id: &str) -> Result<(), ZeroshotError> {
        let cluster = self.inner.clusters.write().await.remove(cluster_id);
        let Some(cluster) = cluster else {
            return Ok(());
        };

        let resumable_agent_id = self.halt_agents(&cluster).await;

        if let (Some(manager), Some(state)) =
            (&cluster.isolation, cluster.isolation_state.read().await.clone())
        {
            manager.stop(&state).await?;
        }

        let mut record = cluster.record.read().await.clone();
        record.state = ClusterState::Stopped;
        record.resumable_agent_id = resumable_agent_id;
        self.inner.store.save(&record).await?;
        Ok(())
    }

    /// Force-stops everything, deletes the workspace and the persisted
    /// record. Idempotent: a cluster with neither a live entry nor a
    /// persisted record is treated as already killed.
    pub async fn kill(&self, cluster_id: &str) -> Result<(), ZeroshotError> {
        let live = self.inner.clusters.write().await.remove(cluster_id);
        let record = match &live {
            Some(cluster) => Some(cluster.record.read().await.clone()),
            None => self.inner.store.load(cluster_id).await?,
        };
        let Some(record) = record else {
            return Ok(());
        };

        if let Some(cluster) = &live {
            self.halt_agents(cluster).await;
        }

        if let Some(isolation_state) = &record.isolation {
            let manager = IsolationManager::new(self.inner.container_runtime.clone());
            manager.kill(isolation_state).await?;
        }

        self.inner.store.delete(cluster_id).await?;
        Ok(())
    }

    /// Reloads the persisted record, recreates the container if isolated,
    /// rebuilds every agent fresh, and resumes the one that was
    /// mid-execution when the cluster was stopped.
    pub async fn resume(
        &self,
        cluster_id: &str,
        resume_context: Option<&str>,
        options: StartOptions,
    ) -> Result<(), ZeroshotError> {
        let mut record = self
            .inner
            .store
            .load(cluster_id)
            .await?
            .ok_or_else(|| ZeroshotError::Config(format!("no persisted cluster: {cluster_id}")))?;

        let isolation = if let Some(state) = &record.isolation {
            let manager = Arc::new(IsolationManager::new(self.inner.container_runtime.clone()));
            let resumed_state = manager.resume(state).await?;
            record.isolation = Some(resumed_state);
            Some(manager)
        } else {
            None
        };

        let ledger = Arc::new(Ledger::new(cluster_id.to_string()));
        let model_ceiling = resolve_model_ceiling(&record.config.max_model, options.default_model_ceiling)?;
        let cwd = agent_cwd(
            &isolation.as_ref().zip(record.isolation.clone()),
            &record.worktree,
            &options.source_root,
        );
        let cluster_config_snapshot =
            serde_json::to_value(&record.config).unwrap_or(serde_json::Value::Null);
        let agents_snapshot = Arc::new(RwLock::new(Vec::new()));

        let mut agents = HashMap::new();
        for named in &record.config.agents {
            let deps = AgentDeps {
                ledger: ledger.clone(),
                isolation: isolation.clone(),
                isolation_state: record.isolation.clone(),
                worktree_enabled: record.worktree.is_some(),
                cwd: cwd.clone(),
                cluster_created_at_ms: record.created_at_ms,
                model_ceiling,
                cluster_config_snapshot: cluster_config_snapshot.clone(),
                agents_snapshot: agents_snapshot.clone(),
                max_tokens: options.max_tokens,
                test_mode: options.test_mode,
                task_runner: Arc::new(ProcessTaskRunner),
            };
            let agent = Agent::new(named.id.clone(), cluster_id.to_string(), named.config.clone());
            agents.insert(named.id.clone(), AgentRuntime::new(agent, deps));
        }
        for runtime in agents.values() {
            runtime.start().await;
        }
        refresh_agents_snapshot(&agents, &agents_snapshot).await;

        record.state = ClusterState::Running;
        let resumable_agent_id = record.resumable_agent_id.clone();
        self.inner.store.save(&record).await?;

        let cluster = Arc::new(Cluster {
            id: cluster_id.to_string(),
            ledger: ledger.clone(),
            agents,
            agents_snapshot,
            isolation,
            isolation_state: RwLock::new(record.isolation.clone()),
            record: RwLock::new(record),
            watcher_subscription: RwLock::new(None),
        });
        self.install_watcher(cluster.clone()).await;
        self.inner
            .clusters
            .write()
            .await
            .insert(cluster_id.to_string(), cluster.clone());

        if let Some(resumable_id) = resumable_agent_id {
            if let Some(runtime) = cluster.agents.get(&resumable_id) {
                runtime.resume(resume_context.unwrap_or_default()).await;
            }
        }

        Ok(())
    }

    pub async fn get_cluster(&self, cluster_id: &str) -> Result<Option<ClusterRecord>, ZeroshotError> {
        if let Some(cluster) = self.inner.clusters.read().await.get(cluster_id) {
            return Ok(Some(cluster.record.read().await.clone()));
        }
        self.inner.store.load(cluster_id).await
    }

    pub async fn list_agents(&self, cluster_id: &str) -> Vec<AgentSummary> {
        match self.inner.clusters.read().await.get(cluster_id) {
            Some(cluster) => cluster.agents_snapshot.read().await.clone(),
            None => Vec::new(),
        }
    }

    pub async fn kill_all(&self) -> Result<(), ZeroshotError> {
        let live_ids: Vec<String> = self.inner.clusters.read().await.keys().cloned().collect();
        let persisted_ids = self.inner.store.list().await?;
        let mut ids: Vec<String> = live_ids;
        for id in persisted_ids {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        for id in ids {
            self.kill(&id).await?;
        }
        Ok(())
    }

    /// Stops every agent runtime and reports the id of whichever agent
    /// was mid-`execute_task` (its mutex-held `current_task` still set),
    /// the cluster's resumption point.
    async fn halt_agents(&self, cluster: &Cluster) -> Option<String> {
        let mut resumable = None;
        for (id, runtime) in &cluster.agents {
            runtime.stop().await;
            if runtime.snapshot().await.is_executing() {
                resumable = Some(id.clone());
            }
        }
        if let Some(sub_id) = cluster.watcher_subscription.write().await.take() {
            cluster.ledger.unsubscribe(sub_id).await;
        }
        resumable
    }

    /// Subscribes once per cluster: refreshes the agent-roster snapshot
    /// on every message, and on `CLUSTER_COMPLETE`/`CLUSTER_FAILED`
    /// addressed to `system`, auto-terminates.
    async fn install_watcher(&self, cluster: Arc<Cluster>) {
        let inner = self.inner.clone();
        let watcher_cluster = cluster.clone();
        let sub_id = cluster
            .ledger
            .subscribe(Arc::new(move |msg: &Message| {
                let inner = inner.clone();
                let cluster = watcher_cluster.clone();
                let msg = msg.clone();
                tokio::spawn(async move {
                    refresh_agents_snapshot(&cluster.agents, &cluster.agents_snapshot).await;

                    if msg.receiver != Receiver::System {
                        return;
                    }
                    let terminal_state = if msg.topic == topics::CLUSTER_COMPLETE {
                        Some(ClusterState::Completed)
                    } else if msg.topic == topics::CLUSTER_FAILED {
                        Some(ClusterState::Failed)
                    } else {
                        None
                    };
                    if let Some(state) = terminal_state {
                        inner.auto_terminate(&cluster, state).await;
                    }
                });
            }))
            .await;
        *cluster.watcher_subscription.write().await = Some(sub_id);
    }
}

impl Inner {
    async fn auto_terminate(&self, cluster: &Arc<Cluster>, final_state: ClusterState) {
        let removed = self.clusters.write().await.remove(&cluster.id);
        let Some(cluster) = removed else {
            return;
        };

        for runtime in cluster.agents.values() {
            runtime.stop().await;
        }
        if let Some(sub_id) = cluster.watcher_subscription.write().await.take() {
            cluster.ledger.unsubscribe(sub_id).await;
        }
        if let (Some(manager), Some(state)) =
            (&cluster.isolation, cluster.isolation_state.read().await.clone())
        {
            let _ = manager.stop(&state).await;
        }

        let mut record = cluster.record.read().await.clone();
        record.state = final_state;
        if let Err(err) = self.store.save(&record).await {
            emit_event(
                tracing::Level::WARN,
                ProcessKind::Engine,
                ObservabilityEvent {
                    event: "orchestrator.auto_terminate.persist_failed",
                    component: "zeroshot.orchestrator",
                    cluster_id: Some(&cluster.id),
                    agent_id: None,
                    task_id: None,
                    status: Some("warn"),
                    error_code: None,
                    detail: Some(&err.to_string()),
                },
            );
        }
    }
}

fn resolve_model_ceiling(max_model: &Option<String>, default: Model) -> Result<Model, ZeroshotError> {
    match max_model {
        None => Ok(default),
        Some(raw) => {
            Model::parse(raw).ok_or_else(|| ZeroshotError::Config(format!("unknown max_model: {raw}")))
        }
    }
}

fn agent_cwd<T>(
    isolation_state: &Option<(T, zeroshot_types::IsolationState)>,
    worktree_state: &Option<zeroshot_types::WorktreeState>,
    source_root: &PathBuf,
) -> PathBuf {
    if let Some((_, state)) = isolation_state {
        return PathBuf::from(&state.work_dir);
    }
    if let Some(state) = worktree_state {
        return PathBuf::from(&state.work_dir);
    }
    source_root.clone()
}
