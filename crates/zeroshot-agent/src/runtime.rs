//! The per-agent state machine. One [`AgentRuntime`] owns exactly one
//! [`Agent`] value, subscribes it to the cluster ledger, and serializes
//! every trigger it fires through to completion: a busy agent's mutex
//! stays locked for the whole evaluate → build-context → execute → hook
//! pipeline, so a second matching message during that window is dropped
//! rather than queued, matching an agent that can run exactly one task
//! at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use zeroshot_context::{ContextBuilder, ContextInputs};
use zeroshot_exec::{ExecutionMode, TaskExecutor};
use zeroshot_hooks::{execute_hook, HookContext};
use zeroshot_ledger::SubscriptionId;
use zeroshot_logic::{AgentSummary, LogicContext, LogicSandbox};
use zeroshot_observability::{emit_event, ObservabilityEvent, ProcessKind};
use zeroshot_types::{
    topics, Agent, AgentState, Hook, Message, MessageContent, Receiver, TriggerAction,
};

use crate::deps::AgentDeps;

const MAX_VALIDATOR_JITTER_MS: u64 = 15_000;
const LOCK_CONTENTION_JITTER_MIN_MS: u64 = 10_000;
const LOCK_CONTENTION_JITTER_MAX_MS: u64 = 30_000;
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);
const VALIDATOR_FALLBACK_TOPIC: &str = "VALIDATION_RESULT";

/// Owns one agent's mutable state and drives it through the lifecycle
/// described by the cluster's trigger/logic/hook configuration.
pub struct AgentRuntime {
    data: AsyncMutex<Agent>,
    deps: AgentDeps,
    executor: TaskExecutor,
    running: AtomicBool,
    subscription: std::sync::Mutex<Option<SubscriptionId>>,
    inflight: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    current_cancel: std::sync::Mutex<Option<CancellationToken>>,
}

impl AgentRuntime {
    pub fn new(agent: Agent, deps: AgentDeps) -> Arc<Self> {
        let executor = TaskExecutor::new(deps.ledger.clone());
        Arc::new(Self {
            data: AsyncMutex::new(agent),
            deps,
            executor,
            running: AtomicBool::new(false),
            subscription: std::sync::Mutex::new(None),
            inflight: std::sync::Mutex::new(None),
            current_cancel: std::sync::Mutex::new(None),
        })
    }

    pub async fn snapshot(&self) -> Agent {
        self.data.lock().await.clone()
    }

    /// Subscribes to the ledger. Every delivered message is handled on
    /// its own spawned task so a slow or busy agent never blocks
    /// `Ledger::publish` for the cluster's other subscribers.
    pub async fn start(self: &Arc<Self>) {
        self.running.store(true, Ordering::Release);
        let dispatch = self.clone();
        let sub_id = self
            .deps
            .ledger
            .subscribe(Arc::new(move |msg: &Message| {
                let dispatch = dispatch.clone();
                let msg = msg.clone();
                let handle = tokio::spawn(async move { dispatch.handle_message(msg).await });
                *dispatch.inflight.lock().unwrap() = Some(handle);
            }))
            .await;
        *self.subscription.lock().unwrap() = Some(sub_id);
    }

    /// Clears the subscription, kills whatever task is in flight, and
    /// waits up to five seconds for the current trigger handling to
    /// finish before returning.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::Release);

        let sub_id = self.subscription.lock().unwrap().take();
        if let Some(sub_id) = sub_id {
            self.deps.ledger.unsubscribe(sub_id).await;
        }

        if let Some(cancel) = self.current_cancel.lock().unwrap().clone() {
            cancel.cancel();
        }

        let task_id = { self.data.lock().await.current_task_id.clone() };
        if let Some(task_id) = task_id {
            self.executor.kill_task(&self.execution_mode(), &task_id).await;
        }

        let handle = self.inflight.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(STOP_GRACE_PERIOD, handle).await;
        }
    }

    /// Bypasses trigger matching entirely: fabricates an `AGENT_RESUME`
    /// message and drives `execute_task` directly, used to pick a
    /// cluster's in-flight agent back up after a restart.
    pub async fn resume(&self, resume_context: &str) {
        let message = {
            let agent = self.data.lock().await;
            Message::new(
                agent.cluster_id.clone(),
                topics::AGENT_RESUME,
                "system",
                Receiver::Broadcast,
                MessageContent::text(resume_context),
            )
        };
        let stamped = self.deps.ledger.publish(message).await;

        self.running.store(true, Ordering::Release);
        let mut agent = self.data.lock().await;
        self.run_execute_task(&mut agent, stamped).await;
    }

    async fn handle_message(self: Arc<Self>, msg: Message) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }

        let mut agent = match self.data.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::debug!(agent = %msg.sender, topic = %msg.topic, "dropping trigger: agent busy");
                return;
            }
        };

        if agent.state != AgentState::Idle {
            tracing::debug!(agent = %agent.id, state = ?agent.state, "dropping trigger: agent not idle");
            return;
        }

        let Some(trigger) = agent
            .config
            .triggers
            .iter()
            .find(|t| t.matches_topic(&msg.topic))
            .cloned()
        else {
            return;
        };

        agent.state = AgentState::EvaluatingLogic;

        if let Some(script) = trigger.logic.clone() {
            let logic_ctx = self.logic_context(&agent, &msg).await;
            let passed = LogicSandbox::new().evaluate(&script, logic_ctx).await;
            if !passed {
                agent.state = AgentState::Idle;
                return;
            }
        }

        match trigger.action {
            TriggerAction::StopCluster => {
                self.publish(&agent.id, topics::CLUSTER_COMPLETE, Receiver::System, serde_json::json!({}))
                    .await;
                agent.state = AgentState::Completed;
            }
            TriggerAction::ExecuteTask => {
                self.run_execute_task(&mut agent, msg).await;
            }
        }
    }

    /// The retry loop described for task execution: up to `maxRetries`
    /// attempts, each running `onStart` → context build → task spawn →
    /// `onComplete`/`onError`, with exponential backoff (plus an extra
    /// jittered sleep on lock contention) between failed attempts.
    async fn run_execute_task(&self, agent: &mut Agent, trigger_message: Message) {
        let max_retries = agent.config.max_retries.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            if let Some(hook) = agent.config.on_start.clone() {
                let hook_ctx = self.hook_context(agent, &trigger_message, None).await;
                if let Err(err) = execute_hook(&hook, &hook_ctx).await {
                    if attempt >= max_retries {
                        self.finalize_failure(agent, &trigger_message, format!("onStart hook failed: {err}"))
                            .await;
                        return;
                    }
                    self.sleep_backoff(attempt, false).await;
                    continue;
                }
            }

            if agent.iteration >= agent.config.max_iterations {
                self.publish(
                    &agent.id,
                    topics::CLUSTER_FAILED,
                    Receiver::System,
                    serde_json::json!({ "reason": "max_iterations" }),
                )
                .await;
                agent.current_task = None;
                agent.state = AgentState::Failed;
                return;
            }
            agent.iteration += 1;

            let prompt = match agent.config.prompt.resolve(agent.iteration) {
                Ok(prompt) => prompt,
                Err(err) => {
                    self.finalize_failure(agent, &trigger_message, format!("prompt resolution failed: {err}"))
                        .await;
                    return;
                }
            };

            agent.state = AgentState::BuildingContext;
            let context_str = {
                let builder = ContextBuilder::new(&self.deps.ledger);
                let inputs = ContextInputs {
                    agent,
                    cluster_created_at_ms: self.deps.cluster_created_at_ms,
                    isolation_enabled: self.deps.isolation.is_some(),
                    worktree_enabled: self.deps.worktree_enabled,
                    prompt: &prompt,
                    triggering_message: &trigger_message,
                    max_tokens: self.deps.max_tokens,
                };
                builder.build(&inputs).await
            };

            agent.state = AgentState::ExecutingTask;
            agent.current_task = Some(prompt.clone());

            if agent.is_validator() && !self.deps.test_mode {
                let jitter_ms = rand::thread_rng().gen_range(0..=MAX_VALIDATOR_JITTER_MS);
                tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
            }

            self.publish(
                &agent.id,
                topics::TASK_STARTED,
                Receiver::Broadcast,
                serde_json::json!({ "iteration": agent.iteration }),
            )
            .await;

            let cancel = CancellationToken::new();
            *self.current_cancel.lock().unwrap() = Some(cancel.clone());

            let model = agent.config.model.resolve(agent.iteration, self.deps.model_ceiling);
            let env = match model {
                Ok(model) => vec![("ANTHROPIC_MODEL".to_string(), model.as_str().to_string())],
                Err(err) => {
                    emit_event(
                        Level::WARN,
                        ProcessKind::Engine,
                        ObservabilityEvent {
                            event: "agent.model_resolution.failed",
                            component: "zeroshot.agent",
                            cluster_id: Some(&agent.cluster_id),
                            agent_id: Some(&agent.id),
                            task_id: None,
                            status: Some("warn"),
                            error_code: None,
                            detail: Some(&err.to_string()),
                        },
                    );
                    Vec::new()
                }
            };

            let result = match (&self.deps.isolation, &self.deps.isolation_state) {
                (Some(isolation), Some(state)) => {
                    self.executor
                        .spawn_isolated(agent, &context_str, isolation.clone(), state.clone(), env, cancel)
                        .await
                }
                _ => {
                    self.executor
                        .spawn_host(agent, &context_str, self.deps.task_runner.clone(), env, cancel)
                        .await
                }
            };
            *self.current_cancel.lock().unwrap() = None;

            if result.success {
                agent.last_task_end_time = Some(chrono::Utc::now().timestamp_millis());
                agent.current_task = None;
                agent.state = AgentState::Idle;

                self.publish(
                    &agent.id,
                    topics::TASK_COMPLETED,
                    Receiver::Broadcast,
                    serde_json::json!({ "taskId": agent.current_task_id, "output": result.output }),
                )
                .await;
                if let Some(usage) = &result.token_usage {
                    self.publish(
                        &agent.id,
                        topics::TOKEN_USAGE,
                        Receiver::Broadcast,
                        serde_json::json!({ "taskId": agent.current_task_id, "usage": usage }),
                    )
                    .await;
                }

                if let Some(hook) = agent.config.on_complete.clone() {
                    let hook_ctx = self.hook_context(agent, &trigger_message, result.output.clone()).await;
                    if let Err(err) = execute_hook(&hook, &hook_ctx).await {
                        emit_event(
                            Level::WARN,
                            ProcessKind::Engine,
                            ObservabilityEvent {
                                event: "agent.on_complete_hook.failed",
                                component: "zeroshot.agent",
                                cluster_id: Some(&agent.cluster_id),
                                agent_id: Some(&agent.id),
                                task_id: agent.current_task_id.as_deref(),
                                status: Some("warn"),
                                error_code: None,
                                detail: Some(&err.to_string()),
                            },
                        );
                    }
                }
                return;
            }

            let error_message = result.error.clone().unwrap_or_default();
            if error_message == "killed" {
                agent.state = AgentState::Stopped;
                return;
            }

            if attempt >= max_retries {
                if agent.is_validator() {
                    self.reject_as_validator(agent, &error_message).await;
                }
                self.finalize_failure(agent, &trigger_message, error_message).await;
                return;
            }

            let lock_contention = error_message.contains("Lock file");
            self.sleep_backoff(attempt, lock_contention).await;
        }
    }

    /// A validator that crashed out of retries never silently approves:
    /// it publishes its configured `onComplete` topic (or a fallback
    /// topic, if that hook isn't a `publish_message`) with an explicit
    /// rejection instead of running the hook's own templated content.
    async fn reject_as_validator(&self, agent: &Agent, error_message: &str) {
        let topic = match &agent.config.on_complete {
            Some(Hook::PublishMessage { config }) => config.topic.clone(),
            _ => VALIDATOR_FALLBACK_TOPIC.to_string(),
        };
        self.publish(
            &agent.id,
            &topic,
            Receiver::Broadcast,
            serde_json::json!({
                "approved": false,
                "crashedAfterRetries": true,
                "errors": [error_message],
            }),
        )
        .await;
    }

    async fn finalize_failure(&self, agent: &mut Agent, trigger_message: &Message, error_message: String) {
        self.publish(
            &agent.id,
            topics::AGENT_ERROR,
            Receiver::Broadcast,
            serde_json::json!({ "error": error_message }),
        )
        .await;

        if let Some(hook) = agent.config.on_error.clone() {
            let hook_ctx = self.hook_context(agent, trigger_message, None).await;
            if let Err(err) = execute_hook(&hook, &hook_ctx).await {
                emit_event(
                    Level::WARN,
                    ProcessKind::Engine,
                    ObservabilityEvent {
                        event: "agent.on_error_hook.failed",
                        component: "zeroshot.agent",
                        cluster_id: Some(&agent.cluster_id),
                        agent_id: Some(&agent.id),
                        task_id: None,
                        status: Some("warn"),
                        error_code: None,
                        detail: Some(&err.to_string()),
                    },
                );
            }
        }
        agent.current_task = None;
        agent.state = AgentState::Error;
    }

    async fn sleep_backoff(&self, attempt: u32, lock_contention: bool) {
        let base_secs = 2u64 * 2u64.saturating_pow(attempt.saturating_sub(1));
        let base = Duration::from_secs(base_secs);
        if lock_contention {
            let extra_ms = rand::thread_rng().gen_range(LOCK_CONTENTION_JITTER_MIN_MS..=LOCK_CONTENTION_JITTER_MAX_MS);
            tokio::time::sleep(base + Duration::from_millis(extra_ms)).await;
        } else {
            tokio::time::sleep(base).await;
        }
    }

    fn execution_mode(&self) -> ExecutionMode {
        match (&self.deps.isolation, &self.deps.isolation_state) {
            (Some(isolation), Some(state)) => ExecutionMode::Isolated {
                isolation: isolation.clone(),
                state: state.clone(),
            },
            _ => ExecutionMode::Host(self.deps.task_runner.clone()),
        }
    }

    async fn logic_context(&self, agent: &Agent, message: &Message) -> LogicContext {
        let agents = self.deps.agents_snapshot.read().await.clone();
        LogicContext {
            ledger: self.deps.ledger.clone(),
            cluster_id: agent.cluster_id.clone(),
            cluster_created_at_ms: self.deps.cluster_created_at_ms,
            agents,
            agent: AgentSummary {
                id: agent.id.clone(),
                role: agent.config.role.clone(),
                iteration: agent.iteration,
            },
            message: message.clone(),
            config: self.deps.cluster_config_snapshot.clone(),
        }
    }

    async fn hook_context(
        &self,
        agent: &Agent,
        trigger_message: &Message,
        result: Option<serde_json::Value>,
    ) -> HookContext {
        let agents = self.deps.agents_snapshot.read().await.clone();
        HookContext {
            ledger: self.deps.ledger.clone(),
            cluster_id: agent.cluster_id.clone(),
            cluster_created_at_ms: self.deps.cluster_created_at_ms,
            agent_id: agent.id.clone(),
            agent_iteration: agent.iteration,
            role: agent.config.role.clone(),
            cwd: self.deps.cwd.clone(),
            result,
            agents,
            triggering_message: trigger_message.clone(),
            config: self.deps.cluster_config_snapshot.clone(),
        }
    }

    async fn publish(&self, sender: &str, topic: &str, receiver: Receiver, data: serde_json::Value) {
        let cluster_id = self.deps.ledger.cluster_id().to_string();
        let message = Message::new(cluster_id, topic, sender, receiver, MessageContent::data(data));
        self.deps.ledger.publish(message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::RwLock;
    use zeroshot_ledger::Ledger;
    use zeroshot_types::{
        AgentConfig, ContextStrategy, MessageFilter, Model, ModelConfig, OutputFormat,
        PromptConfig, Trigger,
    };

    /// Spawns `true`, which exits immediately without ever announcing a
    /// task id, so triggered attempts fail fast and deterministically in
    /// these tests without needing a real `task` binary on `PATH`.
    struct FakeTaskRunner;

    #[async_trait::async_trait]
    impl zeroshot_exec::TaskRunnerClient for FakeTaskRunner {
        async fn spawn(
            &self,
            _argv: &[String],
            _env: &[(String, String)],
        ) -> Result<tokio::process::Child, zeroshot_types::ZeroshotError> {
            tokio::process::Command::new("true")
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::piped())
                .spawn()
                .map_err(|err| zeroshot_types::ZeroshotError::Spawn(err.to_string()))
        }
        async fn status(&self, _task_id: &str) -> Result<String, zeroshot_types::ZeroshotError> {
            Ok(String::new())
        }
        async fn get_log_path(&self, _task_id: &str) -> Result<String, zeroshot_types::ZeroshotError> {
            Ok(String::new())
        }
        async fn kill(&self, _task_id: &str) {}
    }

    fn sample_deps(ledger: Arc<Ledger>) -> AgentDeps {
        AgentDeps {
            ledger,
            isolation: None,
            isolation_state: None,
            worktree_enabled: false,
            cwd: std::env::temp_dir(),
            cluster_created_at_ms: 0,
            model_ceiling: Model::Opus,
            cluster_config_snapshot: serde_json::Value::Null,
            agents_snapshot: Arc::new(RwLock::new(Vec::new())),
            max_tokens: None,
            test_mode: true,
            task_runner: Arc::new(FakeTaskRunner),
        }
    }

    fn worker_config(max_retries: u32, role: &str) -> AgentConfig {
        AgentConfig {
            role: role.into(),
            model: ModelConfig::Static { model: "sonnet".into() },
            prompt: PromptConfig::Literal("do it".into()),
            triggers: vec![Trigger {
                topic: "ISSUE_OPENED".into(),
                action: TriggerAction::ExecuteTask,
                logic: None,
            }],
            context_strategy: ContextStrategy::default(),
            output_format: OutputFormat::default(),
            max_iterations: 10,
            max_retries,
            timeout_ms: 0,
            on_start: None,
            on_complete: None,
            on_error: None,
        }
    }

    fn issue_opened() -> Message {
        Message::new("c1", "ISSUE_OPENED", "system", Receiver::Broadcast, MessageContent::text("go"))
    }

    #[tokio::test]
    async fn busy_agent_drops_matching_trigger() {
        let ledger = Arc::new(Ledger::new("c1"));
        let deps = sample_deps(ledger.clone());
        let agent = Agent::new("w1", "c1", worker_config(1, "worker"));
        let runtime = AgentRuntime::new(agent, deps);

        let guard = runtime.data.lock().await;
        let dispatch = runtime.clone();
        let handle = tokio::spawn(async move { dispatch.handle_message(issue_opened()).await });
        handle.await.unwrap();
        drop(guard);

        let snapshot = runtime.snapshot().await;
        assert_eq!(snapshot.state, AgentState::Idle);
    }

    // `FakeTaskRunner` never announces a task id, so a triggered attempt
    // fails immediately — useful here for exercising the retry/failure
    // bookkeeping without a real task runner.
    #[tokio::test]
    async fn iteration_increments_once_per_retry_attempt() {
        let ledger = Arc::new(Ledger::new("c1"));
        let deps = sample_deps(ledger.clone());
        let agent = Agent::new("w1", "c1", worker_config(2, "worker"));
        let runtime = AgentRuntime::new(agent, deps);

        runtime.clone().handle_message(issue_opened()).await;

        let snapshot = runtime.snapshot().await;
        assert_eq!(snapshot.iteration, 2);
        assert_eq!(snapshot.state, AgentState::Error);
    }

    #[tokio::test]
    async fn validator_never_auto_approves_after_exhausting_retries() {
        let ledger = Arc::new(Ledger::new("c1"));
        let deps = sample_deps(ledger.clone());
        let agent = Agent::new("v1", "c1", worker_config(1, "validator"));
        let runtime = AgentRuntime::new(agent, deps);

        runtime.clone().handle_message(issue_opened()).await;

        let messages = ledger
            .query(&MessageFilter::for_cluster("c1").with_topic(VALIDATOR_FALLBACK_TOPIC))
            .await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content.data.as_ref().unwrap()["approved"], serde_json::json!(false));
        assert_eq!(
            messages[0].content.data.as_ref().unwrap()["crashedAfterRetries"],
            serde_json::json!(true)
        );
    }

    #[tokio::test]
    async fn stop_cluster_trigger_publishes_completion_and_marks_agent_completed() {
        let ledger = Arc::new(Ledger::new("c1"));
        let deps = sample_deps(ledger.clone());
        let mut config = worker_config(1, "worker");
        config.triggers = vec![Trigger {
            topic: "ALL_DONE".into(),
            action: TriggerAction::StopCluster,
            logic: None,
        }];
        let agent = Agent::new("w1", "c1", config);
        let runtime = AgentRuntime::new(agent, deps);

        let msg = Message::new("c1", "ALL_DONE", "system", Receiver::Broadcast, MessageContent::text("done"));
        runtime.clone().handle_message(msg).await;

        let snapshot = runtime.snapshot().await;
        assert_eq!(snapshot.state, AgentState::Completed);
        let completions = ledger
            .query(&MessageFilter::for_cluster("c1").with_topic(topics::CLUSTER_COMPLETE))
            .await;
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].receiver, Receiver::System);
    }
}
