//! The task executor: spawns a task-runner subprocess (on host or inside
//! a cluster's container), follows its NDJSON log, and resolves a
//! [`TaskResult`] once the external store reports completion.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use zeroshot_isolation::IsolationManager;
use zeroshot_ledger::Ledger;
use zeroshot_observability::{emit_event, ObservabilityEvent, ProcessKind};
use zeroshot_stuck::StuckDetector;
use zeroshot_types::{topics, Agent, IsolationState, Message, MessageContent, Receiver, TaskResult};

use crate::argv::build_run_argv;
use crate::backend::ExecutionMode;
use crate::parsing::{self, StatusOutcome};
use crate::task_runner::TaskRunnerClient;

const READY_WAIT_ATTEMPTS: u32 = 10;
const HOST_STATUS_WATCHDOG_LIMIT: u32 = 30;
const COMPLETION_SETTLE_DELAY: Duration = Duration::from_millis(500);

fn task_spawned_regex() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Task spawned:\s*(\S+)").unwrap())
}

pub struct TaskExecutor {
    ledger: Arc<Ledger>,
    stuck: Arc<StuckDetector>,
}

impl TaskExecutor {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        let stuck = Arc::new(StuckDetector::new(ledger.clone()));
        Self { ledger, stuck }
    }

    pub async fn spawn_host(
        &self,
        agent: &mut Agent,
        context: &str,
        task_runner: Arc<dyn TaskRunnerClient>,
        env: Vec<(String, String)>,
        cancel: CancellationToken,
    ) -> TaskResult {
        self.run(ExecutionMode::Host(task_runner), agent, context, env, cancel).await
    }

    pub async fn spawn_isolated(
        &self,
        agent: &mut Agent,
        context: &str,
        isolation: Arc<IsolationManager>,
        state: IsolationState,
        env: Vec<(String, String)>,
        cancel: CancellationToken,
    ) -> TaskResult {
        self.run(ExecutionMode::Isolated { isolation, state }, agent, context, env, cancel)
            .await
    }

    /// Idempotent, best-effort external termination. Never fails — a
    /// missing task or an already-dead process is not an error.
    pub async fn kill_task(&self, mode: &ExecutionMode, task_id: &str) {
        mode.kill_task(task_id).await;
    }

    async fn run(
        &self,
        mode: ExecutionMode,
        agent: &mut Agent,
        context: &str,
        env: Vec<(String, String)>,
        cancel: CancellationToken,
    ) -> TaskResult {
        let argv = build_run_argv(&agent.config.output_format, context);

        let mut child = match mode.spawn(&argv, &env).await {
            Ok(child) => child,
            Err(err) => return failure(format!("failed to spawn task runner: {err}")),
        };

        agent.process_pid = child.id();
        self.publish(
            topics::PROCESS_SPAWNED,
            &agent.id,
            serde_json::json!({ "pid": agent.process_pid }),
        )
        .await;

        let stdout = child.stdout.take().expect("spawn requests piped stdout");
        let stderr = child.stderr.take().expect("spawn requests piped stderr");
        let stderr_tail: Arc<AsyncMutex<String>> = Arc::new(AsyncMutex::new(String::new()));
        {
            let stderr_tail = stderr_tail.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut tail = stderr_tail.lock().await;
                    tail.push_str(&line);
                    tail.push('\n');
                }
            });
        }

        let mut stdout_lines = BufReader::new(stdout).lines();
        let task_id = loop {
            tokio::select! {
                line = stdout_lines.next_line() => {
                    match line {
                        Ok(Some(text)) => {
                            if let Some(captures) = task_spawned_regex().captures(&text) {
                                break Some(captures[1].to_string());
                            }
                        }
                        Ok(None) => break None,
                        Err(_) => break None,
                    }
                }
                status = child.wait() => {
                    let _ = status;
                    break None;
                }
            }
        };

        // Drain whatever remains on stdout so the child never blocks on a
        // full pipe once log-following takes over via the store instead.
        tokio::spawn(async move { while let Ok(Some(_)) = stdout_lines.next_line().await {} });
        tokio::spawn(async move {
            let _ = child.wait().await;
        });

        let Some(task_id) = task_id else {
            let stderr = stderr_tail.lock().await.clone();
            return failure(format!(
                "task runner exited before announcing a task id. stderr: {}",
                if stderr.trim().is_empty() { "(none)" } else { stderr.trim() }
            ));
        };

        agent.current_task_id = Some(task_id.clone());
        self.publish(
            topics::TASK_ID_ASSIGNED,
            &agent.id,
            serde_json::json!({ "taskId": task_id }),
        )
        .await;

        self.wait_until_ready(&mode, &task_id).await;

        let last_output = Arc::new(AtomicI64::new(chrono::Utc::now().timestamp_millis()));
        let watch = agent.process_pid.map(|pid| {
            let last_output = last_output.clone();
            self.stuck.clone().spawn_watch(
                agent.id.clone(),
                agent.config.role.clone(),
                pid,
                move || Some(last_output.load(Ordering::SeqCst)),
            )
        });

        let result = self.follow_to_completion(&mode, agent, &task_id, &last_output, cancel).await;

        if let Some(handle) = watch {
            handle.abort();
        }

        result
    }

    async fn wait_until_ready(&self, mode: &ExecutionMode, task_id: &str) {
        let mut backoff = Duration::from_millis(100);
        for attempt in 0..READY_WAIT_ATTEMPTS {
            match mode.status(task_id).await {
                Ok(text) if !text.trim().is_empty() => return,
                _ => {
                    if attempt + 1 == READY_WAIT_ATTEMPTS {
                        emit_event(
                            Level::WARN,
                            ProcessKind::Engine,
                            ObservabilityEvent {
                                event: "exec.ready_wait.exhausted",
                                component: "zeroshot.exec",
                                cluster_id: None,
                                agent_id: None,
                                task_id: Some(task_id),
                                status: Some("warn"),
                                error_code: None,
                                detail: None,
                            },
                        );
                    } else {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }
    }

    async fn follow_to_completion(
        &self,
        mode: &ExecutionMode,
        agent: &mut Agent,
        task_id: &str,
        last_output: &AtomicI64,
        cancel: CancellationToken,
    ) -> TaskResult {
        let log_path = match mode.log_path(task_id).await {
            Ok(path) if !path.is_empty() => path,
            _ => return failure("could not resolve the task's log file path".to_string()),
        };

        let offset = AtomicU64::new(0);
        let mut residue = String::new();
        let mut raw_lines: Vec<String> = Vec::new();
        let mut result_event: Option<serde_json::Value> = None;

        let mut log_ticker = tokio::time::interval(mode.log_poll_interval());
        let mut status_ticker = tokio::time::interval(mode.status_poll_interval());
        let mut host_status_failures: u32 = 0;

        // Only the isolated path honors a wall-clock deadline; the host
        // path relies on the status-poll watchdog below instead. This
        // asymmetry is inherited, not accidental (see DESIGN.md).
        let deadline = match mode {
            ExecutionMode::Isolated { .. } if agent.config.timeout_ms > 0 => {
                Some(tokio::time::Instant::now() + Duration::from_millis(agent.config.timeout_ms))
            }
            _ => None,
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    mode.kill_task(task_id).await;
                    return TaskResult {
                        success: false,
                        output: None,
                        error: Some("killed".to_string()),
                        token_usage: None,
                    };
                }
                _ = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                } => {
                    mode.kill_task(task_id).await;
                    self.publish(
                        topics::AGENT_ERROR,
                        &agent.id,
                        serde_json::json!({ "reason": "timeout", "taskId": task_id }),
                    )
                    .await;
                    return failure("timeout".to_string());
                }
                _ = log_ticker.tick() => {
                    self.drain_log_delta(mode, &log_path, &offset, &mut residue, &mut raw_lines, &mut result_event, agent, last_output).await;
                }
                _ = status_ticker.tick() => {
                    match mode.status(task_id).await {
                        Ok(status_text) => {
                            host_status_failures = 0;
                            match parsing::parse_status(&status_text) {
                                StatusOutcome::Completed => {
                                    self.drain_log_delta(mode, &log_path, &offset, &mut residue, &mut raw_lines, &mut result_event, agent, last_output).await;
                                    tokio::time::sleep(COMPLETION_SETTLE_DELAY).await;
                                    self.drain_log_delta(mode, &log_path, &offset, &mut residue, &mut raw_lines, &mut result_event, agent, last_output).await;
                                    return self.resolve_success(agent, result_event, &raw_lines);
                                }
                                StatusOutcome::Failed => {
                                    self.drain_log_delta(mode, &log_path, &offset, &mut residue, &mut raw_lines, &mut result_event, agent, last_output).await;
                                    let tail = raw_lines.join("\n");
                                    let message = parsing::resolve_error_message(&status_text, &tail);
                                    return failure(message);
                                }
                                _ => {}
                            }
                        }
                        Err(_) => {
                            host_status_failures += 1;
                            if matches!(mode, ExecutionMode::Host(_)) && host_status_failures >= HOST_STATUS_WATCHDOG_LIMIT {
                                self.publish(
                                    topics::AGENT_ERROR,
                                    &agent.id,
                                    serde_json::json!({ "reason": "polling_timeout", "taskId": task_id }),
                                )
                                .await;
                                return failure("polling_timeout".to_string());
                            }
                        }
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn drain_log_delta(
        &self,
        mode: &ExecutionMode,
        log_path: &str,
        offset: &AtomicU64,
        residue: &mut String,
        raw_lines: &mut Vec<String>,
        result_event: &mut Option<serde_json::Value>,
        agent: &mut Agent,
        last_output: &AtomicI64,
    ) {
        let current_len = match mode.log_len(log_path).await {
            Ok(len) => len,
            Err(_) => return,
        };
        let from = offset.load(Ordering::SeqCst);
        if current_len <= from {
            return;
        }
        let chunk = match mode.log_slice(log_path, from, current_len).await {
            Ok(bytes) => bytes,
            Err(_) => return,
        };
        offset.store(current_len, Ordering::SeqCst);

        residue.push_str(&String::from_utf8_lossy(&chunk));
        while let Some(pos) = residue.find('\n') {
            let line: String = residue.drain(..=pos).collect();
            let line = line.trim_end_matches('\n').to_string();
            if line.trim().is_empty() {
                continue;
            }
            raw_lines.push(line.clone());

            if let Some((timestamp, value)) = parsing::parse_log_line(&line) {
                if parsing::is_result_event(&value) {
                    *result_event = Some(value.clone());
                }
                let mut message = Message::new(
                    agent.cluster_id.clone(),
                    topics::AGENT_OUTPUT,
                    agent.id.clone(),
                    Receiver::Broadcast,
                    MessageContent::data(serde_json::json!({
                        "type": "stdout",
                        "line": value,
                        "agent": agent.id,
                        "role": agent.config.role,
                        "iteration": agent.iteration,
                    })),
                );
                message.timestamp = timestamp;
                self.ledger.publish(message).await;
                let now = chrono::Utc::now().timestamp_millis();
                agent.last_output_time = Some(now);
                last_output.store(now, Ordering::SeqCst);
            }
        }
    }

    fn resolve_success(
        &self,
        agent: &Agent,
        result_event: Option<serde_json::Value>,
        raw_lines: &[String],
    ) -> TaskResult {
        let last_raw_line = raw_lines.last().cloned().unwrap_or_default();
        let schema = agent.config.output_format.json_schema.as_ref();

        let parsed = parsing::parse_result_output(result_event.as_ref(), &last_raw_line, schema);
        let token_usage = result_event.as_ref().and_then(parsing::extract_token_usage);

        let output = match parsed {
            Ok(value) => value,
            Err(err) => {
                return TaskResult {
                    success: false,
                    output: None,
                    error: Some(err),
                    token_usage,
                };
            }
        };

        if let Some(schema) = schema {
            if let Err(validation_error) = parsing::validate_against_schema(&output, schema) {
                if agent.is_validator() {
                    return TaskResult {
                        success: false,
                        output: Some(output),
                        error: Some(validation_error),
                        token_usage,
                    };
                }
                let agent_id = agent.id.clone();
                let ledger = self.ledger.clone();
                let cluster_id = agent.cluster_id.clone();
                tokio::spawn(async move {
                    let message = Message::new(
                        cluster_id,
                        topics::AGENT_SCHEMA_WARNING,
                        agent_id,
                        Receiver::Broadcast,
                        MessageContent::data(serde_json::json!({ "error": validation_error })),
                    );
                    ledger.publish(message).await;
                });
            }
        }

        TaskResult {
            success: true,
            output: Some(output),
            error: None,
            token_usage,
        }
    }

    async fn publish(&self, topic: &str, sender: &str, data: serde_json::Value) {
        let message = Message::new(
            self.ledger.cluster_id().to_string(),
            topic,
            sender,
            Receiver::Broadcast,
            MessageContent::data(data),
        );
        self.ledger.publish(message).await;
    }
}

fn failure(error: String) -> TaskResult {
    TaskResult {
        success: false,
        output: None,
        error: Some(error),
        token_usage: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zeroshot_types::{AgentConfig, ContextStrategy, ModelConfig, OutputFormat, PromptConfig};

    fn sample_agent() -> Agent {
        let config = AgentConfig {
            role: "worker".into(),
            model: ModelConfig::Static { model: "sonnet".into() },
            prompt: PromptConfig::Literal("do it".into()),
            triggers: Vec::new(),
            context_strategy: ContextStrategy::default(),
            output_format: OutputFormat::default(),
            max_iterations: 10,
            max_retries: 1,
            timeout_ms: 0,
            on_start: None,
            on_complete: None,
            on_error: None,
        };
        Agent::new("worker-1", "c1", config)
    }

    /// Spawns `true`, which exits immediately without ever printing
    /// `Task spawned: ...`, so the fail-fast path is exercised
    /// deterministically rather than relying on "task" being absent from
    /// `PATH`.
    struct NeverAnnouncesTaskRunner;

    #[async_trait::async_trait]
    impl crate::task_runner::TaskRunnerClient for NeverAnnouncesTaskRunner {
        async fn spawn(&self, _argv: &[String], _env: &[(String, String)]) -> Result<tokio::process::Child, ZeroshotError> {
            tokio::process::Command::new("true")
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::piped())
                .spawn()
                .map_err(|err| ZeroshotError::Spawn(err.to_string()))
        }
        async fn status(&self, _task_id: &str) -> Result<String, ZeroshotError> {
            Ok(String::new())
        }
        async fn get_log_path(&self, _task_id: &str) -> Result<String, ZeroshotError> {
            Ok(String::new())
        }
        async fn kill(&self, _task_id: &str) {}
    }

    #[tokio::test]
    async fn spawn_host_fails_fast_when_runner_exits_without_announcing() {
        let ledger = Arc::new(Ledger::new("c1"));
        let executor = TaskExecutor::new(ledger);
        let mut agent = sample_agent();

        let task_runner: Arc<dyn crate::task_runner::TaskRunnerClient> = Arc::new(NeverAnnouncesTaskRunner);
        let result = executor
            .spawn_host(&mut agent, "context", task_runner, Vec::new(), CancellationToken::new())
            .await;
        assert!(!result.success);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn spawn_host_follows_log_to_a_successful_completion() {
        let ledger = Arc::new(Ledger::new("c1"));
        let executor = TaskExecutor::new(ledger);
        let mut agent = sample_agent();
        agent.config.output_format.json_schema = Some(serde_json::json!({"type": "object"}));

        let log_body = "{\"type\":\"result\",\"result\":{\"ok\": true}}\n";
        let fake = crate::task_runner::fake::FakeTaskRunner::new("task-xyz", log_body);
        fake.set_status("Status: completed");
        let task_runner: Arc<dyn crate::task_runner::TaskRunnerClient> = Arc::new(fake);

        let result = executor
            .spawn_host(&mut agent, "context", task_runner, Vec::new(), CancellationToken::new())
            .await;
        assert!(result.success, "expected success, got {result:?}");
        assert_eq!(result.output.unwrap(), serde_json::json!({"ok": true}));
    }

    #[test]
    fn resolve_success_returns_parsed_output_when_schema_absent() {
        let ledger = Arc::new(Ledger::new("c1"));
        let executor = TaskExecutor::new(ledger);
        let agent = sample_agent();
        let raw = vec!["{\"ok\": true}".to_string()];
        let result = executor.resolve_success(&agent, None, &raw);
        assert!(result.success);
        assert_eq!(result.output.unwrap(), serde_json::json!({"ok": true}));
    }

    /// Always reports "running" and never completes, so the isolated
    /// path's only way out of `follow_to_completion` is its timeout.
    struct NeverFinishesRuntime;

    #[async_trait::async_trait]
    impl zeroshot_isolation::ContainerRuntime for NeverFinishesRuntime {
        async fn run_detached(&self, _image: &str, _args: &[String]) -> Result<String, ZeroshotError> {
            Ok("fake-container".into())
        }
        async fn exec(&self, _container_id: &str, argv: &[String]) -> Result<zeroshot_isolation::ExecOutput, ZeroshotError> {
            let stdout = if argv.first().map(String::as_str) == Some("status") {
                "Status: running".to_string()
            } else {
                String::new()
            };
            Ok(zeroshot_isolation::ExecOutput { stdout, stderr: String::new(), code: 0 })
        }
        async fn spawn_exec(
            &self,
            _container_id: &str,
            _argv: &[String],
            _env: &[(String, String)],
        ) -> Result<tokio::process::Child, ZeroshotError> {
            tokio::process::Command::new("true").spawn().map_err(|err| ZeroshotError::Spawn(err.to_string()))
        }
        async fn remove(&self, _container_id: &str) -> Result<(), ZeroshotError> {
            Ok(())
        }
        async fn inspect_running(&self, _container_id: &str) -> Result<bool, ZeroshotError> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn isolated_task_past_its_deadline_is_killed_with_a_timeout_error() {
        let ledger = Arc::new(Ledger::new("c1"));
        let executor = TaskExecutor::new(ledger);
        let mut agent = sample_agent();
        agent.config.timeout_ms = 20;

        let runtime: Arc<dyn zeroshot_isolation::ContainerRuntime> = Arc::new(NeverFinishesRuntime);
        let isolation = Arc::new(IsolationManager::new(runtime));
        let state = IsolationState {
            enabled: true,
            cluster_id: "c1".into(),
            container_id: Some("fake-container".into()),
            work_dir: "/tmp/zeroshot-isolated/c1".into(),
            manager: "m1".into(),
        };

        let mode = ExecutionMode::Isolated { isolation, state };
        let last_output = AtomicI64::new(chrono::Utc::now().timestamp_millis());
        let result = executor
            .follow_to_completion(&mode, &mut agent, "task-1", &last_output, CancellationToken::new())
            .await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("timeout"));
    }
}
