use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rhai::{Array as RhaiArray, Dynamic, Engine, Map as RhaiMap, Scope};
use tracing::Level;

use zeroshot_ledger::Ledger;
use zeroshot_observability::{emit_event, ObservabilityEvent, ProcessKind};
use zeroshot_types::{Message, MessageFilter};

use crate::context::{AgentSummary, LogicContext};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_OPERATIONS: u64 = 2_000_000;

/// Evaluates operator-supplied gating scripts against a frozen, curated
/// API surface. No filesystem, network, environment, process, or dynamic
/// code-loading primitive is ever registered on the `rhai::Engine`, so
/// the sandbox is enforced structurally rather than by a denylist.
pub struct LogicSandbox {
    timeout: Duration,
}

impl Default for LogicSandbox {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl LogicSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Any script error or timeout yields `false`, logged — never
    /// propagated as a trigger-evaluation failure.
    pub async fn evaluate(&self, script: &str, ctx: LogicContext) -> bool {
        let script = script.to_string();
        let timeout = self.timeout;
        let cluster_id = ctx.cluster_id.clone();
        let handle = tokio::runtime::Handle::current();

        let join = tokio::task::spawn_blocking(move || run_script(&script, ctx, timeout, handle));

        match tokio::time::timeout(timeout + Duration::from_millis(250), join).await {
            Ok(Ok(Ok(value))) => value,
            Ok(Ok(Err(detail))) => {
                emit_event(
                    Level::WARN,
                    ProcessKind::Engine,
                    ObservabilityEvent {
                        event: "logic.evaluate.error",
                        component: "zeroshot.logic",
                        cluster_id: Some(&cluster_id),
                        agent_id: None,
                        task_id: None,
                        status: Some("false"),
                        error_code: None,
                        detail: Some(&detail),
                    },
                );
                false
            }
            Ok(Err(_join_error)) => false,
            Err(_elapsed) => {
                emit_event(
                    Level::WARN,
                    ProcessKind::Engine,
                    ObservabilityEvent {
                        event: "logic.evaluate.timeout",
                        component: "zeroshot.logic",
                        cluster_id: Some(&cluster_id),
                        agent_id: None,
                        task_id: None,
                        status: Some("false"),
                        error_code: None,
                        detail: None,
                    },
                );
                false
            }
        }
    }
}

fn run_script(
    script: &str,
    ctx: LogicContext,
    timeout: Duration,
    handle: tokio::runtime::Handle,
) -> Result<bool, String> {
    let deadline = Instant::now() + timeout;

    let mut engine = Engine::new();
    engine.set_max_operations(MAX_OPERATIONS);
    engine.set_max_expr_depth(64);
    engine.set_max_call_levels(32);
    engine.set_max_string_size(1_000_000);
    engine.set_max_array_size(100_000);
    engine.set_max_map_size(100_000);
    engine.disable_symbol("eval");
    engine.disable_symbol("import");
    engine.set_module_resolver(rhai::module_resolvers::DummyModuleResolver::new());
    engine.on_print(|_| {});
    engine.on_debug(|_, _, _| {});
    engine.on_progress(move |_count| {
        if Instant::now() >= deadline {
            Some(Dynamic::from("gating logic exceeded its time budget"))
        } else {
            None
        }
    });

    register_ledger(&mut engine);
    register_cluster(&mut engine);
    register_helpers(&mut engine);

    let mut scope = Scope::new();
    scope.push(
        "ledger",
        RhaiLedger {
            ledger: ctx.ledger.clone(),
            handle: handle.clone(),
        },
    );
    scope.push(
        "cluster",
        RhaiCluster {
            id: ctx.cluster_id.clone(),
            created_at_ms: ctx.cluster_created_at_ms,
            agents: ctx.agents.clone(),
        },
    );
    scope.push(
        "helpers",
        RhaiHelpers {
            ledger: ctx.ledger.clone(),
            handle,
            config: ctx.config.clone(),
        },
    );
    scope.push("agent", agent_to_dynamic(&ctx.agent));
    scope.push("message", message_to_dynamic(&ctx.message));

    match engine.eval_with_scope::<Dynamic>(&mut scope, script) {
        Ok(value) => Ok(coerce_bool(&value)),
        Err(err) => Err(err.to_string()),
    }
}

fn coerce_bool(value: &Dynamic) -> bool {
    if let Ok(b) = value.as_bool() {
        return b;
    }
    if let Ok(n) = value.as_int() {
        return n != 0;
    }
    if let Ok(f) = value.as_float() {
        return f != 0.0;
    }
    if value.is_string() {
        return !value.clone().into_string().unwrap_or_default().is_empty();
    }
    if value.is_unit() {
        return false;
    }
    true
}

fn message_to_dynamic(message: &Message) -> Dynamic {
    rhai::serde::to_dynamic(message).unwrap_or(Dynamic::UNIT)
}

fn agent_to_dynamic(agent: &AgentSummary) -> Dynamic {
    rhai::serde::to_dynamic(agent).unwrap_or(Dynamic::UNIT)
}

fn map_to_filter(map: &RhaiMap) -> MessageFilter {
    let mut filter = MessageFilter::default();
    if let Some(topic) = map.get("topic").and_then(|d| d.clone().into_string().ok()) {
        filter.topic = Some(topic);
    }
    if let Some(sender) = map.get("sender").and_then(|d| d.clone().into_string().ok()) {
        filter.sender = Some(sender);
    }
    if let Some(since) = map.get("since").and_then(|d| d.as_int().ok()) {
        filter.since = Some(since);
    }
    if let Some(limit) = map.get("limit").and_then(|d| d.as_int().ok()) {
        filter.limit = Some(limit.max(0) as usize);
    }
    filter
}

#[derive(Clone)]
struct RhaiLedger {
    ledger: Arc<Ledger>,
    handle: tokio::runtime::Handle,
}

fn register_ledger(engine: &mut Engine) {
    engine.register_type_with_name::<RhaiLedger>("Ledger");

    engine.register_fn("query", |this: &mut RhaiLedger, filter: RhaiMap| -> RhaiArray {
        let filter = map_to_filter(&filter);
        let ledger = this.ledger.clone();
        let msgs = this.handle.block_on(async move { ledger.query(&filter).await });
        msgs.iter().map(message_to_dynamic).collect()
    });

    engine.register_fn("findLast", |this: &mut RhaiLedger, filter: RhaiMap| -> Dynamic {
        let filter = map_to_filter(&filter);
        let ledger = this.ledger.clone();
        let found = this.handle.block_on(async move { ledger.find_last(&filter).await });
        found.as_ref().map(message_to_dynamic).unwrap_or(Dynamic::UNIT)
    });

    engine.register_fn("count", |this: &mut RhaiLedger, filter: RhaiMap| -> i64 {
        let filter = map_to_filter(&filter);
        let ledger = this.ledger.clone();
        this.handle.block_on(async move { ledger.count(&filter).await }) as i64
    });

    engine.register_fn("since", |this: &mut RhaiLedger, timestamp: i64| -> RhaiArray {
        let ledger = this.ledger.clone();
        let msgs = this.handle.block_on(async move { ledger.since(timestamp).await });
        msgs.iter().map(message_to_dynamic).collect()
    });
}

#[derive(Clone)]
struct RhaiCluster {
    id: String,
    created_at_ms: i64,
    agents: Vec<AgentSummary>,
}

fn register_cluster(engine: &mut Engine) {
    engine.register_type_with_name::<RhaiCluster>("Cluster");
    engine.register_get("id", |this: &mut RhaiCluster| this.id.clone());
    engine.register_get("createdAt", |this: &mut RhaiCluster| this.created_at_ms);

    engine.register_fn("getAgents", |this: &mut RhaiCluster| -> RhaiArray {
        this.agents.iter().map(agent_to_dynamic).collect()
    });
    engine.register_fn(
        "getAgentsByRole",
        |this: &mut RhaiCluster, role: &str| -> RhaiArray {
            this.agents
                .iter()
                .filter(|a| a.role == role)
                .map(agent_to_dynamic)
                .collect()
        },
    );
    engine.register_fn("getAgent", |this: &mut RhaiCluster, id: &str| -> Dynamic {
        this.agents
            .iter()
            .find(|a| a.id == id)
            .map(agent_to_dynamic)
            .unwrap_or(Dynamic::UNIT)
    });
}

#[derive(Clone)]
struct RhaiHelpers {
    ledger: Arc<Ledger>,
    handle: tokio::runtime::Handle,
    config: serde_json::Value,
}

fn agent_id_of(value: &Dynamic) -> String {
    if value.is_map() {
        let map = value.clone().cast::<RhaiMap>();
        map.get("id")
            .and_then(|d| d.clone().into_string().ok())
            .unwrap_or_default()
    } else {
        value.clone().into_string().unwrap_or_default()
    }
}

fn register_helpers(engine: &mut Engine) {
    engine.register_type_with_name::<RhaiHelpers>("Helpers");

    engine.register_fn(
        "allResponded",
        |this: &mut RhaiHelpers, agents: RhaiArray, topic: &str, since: i64| -> bool {
            let expected_ids: Vec<String> = agents.iter().map(agent_id_of).collect();
            let filter = MessageFilter {
                topic: Some(topic.to_string()),
                since: Some(since),
                ..Default::default()
            };
            let ledger = this.ledger.clone();
            let msgs = this.handle.block_on(async move { ledger.query(&filter).await });
            let senders: HashSet<String> = msgs.into_iter().map(|m| m.sender).collect();
            expected_ids.iter().all(|id| senders.contains(id))
        },
    );

    engine.register_fn("hasConsensus", |this: &mut RhaiHelpers, topic: &str, since: i64| -> bool {
        let filter = MessageFilter {
            topic: Some(topic.to_string()),
            since: Some(since),
            ..Default::default()
        };
        let ledger = this.ledger.clone();
        let msgs = this.handle.block_on(async move { ledger.query(&filter).await });
        if msgs.is_empty() {
            return false;
        }
        msgs.iter().all(|m| {
            m.content
                .data
                .as_ref()
                .and_then(|d| d.get("approved"))
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
        })
    });

    engine.register_fn("timeSinceLastMessage", |this: &mut RhaiHelpers, topic: &str| -> f64 {
        let filter = MessageFilter {
            topic: Some(topic.to_string()),
            ..Default::default()
        };
        let ledger = this.ledger.clone();
        let last = this.handle.block_on(async move { ledger.find_last(&filter).await });
        match last {
            Some(msg) => {
                let now = chrono::Utc::now().timestamp_millis();
                (now - msg.timestamp.unwrap_or(now)) as f64
            }
            None => f64::INFINITY,
        }
    });

    engine.register_fn(
        "hasMessagesSince",
        |this: &mut RhaiHelpers, topic: &str, since: i64| -> bool {
            let filter = MessageFilter {
                topic: Some(topic.to_string()),
                since: Some(since),
                ..Default::default()
            };
            let ledger = this.ledger.clone();
            this.handle.block_on(async move { ledger.count(&filter).await }) > 0
        },
    );

    engine.register_fn("getConfig", |this: &mut RhaiHelpers, key: &str| -> Dynamic {
        this.config
            .get(key)
            .and_then(|v| rhai::serde::to_dynamic(v).ok())
            .unwrap_or(Dynamic::UNIT)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use zeroshot_types::{MessageContent, Receiver};

    fn ctx_with(script_message_topic: &str) -> (Arc<Ledger>, LogicContext) {
        let ledger = Arc::new(Ledger::new("c1"));
        let ctx = LogicContext {
            ledger: ledger.clone(),
            cluster_id: "c1".into(),
            cluster_created_at_ms: 0,
            agents: vec![
                AgentSummary {
                    id: "worker".into(),
                    role: "worker".into(),
                    iteration: 1,
                },
                AgentSummary {
                    id: "validator".into(),
                    role: "validator".into(),
                    iteration: 1,
                },
            ],
            agent: AgentSummary {
                id: "worker".into(),
                role: "worker".into(),
                iteration: 1,
            },
            message: Message::new(
                "c1",
                script_message_topic,
                "system",
                Receiver::Broadcast,
                MessageContent::text("go"),
            ),
            config: serde_json::json!({ "threshold": 2 }),
        };
        (ledger, ctx)
    }

    #[tokio::test]
    async fn script_returning_true_passes() {
        let (_ledger, ctx) = ctx_with("ISSUE_OPENED");
        let sandbox = LogicSandbox::new();
        assert!(sandbox.evaluate("true", ctx).await);
    }

    #[tokio::test]
    async fn script_error_yields_false() {
        let (_ledger, ctx) = ctx_with("ISSUE_OPENED");
        let sandbox = LogicSandbox::new();
        assert!(!sandbox.evaluate("this is not valid rhai {{{", ctx).await);
    }

    #[tokio::test]
    async fn script_can_read_agent_iteration() {
        let (_ledger, ctx) = ctx_with("ISSUE_OPENED");
        let sandbox = LogicSandbox::new();
        assert!(sandbox.evaluate("agent.iteration == 1", ctx).await);
    }

    #[tokio::test]
    async fn slow_script_times_out_to_false() {
        let (_ledger, ctx) = ctx_with("ISSUE_OPENED");
        let sandbox = LogicSandbox::with_timeout(Duration::from_millis(100));
        let script = "let x = 0; while true { x += 1; }";
        assert!(!sandbox.evaluate(script, ctx).await);
    }

    #[tokio::test]
    async fn has_consensus_requires_every_response_approved() {
        let (ledger, ctx) = ctx_with("VALIDATION_RESULT");
        ledger
            .publish(Message::new(
                "c1",
                "VALIDATION_RESULT",
                "validator",
                Receiver::Broadcast,
                MessageContent::data(serde_json::json!({ "approved": true })),
            ))
            .await;
        let sandbox = LogicSandbox::new();
        assert!(
            sandbox
                .evaluate("helpers.hasConsensus(\"VALIDATION_RESULT\", 0)", ctx)
                .await
        );
    }

    #[tokio::test]
    async fn sandbox_cannot_read_files() {
        let (_ledger, ctx) = ctx_with("ISSUE_OPENED");
        let sandbox = LogicSandbox::new();
        // `open`/`File` are never registered; calling them is a parse/eval error -> false.
        assert!(!sandbox.evaluate("open(\"/etc/passwd\")", ctx).await);
    }
}
