//! Runs the declarative side-effects attached to an agent's
//! `onStart` / `onComplete` / `onError` slots.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;

use zeroshot_ledger::Ledger;
use zeroshot_logic::{AgentSummary, LogicContext, LogicSandbox};
use zeroshot_types::{Hook, Message, MessageContent, ZeroshotError};

pub struct HookContext {
    pub ledger: Arc<Ledger>,
    pub cluster_id: String,
    pub cluster_created_at_ms: i64,
    pub agent_id: String,
    pub agent_iteration: u32,
    pub role: String,
    pub cwd: PathBuf,
    /// The parsed task result, when a hook runs after task completion.
    pub result: Option<Value>,
    pub agents: Vec<AgentSummary>,
    pub triggering_message: Message,
    pub config: Value,
}

/// Hook failures propagate to the caller (the agent state machine),
/// which folds them into its own retry accounting — this executor never
/// swallows an error itself.
pub async fn execute_hook(hook: &Hook, ctx: &HookContext) -> Result<(), ZeroshotError> {
    match hook {
        Hook::PublishMessage { config } => {
            let result = ctx.result.clone().unwrap_or(Value::Null);
            let content_value = deep_substitute(&config.content, &result);
            let content = value_to_message_content(content_value);
            ctx.ledger
                .publish(Message::new(
                    ctx.cluster_id.clone(),
                    config.topic.clone(),
                    ctx.agent_id.clone(),
                    config.receiver.clone(),
                    content,
                ))
                .await;
            Ok(())
        }
        Hook::RunScript { command, args } => {
            let result = ctx.result.clone().unwrap_or(Value::Null);
            let substituted: Vec<String> = args.iter().map(|a| substitute_string(a, &result)).collect();
            let output = tokio::process::Command::new(command)
                .args(&substituted)
                .current_dir(&ctx.cwd)
                .output()
                .await
                .map_err(|err| ZeroshotError::Hook(format!("failed to spawn {command}: {err}")))?;

            if !output.status.success() {
                return Err(ZeroshotError::Hook(format!(
                    "{command} exited with {:?}: {}",
                    output.status.code(),
                    String::from_utf8_lossy(&output.stderr)
                )));
            }
            Ok(())
        }
        Hook::EvaluateLogic { script } => {
            let agent = ctx
                .agents
                .iter()
                .find(|a| a.id == ctx.agent_id)
                .cloned()
                .unwrap_or(AgentSummary {
                    id: ctx.agent_id.clone(),
                    role: ctx.role.clone(),
                    iteration: ctx.agent_iteration,
                });
            let logic_ctx = LogicContext {
                ledger: ctx.ledger.clone(),
                cluster_id: ctx.cluster_id.clone(),
                cluster_created_at_ms: ctx.cluster_created_at_ms,
                agents: ctx.agents.clone(),
                agent,
                message: ctx.triggering_message.clone(),
                config: ctx.config.clone(),
            };
            // Side effects only happen through the publish helper surfaced
            // inside the sandbox; the boolean return value is discarded.
            let _ = LogicSandbox::new().evaluate(script, logic_ctx).await;
            Ok(())
        }
    }
}

fn value_to_message_content(value: Value) -> MessageContent {
    serde_json::from_value(value.clone()).unwrap_or_else(|_| MessageContent::data(value))
}

fn deep_substitute(value: &Value, result: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(substitute_string(s, result)),
        Value::Array(items) => Value::Array(items.iter().map(|v| deep_substitute(v, result)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), deep_substitute(v, result)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn substitute_string(template: &str, result: &Value) -> String {
    let mut out = String::new();
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let path = after[..end].trim();
                out.push_str(&resolve_path(path, result));
                rest = &after[end + 2..];
            }
            None => {
                out.push_str("{{");
                rest = after;
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

fn resolve_path(path: &str, result: &Value) -> String {
    let mut segments = path.split('.');
    let Some(root) = segments.next() else {
        return String::new();
    };
    if root != "result" {
        return format!("{{{{{path}}}}}");
    }

    let mut current = result;
    for segment in segments {
        match current.get(segment) {
            Some(next) => current = next,
            None => return String::new(),
        }
    }

    match current {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
