use serde::{Deserialize, Serialize};

use crate::hook::Hook;
use crate::model_config::{ModelConfig, PromptConfig};
use crate::trigger::Trigger;

/// Role names the engine treats specially. Roles are otherwise opaque
/// operator-chosen strings (`config.role`), matched by equality — the
/// engine only ever switches behavior on `"validator"` and `"planner"`.
pub mod roles {
    pub const VALIDATOR: &str = "validator";
    pub const PLANNER: &str = "planner";
    pub const WILDCARD: &str = "any";
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    EvaluatingLogic,
    BuildingContext,
    ExecutingTask,
    Completed,
    Failed,
    Error,
    Stopped,
}

/// Strategy sources that feed the context builder for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSource {
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    pub since: SinceSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// `since` may be a literal epoch-ms timestamp or one of the two symbolic
/// anchors the context builder resolves against cluster/agent state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SinceSpec {
    Timestamp(i64),
    Symbol(SinceSymbol),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SinceSymbol {
    ClusterStart,
    LastTaskEnd,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContextStrategy {
    #[serde(default)]
    pub sources: Vec<ContextSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputFormat {
    /// The schema to enforce. In strict mode it is passed via
    /// `--json-schema`; in non-strict mode it is folded into the prompt
    /// text instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_schema: Option<serde_json::Value>,
    /// Strict-schema mode (`--output-format json --json-schema <schema>`)
    /// is the default whenever a schema is configured. Set this to
    /// `false` for the agent to opt out and run `stream-json` with the
    /// schema folded into the prompt instead.
    #[serde(default = "default_strict")]
    pub strict: bool,
    #[serde(default)]
    pub verbose: bool,
}

fn default_strict() -> bool {
    true
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self {
            json_schema: None,
            strict: true,
            verbose: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub role: String,
    pub model: ModelConfig,
    pub prompt: PromptConfig,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub context_strategy: ContextStrategy,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Only consulted by the isolated execution path; `0` disables it.
    #[serde(default)]
    pub timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_start: Option<Hook>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_complete: Option<Hook>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<Hook>,
}

fn default_max_iterations() -> u32 {
    10
}

fn default_max_retries() -> u32 {
    1
}

#[derive(Debug, Clone)]
pub struct Agent {
    pub id: String,
    pub cluster_id: String,
    pub config: AgentConfig,
    pub state: AgentState,
    pub iteration: u32,
    pub current_task: Option<String>,
    pub current_task_id: Option<String>,
    pub process_pid: Option<u32>,
    pub last_task_end_time: Option<i64>,
    pub last_output_time: Option<i64>,
}

impl Agent {
    pub fn new(id: impl Into<String>, cluster_id: impl Into<String>, config: AgentConfig) -> Self {
        Self {
            id: id.into(),
            cluster_id: cluster_id.into(),
            config,
            state: AgentState::Idle,
            iteration: 0,
            current_task: None,
            current_task_id: None,
            process_pid: None,
            last_task_end_time: None,
            last_output_time: None,
        }
    }

    pub fn is_validator(&self) -> bool {
        self.config.role == roles::VALIDATOR
    }

    pub fn is_executing(&self) -> bool {
        self.current_task.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executing_task_invariant_tracks_current_task() {
        let config = AgentConfig {
            role: "worker".into(),
            model: ModelConfig::Static {
                model: "sonnet".into(),
            },
            prompt: PromptConfig::Literal("do the thing".into()),
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
        let mut agent = Agent::new("a1", "c1", config);
        assert!(!agent.is_executing());
        agent.current_task = Some("task-1".into());
        assert!(agent.is_executing());
    }
}
