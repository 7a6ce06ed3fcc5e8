use std::path::PathBuf;

use zeroshot_types::Model;

/// Everything `start`/`resume` need that isn't carried on the operator's
/// `ClusterConfig` itself.
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Repository root copied (isolation) or worktree-checked-out
    /// (worktree) from. Ignored when neither flag is set.
    pub source_root: PathBuf,
    /// Applies when `ClusterConfig::max_model` is unset.
    pub default_model_ceiling: Model,
    pub max_tokens: Option<u32>,
    /// Skips validator jitter; propagated into every agent's `AgentDeps`.
    pub test_mode: bool,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            source_root: PathBuf::from("."),
            default_model_ceiling: Model::Opus,
            max_tokens: None,
            test_mode: false,
        }
    }
}
