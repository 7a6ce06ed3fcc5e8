//! Pure routing from a reported task complexity and type onto a cluster
//! template name and its derived parameters. No I/O, no clock reads —
//! same inputs always produce the same `RoutedConfig`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum Complexity {
    Trivial,
    Simple,
    Standard,
    Critical,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskType {
    Inquiry,
    Task,
    Debug,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteParams {
    pub validator_count: u32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoutedConfig {
    pub base: &'static str,
    pub params: RouteParams,
}

/// `(complexity, taskType) -> {base, params}`. Rule order:
/// `DEBUG` + not `TRIVIAL` wins over the complexity ladder; everything
/// else falls through to the ladder below.
pub fn route(complexity: Complexity, task_type: TaskType) -> RoutedConfig {
    let base = if task_type == TaskType::Debug && complexity != Complexity::Trivial {
        "debug-workflow"
    } else {
        match complexity {
            Complexity::Trivial => "single-worker",
            Complexity::Simple => "worker-validator",
            Complexity::Standard | Complexity::Critical => "full-workflow",
        }
    };

    RoutedConfig {
        base,
        params: RouteParams {
            validator_count: validator_count(complexity),
            max_tokens: max_tokens(complexity),
        },
    }
}

fn validator_count(complexity: Complexity) -> u32 {
    match complexity {
        Complexity::Trivial => 0,
        Complexity::Simple => 1,
        Complexity::Standard => 2,
        Complexity::Critical => 4,
    }
}

fn max_tokens(complexity: Complexity) -> u32 {
    match complexity {
        Complexity::Trivial => 50_000,
        Complexity::Simple => 100_000,
        Complexity::Standard => 100_000,
        Complexity::Critical => 150_000,
    }
}

/// Model per role, independent of `route`: `planner` at `CRITICAL` gets
/// `opus`; any role at `TRIVIAL` gets `haiku`; everything else `sonnet`.
pub fn model_for_role(role: &str, complexity: Complexity) -> &'static str {
    if role == "planner" && complexity == Complexity::Critical {
        "opus"
    } else if complexity == Complexity::Trivial {
        "haiku"
    } else {
        "sonnet"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_is_pure() {
        let a = route(Complexity::Standard, TaskType::Task);
        let b = route(Complexity::Standard, TaskType::Task);
        assert_eq!(a, b);
    }

    #[test]
    fn debug_overrides_ladder_unless_trivial() {
        assert_eq!(route(Complexity::Standard, TaskType::Debug).base, "debug-workflow");
        assert_eq!(route(Complexity::Trivial, TaskType::Debug).base, "single-worker");
    }

    #[test]
    fn ladder_picks_expected_base() {
        assert_eq!(route(Complexity::Trivial, TaskType::Task).base, "single-worker");
        assert_eq!(route(Complexity::Simple, TaskType::Task).base, "worker-validator");
        assert_eq!(route(Complexity::Standard, TaskType::Task).base, "full-workflow");
        assert_eq!(route(Complexity::Critical, TaskType::Inquiry).base, "full-workflow");
    }

    #[test]
    fn validator_counts_match_table() {
        assert_eq!(route(Complexity::Trivial, TaskType::Task).params.validator_count, 0);
        assert_eq!(route(Complexity::Simple, TaskType::Task).params.validator_count, 1);
        assert_eq!(route(Complexity::Standard, TaskType::Task).params.validator_count, 2);
        assert_eq!(route(Complexity::Critical, TaskType::Task).params.validator_count, 4);
    }

    #[test]
    fn max_tokens_ladder_matches_spec() {
        assert_eq!(route(Complexity::Trivial, TaskType::Task).params.max_tokens, 50_000);
        assert_eq!(route(Complexity::Simple, TaskType::Task).params.max_tokens, 100_000);
        assert_eq!(route(Complexity::Standard, TaskType::Task).params.max_tokens, 100_000);
        assert_eq!(route(Complexity::Critical, TaskType::Task).params.max_tokens, 150_000);
    }

    #[test]
    fn model_for_role_resolves_planner_and_trivial_special_cases() {
        assert_eq!(model_for_role("planner", Complexity::Critical), "opus");
        assert_eq!(model_for_role("worker", Complexity::Critical), "sonnet");
        assert_eq!(model_for_role("planner", Complexity::Trivial), "haiku");
        assert_eq!(model_for_role("any", Complexity::Simple), "sonnet");
    }
}
