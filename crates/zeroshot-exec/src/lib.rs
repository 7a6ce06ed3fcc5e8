mod argv;
mod backend;
mod executor;
mod parsing;
mod task_runner;

pub use argv::{build_run_argv, is_strict_mode};
pub use backend::ExecutionMode;
pub use executor::TaskExecutor;
pub use parsing::{parse_result_output, resolve_error_message, strip_timestamp_prefix, StatusOutcome};
pub use task_runner::{ProcessTaskRunner, TaskRunnerClient};
