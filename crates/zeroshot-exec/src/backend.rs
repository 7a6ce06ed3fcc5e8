//! Dispatches task-runner operations to the host or to a cluster's
//! container, so the executor's lifecycle logic never has to branch on
//! isolation mode itself.

use std::sync::Arc;
use std::time::Duration;

use tokio::process::Child;
use zeroshot_isolation::IsolationManager;
use zeroshot_types::{IsolationState, ZeroshotError};

use crate::task_runner::TaskRunnerClient;

const TASK_RUN_BIN: &str = "task";
const STATUS_BIN: &str = "status";
const LOG_PATH_BIN: &str = "get-log-path";

const HOST_LOG_POLL: Duration = Duration::from_millis(300);
const ISOLATED_LOG_POLL: Duration = Duration::from_millis(500);
const HOST_STATUS_POLL: Duration = Duration::from_secs(1);

/// Where a task's subprocess actually runs. Both variants expose the
/// identical surface the executor drives: spawn, status, log path, kill.
pub enum ExecutionMode {
    Host(Arc<dyn TaskRunnerClient>),
    Isolated {
        isolation: Arc<IsolationManager>,
        state: IsolationState,
    },
}

impl ExecutionMode {
    pub fn log_poll_interval(&self) -> Duration {
        match self {
            ExecutionMode::Host(_) => HOST_LOG_POLL,
            ExecutionMode::Isolated { .. } => ISOLATED_LOG_POLL,
        }
    }

    /// The status poller runs every 1s on host, and on every log-poll
    /// cycle when isolated (status is read via the same container exec
    /// round trip as the log size check).
    pub fn status_poll_interval(&self) -> Duration {
        match self {
            ExecutionMode::Host(_) => HOST_STATUS_POLL,
            ExecutionMode::Isolated { .. } => ISOLATED_LOG_POLL,
        }
    }

    pub async fn spawn(&self, argv: &[String], env: &[(String, String)]) -> Result<Child, ZeroshotError> {
        match self {
            ExecutionMode::Host(task_runner) => task_runner.spawn(argv, env).await,
            ExecutionMode::Isolated { isolation, state } => {
                let mut full_argv = vec![TASK_RUN_BIN.to_string()];
                full_argv.extend_from_slice(argv);
                isolation.spawn(state, &full_argv, env).await
            }
        }
    }

    pub async fn status(&self, task_id: &str) -> Result<String, ZeroshotError> {
        match self {
            ExecutionMode::Host(task_runner) => task_runner.status(task_id).await,
            ExecutionMode::Isolated { isolation, state } => {
                let argv = vec![STATUS_BIN.to_string(), task_id.to_string()];
                let output = isolation.exec(state, &argv).await?;
                Ok(output.stdout)
            }
        }
    }

    pub async fn log_path(&self, task_id: &str) -> Result<String, ZeroshotError> {
        match self {
            ExecutionMode::Host(task_runner) => task_runner.get_log_path(task_id).await,
            ExecutionMode::Isolated { isolation, state } => {
                let argv = vec![LOG_PATH_BIN.to_string(), task_id.to_string()];
                let output = isolation.exec(state, &argv).await?;
                Ok(output.stdout.trim().to_string())
            }
        }
    }

    /// Best-effort, idempotent: a missing task or an already-dead process
    /// must not surface as an error.
    pub async fn kill_task(&self, task_id: &str) {
        match self {
            ExecutionMode::Host(task_runner) => task_runner.kill(task_id).await,
            ExecutionMode::Isolated { isolation, state } => {
                let argv = vec![TASK_RUN_BIN.to_string(), "kill".to_string(), task_id.to_string()];
                let _ = isolation.exec(state, &argv).await;
            }
        }
    }

    /// Reads the log file's current byte length. On host this stats the
    /// file directly; under isolation it shells out to `wc -c` in the
    /// container, since the file lives inside the mounted workspace only.
    pub async fn log_len(&self, log_path: &str) -> Result<u64, ZeroshotError> {
        match self {
            ExecutionMode::Host(_) => match tokio::fs::metadata(log_path).await {
                Ok(meta) => Ok(meta.len()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
                Err(err) => Err(ZeroshotError::Spawn(format!("stat {log_path}: {err}"))),
            },
            ExecutionMode::Isolated { isolation, state } => {
                let argv = vec!["wc".to_string(), "-c".to_string(), log_path.to_string()];
                let output = isolation.exec(state, &argv).await?;
                Ok(output
                    .stdout
                    .split_whitespace()
                    .next()
                    .and_then(|n| n.parse::<u64>().ok())
                    .unwrap_or(0))
            }
        }
    }

    /// Reads the byte range `[from, to)` of the log file.
    pub async fn log_slice(&self, log_path: &str, from: u64, to: u64) -> Result<Vec<u8>, ZeroshotError> {
        if to <= from {
            return Ok(Vec::new());
        }
        match self {
            ExecutionMode::Host(_) => {
                use tokio::io::{AsyncReadExt, AsyncSeekExt};
                let mut file = tokio::fs::File::open(log_path)
                    .await
                    .map_err(|err| ZeroshotError::Spawn(format!("open {log_path}: {err}")))?;
                file.seek(std::io::SeekFrom::Start(from))
                    .await
                    .map_err(|err| ZeroshotError::Spawn(format!("seek {log_path}: {err}")))?;
                let mut buf = vec![0u8; (to - from) as usize];
                file.read_exact(&mut buf)
                    .await
                    .map_err(|err| ZeroshotError::Spawn(format!("read {log_path}: {err}")))?;
                Ok(buf)
            }
            ExecutionMode::Isolated { isolation, state } => {
                let argv = vec![
                    "dd".to_string(),
                    format!("if={log_path}"),
                    format!("bs=1"),
                    format!("skip={from}"),
                    format!("count={}", to - from),
                    "status=none".to_string(),
                ];
                let output = isolation.exec(state, &argv).await?;
                Ok(output.stdout.into_bytes())
            }
        }
    }
}
