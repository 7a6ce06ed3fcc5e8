//! Narrow seam over the `task` CLI so the host execution path can be
//! exercised without a real task-runner binary on `PATH`.
//! `ProcessTaskRunner` is the production implementation; tests substitute
//! `fake::FakeTaskRunner`.

use std::process::Stdio;

use tokio::process::{Child, Command};
use zeroshot_types::ZeroshotError;

const TASK_RUN_BIN: &str = "task";
const STATUS_BIN: &str = "status";
const LOG_PATH_BIN: &str = "get-log-path";

#[async_trait::async_trait]
pub trait TaskRunnerClient: Send + Sync {
    async fn spawn(&self, argv: &[String], env: &[(String, String)]) -> Result<Child, ZeroshotError>;
    async fn status(&self, task_id: &str) -> Result<String, ZeroshotError>;
    async fn get_log_path(&self, task_id: &str) -> Result<String, ZeroshotError>;
    async fn kill(&self, task_id: &str);
}

pub struct ProcessTaskRunner;

#[async_trait::async_trait]
impl TaskRunnerClient for ProcessTaskRunner {
    async fn spawn(&self, argv: &[String], env: &[(String, String)]) -> Result<Child, ZeroshotError> {
        Command::new(TASK_RUN_BIN)
            .args(argv)
            .envs(env.iter().map(|(k, v)| (k.clone(), v.clone())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| ZeroshotError::Spawn(format!("{TASK_RUN_BIN} {argv:?}: {err}")))
    }

    async fn status(&self, task_id: &str) -> Result<String, ZeroshotError> {
        let output = Command::new(STATUS_BIN)
            .arg(task_id)
            .output()
            .await
            .map_err(|err| ZeroshotError::Spawn(format!("{STATUS_BIN}: {err}")))?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn get_log_path(&self, task_id: &str) -> Result<String, ZeroshotError> {
        let output = Command::new(LOG_PATH_BIN)
            .arg(task_id)
            .output()
            .await
            .map_err(|err| ZeroshotError::Spawn(format!("{LOG_PATH_BIN}: {err}")))?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Best-effort, idempotent: a missing task or an already-dead process
    /// must not surface as an error.
    async fn kill(&self, task_id: &str) {
        let _ = Command::new(TASK_RUN_BIN).arg("kill").arg(task_id).output().await;
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    /// Writes a controlled NDJSON log to a temp file and announces a
    /// fixed task id by shelling to `sh -c echo`, so the host execution
    /// path can be followed end to end without the real `task` binary.
    pub struct FakeTaskRunner {
        pub task_id: String,
        pub log_path: std::path::PathBuf,
        pub status_text: Mutex<String>,
    }

    impl FakeTaskRunner {
        pub fn new(task_id: impl Into<String>, log_body: &str) -> Self {
            let task_id = task_id.into();
            let mut file = NamedTempFile::new().expect("create temp log file");
            file.write_all(log_body.as_bytes()).expect("write temp log file");
            let (_, path) = file.keep().expect("persist temp log file");
            Self {
                task_id,
                log_path: path,
                status_text: Mutex::new("Status: running".to_string()),
            }
        }

        pub fn set_status(&self, status_text: impl Into<String>) {
            *self.status_text.lock().unwrap() = status_text.into();
        }
    }

    #[async_trait::async_trait]
    impl TaskRunnerClient for FakeTaskRunner {
        async fn spawn(&self, _argv: &[String], _env: &[(String, String)]) -> Result<Child, ZeroshotError> {
            Command::new("sh")
                .arg("-c")
                .arg(format!("echo 'Task spawned: {}'", self.task_id))
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|err| ZeroshotError::Spawn(err.to_string()))
        }

        async fn status(&self, _task_id: &str) -> Result<String, ZeroshotError> {
            Ok(self.status_text.lock().unwrap().clone())
        }

        async fn get_log_path(&self, _task_id: &str) -> Result<String, ZeroshotError> {
            Ok(self.log_path.to_string_lossy().to_string())
        }

        async fn kill(&self, _task_id: &str) {}
    }
}
