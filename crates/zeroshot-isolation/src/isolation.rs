use std::path::{Path, PathBuf};
use std::sync::Arc;

use uuid::Uuid;
use zeroshot_types::{IsolationState, ZeroshotError};

use crate::container::{ContainerRuntime, ExecOutput};
use crate::worktree::branch_name;

const ISOLATED_ROOT: &str = "/tmp/zeroshot-isolated";
const CONFIG_ROOT: &str = "/tmp/zeroshot-cluster-configs";
const CLUSTER_IMAGE: &str = "zeroshot-cluster-base";

/// Container-backed isolation: a fresh single-commit clone of the
/// current repository per cluster, run inside `zeroshot-cluster-base`
/// with a PreToolUse hook blocking `AskUserQuestion`.
pub struct IsolationManager {
    runtime: Arc<dyn ContainerRuntime>,
    manager_id: String,
}

impl IsolationManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            manager_id: Uuid::new_v4().to_string(),
        }
    }

    pub async fn create(&self, cluster_id: &str, source_root: &Path) -> Result<IsolationState, ZeroshotError> {
        let work_dir = PathBuf::from(ISOLATED_ROOT).join(cluster_id);
        copy_tree(source_root, &work_dir).await?;
        init_git_repo(&work_dir, &branch_name(cluster_id)).await?;

        let config_dir = PathBuf::from(CONFIG_ROOT).join(cluster_id);
        render_config_dir(&config_dir).await?;

        let container_id = self
            .runtime
            .run_detached(CLUSTER_IMAGE, &container_args(&work_dir, &config_dir))
            .await?;

        Ok(IsolationState {
            enabled: true,
            cluster_id: cluster_id.to_string(),
            container_id: Some(container_id),
            work_dir: work_dir.to_string_lossy().to_string(),
            manager: self.manager_id.clone(),
        })
    }

    /// Removes the container but preserves the workspace, so a later
    /// `resume` can recreate a container against the same contents.
    pub async fn stop(&self, state: &IsolationState) -> Result<(), ZeroshotError> {
        if let Some(container_id) = &state.container_id {
            self.runtime.remove(container_id).await?;
        }
        let config_dir = PathBuf::from(CONFIG_ROOT).join(&state.cluster_id);
        let _ = tokio::fs::remove_dir_all(&config_dir).await;
        Ok(())
    }

    pub async fn kill(&self, state: &IsolationState) -> Result<(), ZeroshotError> {
        self.stop(state).await?;
        let _ = tokio::fs::remove_dir_all(&state.work_dir).await;
        Ok(())
    }

    pub async fn resume(&self, state: &IsolationState) -> Result<IsolationState, ZeroshotError> {
        let work_dir = PathBuf::from(&state.work_dir);
        let config_dir = PathBuf::from(CONFIG_ROOT).join(&state.cluster_id);
        render_config_dir(&config_dir).await?;

        let container_id = self
            .runtime
            .run_detached(CLUSTER_IMAGE, &container_args(&work_dir, &config_dir))
            .await?;

        Ok(IsolationState {
            container_id: Some(container_id),
            manager: self.manager_id.clone(),
            ..state.clone()
        })
    }

    pub async fn exec(&self, state: &IsolationState, argv: &[String]) -> Result<ExecOutput, ZeroshotError> {
        let container_id = state
            .container_id
            .as_ref()
            .ok_or_else(|| ZeroshotError::Spawn("isolation state has no container".into()))?;
        self.runtime.exec(container_id, argv).await
    }

    pub async fn spawn(
        &self,
        state: &IsolationState,
        argv: &[String],
        env: &[(String, String)],
    ) -> Result<tokio::process::Child, ZeroshotError> {
        let container_id = state
            .container_id
            .as_ref()
            .ok_or_else(|| ZeroshotError::Spawn("isolation state has no container".into()))?;
        self.runtime.spawn_exec(container_id, argv, env).await
    }
}

fn container_args(work_dir: &Path, config_dir: &Path) -> Vec<String> {
    vec![
        "-v".into(),
        format!("{}:/workspace", work_dir.display()),
        "-v".into(),
        format!("{}:/home/node/.claude", config_dir.display()),
        "-e".into(),
        "ZEROSHOT_BLOCK_ASK_USER=1".into(),
    ]
}

async fn copy_tree(source: &Path, dest: &Path) -> Result<(), ZeroshotError> {
    if let Some(parent) = dest.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    let output = tokio::process::Command::new("cp")
        .arg("-a")
        .arg(source)
        .arg(dest)
        .output()
        .await
        .map_err(|err| ZeroshotError::Spawn(format!("cp -a: {err}")))?;

    if !output.status.success() {
        return Err(ZeroshotError::Spawn(format!(
            "cp -a failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

async fn init_git_repo(work_dir: &Path, branch: &str) -> Result<(), ZeroshotError> {
    run_git(work_dir, &["init", "-q"]).await?;
    run_git(work_dir, &["add", "-A"]).await?;
    run_git(
        work_dir,
        &[
            "-c",
            "user.email=zeroshot@localhost",
            "-c",
            "user.name=zeroshot",
            "commit",
            "-q",
            "--allow-empty",
            "-m",
            "isolated workspace snapshot",
        ],
    )
    .await?;
    run_git(work_dir, &["checkout", "-q", "-b", branch]).await?;
    Ok(())
}

async fn run_git(cwd: &Path, args: &[&str]) -> Result<(), ZeroshotError> {
    let output = tokio::process::Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .await
        .map_err(|err| ZeroshotError::Spawn(format!("git {args:?}: {err}")))?;

    if !output.status.success() {
        return Err(ZeroshotError::Spawn(format!(
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

async fn render_config_dir(config_dir: &Path) -> Result<(), ZeroshotError> {
    tokio::fs::create_dir_all(config_dir)
        .await
        .map_err(|err| ZeroshotError::Spawn(format!("mkdir {}: {err}", config_dir.display())))?;

    let settings = serde_json::json!({
        "hooks": {
            "PreToolUse": [
                {
                    "matcher": "AskUserQuestion",
                    "hooks": [{ "type": "command", "command": "exit 1" }]
                }
            ]
        }
    });
    let settings_path = config_dir.join("settings.json");
    let body = serde_json::to_vec_pretty(&settings)
        .map_err(|err| ZeroshotError::Spawn(format!("serialize tool-gating config: {err}")))?;
    tokio::fs::write(&settings_path, body)
        .await
        .map_err(|err| ZeroshotError::Spawn(format!("write {}: {err}", settings_path.display())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::fake::FakeContainerRuntime;

    #[tokio::test]
    async fn stop_removes_container_and_preserves_workspace() {
        let runtime = Arc::new(FakeContainerRuntime::default());
        let manager = IsolationManager::new(runtime.clone());
        let state = IsolationState {
            enabled: true,
            cluster_id: "c1".into(),
            container_id: Some("fake-container-0".into()),
            work_dir: "/tmp/zeroshot-isolated/c1".into(),
            manager: manager.manager_id.clone(),
        };

        manager.stop(&state).await.unwrap();
        assert_eq!(runtime.removed.lock().unwrap().as_slice(), ["fake-container-0"]);
    }

    #[tokio::test]
    async fn resume_assigns_a_new_container_id_and_keeps_workspace() {
        let runtime = Arc::new(FakeContainerRuntime::default());
        let manager = IsolationManager::new(runtime);
        let state = IsolationState {
            enabled: true,
            cluster_id: "c1".into(),
            container_id: Some("old-container".into()),
            work_dir: "/tmp/zeroshot-isolated/c1".into(),
            manager: "old-manager".into(),
        };

        let resumed = manager.resume(&state).await.unwrap();
        assert_ne!(resumed.container_id, state.container_id);
        assert_eq!(resumed.work_dir, state.work_dir);

        let _ = tokio::fs::remove_dir_all("/tmp/zeroshot-cluster-configs/c1").await;
    }
}
