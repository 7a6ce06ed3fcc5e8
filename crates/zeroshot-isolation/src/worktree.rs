use std::path::{Path, PathBuf};

use zeroshot_types::{WorktreeState, ZeroshotError};

/// Lightweight per-cluster isolation: a git worktree and branch off the
/// host repository, no container involved. Agents run tasks directly on
/// the host with this directory as their working directory.
pub struct WorktreeManager {
    repo_root: PathBuf,
}

impl WorktreeManager {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }

    pub async fn create(&self, cluster_id: &str) -> Result<WorktreeState, ZeroshotError> {
        let branch = branch_name(cluster_id);
        let work_dir = self.repo_root.join(".zeroshot-worktrees").join(cluster_id);
        let work_dir_str = work_dir.to_string_lossy().to_string();

        run_git(&self.repo_root, &["worktree", "add", "-b", &branch, &work_dir_str]).await?;

        Ok(WorktreeState {
            enabled: true,
            branch,
            work_dir: work_dir_str,
        })
    }

    /// Only call on `kill` — `stop` must preserve the worktree so
    /// `resume` can find it again.
    pub async fn remove(&self, state: &WorktreeState) -> Result<(), ZeroshotError> {
        let _ = run_git(&self.repo_root, &["worktree", "remove", "--force", &state.work_dir]).await;
        let _ = run_git(&self.repo_root, &["branch", "-D", &state.branch]).await;
        Ok(())
    }
}

pub fn branch_name(cluster_id: &str) -> String {
    let suffix: String = cluster_id.chars().take(8).collect();
    format!("zeroshot/{suffix}")
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_name_is_prefixed_and_bounded() {
        let name = branch_name("0123456789abcdef");
        assert_eq!(name, "zeroshot/01234567");
    }
}
