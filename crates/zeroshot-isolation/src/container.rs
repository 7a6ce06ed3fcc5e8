use zeroshot_types::ZeroshotError;

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: i32,
}

/// Narrow seam over the container runtime so the isolation manager (and
/// anything built on it) can be exercised without a real container
/// engine. `DockerRuntime` is the production implementation; tests
/// substitute `FakeContainerRuntime`.
#[async_trait::async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn run_detached(&self, image: &str, args: &[String]) -> Result<String, ZeroshotError>;
    async fn exec(&self, container_id: &str, argv: &[String]) -> Result<ExecOutput, ZeroshotError>;
    async fn spawn_exec(
        &self,
        container_id: &str,
        argv: &[String],
        env: &[(String, String)],
    ) -> Result<tokio::process::Child, ZeroshotError>;
    async fn remove(&self, container_id: &str) -> Result<(), ZeroshotError>;
    async fn inspect_running(&self, container_id: &str) -> Result<bool, ZeroshotError>;
}

pub struct DockerRuntime;

#[async_trait::async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn run_detached(&self, image: &str, args: &[String]) -> Result<String, ZeroshotError> {
        let output = tokio::process::Command::new("docker")
            .arg("run")
            .arg("-d")
            .args(args)
            .arg(image)
            .output()
            .await
            .map_err(|err| ZeroshotError::Spawn(format!("docker run: {err}")))?;

        if !output.status.success() {
            return Err(ZeroshotError::Spawn(format!(
                "docker run failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn exec(&self, container_id: &str, argv: &[String]) -> Result<ExecOutput, ZeroshotError> {
        let output = tokio::process::Command::new("docker")
            .arg("exec")
            .arg(container_id)
            .args(argv)
            .output()
            .await
            .map_err(|err| ZeroshotError::Spawn(format!("docker exec: {err}")))?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            code: output.status.code().unwrap_or(-1),
        })
    }

    async fn spawn_exec(
        &self,
        container_id: &str,
        argv: &[String],
        env: &[(String, String)],
    ) -> Result<tokio::process::Child, ZeroshotError> {
        let mut cmd = tokio::process::Command::new("docker");
        cmd.arg("exec").arg("-i");
        for (key, value) in env {
            cmd.arg("-e").arg(format!("{key}={value}"));
        }
        cmd.arg(container_id).args(argv);
        cmd.stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        cmd.spawn()
            .map_err(|err| ZeroshotError::Spawn(format!("docker exec spawn: {err}")))
    }

    async fn remove(&self, container_id: &str) -> Result<(), ZeroshotError> {
        let output = tokio::process::Command::new("docker")
            .arg("rm")
            .arg("-f")
            .arg(container_id)
            .output()
            .await
            .map_err(|err| ZeroshotError::Spawn(format!("docker rm -f: {err}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("No such container") {
                return Err(ZeroshotError::Spawn(format!("docker rm -f failed: {stderr}")));
            }
        }
        Ok(())
    }

    async fn inspect_running(&self, container_id: &str) -> Result<bool, ZeroshotError> {
        let output = tokio::process::Command::new("docker")
            .arg("inspect")
            .arg("-f")
            .arg("{{.State.Running}}")
            .arg(container_id)
            .output()
            .await
            .map_err(|err| ZeroshotError::Spawn(format!("docker inspect: {err}")))?;

        if !output.status.success() {
            return Ok(false);
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim() == "true")
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeContainerRuntime {
        next_id: AtomicU64,
        pub removed: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl ContainerRuntime for FakeContainerRuntime {
        async fn run_detached(&self, _image: &str, _args: &[String]) -> Result<String, ZeroshotError> {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            Ok(format!("fake-container-{id}"))
        }

        async fn exec(&self, _container_id: &str, _argv: &[String]) -> Result<ExecOutput, ZeroshotError> {
            Ok(ExecOutput {
                stdout: String::new(),
                stderr: String::new(),
                code: 0,
            })
        }

        async fn spawn_exec(
            &self,
            _container_id: &str,
            _argv: &[String],
            _env: &[(String, String)],
        ) -> Result<tokio::process::Child, ZeroshotError> {
            tokio::process::Command::new("true")
                .spawn()
                .map_err(|err| ZeroshotError::Spawn(err.to_string()))
        }

        async fn remove(&self, container_id: &str) -> Result<(), ZeroshotError> {
            self.removed.lock().unwrap().push(container_id.to_string());
            Ok(())
        }

        async fn inspect_running(&self, _container_id: &str) -> Result<bool, ZeroshotError> {
            Ok(true)
        }
    }
}
