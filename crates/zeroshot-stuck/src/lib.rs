//! Informational liveness analysis for a running agent task's subprocess.
//!
//! Cross-platform via `sysinfo`. The watcher never kills anything — it
//! only publishes `AGENT_STALE_WARNING` for human/operator consumption.

use std::sync::Arc;
use std::time::Duration;

use sysinfo::{Pid, ProcessStatus, System};
use zeroshot_ledger::Ledger;
use zeroshot_types::{topics, Message, MessageContent, Receiver};

const STUCK_SCORE_THRESHOLD: u32 = 2;

#[derive(Debug, Clone)]
pub struct StuckAnalysis {
    pub pid: u32,
    pub status: String,
    pub cpu_percent: f64,
    pub disk_active: bool,
    pub score: u32,
    pub is_stuck: bool,
}

impl StuckAnalysis {
    fn to_data(&self) -> serde_json::Value {
        serde_json::json!({
            "pid": self.pid,
            "status": self.status,
            "cpuPercent": self.cpu_percent,
            "diskActive": self.disk_active,
            "score": self.score,
        })
    }
}

pub struct StuckDetector {
    ledger: Arc<Ledger>,
    cadence: Duration,
    stale_after: Duration,
    sample_window: Duration,
}

impl StuckDetector {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self {
            ledger,
            cadence: Duration::from_secs(60),
            stale_after: Duration::from_secs(60),
            sample_window: Duration::from_secs(5),
        }
    }

    pub fn with_cadence(mut self, cadence: Duration) -> Self {
        self.cadence = cadence;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Spawns the per-agent sampling loop. `last_output_time_ms` is
    /// consulted fresh on every tick so the caller's agent state stays
    /// the single source of truth. Abort the returned handle to stop.
    pub fn spawn_watch(
        self: Arc<Self>,
        agent_id: String,
        role: String,
        pid: u32,
        last_output_time_ms: impl Fn() -> Option<i64> + Send + Sync + 'static,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(self.cadence).await;

                let Some(last) = last_output_time_ms() else {
                    continue;
                };
                let now = chrono::Utc::now().timestamp_millis();
                if now - last < self.stale_after.as_millis() as i64 {
                    continue;
                }

                match sample_over_window(pid, self.sample_window).await {
                    Some(analysis) if analysis.is_stuck => {
                        self.publish_warning(&agent_id, &role, &analysis).await;
                    }
                    Some(_) => {}
                    None => {
                        tracing::debug!(pid, "stuck analysis inconclusive, process likely exited");
                    }
                }
            }
        })
    }

    async fn publish_warning(&self, agent_id: &str, role: &str, analysis: &StuckAnalysis) {
        let mut data = analysis.to_data();
        data["agent"] = serde_json::Value::String(agent_id.to_string());
        data["role"] = serde_json::Value::String(role.to_string());

        self.ledger
            .publish(Message::new(
                self.ledger.cluster_id(),
                topics::AGENT_STALE_WARNING,
                agent_id,
                Receiver::System,
                MessageContent::data(data),
            ))
            .await;
    }
}

async fn sample_over_window(pid: u32, window: Duration) -> Option<StuckAnalysis> {
    let sys_pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_process(sys_pid);
    let before = raw_sample(&system, sys_pid)?;

    tokio::time::sleep(window).await;

    system.refresh_process(sys_pid);
    let after = raw_sample(&system, sys_pid)?;

    Some(score(pid, &before, &after))
}

struct RawSample {
    status: ProcessStatus,
    cpu_percent: f64,
    disk_bytes: u64,
}

fn raw_sample(system: &System, pid: Pid) -> Option<RawSample> {
    let proc = system.process(pid)?;
    let disk = proc.disk_usage();
    Some(RawSample {
        status: proc.status(),
        cpu_percent: proc.cpu_usage() as f64,
        disk_bytes: disk.read_bytes + disk.written_bytes,
    })
}

fn score(pid: u32, before: &RawSample, after: &RawSample) -> StuckAnalysis {
    let disk_active = after.disk_bytes > before.disk_bytes;

    let mut score = 0;
    if matches!(after.status, ProcessStatus::Sleep | ProcessStatus::Idle) {
        score += 1;
    }
    if after.cpu_percent < 1.0 {
        score += 1;
    }
    if !disk_active {
        score += 1;
    }

    StuckAnalysis {
        pid,
        status: format!("{:?}", after.status),
        cpu_percent: after.cpu_percent,
        disk_active,
        score,
        is_stuck: score >= STUCK_SCORE_THRESHOLD,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_flags_sleeping_idle_process_as_stuck() {
        let before = RawSample {
            status: ProcessStatus::Sleep,
            cpu_percent: 0.2,
            disk_bytes: 5000,
        };
        let after = RawSample {
            status: ProcessStatus::Sleep,
            cpu_percent: 0.1,
            disk_bytes: 5000,
        };
        let analysis = score(1234, &before, &after);
        assert!(analysis.is_stuck);
        assert!(!analysis.disk_active);
    }

    #[test]
    fn score_does_not_flag_busy_process() {
        let before = RawSample {
            status: ProcessStatus::Run,
            cpu_percent: 40.0,
            disk_bytes: 5000,
        };
        let after = RawSample {
            status: ProcessStatus::Run,
            cpu_percent: 55.0,
            disk_bytes: 50_000,
        };
        let analysis = score(1234, &before, &after);
        assert!(!analysis.is_stuck);
    }

    #[tokio::test]
    async fn self_pid_is_sampleable() {
        let pid = std::process::id();
        assert!(sample_over_window(pid, Duration::from_millis(10)).await.is_some());
    }
}
