use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use zeroshot_isolation::DockerRuntime;
use zeroshot_observability::{init_process_logging, ProcessKind};
use zeroshot_orchestrator::{ClusterStore, FileClusterStore, Orchestrator, StartOptions};
use zeroshot_types::{ClusterConfig, ClusterState, Message, MessageContent, Model, Receiver};

#[derive(Parser, Debug)]
#[command(name = "zeroshot-engine")]
#[command(about = "Headless agent-cluster orchestration engine")]
struct Cli {
    #[arg(long, global = true)]
    state_dir: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a cluster from a JSON or YAML config file and drive it to
    /// completion in the foreground.
    Start {
        config_path: PathBuf,
        #[arg(long, default_value = "Start the cluster.")]
        message: String,
        #[arg(long)]
        source_root: Option<PathBuf>,
        #[arg(long)]
        isolation: bool,
        #[arg(long)]
        worktree: bool,
    },
    /// Stop the cluster's agents and preserve its workspace for `resume`.
    /// Only has an effect on a cluster currently live in this process.
    Stop { cluster_id: String },
    /// Force-stop the cluster, tear down its workspace, delete its record.
    Kill { cluster_id: String },
    /// Reload a persisted cluster and resume it in the foreground.
    Resume {
        cluster_id: String,
        #[arg(long)]
        context: Option<String>,
        #[arg(long)]
        source_root: Option<PathBuf>,
    },
    /// Print the persisted record for a cluster.
    Status { cluster_id: String },
    /// List every cluster this engine has a persisted record for.
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let state_dir = resolve_state_dir(cli.state_dir.clone());
    let logs_dir = zeroshot_observability::canonical_logs_dir_from_root(&state_dir);
    let _logging_guard = init_process_logging(ProcessKind::Engine, &logs_dir, 14)
        .context("failed to initialize logging")?;

    let store: Arc<dyn ClusterStore> = Arc::new(FileClusterStore::new(&state_dir));
    let orchestrator = Orchestrator::new(store.clone(), Arc::new(DockerRuntime));

    match cli.command {
        Command::Start { config_path, message, source_root, isolation, worktree } => {
            let mut config = load_cluster_config(&config_path)?;
            config.isolation = config.isolation || isolation;
            config.worktree = config.worktree || worktree;
            let options = build_options(source_root);
            let initial = Message::new(
                "unset",
                zeroshot_types::topics::ISSUE_OPENED,
                "operator",
                Receiver::Broadcast,
                MessageContent::text(message),
            );
            let cluster_id = orchestrator.start(config, initial, options).await?;
            info!(cluster_id = %cluster_id, "cluster started");
            println!("{cluster_id}");
            run_to_terminal_state(&orchestrator, &cluster_id).await?;
        }
        Command::Stop { cluster_id } => {
            orchestrator.stop(&cluster_id).await?;
            print_record(&store, &cluster_id).await?;
        }
        Command::Kill { cluster_id } => {
            orchestrator.kill(&cluster_id).await?;
            println!("killed {cluster_id}");
        }
        Command::Resume { cluster_id, context, source_root } => {
            let options = build_options(source_root);
            orchestrator.resume(&cluster_id, context.as_deref(), options).await?;
            run_to_terminal_state(&orchestrator, &cluster_id).await?;
        }
        Command::Status { cluster_id } => {
            print_record(&store, &cluster_id).await?;
        }
        Command::List => {
            for id in store.list().await? {
                println!("{id}");
            }
        }
    }

    Ok(())
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("ZEROSHOT_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(".zeroshot")
}

fn build_options(source_root: Option<PathBuf>) -> StartOptions {
    StartOptions {
        source_root: source_root.unwrap_or_else(|| PathBuf::from(".")),
        default_model_ceiling: Model::Opus,
        max_tokens: None,
        test_mode: false,
    }
}

fn load_cluster_config(path: &PathBuf) -> anyhow::Result<ClusterConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading cluster config at {}", path.display()))?;
    if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
        return Ok(serde_json::from_str(&raw)?);
    }
    serde_yaml::from_str(&raw).or_else(|_| Ok(serde_json::from_str(&raw)?))
}

async fn print_record(store: &Arc<dyn ClusterStore>, cluster_id: &str) -> anyhow::Result<()> {
    match store.load(cluster_id).await? {
        Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
        None => println!("no persisted cluster: {cluster_id}"),
    }
    Ok(())
}

/// Blocks until the cluster reaches a terminal state or the operator
/// interrupts with Ctrl-C, in which case `stop` is issued so the
/// workspace is preserved for a later `resume`.
async fn run_to_terminal_state(orchestrator: &Orchestrator, cluster_id: &str) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!(cluster_id = %cluster_id, "interrupted, stopping cluster");
                orchestrator.stop(cluster_id).await?;
                return Ok(());
            }
            _ = tokio::time::sleep(Duration::from_millis(250)) => {
                let Some(record) = orchestrator.get_cluster(cluster_id).await? else {
                    return Ok(());
                };
                if matches!(
                    record.state,
                    ClusterState::Completed | ClusterState::Failed | ClusterState::Killed
                ) {
                    println!("{}", serde_json::to_string_pretty(&record)?);
                    return Ok(());
                }
            }
        }
    }
}
