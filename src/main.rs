//! Thin CLI composition root for the Tesslate control plane. Wires the
//! library crates together for local operation and debugging; the HTTP
//! layer this backs in production is out of scope for this repo.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tesslate_core::git::GitManager;
use tesslate_core::orchestrator::{
    EnvironmentOrchestrator, StartOverrides, docker::DockerOrchestrator, k8s::KubernetesOrchestrator,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tesslate-orchestrator", about = "Control plane for ephemeral per-user dev environments")]
struct Cli {
    #[arg(long, default_value = "tesslate.toml", env = "TESSLATE_CONFIG")]
    config: PathBuf,

    #[arg(long, env = "TESSLATE_USER")]
    user: String,

    #[arg(long, env = "TESSLATE_PROJECT")]
    project: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Environment lifecycle (start/stop/status).
    Env {
        #[command(subcommand)]
        action: EnvAction,
    },
    /// Persistent shell sessions (open/exec/close).
    Shell {
        #[command(subcommand)]
        action: ShellAction,
    },
    /// Git operations against the environment's checkout.
    Git {
        #[command(subcommand)]
        action: GitAction,
    },
}

#[derive(Subcommand)]
enum EnvAction {
    Start {
        #[arg(long)]
        project_path: String,
        #[arg(long)]
        start_command: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    Stop,
    Status,
}

#[derive(Subcommand)]
enum ShellAction {
    Open {
        #[arg(long, default_value = "/app")]
        cwd: String,
    },
    Exec {
        #[arg(long)]
        session_id: String,
        #[arg(long)]
        command: String,
        #[arg(long, default_value_t = 2.0)]
        wait_seconds: f64,
    },
    Close {
        #[arg(long)]
        session_id: String,
    },
}

#[derive(Subcommand)]
enum GitAction {
    Status,
    Commit {
        #[arg(long)]
        message: String,
    },
    Push {
        #[arg(long)]
        branch: Option<String>,
        #[arg(long, default_value = "origin")]
        remote: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = tesslate_config::load_config(&cli.config).context("loading tesslate.toml")?;

    let orchestrator = build_orchestrator(&config).await?;

    match cli.command {
        Commands::Env { action } => run_env(orchestrator, &cli.user, &cli.project, action).await,
        Commands::Shell { action } => run_shell(orchestrator, &config, &cli.user, &cli.project, action).await,
        Commands::Git { action } => run_git(orchestrator, &cli.user, &cli.project, action).await,
    }
}

async fn build_orchestrator(config: &tesslate_config::TesslateConfig) -> Result<Arc<dyn EnvironmentOrchestrator>> {
    match config.deployment_mode {
        tesslate_config::DeploymentMode::Docker => {
            Ok(Arc::new(DockerOrchestrator::new(config.docker.clone(), config.domain.clone())))
        }
        tesslate_config::DeploymentMode::Kubernetes => {
            let client = kube::Client::try_default().await.context("connecting to Kubernetes API")?;
            Ok(Arc::new(KubernetesOrchestrator::new(client, config.kubernetes.clone(), config.domain.clone())))
        }
    }
}

async fn run_env(orchestrator: Arc<dyn EnvironmentOrchestrator>, user: &str, project: &str, action: EnvAction) -> Result<()> {
    match action {
        EnvAction::Start { project_path, start_command, port } => {
            let overrides = (start_command.is_some() || port.is_some()).then_some(StartOverrides { start_command, port });
            let url = orchestrator.start_container(user, project, &project_path, None, overrides).await?;
            println!("{url}");
        }
        EnvAction::Stop => {
            orchestrator.stop_container(user, project).await?;
            println!("stopped");
        }
        EnvAction::Status => {
            let status = orchestrator.status(user, project, None).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }
    Ok(())
}

async fn run_shell(
    orchestrator: Arc<dyn EnvironmentOrchestrator>,
    config: &tesslate_config::TesslateConfig,
    user: &str,
    project: &str,
    action: ShellAction,
) -> Result<()> {
    let broker: Arc<dyn tesslate_core::pty::PtyBroker> = match config.deployment_mode {
        tesslate_config::DeploymentMode::Docker => Arc::new(tesslate_core::pty::docker::DockerPtyBroker::new()),
        tesslate_config::DeploymentMode::Kubernetes => {
            let client = kube::Client::try_default().await.context("connecting to Kubernetes API")?;
            Arc::new(tesslate_core::pty::k8s::KubernetesPtyBroker::new(client, config.kubernetes.namespace.clone()))
        }
    };
    let shell = tesslate_core::shell::ShellSessionManager::new(broker, config.shell_quota);
    let _ = orchestrator;

    match action {
        ShellAction::Open { cwd } => {
            let id = shell.open(user, project, &cwd).await?;
            println!("{id}");
        }
        ShellAction::Exec { session_id, command, wait_seconds } => {
            let id: uuid::Uuid = session_id.parse().context("invalid session id")?;
            let mut line = command;
            if !line.ends_with('\n') {
                line.push('\n');
            }
            shell.write(id, line.as_bytes()).await?;
            tokio::time::sleep(std::time::Duration::from_secs_f64(wait_seconds)).await;
            let (bytes, is_eof) = shell.read(id)?;
            print!("{}", String::from_utf8_lossy(&bytes));
            if is_eof {
                eprintln!("(session closed)");
            }
        }
        ShellAction::Close { session_id } => {
            let id: uuid::Uuid = session_id.parse().context("invalid session id")?;
            shell.close(id).await?;
            println!("closed");
        }
    }
    Ok(())
}

async fn run_git(orchestrator: Arc<dyn EnvironmentOrchestrator>, user: &str, project: &str, action: GitAction) -> Result<()> {
    let git = GitManager::new(orchestrator, user, project);
    match action {
        GitAction::Status => {
            let status = git.get_status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        GitAction::Commit { message } => {
            let sha = git.commit(&message, None).await?;
            println!("{sha}");
        }
        GitAction::Push { branch, remote } => {
            git.push(branch.as_deref(), &remote, false).await?;
            println!("pushed");
        }
    }
    Ok(())
}
