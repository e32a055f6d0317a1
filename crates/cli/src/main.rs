//! `shoal` command-line client.
//!
//! Submits DAGs to an agent, follows them stage by stage and relays
//! operator commands.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shoal_sdk::{
    AgentInfo, ConsoleProgress, DagHandler, DagId, DagOperator, DagSpec, ShoalClient,
    ShoalError, TaskId,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

mod output;

#[derive(Parser, Debug)]
#[command(name = "shoal", about = "Drive DAGs on a shoal agent", version)]
struct Cli {
    /// Agent API address
    #[arg(long, global = true, env = "SHOAL_SERVER", default_value = "http://127.0.0.1:2886")]
    server: String,

    /// Bearer token for the agent API
    #[arg(long, global = true, env = "SHOAL_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// More log output (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Work with DAGs
    #[command(subcommand)]
    Dag(DagCommand),
    /// List the operation types the agent can run
    Operations,
    /// Check that the agent is up
    Health,
}

/// Options controlling how a DAG is followed
#[derive(clap::Args, Debug)]
struct WatchArgs {
    /// Query this agent (ip:port) directly instead of --server
    #[arg(long)]
    agent: Option<AgentInfo>,

    /// Query through the upgrade path, falling back to the plain one
    #[arg(long)]
    upgrade: bool,

    /// Consecutive fetch failures tolerated before giving up
    #[arg(long, default_value_t = 3)]
    retry_times: u32,

    /// Log lines shown for a failed task
    #[arg(long, default_value_t = 20)]
    log_tail: usize,
}

#[derive(Subcommand, Debug)]
enum DagCommand {
    /// Submit a DAG from a JSON or TOML file
    Submit {
        file: PathBuf,
        /// Return right after submission
        #[arg(long)]
        no_watch: bool,
        #[command(flatten)]
        watch: WatchArgs,
    },
    /// List DAGs, newest first
    List,
    /// Show a DAG with its nodes and tasks
    Show { dag_id: DagId },
    /// Follow a DAG until it finishes. Ctrl-C cancels it.
    Watch {
        dag_id: DagId,
        #[command(flatten)]
        watch: WatchArgs,
    },
    /// Retry the failed tasks of the current stage
    Retry {
        dag_id: DagId,
        #[arg(long)]
        no_watch: bool,
        #[command(flatten)]
        watch: WatchArgs,
    },
    /// Mark the failed tasks of the current stage as succeeded
    Pass {
        dag_id: DagId,
        #[arg(long)]
        no_watch: bool,
        #[command(flatten)]
        watch: WatchArgs,
    },
    /// Undo every executed stage, newest first
    Rollback {
        dag_id: DagId,
        #[arg(long)]
        no_watch: bool,
        #[command(flatten)]
        watch: WatchArgs,
    },
    /// Cancel a running or failed DAG
    Cancel { dag_id: DagId },
    /// Print the execution log of a task
    Logs {
        dag_id: DagId,
        task_id: TaskId,
        /// Only the last N lines
        #[arg(long)]
        tail: Option<usize>,
    },
    /// Print the audit trail of a DAG
    Events { dag_id: DagId },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = match cli.verbose {
        0 => "warn",
        1 => "shoal_sdk=debug,info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        // The progress output already explained a failed dag
        if !matches!(
            e.downcast_ref::<ShoalError>(),
            Some(ShoalError::DagFailed { .. })
        ) {
            eprintln!("Error: {:#}", e);
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut builder = ShoalClient::builder().base_url(cli.server.as_str());
    if let Some(token) = cli.token {
        builder = builder.token(token);
    }
    let client = builder.build().context("Invalid client configuration")?;

    match cli.command {
        Command::Health => {
            let health = client.health().check().await?;
            println!("{} ({})", health.status, health.agent);
        }
        Command::Operations => {
            let operations = client.operations().list().await?;
            output::print_operations(&operations);
        }
        Command::Dag(command) => run_dag(client, command).await?,
    }

    Ok(())
}

async fn run_dag(client: ShoalClient, command: DagCommand) -> Result<()> {
    match command {
        DagCommand::Submit {
            file,
            no_watch,
            watch,
        } => {
            let spec = load_spec(&file)?;
            let dag = client.dags().submit(&spec).await?;
            println!("Submitted '{}' as {}", dag.name, dag.id);
            if !no_watch {
                follow(client, dag.id, &watch).await?;
            }
        }
        DagCommand::List => {
            let dags = client.dags().list().await?;
            output::print_dag_list(&dags);
        }
        DagCommand::Show { dag_id } => {
            let dag = client.dags().get(&dag_id).await?;
            output::print_dag(&dag);
        }
        DagCommand::Watch { dag_id, watch } => follow(client, dag_id, &watch).await?,
        DagCommand::Retry {
            dag_id,
            no_watch,
            watch,
        } => command_then_follow(client, dag_id, DagOperator::Retry, no_watch, &watch).await?,
        DagCommand::Pass {
            dag_id,
            no_watch,
            watch,
        } => command_then_follow(client, dag_id, DagOperator::Pass, no_watch, &watch).await?,
        DagCommand::Rollback {
            dag_id,
            no_watch,
            watch,
        } => {
            command_then_follow(client, dag_id, DagOperator::Rollback, no_watch, &watch).await?
        }
        DagCommand::Cancel { dag_id } => {
            let dag = client.dags().operator(&dag_id, DagOperator::Cancel).await?;
            println!("'{}' is {}", dag.name, dag.status);
        }
        DagCommand::Logs {
            dag_id,
            task_id,
            tail,
        } => {
            for entry in client.dags().task_logs(&dag_id, &task_id, tail).await? {
                println!("{}", entry);
            }
        }
        DagCommand::Events { dag_id } => {
            let events = client.dags().events(&dag_id).await?;
            output::print_events(&events);
        }
    }

    Ok(())
}

async fn command_then_follow(
    client: ShoalClient,
    dag_id: DagId,
    operator: DagOperator,
    no_watch: bool,
    watch: &WatchArgs,
) -> Result<()> {
    let handler = handler(client, dag_id, watch)?;
    let dag = match operator {
        DagOperator::Retry => handler.retry().await?,
        DagOperator::Pass => handler.pass().await?,
        DagOperator::Rollback => handler.rollback().await?,
        other => anyhow::bail!("{} cannot be followed", other),
    };
    println!("{} accepted for '{}'", operator, dag.name);

    if !no_watch {
        watch_until_done(&handler).await?;
    }
    Ok(())
}

fn handler(client: ShoalClient, dag_id: DagId, watch: &WatchArgs) -> Result<DagHandler> {
    let mut handler = DagHandler::from_id(client, dag_id)
        .retry_times(watch.retry_times)
        .for_upgrade(watch.upgrade)
        .log_tail(watch.log_tail)
        .poll_interval(Duration::from_secs(1))
        .reporter(Arc::new(ConsoleProgress::new()));
    if let Some(agent) = &watch.agent {
        handler = handler.with_agent(agent)?;
    }
    Ok(handler)
}

async fn follow(client: ShoalClient, dag_id: DagId, watch: &WatchArgs) -> Result<()> {
    let handler = handler(client, dag_id, watch)?;
    watch_until_done(&handler).await
}

/// Watch `handler` to the end. The first Ctrl-C cancels the DAG and waits for
/// the agent to confirm.
async fn watch_until_done(handler: &DagHandler) -> Result<()> {
    let watch = handler.watch();
    tokio::pin!(watch);

    let result = tokio::select! {
        result = &mut watch => result,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Cancelling dag {}...", handler.dag_id());
            if let Err(e) = handler.cancel().await {
                eprintln!("Cancel rejected: {}", e);
            }
            (&mut watch).await
        }
    };

    result?;
    Ok(())
}

fn load_spec(path: &Path) -> Result<DagSpec> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let spec = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?,
        _ => serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?,
    };
    Ok(spec)
}
