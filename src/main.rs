use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tessera_agent::{ContextCompiler, EventLog, TokenCounter, WorkflowDefinition};
use tessera_core::config::AppConfig;
use tessera_core::event::Scope;
use tessera_core::traits::Store;
use tessera_core::types::RunId;
use tessera_store::SqliteStore;

#[derive(Parser)]
#[command(name = "tessera", version, about = "Event-sourced workflow engine for LLM agents")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "tessera.toml", env = "TESSERA_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a workflow definition and print its topology
    Validate {
        /// Workflow TOML file
        file: PathBuf,
    },
    /// List runs in the event store
    Runs,
    /// Replay a run and print its execution context as JSON
    Inspect {
        run_id: String,
    },
    /// Print the compiled view of a run as an agent would see it
    View {
        run_id: String,
        /// Restrict to one node's namespace
        #[arg(long)]
        node: Option<String>,
    },
    /// Show the effective configuration
    Config,
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_env("TESSERA_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("tessera=info,warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(*shell, &mut cmd, "tessera", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Validate { file } => return validate(file),
        _ => {}
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Runs => {
            let store = open_store(&config)?;
            let runs = store.list_runs().await?;
            if runs.is_empty() {
                println!("No runs.");
            }
            for run_id in runs {
                let events = store.load(&run_id).await?;
                let ctx = EventLog::from_events(run_id.clone(), events)?.replay(0);
                println!(
                    "{}  {:<10} {:<20} {} events",
                    run_id,
                    ctx.status.to_string(),
                    ctx.workflow.as_deref().unwrap_or("-"),
                    ctx.last_seq.map_or(0, |s| s + 1)
                );
            }
        }
        Commands::Inspect { run_id } => {
            let log = load_log(&config, &run_id).await?;
            let ctx = log.replay(0);
            println!("{}", serde_json::to_string_pretty(&ctx)?);
        }
        Commands::View { run_id, node } => {
            let log = load_log(&config, &run_id).await?;
            let scope = node.map_or(Scope::All, Scope::Node);
            let view = ContextCompiler::compile(&log, &scope);
            let counter = TokenCounter::from_config(&config.model);
            println!("{}", view.render());
            println!();
            println!(
                "{} entries ({} summaries), ~{} tokens, scope {}",
                view.len(),
                view.summaries().count(),
                view.token_count(&counter),
                scope
            );
        }
        Commands::Validate { .. } | Commands::Completions { .. } => {}
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        info!(path = %path.display(), "Loading config");
        return Ok(AppConfig::load(path)?);
    }
    info!(path = %path.display(), "No config file, using defaults");
    Ok(AppConfig::default())
}

fn open_store(config: &AppConfig) -> anyhow::Result<SqliteStore> {
    let db_path = config.db_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    Ok(SqliteStore::open(&db_path)?)
}

async fn load_log(config: &AppConfig, run_id: &str) -> anyhow::Result<EventLog> {
    let store = open_store(config)?;
    let run_id = RunId::from_string(run_id);
    let events = store.load(&run_id).await?;
    if events.is_empty() {
        anyhow::bail!("run {} not found in {}", run_id, config.db_path().display());
    }
    Ok(EventLog::from_events(run_id, events)?)
}

fn validate(file: &Path) -> anyhow::Result<()> {
    let definition = WorkflowDefinition::load(file)?;
    let graph = definition.build()?;
    let topology = graph.validate()?;

    println!("workflow {} is valid", graph.name());
    println!("  entry: {}", topology.entry);
    for node in graph.nodes() {
        let mut flags = Vec::new();
        if node.critical {
            flags.push("critical");
        }
        if topology.repeatable.contains(&node.id) {
            flags.push("repeatable");
        }
        println!("  node {:<20} {:<15} {}", node.id, node.kind_name(), flags.join(" "));
    }
    for (i, edge) in graph.edges().iter().enumerate() {
        let back = if topology.is_back_edge(i) { " (back edge)" } else { "" };
        println!("  edge {} -> {}{}", edge.from, edge.to, back);
    }
    Ok(())
}
