use clap::{Parser, Subcommand};
use mycelium_core::ProjectConfig;
use mycelium_exec::{AgentCliClient, AppResult, RunEngine, RunOptions, StopSignal};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "mycelium-exec", about = "Executor for planned coding-agent runs")]
struct Cli {
    /// Path to the project config file.
    #[arg(long, default_value = "mycelium.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a run over the planned tasks.
    Run {
        /// Reopen an existing run id instead of starting a new run.
        #[arg(long)]
        run_id: Option<String>,
        /// Override max_parallel from config.
        #[arg(long)]
        max_parallel: Option<u32>,
    },
    /// Resume a run after a crash, resetting in-flight tasks.
    Resume {
        #[arg(long)]
        run_id: String,
    },
}

#[tokio::main]
async fn main() -> AppResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let mut config = ProjectConfig::from_file(&cli.config)?;

    let (run_id, resume) = match cli.command {
        Commands::Run {
            run_id,
            max_parallel,
        } => {
            if let Some(max_parallel) = max_parallel {
                if max_parallel == 0 {
                    eyre::bail!("--max-parallel must be >= 1");
                }
                config.max_parallel = max_parallel;
            }
            (run_id, false)
        }
        Commands::Resume { run_id } => (Some(run_id), true),
    };

    let stop = StopSignal::new();
    mycelium_exec::signals::spawn_signal_listener(stop.clone());

    let llm = Arc::new(AgentCliClient {
        bin: config.agent.bin.clone(),
        model: config.agent.model.clone(),
    });

    let options = RunOptions {
        home: None,
        run_id,
        resume,
        crash_after_start: false,
    };
    let mut engine = RunEngine::new(config, options, llm, stop)?;
    tracing::info!(run_id = %engine.run_id(), state = %engine.state_path().display(), "run starting");

    let status = engine.run().await?;
    tracing::info!(status = status.as_str(), "run finished");
    Ok(())
}
