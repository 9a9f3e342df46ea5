use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use conveyor::collab::Collaborators;
use conveyor::collab::exec::CliGenerator;
use conveyor::config::Config;
use conveyor::poll::Pipeline;
use conveyor::stages::Stage;
use conveyor::stages::plan::PlanStage;
use conveyor::state::ExecutionState;

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(about = "Ticket-to-deployment delivery engine", long_about = None)]
#[command(version)]
struct Cli {
    /// Project directory containing the repository and conveyor.toml
    #[arg(short, long, default_value = ".")]
    project_dir: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process every ready ticket once, then exit
    Run,
    /// Poll the tracker continuously
    Watch,
    /// Process a single ticket by identifier, e.g. ENG-42
    Ticket {
        /// Ticket identifier
        identifier: String,
    },
    /// Plan the work item stack for a task without running it
    Plan {
        /// Free-form task description
        #[arg(long)]
        task: String,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "conveyor=debug" } else { "conveyor=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = Arc::new(Config::load(cli.project_dir.clone(), cli.verbose)?);

    match cli.command {
        Commands::Run => {
            let pipeline = Pipeline::new(config.clone(), Collaborators::live(&config)?);
            let finished = pipeline.run_once().await?;
            println!("Finished {finished} ticket run(s)");
        }
        Commands::Watch => {
            let pipeline = Pipeline::new(config.clone(), Collaborators::live(&config)?);
            pipeline.watch().await?;
        }
        Commands::Ticket { identifier } => {
            let pipeline = Pipeline::new(config.clone(), Collaborators::live(&config)?);
            let state = pipeline.run_identifier(&identifier).await?;
            println!("{identifier}: {}", state.status);
            for message in &state.messages {
                println!("  - {message}");
            }
        }
        Commands::Plan { task } => {
            let generator = Arc::new(CliGenerator::new(
                &config.generator_cmd,
                config.call_timeout,
            ));
            let stage = PlanStage::new(config, generator);
            let update = stage
                .run(&ExecutionState::for_task(&task))
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            let items = update.work_items.unwrap_or_default();
            println!("Planned {} work item(s):", items.len());
            for (index, item) in items.iter().enumerate() {
                let dep = match item.depends_on {
                    Some(dep) => format!(" (depends on #{dep})"),
                    None => String::new(),
                };
                println!("  #{index} [{}] {}{dep}", item.kind, item.title);
            }
        }
    }
    Ok(())
}
