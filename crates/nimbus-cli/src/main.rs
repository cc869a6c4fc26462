//! nimbus CLI tool.

use clap::{Parser, Subcommand};

mod commands;

use commands::ApiClient;
use commands::jobs::FilterArgs;

#[derive(Parser)]
#[command(name = "nimbus")]
#[command(about = "nimbus job orchestrator CLI", long_about = None)]
struct Cli {
    /// API server URL
    #[arg(long, env = "NIMBUS_API_URL", default_value = "http://localhost:3000")]
    api_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Trigger a job manually
    Trigger {
        #[command(subcommand)]
        command: TriggerCommands,
    },
    /// Cancel a job, or every job matching a filter
    Cancel {
        /// Job kind (describe, compliance, compliance-runner, ...)
        kind: String,
        /// Job ID; omit to cancel by filter
        id: Option<String>,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Show job counts by status
    Progress {
        /// Job kind
        kind: String,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Validate an orchestrator configuration
    Validate {
        /// Path to the configuration file
        #[arg(default_value = "nimbus.kdl")]
        path: String,
    },
}

#[derive(Subcommand)]
enum TriggerCommands {
    /// Describe resource types of one connection
    Describe {
        /// Connection ID
        connection: String,
        /// Resource types to describe
        #[arg(required = true)]
        resource_types: Vec<String>,
    },
    /// Evaluate a benchmark against connections
    Benchmark {
        /// Benchmark ID
        benchmark: String,
        /// Connection IDs
        #[arg(long = "connection", required = true)]
        connections: Vec<String>,
        /// Restrict the run to these controls
        #[arg(long = "control")]
        controls: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Validate { path } = &cli.command {
        return commands::validate(path);
    }

    let api = ApiClient::new(&cli.api_url)?;
    match cli.command {
        Commands::Trigger { command } => match command {
            TriggerCommands::Describe {
                connection,
                resource_types,
            } => {
                commands::trigger::describe(&api, &connection, resource_types).await?;
            }
            TriggerCommands::Benchmark {
                benchmark,
                connections,
                controls,
            } => {
                commands::trigger::benchmark(&api, &benchmark, connections, controls).await?;
            }
        },
        Commands::Cancel { kind, id, filter } => match id {
            Some(id) => commands::jobs::cancel(&api, &kind, &id).await?,
            None => commands::jobs::cancel_matching(&api, &kind, &filter).await?,
        },
        Commands::Progress { kind, filter } => {
            commands::jobs::progress(&api, &kind, &filter).await?;
        }
        Commands::Validate { .. } => {}
    }

    Ok(())
}
