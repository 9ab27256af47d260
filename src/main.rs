use clap::{Parser, Subcommand, ValueEnum};
use docproc::storage::TerminalStatus;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "docproc")]
#[command(about = "Document processing API", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API (default)
    Serve,
    /// Inspect and advance queued batch requests
    Batch {
        #[command(subcommand)]
        action: BatchAction,
    },
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum BatchAction {
    /// Submit every queued request for a deployment as one batch job
    Submit {
        #[arg(long)]
        deployment: String,
    },
    Show {
        id: Uuid,
    },
    /// Record the outcome of a processing request
    Finish {
        id: Uuid,
        #[arg(long, value_enum)]
        status: FinishStatus,
        /// Result document as JSON
        #[arg(long)]
        result: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum FinishStatus {
    Done,
    Failed,
}

impl From<FinishStatus> for TerminalStatus {
    fn from(status: FinishStatus) -> Self {
        match status {
            FinishStatus::Done => TerminalStatus::Done,
            FinishStatus::Failed => TerminalStatus::Failed,
        }
    }
}

#[derive(Subcommand)]
enum ConfigAction {
    Init {
        #[arg(long)]
        stdout: bool,
    },
    Validate,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docproc=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        Some(Commands::Serve) | None => {
            docproc::cli::serve::run(config_path).await?;
        }
        Some(Commands::Batch { action }) => match action {
            BatchAction::Submit { deployment } => {
                docproc::cli::batch::submit(config_path, &deployment).await?;
            }
            BatchAction::Show { id } => {
                docproc::cli::batch::show(config_path, id).await?;
            }
            BatchAction::Finish { id, status, result } => {
                docproc::cli::batch::finish(config_path, id, status.into(), result.as_deref())
                    .await?;
            }
        },
        Some(Commands::Config { action }) => match action {
            ConfigAction::Init { stdout } => {
                docproc::cli::config::init(stdout)?;
            }
            ConfigAction::Validate => {
                docproc::cli::config::validate(config_path)?;
            }
        },
    }

    Ok(())
}
