use crate::ops::{self, ClosingArgs, CredentialArgs, PackageArgs};
use crate::server;
use clap::{Args, Parser, Subcommand};
use fiscal_pipeline::error::AppError;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "Fiscal Document Worker",
    about = "Submit, track and package electronic fiscal documents",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP service and the status scheduler (default command)
    Serve(ServeArgs),
    /// Post a snapshot read from a JSON file and submit it right away
    Post {
        /// Path to the document snapshot
        snapshot: PathBuf,
    },
    /// Show the current state of a document
    Status { document: String },
    /// Replay the submission attempts recorded for a document
    Replay { document: String },
    /// Cancel a document that is not accepted
    Cancel {
        document: String,
        /// Reason stored with the transition
        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
    },
    /// Write the attached-document package of an accepted document
    Package(PackageArgs),
    /// Totals of issued documents for a period
    Closing(ClosingArgs),
    /// Run one scheduler pass: recover, submit queued, poll pending
    Tick,
    /// Resolve submissions left behind by a stopped worker
    Recover,
    /// List the registered codecs
    Codecs,
    /// Register a credential in the ledger
    Credential(CredentialArgs),
}

#[derive(Args, Debug, Default)]
pub(crate) struct ServeArgs {
    /// Override the configured host for the HTTP server
    #[arg(long)]
    pub(crate) host: Option<String>,
    /// Override the configured port for the HTTP server
    #[arg(long)]
    pub(crate) port: Option<u16>,
    /// Serve the HTTP surface only; another worker drives the scheduler
    #[arg(long)]
    pub(crate) no_scheduler: bool,
}

pub(crate) async fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let command = cli
        .command
        .unwrap_or_else(|| Command::Serve(ServeArgs::default()));

    if let Command::Serve(args) = command {
        return server::run(args).await;
    }

    let (config, pipeline) = ops::open()?;
    match command {
        Command::Serve(_) => Ok(()),
        Command::Post { snapshot } => ops::post(&pipeline, &snapshot).await,
        Command::Status { document } => ops::status(&pipeline, &document),
        Command::Replay { document } => ops::replay(&pipeline, &document),
        Command::Cancel { document, reason } => ops::cancel(&pipeline, &document, &reason),
        Command::Package(args) => ops::package(&pipeline, args),
        Command::Closing(args) => ops::closing(&pipeline, args),
        Command::Tick => ops::tick(pipeline, config.fiscal.scheduler_settings()).await,
        Command::Recover => ops::recover(&pipeline).await,
        Command::Codecs => ops::codecs(&pipeline),
        Command::Credential(args) => ops::register_credential(&pipeline, args),
    }
}
