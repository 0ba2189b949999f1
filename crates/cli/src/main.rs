mod app;
mod commands;
mod consent;
mod store;

use clap::{Parser, Subcommand};
use nimbus_core::ErrorKind;
use tracing_subscriber::EnvFilter;

use crate::app::App;
use crate::commands::{download, list, mkdir, mount, mv, rm, upload};

#[derive(Parser)]
#[command(name = "nimbus")]
#[command(author, version, about = "Unified cloud storage client")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List a remote directory
    List(list::Args),

    /// Download a remote file
    Download(download::Args),

    /// Upload a local file to a remote directory
    Upload(upload::Args),

    /// Create a remote directory
    Mkdir(mkdir::Args),

    /// Move or rename a remote file or directory
    Mv(mv::Args),

    /// Remove a remote file or directory
    Rm(rm::Args),

    /// Run the VFS and local streaming daemon
    Mount(mount::Args),
}

// Exit codes: 0 success, 1 internal, 2 usage (clap's own), 3 auth,
// 4 not found, 5 network.
fn exit_code(error: &anyhow::Error) -> i32 {
    match error.downcast_ref::<nimbus_core::Error>() {
        Some(e) => match e.kind() {
            ErrorKind::Auth => 3,
            ErrorKind::Semantic => 4,
            ErrorKind::Transport | ErrorKind::Http | ErrorKind::Resource => 5,
            ErrorKind::Cancelled | ErrorKind::Internal => 1,
        },
        None => 1,
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "nimbus=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = run(cli).await;
    if let Err(error) = result {
        eprintln!("error: {error:#}");
        std::process::exit(exit_code(&error));
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let app = App::new().await?;
    match cli.command {
        Commands::List(args) => list::run(&app, args).await,
        Commands::Download(args) => download::run(&app, args).await,
        Commands::Upload(args) => upload::run(&app, args).await,
        Commands::Mkdir(args) => mkdir::run(&app, args).await,
        Commands::Mv(args) => mv::run(&app, args).await,
        Commands::Rm(args) => rm::run(&app, args).await,
        Commands::Mount(args) => mount::run(&app, args).await,
    }
}
