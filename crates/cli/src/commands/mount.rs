use std::path::PathBuf;

use crate::app::App;

#[derive(clap::Args)]
pub struct Args {
    /// Mount point for a kernel bridge, when one is attached externally
    pub mountpoint: Option<PathBuf>,
}

/// Runs the VFS with all configured providers and keeps the local daemon
/// serving playable URLs until interrupted. The kernel file system bridge
/// itself is an external collaborator; without one, content is reachable
/// through the daemon's streaming endpoint.
pub async fn run(app: &App, args: Args) -> anyhow::Result<()> {
    for provider in app.clients.keys() {
        app.ensure_authorized(provider).await?;
    }
    let fs = app.filesystem().await?;

    if let Some(mountpoint) = &args.mountpoint {
        eprintln!(
            "no kernel bridge attached; {} will not appear in the file tree",
            mountpoint.display()
        );
    }
    eprintln!(
        "serving {} provider(s) at {} — press Ctrl-C to stop",
        app.clients.len(),
        app.daemon_url
    );

    tokio::signal::ctrl_c().await?;
    eprintln!("shutting down");
    fs.shutdown().await;
    Ok(())
}
