use std::path::PathBuf;

use nimbus_core::client::discard;
use nimbus_core::http::FileSink;
use nimbus_core::FULL_RANGE;

use crate::app::App;

#[derive(clap::Args)]
pub struct Args {
    /// Remote file path, e.g. `dropbox/music/track.mp3`
    pub remote: String,

    /// Local destination (defaults to the remote file name)
    pub local: Option<PathBuf>,
}

pub async fn run(app: &App, args: Args) -> anyhow::Result<()> {
    let (provider, _) = App::split_path(&args.remote);
    app.ensure_authorized(&provider).await?;

    let fs = app.filesystem().await?;
    let node = fs.getattr_path(&args.remote).await?;
    let (provider, item) = fs.item_of(node.inode).await?;
    fs.shutdown().await;

    let destination = args
        .local
        .unwrap_or_else(|| PathBuf::from(&node.filename));
    let file = tokio::fs::File::create(&destination).await?;
    let client = app.client(&provider)?;
    client
        .download_file(&item, FULL_RANGE, FileSink(file), None, discard)
        .result()
        .await?;
    eprintln!("downloaded {} ({} bytes)", destination.display(), node.size);
    Ok(())
}
