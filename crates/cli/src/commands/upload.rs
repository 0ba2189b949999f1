use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use nimbus_core::client::discard;
use nimbus_vfs::FileSource;

use crate::app::App;

#[derive(clap::Args)]
pub struct Args {
    /// Local file to upload
    pub local: PathBuf,

    /// Remote directory, e.g. `s3/bucket/backups`
    pub remote: String,
}

pub async fn run(app: &App, args: Args) -> anyhow::Result<()> {
    let (provider, _) = App::split_path(&args.remote);
    app.ensure_authorized(&provider).await?;

    let filename = args
        .local
        .file_name()
        .and_then(|n| n.to_str())
        .context("local path has no file name")?
        .to_string();

    let fs = app.filesystem().await?;
    let node = fs.getattr_path(&args.remote).await?;
    let (provider, parent_item) = fs.item_of(node.inode).await?;
    fs.shutdown().await;

    let source = Arc::new(FileSource::open(&args.local).await?);
    let client = app.client(&provider)?;
    let uploaded = client
        .upload_file(&parent_item, &filename, source, None, discard)
        .result()
        .await?;
    eprintln!("uploaded {} as {}", args.local.display(), uploaded.filename);
    Ok(())
}
