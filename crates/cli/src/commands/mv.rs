use crate::app::App;
use crate::commands::parent_and_leaf;

#[derive(clap::Args)]
pub struct Args {
    /// Source path, e.g. `dropbox/old/report.pdf`
    pub src: String,

    /// Destination path, e.g. `dropbox/archive/report-2024.pdf`
    pub dst: String,
}

pub async fn run(app: &App, args: Args) -> anyhow::Result<()> {
    let (provider, _) = App::split_path(&args.src);
    app.ensure_authorized(&provider).await?;

    let (src_parent, src_name) = parent_and_leaf(&args.src);
    let (dst_parent, dst_name) = parent_and_leaf(&args.dst);
    anyhow::ensure!(
        !src_parent.is_empty() && !dst_parent.is_empty(),
        "both paths must be inside a provider"
    );

    let fs = app.filesystem().await?;
    let from = fs.getattr_path(&src_parent).await?;
    let to = fs.getattr_path(&dst_parent).await?;
    fs.rename(from.inode, &src_name, to.inode, &dst_name).await?;
    fs.shutdown().await;
    eprintln!("moved {} -> {}", args.src, args.dst);
    Ok(())
}
