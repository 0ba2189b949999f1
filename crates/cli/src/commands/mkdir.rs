use crate::app::App;
use crate::commands::parent_and_leaf;

#[derive(clap::Args)]
pub struct Args {
    /// Remote directory to create, e.g. `google_drive/projects/new`
    pub path: String,
}

pub async fn run(app: &App, args: Args) -> anyhow::Result<()> {
    let (provider, _) = App::split_path(&args.path);
    app.ensure_authorized(&provider).await?;

    let (parent, name) = parent_and_leaf(&args.path);
    anyhow::ensure!(!parent.is_empty(), "cannot create a directory at the root");

    let fs = app.filesystem().await?;
    let parent_node = fs.getattr_path(&parent).await?;
    let created = fs.mkdir(parent_node.inode, &name).await?;
    fs.shutdown().await;
    eprintln!("created {}", created.filename);
    Ok(())
}
