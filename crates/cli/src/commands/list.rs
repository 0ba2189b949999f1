use nimbus_core::FileType;
use nimbus_vfs::ROOT_INODE;

use crate::app::App;

#[derive(clap::Args)]
pub struct Args {
    /// Remote path, e.g. `google_drive/Documents` (empty lists providers)
    #[arg(default_value = "")]
    pub path: String,
}

pub async fn run(app: &App, args: Args) -> anyhow::Result<()> {
    let fs = app.filesystem().await?;
    let target = if args.path.is_empty() {
        ROOT_INODE
    } else {
        let (provider, _) = App::split_path(&args.path);
        app.ensure_authorized(&provider).await?;
        fs.getattr_path(&args.path).await?.inode
    };

    let entries = fs.readdir(target).await?;
    for entry in entries {
        let marker = if entry.file_type == FileType::Directory {
            "/"
        } else {
            ""
        };
        match entry.file_type {
            FileType::Directory => println!("{}{}", entry.filename, marker),
            _ => println!("{}\t{}", entry.filename, entry.size),
        }
    }
    fs.shutdown().await;
    Ok(())
}
