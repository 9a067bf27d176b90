use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use photogrid::app::GallerySession;
use photogrid::models::AlbumId;
use photogrid::GalleryConfig;

/// Scroll a photo library through the prefetching grid pipeline.
#[derive(Debug, Parser)]
#[command(name = "photogrid", version, about)]
struct Cli {
    /// Library root; defaults to the pictures directory
    root: Option<PathBuf>,

    /// Album to show (a sub-directory name, or Panoramas / Verticals)
    #[arg(long)]
    album: Option<String>,

    /// Grid columns
    #[arg(long, default_value_t = 3)]
    columns: usize,

    /// Display scale (device pixels per point)
    #[arg(long, default_value_t = 2.0)]
    scale: f64,

    /// Visible rows
    #[arg(long, default_value_t = 6)]
    rows: usize,

    /// Asset index location
    #[arg(long)]
    index: Option<PathBuf>,

    /// Fire a memory warning when this row reaches the top
    #[arg(long, value_name = "ROW")]
    memory_warning_after: Option<usize>,

    /// Print the album selector and exit
    #[arg(long)]
    list_albums: bool,
}

fn run(cli: Cli) -> Result<()> {
    let mut config = GalleryConfig::default()
        .with_columns(cli.columns)
        .with_display_scale(cli.scale)
        .with_visible_rows(cli.rows);
    if let Some(root) = cli.root {
        config = config.with_library_root(root);
    }
    if let Some(index) = cli.index {
        config = config.with_index_path(index);
    }

    let album = cli.album.as_deref().map(AlbumId::from_name);
    let mut session = GallerySession::open(config, album)?;

    if cli.list_albums {
        for line in session.list_albums()? {
            println!("{}", line);
        }
        return Ok(());
    }

    let summary = session.run(cli.memory_warning_after);
    println!("{}", summary);
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("photogrid=info".parse().unwrap()),
        )
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("photogrid: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
