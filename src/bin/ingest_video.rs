#![forbid(unsafe_code)]

//! Ingests one video: makes sure its channel and video rows exist exactly
//! once and that the media and thumbnail sit under the asset root.

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use ytingest::channel_api::YoutubeDataApi;
use ytingest::config::{SettingsOverrides, resolve_settings};
use ytingest::layout::AssetLayout;
use ytingest::logging;
use ytingest::media::YtDlp;
use ytingest::metadata::MetadataStore;
use ytingest::reconcile::{Ingestion, ReconciliationEngine};

#[derive(Debug, Parser)]
#[command(name = "ingest_video", about = "Download a video and record it exactly once")]
struct Args {
    /// Video URL or bare video id.
    video: String,

    /// Asset root (overrides YT_BASE_DIR).
    #[arg(long)]
    base_dir: Option<PathBuf>,

    /// SQLite metadata database (overrides YT_DATABASE).
    #[arg(long)]
    database: Option<PathBuf>,

    /// Env file read for settings.
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// yt-dlp executable (overrides YT_DLP).
    #[arg(long)]
    yt_dlp: Option<PathBuf>,
}

impl Args {
    fn overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            base_dir: self.base_dir.clone(),
            database_path: self.database.clone(),
            yt_dlp: self.yt_dlp.clone(),
            env_path: self.env_file.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = resolve_settings(args.overrides())?;

    let layout = AssetLayout::new(&settings.base_dir);
    layout.prepare()?;
    logging::init(&layout.log_file())?;
    info!(base = %layout.base().display(), "starting ingestion");

    let media = YtDlp::new(&settings.yt_dlp);
    media.ensure_available()?;

    let store = MetadataStore::open(&settings.database_path)
        .await
        .context("initializing metadata database")?;
    let resolver = media.clone();
    let input = args.video.clone();
    let video = tokio::task::spawn_blocking(move || resolver.resolve(&input))
        .await
        .context("yt-dlp resolution task failed")?
        .with_context(|| format!("resolving {}", args.video))?;
    info!(title = %video.title, channel = %video.channel_name, "resolved video");

    let engine = ReconciliationEngine::new(
        store,
        YoutubeDataApi::new(settings.api_key.clone()),
        media,
        layout,
    );
    let outcome = engine
        .ingest(&video)
        .await
        .with_context(|| format!("ingesting {}", video.url))?;

    info!(action = ?outcome.action, channel_created = outcome.channel_created, "ingestion complete");
    write_outcome(&mut io::stdout().lock(), &outcome)
}

/// Stdout carries only this document; logs go to stderr and the log file.
fn write_outcome(out: &mut impl Write, outcome: &Ingestion) -> Result<()> {
    serde_json::to_writer_pretty(&mut *out, outcome)?;
    writeln!(out)?;
    Ok(())
}
