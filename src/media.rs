//! Video resolution and media downloads, backed by yt-dlp.
//!
//! The binary resolves a URL into a [`VideoRef`] once, then hands it to the
//! reconciliation engine which decides whether [`MediaFetcher`] runs at all.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::layout::{THUMBNAIL_EXT, ensure_dir};

/// Format selection: best video plus best audio, else the best muxed stream.
const BEST_FORMAT: &str = "bv*+ba/b";
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Everything known about a video before anything is downloaded.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoRef {
    pub video_id: String,
    pub url: String,
    pub title: String,
    /// Display name of the uploading channel; the channel identity.
    pub channel_name: String,
    /// Upstream channel id, used for metadata lookups.
    pub channel_id: String,
    pub duration_seconds: f64,
    pub description: String,
    pub published_at: Option<DateTime<Utc>>,
    pub thumbnail_url: Option<String>,
}

/// Metadata reported by a completed media download.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaDetails {
    pub duration_seconds: f64,
    pub description: String,
    pub published_at: Option<DateTime<Utc>>,
}

/// Downloads media and thumbnails. `dest_filename` never carries an
/// extension; implementations choose it.
pub trait MediaFetcher {
    fn fetch_video(
        &self,
        video: &VideoRef,
        dest_dir: &Path,
        dest_filename: &str,
    ) -> Result<MediaDetails>;

    /// Writes `<dest_dir>/<dest_filename>.jpg` and returns its size in bytes.
    fn fetch_thumbnail(&self, video: &VideoRef, dest_dir: &Path, dest_filename: &str)
    -> Result<u64>;
}

/// Subset of yt-dlp's `--dump-single-json` payload. Everything optional
/// because older uploads lack fields.
#[derive(Debug, Deserialize)]
struct VideoInfo {
    id: Option<String>,
    title: Option<String>,
    fulltitle: Option<String>,
    description: Option<String>,
    webpage_url: Option<String>,
    channel: Option<String>,
    uploader: Option<String>,
    channel_id: Option<String>,
    duration: Option<f64>,
    upload_date: Option<String>,
    timestamp: Option<i64>,
    thumbnail: Option<String>,
}

impl VideoInfo {
    fn published_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp
            .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
            .or_else(|| self.upload_date.as_deref().and_then(upload_date_to_utc))
    }

    fn into_video_ref(self, fallback_url: &str) -> Result<VideoRef> {
        let published_at = self.published_at();
        let video_id = self.id.context("yt-dlp metadata lacks an id")?;
        let title = self
            .title
            .or(self.fulltitle)
            .filter(|title| !title.trim().is_empty())
            .with_context(|| format!("video {video_id} has no title"))?;
        let channel_name = self
            .channel
            .or(self.uploader)
            .filter(|name| !name.trim().is_empty())
            .with_context(|| format!("video {video_id} has no channel name"))?;
        let channel_id = self
            .channel_id
            .with_context(|| format!("video {video_id} has no channel id"))?;
        Ok(VideoRef {
            url: self.webpage_url.unwrap_or_else(|| fallback_url.to_string()),
            title,
            channel_name,
            channel_id,
            duration_seconds: self.duration.unwrap_or(0.0),
            description: self.description.unwrap_or_default(),
            published_at,
            thumbnail_url: self.thumbnail,
            video_id,
        })
    }

    fn into_details(self) -> MediaDetails {
        MediaDetails {
            published_at: self.published_at(),
            duration_seconds: self.duration.unwrap_or(0.0),
            description: self.description.unwrap_or_default(),
        }
    }
}

/// yt-dlp's `upload_date` is `YYYYMMDD`; midnight UTC is assumed.
fn upload_date_to_utc(value: &str) -> Option<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(value, "%Y%m%d").ok()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc())
}

/// Accepts a full URL or a bare 11-character video id.
pub fn normalize_video_url(input: &str) -> String {
    let trimmed = input.trim();
    let is_bare_id = trimmed.len() == 11
        && trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if is_bare_id {
        format!("https://www.youtube.com/watch?v={trimmed}")
    } else {
        trimmed.to_string()
    }
}

/// `%` starts a field in yt-dlp output templates.
fn escape_template(value: &str) -> String {
    value.replace('%', "%%")
}

/// [`MediaFetcher`] driving the yt-dlp executable; thumbnails come straight
/// from the URL yt-dlp reported.
#[derive(Clone)]
pub struct YtDlp {
    program: PathBuf,
    agent: ureq::Agent,
}

impl YtDlp {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            agent: ureq::AgentBuilder::new().timeout(HTTP_TIMEOUT).build(),
        }
    }

    fn command(&self) -> Command {
        Command::new(&self.program)
    }

    /// Runs `<program> --version` to fail loudly when yt-dlp is missing.
    pub fn ensure_available(&self) -> Result<()> {
        let status = self
            .command()
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        match status {
            Ok(status) if status.success() => Ok(()),
            Ok(_) => bail!(
                "{} is installed but returned a failure status",
                self.program.display()
            ),
            Err(err) => bail!(
                "{} is not installed or not in PATH: {}",
                self.program.display(),
                err
            ),
        }
    }

    /// Looks up a video without downloading it.
    pub fn resolve(&self, input: &str) -> Result<VideoRef> {
        let url = normalize_video_url(input);
        let mut command = self.command();
        command
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg("--no-progress")
            .arg(&url);
        let info = run_for_info(command, &url)?;
        let video = info.into_video_ref(&url)?;
        debug!(video_id = %video.video_id, title = %video.title, channel = %video.channel_name, "resolved video");
        Ok(video)
    }
}

impl std::fmt::Debug for YtDlp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YtDlp")
            .field("program", &self.program)
            .finish_non_exhaustive()
    }
}

/// Runs yt-dlp and parses the single JSON document it prints on stdout.
fn run_for_info(mut command: Command, url: &str) -> Result<VideoInfo> {
    let output = command
        .stdin(Stdio::null())
        .stderr(Stdio::inherit())
        .output()
        .with_context(|| format!("running yt-dlp for {url}"))?;

    if !output.status.success() {
        bail!("yt-dlp failed for {} (status {})", url, output.status);
    }

    let raw_json = String::from_utf8(output.stdout).context("parsing yt-dlp output as UTF-8")?;
    serde_json::from_str(raw_json.trim()).context("deserializing yt-dlp JSON")
}

impl MediaFetcher for YtDlp {
    fn fetch_video(
        &self,
        video: &VideoRef,
        dest_dir: &Path,
        dest_filename: &str,
    ) -> Result<MediaDetails> {
        ensure_dir(dest_dir).with_context(|| format!("creating {}", dest_dir.display()))?;
        let template = dest_dir.join(format!("{}.%(ext)s", escape_template(dest_filename)));
        info!(video_id = %video.video_id, dest = %dest_dir.display(), "downloading video");

        let mut command = self.command();
        command
            .arg("--format")
            .arg(BEST_FORMAT)
            .arg("--output")
            .arg(&template)
            .arg("--no-playlist")
            .arg("--no-simulate")
            .arg("--dump-single-json")
            .arg("--no-overwrites")
            .arg("--continue")
            .arg("--no-warnings")
            .arg("--no-progress")
            .arg(&video.url);

        let details = run_for_info(command, &video.url)?.into_details();
        info!(video_id = %video.video_id, "video downloaded");
        Ok(details)
    }

    fn fetch_thumbnail(
        &self,
        video: &VideoRef,
        dest_dir: &Path,
        dest_filename: &str,
    ) -> Result<u64> {
        let url = video
            .thumbnail_url
            .as_deref()
            .with_context(|| format!("video {} has no thumbnail url", video.video_id))?;
        ensure_dir(dest_dir).with_context(|| format!("creating {}", dest_dir.display()))?;

        let response = self
            .agent
            .get(url)
            .call()
            .with_context(|| format!("downloading thumbnail {url}"))?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut bytes)
            .with_context(|| format!("reading thumbnail {url}"))?;

        let target = dest_dir.join(format!("{dest_filename}.{THUMBNAIL_EXT}"));
        write_atomically(&target, &bytes)?;
        debug!(path = %target.display(), bytes = bytes.len(), "thumbnail written");
        Ok(bytes.len() as u64)
    }
}

/// Writes through a temp file in the same directory so readers never see a
/// truncated file.
pub fn write_atomically(target: &Path, bytes: &[u8]) -> Result<()> {
    let dir = target
        .parent()
        .with_context(|| format!("{} has no parent directory", target.display()))?;
    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("creating temp file in {}", dir.display()))?;
    tmp.write_all(bytes)
        .with_context(|| format!("writing {}", target.display()))?;
    tmp.persist(target)
        .with_context(|| format!("persisting {}", target.display()))?;
    Ok(())
}
