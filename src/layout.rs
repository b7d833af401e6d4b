//! On-disk asset layout.
//!
//! ```text
//! <base>/videos/<channel>/<title>.<ext>
//! <base>/thumbnails/<channel>/<title>.jpg
//! <base>/logos/<channel>/logo.png
//! <base>/logs/ingest.log
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const VIDEOS_SUBDIR: &str = "videos";
const THUMBNAILS_SUBDIR: &str = "thumbnails";
const LOGOS_SUBDIR: &str = "logos";
const LOGS_SUBDIR: &str = "logs";
const LOGO_FILE: &str = "logo.png";
const LOG_FILE: &str = "ingest.log";
pub const THUMBNAIL_EXT: &str = "jpg";

/// Every filesystem location an ingestion touches, derived from one base.
#[derive(Debug, Clone)]
pub struct AssetLayout {
    base: PathBuf,
    videos: PathBuf,
    thumbnails: PathBuf,
    logos: PathBuf,
    logs: PathBuf,
}

impl AssetLayout {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        Self {
            videos: base.join(VIDEOS_SUBDIR),
            thumbnails: base.join(THUMBNAILS_SUBDIR),
            logos: base.join(LOGOS_SUBDIR),
            logs: base.join(LOGS_SUBDIR),
            base,
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Creates the top-level directories. Safe to call on an existing tree.
    pub fn prepare(&self) -> Result<()> {
        for dir in [&self.videos, &self.thumbnails, &self.logos, &self.logs] {
            ensure_dir(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn video_dir(&self, channel: &str) -> PathBuf {
        self.videos.join(sanitize_component(channel))
    }

    pub fn thumbnail_dir(&self, channel: &str) -> PathBuf {
        self.thumbnails.join(sanitize_component(channel))
    }

    pub fn thumbnail_path(&self, channel: &str, title: &str) -> PathBuf {
        self.thumbnail_dir(channel)
            .join(format!("{}.{THUMBNAIL_EXT}", asset_stem(title)))
    }

    pub fn logo_dir(&self, channel: &str) -> PathBuf {
        self.logos.join(sanitize_component(channel))
    }

    pub fn logo_path(&self, channel: &str) -> PathBuf {
        self.logo_dir(channel).join(LOGO_FILE)
    }

    pub fn log_file(&self) -> PathBuf {
        self.logs.join(LOG_FILE)
    }
}

/// Filename (without extension) used for both the media file and thumbnail.
pub fn asset_stem(title: &str) -> String {
    sanitize_component(title)
}

/// Creates `dir` when it is absent; an existing directory is success.
pub fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(dir)
}

/// Maps a channel name or title onto a single safe path component.
///
/// The mapping is reversible, so distinct names never share a file: `%`,
/// reserved and control characters are percent-encoded, as are leading
/// whitespace and trailing whitespace or dots. The empty name maps to a lone
/// `%`, which no escape sequence can produce.
pub fn sanitize_component(raw: &str) -> String {
    if raw.is_empty() {
        return "%".to_string();
    }
    let body_start = raw
        .char_indices()
        .find(|(_, c)| !c.is_whitespace())
        .map_or(raw.len(), |(idx, _)| idx);
    let body_end = raw
        .char_indices()
        .rev()
        .find(|(_, c)| !c.is_whitespace() && *c != '.')
        .map_or(body_start, |(idx, c)| idx + c.len_utf8())
        .max(body_start);

    let mut out = String::with_capacity(raw.len());
    for (idx, c) in raw.char_indices() {
        let edge = idx < body_start || idx >= body_end;
        let reserved = matches!(c, '%' | '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|');
        if edge || reserved || c.is_control() {
            push_escaped(&mut out, c);
        } else {
            out.push(c);
        }
    }
    out
}

fn push_escaped(out: &mut String, c: char) {
    let mut buf = [0u8; 4];
    for byte in c.encode_utf8(&mut buf).bytes() {
        out.push_str(&format!("%{byte:02X}"));
    }
}
