//! Filesystem presence checks for downloaded assets.

use std::fs;
use std::path::Path;

use tracing::debug;

/// Reports whether `dir` holds a regular file named `stem` plus any single
/// extension (`Intro.mp4`, `Intro.webm`, ...).
///
/// A missing or unreadable directory means the asset is absent. Partial
/// downloads such as `Intro.mp4.part` do not count because their stem is
/// `Intro.mp4`.
pub fn asset_exists(dir: &Path, stem: &str) -> bool {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            debug!(dir = %dir.display(), error = %err, "asset directory not readable; treating as absent");
            return false;
        }
    };

    entries.flatten().any(|entry| {
        let path = entry.path();
        path.is_file() && path.file_stem().is_some_and(|found| found == stem)
    })
}
