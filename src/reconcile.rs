//! Reconciles one (channel, video) pair across the channel table, the video
//! table and the asset tree.
//!
//! Nothing is stored between requests: every run re-derives whether the
//! channel exists, whether the video row exists and whether the media file is
//! on disk, then takes the smallest action that brings the three into
//! agreement.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::channel_api::MetadataFetcher;
use crate::error::IngestError;
use crate::layout::{AssetLayout, asset_stem, ensure_dir};
use crate::media::{MediaDetails, MediaFetcher, VideoRef, write_atomically};
use crate::metadata::{ChannelId, ChannelRecord, ChannelStore, VideoRecord, VideoStore};
use crate::probe::asset_exists;

/// What happened to the video side of an ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoAction {
    /// Row and media file were both present.
    AlreadyReconciled,
    /// Row present, media missing: downloaded again, no new row.
    Redownloaded,
    /// Neither present: downloaded and inserted.
    Downloaded,
    /// Media present without a row: inserted without downloading.
    AdoptedOrphan,
}

/// Outcome of [`ReconciliationEngine::ingest`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ingestion {
    pub channel: ChannelId,
    pub channel_created: bool,
    pub action: VideoAction,
    /// The stored row after reconciliation, fresh or pre-existing.
    pub video: VideoRecord,
}

/// Minutes with two decimals, e.g. 125 s -> 2.08. Exact halves round to
/// even, like `%.2f` formatting: 7.5 s -> 0.12.
pub fn duration_minutes(seconds: f64) -> f64 {
    (seconds / 60.0 * 100.0).round_ties_even() / 100.0
}

/// Composes the stores, the fetchers and the asset layout for ingestion.
///
/// The engine assumes it is the only writer for a given channel while a
/// request is in flight; callers needing parallelism serialize per channel.
/// Fetchers block, so every call into them runs on tokio's blocking pool.
#[derive(Debug)]
pub struct ReconciliationEngine<S, M, F> {
    store: S,
    metadata: Arc<M>,
    media: Arc<F>,
    layout: AssetLayout,
}

impl<S, M, F> ReconciliationEngine<S, M, F>
where
    S: ChannelStore + VideoStore,
    M: MetadataFetcher + Send + Sync + 'static,
    F: MediaFetcher + Send + Sync + 'static,
{
    pub fn new(store: S, metadata: M, media: F, layout: AssetLayout) -> Self {
        Self {
            store,
            metadata: Arc::new(metadata),
            media: Arc::new(media),
            layout,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn layout(&self) -> &AssetLayout {
        &self.layout
    }

    /// Runs one ingestion: channel first, then the video row and media file.
    pub async fn ingest(&self, video: &VideoRef) -> Result<Ingestion, IngestError> {
        let (channel, channel_created) = self.resolve_channel(video).await?;

        let existing = self
            .store
            .find_video(&video.title, channel)
            .await
            .map_err(IngestError::store)?;

        let video_dir = self.layout.video_dir(&video.channel_name);
        let stem = asset_stem(&video.title);
        let file_exists = asset_exists(&video_dir, &stem);

        let (action, record) = match (existing, file_exists) {
            (Some((_, record)), true) => {
                info!(title = %video.title, channel = %video.channel_name, "video already present in store and on disk");
                (VideoAction::AlreadyReconciled, record)
            }
            (Some((_, record)), false) => {
                warn!(
                    title = %video.title,
                    dir = %video_dir.display(),
                    "video stored but media file missing; downloading again"
                );
                self.download(video, &video_dir, &stem).await?;
                (VideoAction::Redownloaded, record)
            }
            (None, false) => {
                info!(title = %video.title, channel = %video.channel_name, "video not in store; downloading");
                let (details, thumbnail) = self.download(video, &video_dir, &stem).await?;
                let record = build_record(video, channel, &details, thumbnail);
                self.insert_video(&record).await?;
                (VideoAction::Downloaded, record)
            }
            (None, true) => {
                info!(
                    title = %video.title,
                    dir = %video_dir.display(),
                    "media file found without a store entry; recording it"
                );
                let thumbnail_path = self.layout.thumbnail_path(&video.channel_name, &video.title);
                let thumbnail = thumbnail_path
                    .is_file()
                    .then(|| thumbnail_path.to_string_lossy().into_owned());
                let details = MediaDetails {
                    duration_seconds: video.duration_seconds,
                    description: video.description.clone(),
                    published_at: video.published_at,
                };
                let record = build_record(video, channel, &details, thumbnail);
                self.insert_video(&record).await?;
                (VideoAction::AdoptedOrphan, record)
            }
        };

        Ok(Ingestion {
            channel,
            channel_created,
            action,
            video: record,
        })
    }

    /// Returns the channel id, creating the channel (profile fetch, logo,
    /// row) only when no row with this name exists yet.
    async fn resolve_channel(&self, video: &VideoRef) -> Result<(ChannelId, bool), IngestError> {
        let name = video.channel_name.as_str();
        if let Some((id, _)) = self
            .store
            .find_channel(name)
            .await
            .map_err(IngestError::store)?
        {
            debug!(channel = name, %id, "channel already stored");
            return Ok((id, false));
        }

        warn!(channel = name, "channel not in store; fetching profile");
        let metadata = Arc::clone(&self.metadata);
        let channel_id = video.channel_id.clone();
        let profile = tokio::task::spawn_blocking(move || metadata.fetch_channel(&channel_id))
            .await
            .map_err(|err| IngestError::metadata(&video.channel_id, err))?
            .map_err(|err| IngestError::metadata(&video.channel_id, err))?;
        if profile.name != name {
            debug!(channel = name, upstream = %profile.name, "upstream channel title differs; keeping video's channel name");
        }

        let logo_dir = self.layout.logo_dir(name);
        ensure_dir(&logo_dir).map_err(|err| IngestError::filesystem(&logo_dir, err))?;
        let logo_path = self.layout.logo_path(name);
        write_atomically(&logo_path, &profile.logo)
            .map_err(|err| IngestError::filesystem(&logo_path, err))?;

        let record = ChannelRecord {
            name: name.to_string(),
            description: profile.description,
            joined_at: profile.joined_at,
            logo: logo_path.to_string_lossy().into_owned(),
            view_count: profile.view_count,
            subscriber_count: profile.subscriber_count,
            video_count: profile.video_count,
        };
        let id = self
            .store
            .insert_channel(&record)
            .await
            .map_err(IngestError::store)?;
        info!(channel = name, %id, "channel created");
        Ok((id, true))
    }

    /// Downloads media then thumbnail. A media failure aborts; a thumbnail
    /// failure is logged and yields no thumbnail path.
    async fn download(
        &self,
        video: &VideoRef,
        video_dir: &Path,
        stem: &str,
    ) -> Result<(MediaDetails, Option<String>), IngestError> {
        let media = Arc::clone(&self.media);
        let owned_video = video.clone();
        let dir = video_dir.to_path_buf();
        let filename = stem.to_string();
        let details = tokio::task::spawn_blocking(move || {
            media.fetch_video(&owned_video, &dir, &filename)
        })
        .await
        .map_err(|err| IngestError::media(&video.video_id, err))?
        .map_err(|err| IngestError::media(&video.video_id, err))?;
        info!(title = %video.title, dir = %video_dir.display(), "media downloaded");

        let media = Arc::clone(&self.media);
        let owned_video = video.clone();
        let filename = stem.to_string();
        let thumbnail_dir = self.layout.thumbnail_dir(&video.channel_name);
        let fetched = tokio::task::spawn_blocking(move || {
            media.fetch_thumbnail(&owned_video, &thumbnail_dir, &filename)
        })
        .await
        .map_err(anyhow::Error::from)
        .and_then(|result| result);
        let thumbnail = match fetched {
            Ok(bytes) => {
                let path = self.layout.thumbnail_path(&video.channel_name, &video.title);
                debug!(path = %path.display(), bytes, "thumbnail written");
                Some(path.to_string_lossy().into_owned())
            }
            Err(err) => {
                warn!(title = %video.title, error = %format!("{err:#}"), "thumbnail download failed; continuing without it");
                None
            }
        };
        Ok((details, thumbnail))
    }

    async fn insert_video(&self, record: &VideoRecord) -> Result<(), IngestError> {
        let id = self
            .store
            .insert_video(record)
            .await
            .map_err(IngestError::store)?;
        debug!(title = %record.title, %id, "video recorded");
        Ok(())
    }
}

fn build_record(
    video: &VideoRef,
    channel: ChannelId,
    details: &MediaDetails,
    thumbnail: Option<String>,
) -> VideoRecord {
    VideoRecord {
        title: video.title.clone(),
        description: details.description.clone(),
        duration: duration_minutes(details.duration_seconds),
        channel,
        published_at: details.published_at,
        thumbnail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel_api::ChannelProfile;
    use crate::metadata::MetadataStore;
    use anyhow::{Result, anyhow, bail};
    use chrono::{TimeZone, Utc};
    use std::fs;
    use std::sync::Mutex;
    use std::thread::{self, ThreadId};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{TempDir, tempdir};

    #[derive(Default)]
    struct FakeMetadata {
        calls: AtomicUsize,
        threads: Mutex<Vec<ThreadId>>,
        fail: bool,
    }

    impl MetadataFetcher for FakeMetadata {
        fn fetch_channel(&self, channel_id: &str) -> Result<ChannelProfile> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.threads.lock().unwrap().push(thread::current().id());
            if self.fail {
                bail!("quota exceeded for {channel_id}");
            }
            Ok(ChannelProfile {
                name: "Acme Official".into(),
                description: "We build things".into(),
                joined_at: Utc.with_ymd_and_hms(2012, 4, 5, 0, 0, 0).unwrap(),
                logo: b"png-bytes".to_vec(),
                view_count: 1_000,
                subscriber_count: 10,
                video_count: 3,
            })
        }
    }

    /// Writes placeholder files where yt-dlp would and records every call.
    #[derive(Default)]
    struct FakeMedia {
        videos: Mutex<Vec<String>>,
        thumbnails: AtomicUsize,
        threads: Mutex<Vec<ThreadId>>,
        fail_video: bool,
        fail_thumbnail: bool,
    }

    impl FakeMedia {
        fn video_downloads(&self) -> usize {
            self.videos.lock().unwrap().len()
        }
    }

    impl MediaFetcher for FakeMedia {
        fn fetch_video(
            &self,
            video: &VideoRef,
            dest_dir: &Path,
            dest_filename: &str,
        ) -> Result<MediaDetails> {
            self.threads.lock().unwrap().push(thread::current().id());
            if self.fail_video {
                bail!("stream unavailable");
            }
            fs::create_dir_all(dest_dir)?;
            fs::write(dest_dir.join(format!("{dest_filename}.mp4")), "video")?;
            self.videos.lock().unwrap().push(video.title.clone());
            Ok(MediaDetails {
                duration_seconds: video.duration_seconds,
                description: format!("{} (downloaded)", video.description),
                published_at: video.published_at,
            })
        }

        fn fetch_thumbnail(
            &self,
            _video: &VideoRef,
            dest_dir: &Path,
            dest_filename: &str,
        ) -> Result<u64> {
            self.thumbnails.fetch_add(1, Ordering::SeqCst);
            self.threads.lock().unwrap().push(thread::current().id());
            if self.fail_thumbnail {
                return Err(anyhow!("thumbnail 404"));
            }
            fs::create_dir_all(dest_dir)?;
            fs::write(dest_dir.join(format!("{dest_filename}.jpg")), "jpg")?;
            Ok(3)
        }
    }

    fn video_ref(title: &str, seconds: f64) -> VideoRef {
        video_ref_in("Acme", title, seconds)
    }

    fn video_ref_in(channel: &str, title: &str, seconds: f64) -> VideoRef {
        VideoRef {
            video_id: format!("id-{title}"),
            url: format!("https://www.youtube.com/watch?v=id-{title}"),
            title: title.to_owned(),
            channel_name: channel.into(),
            channel_id: format!("UC-{channel}"),
            duration_seconds: seconds,
            description: format!("about {title}"),
            published_at: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
            thumbnail_url: Some("https://i.ytimg.example/hq.jpg".into()),
        }
    }

    type TestEngine = ReconciliationEngine<MetadataStore, FakeMetadata, FakeMedia>;

    async fn engine_with(metadata: FakeMetadata, media: FakeMedia) -> Result<(TempDir, TestEngine)> {
        let dir = tempdir()?;
        let store = MetadataStore::open(&dir.path().join("metadata.db")).await?;
        let layout = AssetLayout::new(dir.path().join("assets"));
        Ok((dir, ReconciliationEngine::new(store, metadata, media, layout)))
    }

    async fn engine() -> Result<(TempDir, TestEngine)> {
        engine_with(FakeMetadata::default(), FakeMedia::default()).await
    }

    #[test]
    fn duration_rounds_to_two_decimals() {
        assert_eq!(duration_minutes(150.0), 2.5);
        assert_eq!(duration_minutes(125.0), 2.08);
        assert_eq!(duration_minutes(90.0), 1.5);
        assert_eq!(duration_minutes(0.0), 0.0);
    }

    #[test]
    fn duration_halves_round_to_even() {
        assert_eq!(duration_minutes(7.5), 0.12);
        assert_eq!(duration_minutes(22.5), 0.38);
    }

    #[tokio::test]
    async fn first_ingestion_creates_channel_video_and_files() -> Result<()> {
        let (_dir, engine) = engine().await?;
        let outcome = engine.ingest(&video_ref("Intro", 90.0)).await?;

        assert!(outcome.channel_created);
        assert_eq!(outcome.action, VideoAction::Downloaded);
        assert_eq!(outcome.video.title, "Intro");
        assert_eq!(outcome.video.duration, 1.5);
        assert_eq!(outcome.video.channel, outcome.channel);
        assert_eq!(outcome.video.description, "about Intro (downloaded)");

        let channels = engine.store().list_channels().await?;
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].0, outcome.channel);
        assert_eq!(channels[0].1.name, "Acme");
        assert_eq!(channels[0].1.subscriber_count, 10);

        let videos = engine.store().list_videos().await?;
        assert_eq!(videos.len(), 1);
        assert_eq!(videos[0].1, outcome.video);

        let layout = engine.layout();
        assert!(layout.video_dir("Acme").join("Intro.mp4").is_file());
        let thumbnail = layout.thumbnail_path("Acme", "Intro");
        assert!(thumbnail.is_file());
        assert_eq!(
            outcome.video.thumbnail.as_deref(),
            Some(thumbnail.to_string_lossy().as_ref())
        );
        assert_eq!(fs::read(layout.logo_path("Acme"))?, b"png-bytes");
        Ok(())
    }

    #[tokio::test]
    async fn second_run_is_a_no_op() -> Result<()> {
        let (_dir, engine) = engine().await?;
        let video = video_ref("Intro", 90.0);
        let first = engine.ingest(&video).await?;
        let second = engine.ingest(&video).await?;

        assert!(!second.channel_created);
        assert_eq!(second.action, VideoAction::AlreadyReconciled);
        assert_eq!(second.video, first.video);
        assert_eq!(second.channel, first.channel);
        assert_eq!(engine.store().list_channels().await?.len(), 1);
        assert_eq!(engine.store().list_videos().await?.len(), 1);
        assert_eq!(engine.media.video_downloads(), 1);
        assert_eq!(engine.metadata.calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn missing_media_is_downloaded_again_without_new_row() -> Result<()> {
        let (_dir, engine) = engine().await?;
        let video = video_ref("Intro", 90.0);
        let first = engine.ingest(&video).await?;
        fs::remove_file(engine.layout().video_dir("Acme").join("Intro.mp4"))?;

        let repaired = engine.ingest(&video).await?;
        assert_eq!(repaired.action, VideoAction::Redownloaded);
        assert_eq!(repaired.video, first.video);
        assert_eq!(engine.media.video_downloads(), 2);
        assert!(engine.layout().video_dir("Acme").join("Intro.mp4").is_file());
        assert_eq!(engine.store().list_videos().await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn orphan_file_is_recorded_without_download() -> Result<()> {
        let (_dir, engine) = engine().await?;
        let layout = engine.layout().clone();
        fs::create_dir_all(layout.video_dir("Acme"))?;
        fs::write(layout.video_dir("Acme").join("Intro.webm"), "video")?;
        fs::create_dir_all(layout.thumbnail_dir("Acme"))?;
        fs::write(layout.thumbnail_path("Acme", "Intro"), "jpg")?;

        let outcome = engine.ingest(&video_ref("Intro", 125.0)).await?;
        assert_eq!(outcome.action, VideoAction::AdoptedOrphan);
        assert_eq!(outcome.video.duration, 2.08);
        assert_eq!(outcome.video.description, "about Intro");
        assert_eq!(
            outcome.video.thumbnail.as_deref(),
            Some(layout.thumbnail_path("Acme", "Intro").to_string_lossy().as_ref())
        );
        assert_eq!(engine.media.video_downloads(), 0);
        assert_eq!(engine.media.thumbnails.load(Ordering::SeqCst), 0);
        assert_eq!(engine.store().list_videos().await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn orphan_without_thumbnail_records_none() -> Result<()> {
        let (_dir, engine) = engine().await?;
        let dir = engine.layout().video_dir("Acme");
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("Intro.mp4"), "video")?;

        let outcome = engine.ingest(&video_ref("Intro", 60.0)).await?;
        assert_eq!(outcome.action, VideoAction::AdoptedOrphan);
        assert!(outcome.video.thumbnail.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn channel_profile_fetched_once_per_channel() -> Result<()> {
        let (_dir, engine) = engine().await?;
        let intro = engine.ingest(&video_ref("Intro", 90.0)).await?;
        let outro = engine.ingest(&video_ref("Outro", 150.0)).await?;

        assert!(intro.channel_created);
        assert!(!outro.channel_created);
        assert_eq!(intro.channel, outro.channel);
        assert_eq!(outro.video.duration, 2.5);
        assert_eq!(engine.metadata.calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.store().list_videos().await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn existing_logo_is_not_rewritten() -> Result<()> {
        let (_dir, engine) = engine().await?;
        engine.ingest(&video_ref("Intro", 90.0)).await?;
        let logo = engine.layout().logo_path("Acme");
        fs::write(&logo, "custom")?;

        engine.ingest(&video_ref("Outro", 90.0)).await?;
        assert_eq!(fs::read_to_string(&logo)?, "custom");
        Ok(())
    }

    #[tokio::test]
    async fn metadata_failure_leaves_no_rows() -> Result<()> {
        let metadata = FakeMetadata {
            fail: true,
            ..FakeMetadata::default()
        };
        let (_dir, engine) = engine_with(metadata, FakeMedia::default()).await?;

        let err = engine.ingest(&video_ref("Intro", 90.0)).await.unwrap_err();
        assert!(matches!(err, IngestError::MetadataUnavailable { .. }));
        assert!(engine.store().list_channels().await?.is_empty());
        assert!(engine.store().list_videos().await?.is_empty());
        assert_eq!(engine.media.video_downloads(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn media_failure_keeps_channel_but_inserts_no_video() -> Result<()> {
        let media = FakeMedia {
            fail_video: true,
            ..FakeMedia::default()
        };
        let (_dir, engine) = engine_with(FakeMetadata::default(), media).await?;

        let err = engine.ingest(&video_ref("Intro", 90.0)).await.unwrap_err();
        assert!(matches!(err, IngestError::MediaUnavailable { .. }));
        assert_eq!(engine.store().list_channels().await?.len(), 1);
        assert!(engine.store().list_videos().await?.is_empty());
        assert_eq!(engine.media.thumbnails.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn thumbnail_failure_is_not_fatal() -> Result<()> {
        let media = FakeMedia {
            fail_thumbnail: true,
            ..FakeMedia::default()
        };
        let (_dir, engine) = engine_with(FakeMetadata::default(), media).await?;

        let outcome = engine.ingest(&video_ref("Intro", 90.0)).await?;
        assert_eq!(outcome.action, VideoAction::Downloaded);
        assert!(outcome.video.thumbnail.is_none());
        assert_eq!(engine.store().list_videos().await?[0].1.thumbnail, None);
        Ok(())
    }

    #[tokio::test]
    async fn titles_with_separators_stay_inside_channel_dir() -> Result<()> {
        let (_dir, engine) = engine().await?;
        let outcome = engine.ingest(&video_ref("Before/After", 90.0)).await?;
        assert_eq!(outcome.video.title, "Before/After");
        assert!(engine.layout().video_dir("Acme").join("Before%2FAfter.mp4").is_file());

        let again = engine.ingest(&video_ref("Before/After", 90.0)).await?;
        assert_eq!(again.action, VideoAction::AlreadyReconciled);
        Ok(())
    }

    #[tokio::test]
    async fn distinct_titles_with_similar_filenames_both_download() -> Result<()> {
        let (_dir, engine) = engine().await?;
        let first = engine.ingest(&video_ref("A/B", 90.0)).await?;
        let second = engine.ingest(&video_ref("A_B", 90.0)).await?;

        assert_eq!(first.action, VideoAction::Downloaded);
        assert_eq!(second.action, VideoAction::Downloaded);
        assert_eq!(engine.media.video_downloads(), 2);
        assert_ne!(first.video.thumbnail, second.video.thumbnail);

        let trailing = engine.ingest(&video_ref("A_B.", 90.0)).await?;
        assert_eq!(trailing.action, VideoAction::Downloaded);
        assert_eq!(engine.store().list_videos().await?.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn similar_channel_names_keep_separate_logos() -> Result<()> {
        let (_dir, engine) = engine().await?;
        let acdc = engine.ingest(&video_ref_in("AC/DC", "Intro", 90.0)).await?;
        let first_logo = engine.layout().logo_path("AC/DC");
        fs::write(&first_logo, "first-channel-logo")?;

        let other = engine.ingest(&video_ref_in("AC_DC", "Intro", 90.0)).await?;
        assert!(other.channel_created);
        assert_ne!(acdc.channel, other.channel);
        assert_eq!(other.action, VideoAction::Downloaded);
        assert_eq!(fs::read_to_string(&first_logo)?, "first-channel-logo");
        assert_eq!(fs::read(engine.layout().logo_path("AC_DC"))?, b"png-bytes");
        assert_eq!(engine.media.video_downloads(), 2);
        assert_eq!(engine.store().list_channels().await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn fetchers_run_off_the_runtime_thread() -> Result<()> {
        let (_dir, engine) = engine().await?;
        let outcome = engine.ingest(&video_ref("Intro", 90.0)).await?;
        assert_eq!(outcome.action, VideoAction::Downloaded);

        let runtime_thread = thread::current().id();
        let metadata_threads = engine.metadata.threads.lock().unwrap();
        let media_threads = engine.media.threads.lock().unwrap();
        assert_eq!(metadata_threads.len(), 1);
        assert_eq!(media_threads.len(), 2);
        assert!(
            metadata_threads
                .iter()
                .chain(media_threads.iter())
                .all(|id| *id != runtime_thread)
        );
        Ok(())
    }
}
