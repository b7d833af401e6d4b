//! Channel and video persistence.
//!
//! Records mirror the `channels` and `videos` tables. The store itself never
//! enforces identity uniqueness; [`crate::reconcile::ReconciliationEngine`]
//! only inserts after a lookup came back empty.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use libsql::{Builder, Connection, Row, params};
use serde::Serialize;

/// Row id of a `channels` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ChannelId(pub i64);

/// Row id of a `videos` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VideoId(pub i64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for VideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Channel profile as stored in the `channels` table. `name` is the identity.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelRecord {
    pub name: String,
    pub description: String,
    pub joined_at: DateTime<Utc>,
    /// Path of the logo written during channel creation.
    pub logo: String,
    pub view_count: i64,
    pub subscriber_count: i64,
    pub video_count: i64,
}

/// Video entry stored in the `videos` table; `(title, channel)` is the
/// identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoRecord {
    pub title: String,
    pub description: String,
    /// Minutes, rounded to two decimals.
    pub duration: f64,
    pub channel: ChannelId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    /// `None` when the thumbnail could not be fetched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

/// Lookup/insert contract for channel records.
#[allow(async_fn_in_trait)]
pub trait ChannelStore {
    async fn find_channel(&self, name: &str) -> Result<Option<(ChannelId, ChannelRecord)>>;

    /// Inserts unconditionally; callers check [`Self::find_channel`] first.
    async fn insert_channel(&self, record: &ChannelRecord) -> Result<ChannelId>;
}

/// Lookup/insert contract for video records.
#[allow(async_fn_in_trait)]
pub trait VideoStore {
    async fn find_video(
        &self,
        title: &str,
        channel: ChannelId,
    ) -> Result<Option<(VideoId, VideoRecord)>>;

    /// Inserts unconditionally; callers check [`Self::find_video`] first.
    async fn insert_video(&self, record: &VideoRecord) -> Result<VideoId>;
}

async fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA foreign_keys=ON;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS channels (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            joined_at TEXT NOT NULL,
            logo TEXT NOT NULL,
            view_count INTEGER NOT NULL DEFAULT 0,
            subscriber_count INTEGER NOT NULL DEFAULT 0,
            video_count INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS videos (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            duration REAL NOT NULL,
            channel INTEGER NOT NULL REFERENCES channels(id),
            published_at TEXT,
            thumbnail TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_channels_name ON channels(name);
        CREATE INDEX IF NOT EXISTS idx_videos_title_channel ON videos(title, channel);
        "#,
    )
    .await?;
    Ok(())
}

/// Wrapper around the SQLite-compatible connection holding both collections.
pub struct MetadataStore {
    conn: Connection,
}

impl fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataStore").finish_non_exhaustive()
    }
}

impl MetadataStore {
    /// Opens (and if necessary creates) the SQLite DB and ensures the expected
    /// schema exists.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating metadata directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening metadata DB {}", path.display()))?;

        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        Ok(Self { conn })
    }

    /// Every channel, oldest insert first.
    pub async fn list_channels(&self) -> Result<Vec<(ChannelId, ChannelRecord)>> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT id, name, description, joined_at, logo,
                       view_count, subscriber_count, video_count
                FROM channels
                ORDER BY id ASC
                "#,
                params![],
            )
            .await?;
        let mut channels = Vec::new();
        while let Some(row) = rows.next().await? {
            channels.push(row_to_channel(&row)?);
        }
        Ok(channels)
    }

    /// Every video, oldest insert first.
    pub async fn list_videos(&self) -> Result<Vec<(VideoId, VideoRecord)>> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT id, title, description, duration, channel, published_at, thumbnail
                FROM videos
                ORDER BY id ASC
                "#,
                params![],
            )
            .await?;
        let mut videos = Vec::new();
        while let Some(row) = rows.next().await? {
            videos.push(row_to_video(&row)?);
        }
        Ok(videos)
    }
}

impl ChannelStore for MetadataStore {
    async fn find_channel(&self, name: &str) -> Result<Option<(ChannelId, ChannelRecord)>> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT id, name, description, joined_at, logo,
                       view_count, subscriber_count, video_count
                FROM channels
                WHERE name = ?1
                ORDER BY id ASC
                LIMIT 1
                "#,
                [name],
            )
            .await
            .with_context(|| format!("looking up channel {name}"))?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_channel(&row)?)),
            None => Ok(None),
        }
    }

    async fn insert_channel(&self, record: &ChannelRecord) -> Result<ChannelId> {
        self.conn
            .execute(
                r#"
                INSERT INTO channels (
                    name, description, joined_at, logo,
                    view_count, subscriber_count, video_count
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    record.name.as_str(),
                    record.description.as_str(),
                    record.joined_at.to_rfc3339(),
                    record.logo.as_str(),
                    record.view_count,
                    record.subscriber_count,
                    record.video_count,
                ],
            )
            .await
            .with_context(|| format!("inserting channel {}", record.name))?;
        Ok(ChannelId(self.conn.last_insert_rowid()))
    }
}

impl VideoStore for MetadataStore {
    async fn find_video(
        &self,
        title: &str,
        channel: ChannelId,
    ) -> Result<Option<(VideoId, VideoRecord)>> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT id, title, description, duration, channel, published_at, thumbnail
                FROM videos
                WHERE title = ?1 AND channel = ?2
                ORDER BY id ASC
                LIMIT 1
                "#,
                params![title, channel.0],
            )
            .await
            .with_context(|| format!("looking up video {title:?} of channel {channel}"))?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_video(&row)?)),
            None => Ok(None),
        }
    }

    async fn insert_video(&self, record: &VideoRecord) -> Result<VideoId> {
        self.conn
            .execute(
                r#"
                INSERT INTO videos (
                    title, description, duration, channel, published_at, thumbnail
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    record.title.as_str(),
                    record.description.as_str(),
                    record.duration,
                    record.channel.0,
                    record.published_at.map(|at| at.to_rfc3339()),
                    record.thumbnail.as_deref(),
                ],
            )
            .await
            .with_context(|| format!("inserting video {:?}", record.title))?;
        Ok(VideoId(self.conn.last_insert_rowid()))
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("parsing stored timestamp {raw:?}"))?
        .with_timezone(&Utc))
}

/// Column order must match the channel SELECT statements above.
fn row_to_channel(row: &Row) -> Result<(ChannelId, ChannelRecord)> {
    let joined_at: String = row.get(3)?;
    Ok((
        ChannelId(row.get(0)?),
        ChannelRecord {
            name: row.get(1)?,
            description: row.get(2)?,
            joined_at: parse_timestamp(&joined_at)?,
            logo: row.get(4)?,
            view_count: row.get(5)?,
            subscriber_count: row.get(6)?,
            video_count: row.get(7)?,
        },
    ))
}

/// Column order must match the video SELECT statements above.
fn row_to_video(row: &Row) -> Result<(VideoId, VideoRecord)> {
    let published_at: Option<String> = row.get(5)?;
    Ok((
        VideoId(row.get(0)?),
        VideoRecord {
            title: row.get(1)?,
            description: row.get(2)?,
            duration: row.get(3)?,
            channel: ChannelId(row.get(4)?),
            published_at: published_at.as_deref().map(parse_timestamp).transpose()?,
            thumbnail: row.get(6)?,
        },
    ))
}
