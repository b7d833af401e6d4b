//! Channel profile retrieval through the YouTube Data API v3.

use std::io::Read;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info};

const CHANNELS_ENDPOINT: &str = "https://www.googleapis.com/youtube/v3/channels";
const CHANNEL_PARTS: &str = "snippet,contentDetails,statistics";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything needed to create a channel record, logo bytes included.
#[derive(Clone, PartialEq)]
pub struct ChannelProfile {
    pub name: String,
    pub description: String,
    pub joined_at: DateTime<Utc>,
    pub logo: Vec<u8>,
    pub view_count: i64,
    pub subscriber_count: i64,
    pub video_count: i64,
}

impl std::fmt::Debug for ChannelProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelProfile")
            .field("name", &self.name)
            .field("joined_at", &self.joined_at)
            .field("logo_bytes", &self.logo.len())
            .field("view_count", &self.view_count)
            .field("subscriber_count", &self.subscriber_count)
            .field("video_count", &self.video_count)
            .finish_non_exhaustive()
    }
}

/// Source of channel profiles. Any error is treated as "metadata unavailable".
pub trait MetadataFetcher {
    fn fetch_channel(&self, channel_id: &str) -> Result<ChannelProfile>;
}

#[derive(Debug, Deserialize)]
struct ChannelListResponse {
    #[serde(default)]
    items: Vec<ChannelItem>,
}

#[derive(Debug, Deserialize)]
struct ChannelItem {
    snippet: Snippet,
    #[serde(default)]
    statistics: Statistics,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snippet {
    title: String,
    #[serde(default)]
    description: String,
    published_at: String,
    #[serde(default)]
    thumbnails: Thumbnails,
}

#[derive(Debug, Default, Deserialize)]
struct Thumbnails {
    medium: Option<Thumbnail>,
    high: Option<Thumbnail>,
    default: Option<Thumbnail>,
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
    url: String,
}

/// The API reports counts as decimal strings; hidden counts are omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Statistics {
    view_count: Option<String>,
    subscriber_count: Option<String>,
    video_count: Option<String>,
}

/// Profile fields parsed from a `channels.list` response, before the logo
/// download.
#[derive(Debug, Clone, PartialEq)]
struct ChannelSummary {
    name: String,
    description: String,
    joined_at: DateTime<Utc>,
    logo_url: String,
    view_count: i64,
    subscriber_count: i64,
    video_count: i64,
}

fn parse_count(raw: Option<&str>, field: &str) -> Result<i64> {
    match raw {
        None => Ok(0),
        Some(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("parsing {field} {value:?}"))
            .and_then(|count| i64::try_from(count).with_context(|| format!("{field} overflow"))),
    }
}

fn parse_channel_response(body: &str, channel_id: &str) -> Result<ChannelSummary> {
    let response: ChannelListResponse =
        serde_json::from_str(body).context("deserializing channels response")?;
    let Some(item) = response.items.into_iter().next() else {
        bail!("no channel found for id {channel_id}");
    };

    let Snippet {
        title,
        description,
        published_at,
        thumbnails,
    } = item.snippet;
    let logo_url = thumbnails
        .medium
        .or(thumbnails.high)
        .or(thumbnails.default)
        .map(|thumbnail| thumbnail.url)
        .with_context(|| format!("channel {channel_id} has no logo thumbnail"))?;
    let joined_at = DateTime::parse_from_rfc3339(&published_at)
        .with_context(|| format!("parsing publishedAt {published_at:?}"))?
        .with_timezone(&Utc);
    let stats = item.statistics;

    Ok(ChannelSummary {
        name: title,
        description,
        joined_at,
        logo_url,
        view_count: parse_count(stats.view_count.as_deref(), "viewCount")?,
        subscriber_count: parse_count(stats.subscriber_count.as_deref(), "subscriberCount")?,
        video_count: parse_count(stats.video_count.as_deref(), "videoCount")?,
    })
}

/// Blocking client for the `channels` endpoint.
pub struct YoutubeDataApi {
    agent: ureq::Agent,
    api_key: String,
    endpoint: String,
}

impl YoutubeDataApi {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_endpoint(api_key, CHANNELS_ENDPOINT)
    }

    pub fn with_endpoint(api_key: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(HTTP_TIMEOUT).build(),
            api_key: api_key.into(),
            endpoint: endpoint.into(),
        }
    }

    fn download_logo(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .agent
            .get(url)
            .call()
            .with_context(|| format!("downloading channel logo {url}"))?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut bytes)
            .with_context(|| format!("reading channel logo {url}"))?;
        Ok(bytes)
    }
}

impl MetadataFetcher for YoutubeDataApi {
    fn fetch_channel(&self, channel_id: &str) -> Result<ChannelProfile> {
        debug!(channel_id, "requesting channel profile");
        let body = self
            .agent
            .get(&self.endpoint)
            .query("part", CHANNEL_PARTS)
            .query("id", channel_id)
            .query("key", &self.api_key)
            .call()
            .with_context(|| format!("calling channels endpoint for {channel_id}"))?
            .into_string()
            .context("reading channels response")?;
        let summary = parse_channel_response(&body, channel_id)?;
        let logo = self.download_logo(&summary.logo_url)?;
        info!(
            channel = %summary.name,
            subscribers = summary.subscriber_count,
            "fetched channel profile"
        );

        Ok(ChannelProfile {
            name: summary.name,
            description: summary.description,
            joined_at: summary.joined_at,
            logo,
            view_count: summary.view_count,
            subscriber_count: summary.subscriber_count,
            video_count: summary.video_count,
        })
    }
}

impl std::fmt::Debug for YoutubeDataApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YoutubeDataApi")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}
