//! Core domain model for StreamDims: raw items, normalized records, derived metrics
//! and the snapshot shapes shared by every other crate.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "streamdims-core";

/// Which API resource a raw payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Video,
    Channel,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Video => "video",
            ItemKind::Channel => "channel",
        }
    }
}

/// Opaque payload for one API item, exactly as fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    pub kind: ItemKind,
    pub item_id: String,
    pub fetched_at: DateTime<Utc>,
    pub payload: JsonValue,
}

/// Snapshot identifier: a UTC timestamp with microsecond precision.
///
/// Renders as `YYYYMMDDTHHMMSSffffffZ`, so lexical order is chronological order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId {
    micros: i64,
}

impl RunId {
    pub fn now() -> Self {
        Self::from_timestamp(Utc::now())
    }

    pub fn from_timestamp(ts: DateTime<Utc>) -> Self {
        Self {
            micros: ts.timestamp() * 1_000_000 + i64::from(ts.timestamp_subsec_micros()),
        }
    }

    /// A run id strictly greater than `prev`, using the wall clock when it has moved on.
    pub fn next_after(prev: RunId) -> Self {
        let now = Self::now();
        if now > prev {
            now
        } else {
            Self {
                micros: prev.micros + 1,
            }
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        let secs = self.micros.div_euclid(1_000_000);
        let nanos = (self.micros.rem_euclid(1_000_000) * 1_000) as u32;
        Utc.timestamp_opt(secs, nanos)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ts = self.timestamp();
        write!(
            f,
            "{}{:06}Z",
            ts.format("%Y%m%dT%H%M%S"),
            ts.timestamp_subsec_micros()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid run id {0:?}")]
pub struct InvalidRunId(pub String);

impl FromStr for RunId {
    type Err = InvalidRunId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidRunId(s.to_string());
        if s.len() != 22 || !s.is_ascii() || !s.ends_with('Z') {
            return Err(invalid());
        }
        let naive = NaiveDateTime::parse_from_str(&s[..15], "%Y%m%dT%H%M%S").map_err(|_| invalid())?;
        let fraction = &s[15..21];
        if !fraction.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let micros: i64 = fraction.parse().map_err(|_| invalid())?;
        let ts = Utc.from_utc_datetime(&naive);
        Ok(Self {
            micros: ts.timestamp() * 1_000_000 + micros,
        })
    }
}

impl TryFrom<String> for RunId {
    type Error = InvalidRunId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RunId> for String {
    fn from(value: RunId) -> Self {
        value.to_string()
    }
}

/// Where an interrupted fetch can pick up again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePoint {
    /// Index into the run's category list (0 for an unfiltered run).
    pub category_index: usize,
    pub category_id: Option<String>,
    /// Continuation token of the page that was being requested.
    pub page_token: Option<String>,
    /// Videos already emitted before the interruption.
    pub videos_emitted: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoRecord {
    pub video_id: String,
    pub channel_id: String,
    pub channel_title: String,
    pub title: String,
    pub category_id: String,
    pub category_name: String,
    /// Upload time; absent when the payload did not carry one.
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    pub duration_seconds: u64,
    pub duration_minutes: f64,
    pub view_count: u64,
    pub like_count: u64,
    pub comment_count: u64,
    pub ad_break_count: u32,
    pub tags: Vec<String>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub channel_id: String,
    pub title: String,
    pub subscriber_count: u64,
    pub total_views: u64,
    pub video_count: u64,
    pub channel_category: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DurationBucket {
    Unknown,
    Short,
    Medium,
    Long,
    VeryLong,
}

impl DurationBucket {
    pub fn for_minutes(minutes: f64) -> Self {
        if minutes <= 0.0 {
            DurationBucket::Unknown
        } else if minutes < 5.0 {
            DurationBucket::Short
        } else if minutes < 15.0 {
            DurationBucket::Medium
        } else if minutes < 30.0 {
            DurationBucket::Long
        } else {
            DurationBucket::VeryLong
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DurationBucket::Unknown => "unknown",
            DurationBucket::Short => "short",
            DurationBucket::Medium => "medium",
            DurationBucket::Long => "long",
            DurationBucket::VeryLong => "very_long",
        }
    }
}

/// Reach band by view count: up to 10k, 100k, 1M and 10M, then above.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChannelTier {
    Micro,
    Small,
    Medium,
    Large,
    Enterprise,
}

impl ChannelTier {
    pub fn for_views(views: u64) -> Self {
        match views {
            0..=10_000 => ChannelTier::Micro,
            10_001..=100_000 => ChannelTier::Small,
            100_001..=1_000_000 => ChannelTier::Medium,
            1_000_001..=10_000_000 => ChannelTier::Large,
            _ => ChannelTier::Enterprise,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelTier::Micro => "micro",
            ChannelTier::Small => "small",
            ChannelTier::Medium => "medium",
            ChannelTier::Large => "large",
            ChannelTier::Enterprise => "enterprise",
        }
    }
}

/// Derived ad-saturation metrics for one video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub video_id: String,
    /// Ad breaks per minute; `None` when the video has no measurable duration.
    pub ad_density: Option<f64>,
    pub estimated_ad_seconds: f64,
    /// Estimated fraction of runtime spent on ads, always within `[0, 1]`.
    pub ad_ratio: f64,
    pub engagement_rate: f64,
    pub duration_bucket: DurationBucket,
    /// Whole days from upload to fetch, never negative. `None` without an upload time.
    pub age_days: Option<i64>,
    /// Views divided by `max(age_days, 1)`.
    pub views_per_day: Option<f64>,
    pub channel_tier: ChannelTier,
}

/// One row of the processed table: a video, its metrics and (when fetched) its channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedRow {
    pub video: VideoRecord,
    pub metrics: MetricsRecord,
    pub channel: Option<ChannelRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryRollup {
    pub category_id: String,
    pub category_name: String,
    pub video_count: usize,
    pub undefined_density_count: usize,
    pub mean_ad_density: Option<f64>,
    pub mean_ad_ratio: f64,
    pub mean_engagement_rate: f64,
}

/// Record-level rejection. Never aborts the batch it was found in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum ValidationError {
    #[error("{item_id}: payload is not an object of a known kind")]
    MalformedPayload { item_id: String },
    #[error("{item_id}: missing required field {field}")]
    MissingField { item_id: String, field: String },
    #[error("{item_id}: malformed duration {raw:?}")]
    MalformedDuration { item_id: String, raw: String },
    #[error("{item_id}: field {field} is not a non-negative integer ({raw:?})")]
    InvalidCount {
        item_id: String,
        field: String,
        raw: String,
    },
    #[error("{item_id}: field {field} is not an RFC 3339 timestamp ({raw:?})")]
    InvalidTimestamp {
        item_id: String,
        field: String,
        raw: String,
    },
}

impl ValidationError {
    pub fn item_id(&self) -> &str {
        match self {
            ValidationError::MalformedPayload { item_id }
            | ValidationError::MissingField { item_id, .. }
            | ValidationError::MalformedDuration { item_id, .. }
            | ValidationError::InvalidCount { item_id, .. }
            | ValidationError::InvalidTimestamp { item_id, .. } => item_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotIntegrityError {
    #[error("metrics for {0} reference no video in the snapshot")]
    OrphanMetrics(String),
    #[error("video {0} has no metrics row")]
    MissingMetrics(String),
    #[error("video {0} appears more than once")]
    DuplicateVideo(String),
}

/// Joined, immutable output of one successful pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedSnapshot {
    pub run_id: RunId,
    pub rows: Vec<ProcessedRow>,
    pub rollups: Vec<CategoryRollup>,
    #[serde(default)]
    pub rejected: Vec<ValidationError>,
}

impl ProcessedSnapshot {
    /// Join videos with their metrics and channels.
    ///
    /// Metrics must pair one-to-one with videos; channels are optional per row.
    pub fn assemble(
        run_id: RunId,
        videos: Vec<VideoRecord>,
        metrics: Vec<MetricsRecord>,
        channels: &[ChannelRecord],
        rollups: Vec<CategoryRollup>,
        rejected: Vec<ValidationError>,
    ) -> Result<Self, SnapshotIntegrityError> {
        let mut seen = HashSet::new();
        for video in &videos {
            if !seen.insert(video.video_id.as_str()) {
                return Err(SnapshotIntegrityError::DuplicateVideo(video.video_id.clone()));
            }
        }
        for m in &metrics {
            if !seen.contains(m.video_id.as_str()) {
                return Err(SnapshotIntegrityError::OrphanMetrics(m.video_id.clone()));
            }
        }

        let mut metrics_by_id = metrics
            .into_iter()
            .map(|m| (m.video_id.clone(), m))
            .collect::<std::collections::HashMap<_, _>>();

        let mut rows = Vec::with_capacity(videos.len());
        for video in videos {
            let metrics = metrics_by_id
                .remove(&video.video_id)
                .ok_or_else(|| SnapshotIntegrityError::MissingMetrics(video.video_id.clone()))?;
            let channel = channels
                .iter()
                .find(|c| c.channel_id == video.channel_id)
                .cloned();
            rows.push(ProcessedRow {
                video,
                metrics,
                channel,
            });
        }

        Ok(Self {
            run_id,
            rows,
            rollups,
            rejected,
        })
    }
}

/// Operator-triggered abort, checked only between pages and record batches.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    flag: Arc<AtomicBool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

const CATEGORY_NAMES: &[(&str, &str)] = &[
    ("1", "Film & Animation"),
    ("2", "Autos & Vehicles"),
    ("10", "Music"),
    ("15", "Pets & Animals"),
    ("17", "Sports"),
    ("19", "Travel & Events"),
    ("20", "Gaming"),
    ("22", "People & Blogs"),
    ("23", "Comedy"),
    ("24", "Entertainment"),
    ("25", "News & Politics"),
    ("26", "Howto & Style"),
    ("27", "Education"),
    ("28", "Science & Technology"),
];

pub fn category_name(category_id: &str) -> &'static str {
    CATEGORY_NAMES
        .iter()
        .find(|(id, _)| *id == category_id)
        .map(|(_, name)| *name)
        .unwrap_or("Unknown")
}
