//! Explicit parse step from opaque API payloads to tagged, typed items.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use streamdims_core::{ItemKind, RawItem, ValidationError};

/// Result of parsing one raw item. Consumers match all three variants.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedItem {
    Video(VideoPayload),
    Channel(ChannelPayload),
    Malformed(ValidationError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoPayload {
    pub video_id: String,
    pub channel_id: String,
    pub channel_title: String,
    pub title: String,
    pub category_id: String,
    pub published_at: Option<DateTime<Utc>>,
    pub duration_seconds: u64,
    pub view_count: u64,
    pub like_count: u64,
    pub comment_count: u64,
    pub ad_break_count: u32,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelPayload {
    pub channel_id: String,
    pub title: String,
    pub subscriber_count: u64,
    pub total_views: u64,
    pub video_count: u64,
    pub channel_category: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoResource {
    #[serde(default)]
    id: Option<JsonValue>,
    #[serde(default)]
    snippet: VideoSnippet,
    #[serde(default)]
    content_details: VideoContentDetails,
    #[serde(default)]
    statistics: Statistics,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoSnippet {
    #[serde(default)]
    title: String,
    #[serde(default)]
    channel_id: String,
    #[serde(default)]
    channel_title: String,
    #[serde(default)]
    category_id: String,
    #[serde(default)]
    published_at: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoContentDetails {
    #[serde(default)]
    duration: Option<String>,
    /// Mid-roll markers, one entry per ad break.
    #[serde(default)]
    ad_breaks: Option<Vec<JsonValue>>,
    #[serde(default)]
    ad_break_count: Option<JsonValue>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Statistics {
    #[serde(default)]
    view_count: Option<JsonValue>,
    #[serde(default)]
    like_count: Option<JsonValue>,
    #[serde(default)]
    comment_count: Option<JsonValue>,
    #[serde(default)]
    subscriber_count: Option<JsonValue>,
    #[serde(default)]
    video_count: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelResource {
    #[serde(default)]
    id: Option<JsonValue>,
    #[serde(default)]
    snippet: ChannelSnippet,
    #[serde(default)]
    statistics: Statistics,
    #[serde(default)]
    topic_details: TopicDetails,
}

#[derive(Debug, Default, Deserialize)]
struct ChannelSnippet {
    #[serde(default)]
    title: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TopicDetails {
    #[serde(default)]
    topic_categories: Vec<String>,
}

/// The item id as the API reports it: a bare string, or an object such as
/// `{"kind": "youtube#video", "videoId": "..."}`.
pub fn payload_id(kind: ItemKind, payload: &JsonValue) -> Option<String> {
    let id = payload.get("id")?;
    let key = match kind {
        ItemKind::Video => "videoId",
        ItemKind::Channel => "channelId",
    };
    id_from_value(id, key)
}

fn id_from_value(id: &JsonValue, key: &str) -> Option<String> {
    match id {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Object(map) => map.get(key).and_then(JsonValue::as_str).map(str::to_string),
        _ => None,
    }
    .filter(|s| !s.trim().is_empty())
}

fn source_id(raw: &RawItem) -> String {
    if raw.item_id.is_empty() {
        "<missing id>".to_string()
    } else {
        raw.item_id.clone()
    }
}

pub fn parse_item(raw: &RawItem) -> ParsedItem {
    let parsed = match raw.kind {
        ItemKind::Video => parse_video(raw).map(ParsedItem::Video),
        ItemKind::Channel => parse_channel(raw).map(ParsedItem::Channel),
    };
    parsed.unwrap_or_else(ParsedItem::Malformed)
}

fn parse_video(raw: &RawItem) -> Result<VideoPayload, ValidationError> {
    let item_id = source_id(raw);
    let resource: VideoResource = serde_json::from_value(raw.payload.clone())
        .map_err(|_| ValidationError::MalformedPayload {
            item_id: item_id.clone(),
        })?;

    let video_id = resource
        .id
        .as_ref()
        .and_then(|id| id_from_value(id, "videoId"))
        .ok_or_else(|| ValidationError::MissingField {
            item_id: item_id.clone(),
            field: "id".into(),
        })?;

    // Absent duration must fail validation rather than read as zero length.
    let raw_duration = resource
        .content_details
        .duration
        .ok_or_else(|| ValidationError::MissingField {
            item_id: video_id.clone(),
            field: "contentDetails.duration".into(),
        })?;
    let duration_seconds =
        parse_iso8601_duration(&raw_duration).ok_or_else(|| ValidationError::MalformedDuration {
            item_id: video_id.clone(),
            raw: raw_duration.clone(),
        })?;

    let ad_break_count = match resource.content_details.ad_breaks {
        Some(markers) => markers.len() as u64,
        None => count(
            resource.content_details.ad_break_count.as_ref(),
            "contentDetails.adBreakCount",
            &video_id,
        )?,
    };
    let ad_break_count = u32::try_from(ad_break_count).map_err(|_| ValidationError::InvalidCount {
        item_id: video_id.clone(),
        field: "contentDetails.adBreakCount".into(),
        raw: ad_break_count.to_string(),
    })?;

    let published_at = timestamp(
        resource.snippet.published_at.as_deref(),
        "snippet.publishedAt",
        &video_id,
    )?;

    let stats = &resource.statistics;
    Ok(VideoPayload {
        view_count: count(stats.view_count.as_ref(), "statistics.viewCount", &video_id)?,
        like_count: count(stats.like_count.as_ref(), "statistics.likeCount", &video_id)?,
        comment_count: count(stats.comment_count.as_ref(), "statistics.commentCount", &video_id)?,
        video_id,
        channel_id: resource.snippet.channel_id,
        channel_title: resource.snippet.channel_title,
        title: resource.snippet.title,
        category_id: resource.snippet.category_id,
        published_at,
        duration_seconds,
        ad_break_count,
        tags: resource.snippet.tags,
    })
}

fn parse_channel(raw: &RawItem) -> Result<ChannelPayload, ValidationError> {
    let item_id = source_id(raw);
    let resource: ChannelResource = serde_json::from_value(raw.payload.clone())
        .map_err(|_| ValidationError::MalformedPayload {
            item_id: item_id.clone(),
        })?;

    let channel_id = resource
        .id
        .as_ref()
        .and_then(|id| id_from_value(id, "channelId"))
        .ok_or_else(|| ValidationError::MissingField {
            item_id: item_id.clone(),
            field: "id".into(),
        })?;

    let stats = &resource.statistics;
    let channel_category = resource
        .topic_details
        .topic_categories
        .first()
        .map(|url| topic_label(url))
        .unwrap_or_default();

    Ok(ChannelPayload {
        subscriber_count: count(
            stats.subscriber_count.as_ref(),
            "statistics.subscriberCount",
            &channel_id,
        )?,
        total_views: count(stats.view_count.as_ref(), "statistics.viewCount", &channel_id)?,
        video_count: count(stats.video_count.as_ref(), "statistics.videoCount", &channel_id)?,
        channel_id,
        title: resource.snippet.title,
        channel_category,
    })
}

/// `https://en.wikipedia.org/wiki/Video_game_culture` -> `Video game culture`.
fn topic_label(url: &str) -> String {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .replace('_', " ")
}

/// RFC 3339 timestamps such as `2024-03-01T17:00:00Z`; absent or blank means unknown.
fn timestamp(
    value: Option<&str>,
    field: &str,
    item_id: &str,
) -> Result<Option<DateTime<Utc>>, ValidationError> {
    match value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|ts| Some(ts.with_timezone(&Utc)))
            .map_err(|_| ValidationError::InvalidTimestamp {
                item_id: item_id.to_string(),
                field: field.to_string(),
                raw: raw.to_string(),
            }),
    }
}

/// Counts arrive as JSON numbers or numeric strings; absence means zero.
fn count(value: Option<&JsonValue>, field: &str, item_id: &str) -> Result<u64, ValidationError> {
    let invalid = |raw: String| ValidationError::InvalidCount {
        item_id: item_id.to_string(),
        field: field.to_string(),
        raw,
    };
    match value {
        None | Some(JsonValue::Null) => Ok(0),
        Some(JsonValue::Number(n)) => n.as_u64().ok_or_else(|| invalid(n.to_string())),
        Some(JsonValue::String(s)) => s.trim().parse::<u64>().map_err(|_| invalid(s.clone())),
        Some(other) => Err(invalid(other.to_string())),
    }
}

/// Parse an ISO-8601 period such as `PT4M13S` or `P1DT2H` into whole seconds.
///
/// Accepts weeks and days in the date part and hours, minutes and seconds in the
/// time part, each an unsigned integer and in that order. Years and months have no
/// fixed length and are rejected, as are fractions and empty designators.
pub fn parse_iso8601_duration(input: &str) -> Option<u64> {
    let rest = input.strip_prefix('P')?;
    if rest.is_empty() {
        return None;
    }
    let (date, time) = match rest.split_once('T') {
        Some((_, "")) => return None,
        Some((date, time)) => (date, Some(time)),
        None => (rest, None),
    };

    let mut total = sum_components(date, &[('W', 7 * 86_400), ('D', 86_400)])?;
    if let Some(time) = time {
        total = total.checked_add(sum_components(time, &[('H', 3_600), ('M', 60), ('S', 1)])?)?;
    }
    Some(total)
}

fn sum_components(part: &str, units: &[(char, u64)]) -> Option<u64> {
    let mut total = 0u64;
    let mut digits = String::new();
    let mut next_unit = 0usize;

    for ch in part.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        if digits.is_empty() {
            return None;
        }
        let offset = units[next_unit..].iter().position(|(unit, _)| *unit == ch)?;
        let (_, scale) = units[next_unit + offset];
        let value: u64 = digits.parse().ok()?;
        total = total.checked_add(value.checked_mul(scale)?)?;
        next_unit += offset + 1;
        digits.clear();
    }

    if digits.is_empty() {
        Some(total)
    } else {
        None
    }
}
