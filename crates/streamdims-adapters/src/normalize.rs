//! Raw items -> deduplicated `VideoRecord`s and `ChannelRecord`s.

use std::collections::HashMap;

use streamdims_core::{category_name, CancelSignal, ChannelRecord, RawItem, ValidationError, VideoRecord};
use thiserror::Error;
use tracing::warn;

use crate::payload::{parse_item, ChannelPayload, ParsedItem, VideoPayload};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedBatch {
    pub videos: Vec<VideoRecord>,
    pub channels: Vec<ChannelRecord>,
    pub rejected: Vec<ValidationError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("normalization cancelled after {processed} items")]
pub struct Cancelled {
    pub processed: usize,
}

/// Keeps one entry per key: the last value seen, at the position the key first appeared.
#[derive(Debug)]
struct LastWins<T> {
    positions: HashMap<String, usize>,
    items: Vec<T>,
}

impl<T> LastWins<T> {
    fn new() -> Self {
        Self {
            positions: HashMap::new(),
            items: Vec::new(),
        }
    }

    fn upsert(&mut self, key: String, item: T) {
        match self.positions.get(&key) {
            Some(&index) => self.items[index] = item,
            None => {
                self.positions.insert(key, self.items.len());
                self.items.push(item);
            }
        }
    }
}

fn to_video_record(raw: &RawItem, payload: VideoPayload) -> VideoRecord {
    VideoRecord {
        category_name: category_name(&payload.category_id).to_string(),
        duration_minutes: payload.duration_seconds as f64 / 60.0,
        video_id: payload.video_id,
        channel_id: payload.channel_id,
        channel_title: payload.channel_title,
        title: payload.title,
        category_id: payload.category_id,
        published_at: payload.published_at,
        duration_seconds: payload.duration_seconds,
        view_count: payload.view_count,
        like_count: payload.like_count,
        comment_count: payload.comment_count,
        ad_break_count: payload.ad_break_count,
        tags: payload.tags,
        fetched_at: raw.fetched_at,
    }
}

fn to_channel_record(payload: ChannelPayload) -> ChannelRecord {
    ChannelRecord {
        channel_id: payload.channel_id,
        title: payload.title,
        subscriber_count: payload.subscriber_count,
        total_views: payload.total_views,
        video_count: payload.video_count,
        channel_category: payload.channel_category,
    }
}

struct Normalizer {
    videos: LastWins<VideoRecord>,
    channels: LastWins<ChannelRecord>,
    rejected: Vec<ValidationError>,
}

impl Normalizer {
    fn new() -> Self {
        Self {
            videos: LastWins::new(),
            channels: LastWins::new(),
            rejected: Vec::new(),
        }
    }

    fn push(&mut self, raw: &RawItem) {
        match parse_item(raw) {
            ParsedItem::Video(payload) => {
                let record = to_video_record(raw, payload);
                self.videos.upsert(record.video_id.clone(), record);
            }
            ParsedItem::Channel(payload) => {
                let record = to_channel_record(payload);
                self.channels.upsert(record.channel_id.clone(), record);
            }
            ParsedItem::Malformed(err) => {
                warn!(item_id = err.item_id(), kind = raw.kind.as_str(), error = %err, "rejected record");
                self.rejected.push(err);
            }
        }
    }

    fn finish(self) -> NormalizedBatch {
        NormalizedBatch {
            videos: self.videos.items,
            channels: self.channels.items,
            rejected: self.rejected,
        }
    }
}

/// Normalize one fetch batch.
///
/// Pure and deterministic: the same input order always yields the same output.
/// Malformed items are reported in `rejected` and never abort the batch; a repeated
/// id keeps its last-seen content at the position it first appeared.
pub fn normalize(raw_items: &[RawItem]) -> NormalizedBatch {
    let mut normalizer = Normalizer::new();
    for raw in raw_items {
        normalizer.push(raw);
    }
    normalizer.finish()
}

/// [`normalize`] in chunks of `batch_size`, checking `cancel` between chunks only.
pub fn normalize_in_batches(
    raw_items: &[RawItem],
    batch_size: usize,
    cancel: &CancelSignal,
) -> Result<NormalizedBatch, Cancelled> {
    let mut normalizer = Normalizer::new();
    let mut processed = 0;
    for chunk in raw_items.chunks(batch_size.max(1)) {
        if cancel.is_cancelled() {
            return Err(Cancelled { processed });
        }
        for raw in chunk {
            normalizer.push(raw);
        }
        processed += chunk.len();
    }
    Ok(normalizer.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::{json, Value as JsonValue};
    use streamdims_core::ItemKind;

    fn video(id: &str, title: &str, duration: &str) -> RawItem {
        RawItem {
            kind: ItemKind::Video,
            item_id: id.to_string(),
            fetched_at: Utc::now(),
            payload: json!({
                "id": id,
                "snippet": {"title": title, "channelId": "c1", "categoryId": "10"},
                "contentDetails": {"duration": duration},
                "statistics": {"viewCount": "100", "likeCount": "10"}
            }),
        }
    }

    fn channel(id: &str, subscribers: u64) -> RawItem {
        RawItem {
            kind: ItemKind::Channel,
            item_id: id.to_string(),
            fetched_at: Utc::now(),
            payload: json!({"id": id, "statistics": {"subscriberCount": subscribers.to_string()}}),
        }
    }

    #[test]
    fn duplicate_video_keeps_last_content_at_first_position() {
        let items = vec![
            video("v0", "zero", "PT1M"),
            video("v1", "first copy", "PT1M"),
            video("v2", "two", "PT1M"),
            video("v3", "three", "PT1M"),
            video("v1", "second copy", "PT2M"),
            video("v4", "four", "PT1M"),
        ];
        let batch = normalize(&items);
        let ids = batch.videos.iter().map(|v| v.video_id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["v0", "v1", "v2", "v3", "v4"]);
        let v1 = &batch.videos[1];
        assert_eq!(v1.title, "second copy");
        assert_eq!(v1.duration_seconds, 120);
    }

    #[test]
    fn one_malformed_duration_rejects_only_that_record() {
        let mut items = (0..10)
            .map(|i| video(&format!("v{i}"), "ok", "PT3M"))
            .collect::<Vec<_>>();
        items[6] = video("v6", "broken", "PT3MINUTES");

        let batch = normalize(&items);
        assert_eq!(batch.videos.len(), 9);
        assert_eq!(
            batch.rejected,
            vec![ValidationError::MalformedDuration {
                item_id: "v6".into(),
                raw: "PT3MINUTES".into()
            }]
        );
    }

    #[test]
    fn rejected_duplicate_does_not_displace_valid_record() {
        let items = vec![video("v1", "good", "PT1M"), video("v1", "bad", "oops")];
        let batch = normalize(&items);
        assert_eq!(batch.videos.len(), 1);
        assert_eq!(batch.videos[0].title, "good");
        assert_eq!(batch.rejected.len(), 1);
    }

    #[test]
    fn normalization_is_idempotent_and_order_stable() {
        let items = vec![
            channel("c1", 10),
            video("v2", "b", "PT4M13S"),
            video("v1", "a", "PT0S"),
            channel("c1", 20),
            video("v2", "b2", "PT5M"),
        ];
        let first = normalize(&items);
        let second = normalize(&items);
        assert_eq!(first, second);
        assert_eq!(first.channels.len(), 1);
        assert_eq!(first.channels[0].subscriber_count, 20);
        assert_eq!(first.videos[0].video_id, "v2");
    }

    #[test]
    fn durations_convert_to_fractional_minutes() {
        let batch = normalize(&[video("v1", "a", "PT4M13S"), video("v2", "b", "PT0S")]);
        assert!((batch.videos[0].duration_minutes - (4.0 + 13.0 / 60.0)).abs() < 1e-9);
        assert_eq!(batch.videos[1].duration_minutes, 0.0);
        assert!(batch.videos.iter().all(|v| v.duration_minutes >= 0.0));
        assert_eq!(batch.videos[0].category_name, "Music");
    }

    #[test]
    fn cancellation_is_observed_between_batches() {
        let items = (0..6)
            .map(|i| video(&format!("v{i}"), "ok", "PT1M"))
            .collect::<Vec<_>>();
        let cancel = CancelSignal::new();
        assert_eq!(
            normalize_in_batches(&items, 4, &cancel).unwrap(),
            normalize(&items)
        );

        cancel.cancel();
        assert_eq!(
            normalize_in_batches(&items, 4, &cancel),
            Err(Cancelled { processed: 0 })
        );
    }

    #[test]
    fn unknown_payload_shapes_are_rejected_with_their_source_id() {
        let items = vec![RawItem {
            kind: ItemKind::Channel,
            item_id: "c9".into(),
            fetched_at: Utc::now(),
            payload: JsonValue::String("garbage".into()),
        }];
        let batch = normalize(&items);
        assert!(batch.channels.is_empty());
        assert_eq!(batch.rejected[0].item_id(), "c9");
    }
}
