//! Columnar (parquet) renderings of raw and processed snapshots.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, Int64Array, RecordBatch, StringArray, UInt32Array, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use streamdims_core::{CategoryRollup, ProcessedRow, RawItem};

pub(crate) fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    File::open(path)
        .and_then(|f| f.sync_all())
        .with_context(|| format!("syncing {}", path.display()))?;
    Ok(())
}

pub(crate) fn write_raw_items_parquet(path: &Path, items: &[RawItem]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("kind", DataType::Utf8, false),
        ArrowField::new("item_id", DataType::Utf8, false),
        ArrowField::new("fetched_at", DataType::Utf8, false),
        ArrowField::new("payload", DataType::Utf8, false),
    ]));

    let kinds = StringArray::from(items.iter().map(|i| i.kind.as_str()).collect::<Vec<_>>());
    let ids = StringArray::from(items.iter().map(|i| i.item_id.as_str()).collect::<Vec<_>>());
    let fetched_at = StringArray::from(
        items
            .iter()
            .map(|i| i.fetched_at.to_rfc3339())
            .collect::<Vec<_>>(),
    );
    let payloads = StringArray::from(
        items
            .iter()
            .map(|i| i.payload.to_string())
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(kinds),
            Arc::new(ids),
            Arc::new(fetched_at),
            Arc::new(payloads),
        ],
    )
    .context("building raw items record batch")?;
    write_parquet(path, batch)
}

pub(crate) fn write_videos_parquet(path: &Path, rows: &[ProcessedRow]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("video_id", DataType::Utf8, false),
        ArrowField::new("channel_id", DataType::Utf8, false),
        ArrowField::new("channel_title", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("category_id", DataType::Utf8, false),
        ArrowField::new("category_name", DataType::Utf8, false),
        ArrowField::new("published_at", DataType::Utf8, true),
        ArrowField::new("duration_seconds", DataType::UInt64, false),
        ArrowField::new("duration_minutes", DataType::Float64, false),
        ArrowField::new("view_count", DataType::UInt64, false),
        ArrowField::new("like_count", DataType::UInt64, false),
        ArrowField::new("comment_count", DataType::UInt64, false),
        ArrowField::new("ad_break_count", DataType::UInt32, false),
        ArrowField::new("ad_density", DataType::Float64, true),
        ArrowField::new("estimated_ad_seconds", DataType::Float64, false),
        ArrowField::new("ad_ratio", DataType::Float64, false),
        ArrowField::new("engagement_rate", DataType::Float64, false),
        ArrowField::new("duration_bucket", DataType::Utf8, false),
        ArrowField::new("age_days", DataType::Int64, true),
        ArrowField::new("views_per_day", DataType::Float64, true),
        ArrowField::new("channel_tier", DataType::Utf8, false),
        ArrowField::new("subscriber_count", DataType::UInt64, true),
        ArrowField::new("channel_total_views", DataType::UInt64, true),
        ArrowField::new("channel_category", DataType::Utf8, true),
        ArrowField::new("fetched_at", DataType::Utf8, false),
    ]));

    let strings = |f: fn(&ProcessedRow) -> &str| {
        StringArray::from(rows.iter().map(f).collect::<Vec<_>>())
    };
    let counts = |f: fn(&ProcessedRow) -> u64| UInt64Array::from(rows.iter().map(f).collect::<Vec<_>>());
    let floats = |f: fn(&ProcessedRow) -> f64| Float64Array::from(rows.iter().map(f).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(strings(|r| &r.video.video_id)),
            Arc::new(strings(|r| &r.video.channel_id)),
            Arc::new(strings(|r| &r.video.channel_title)),
            Arc::new(strings(|r| &r.video.title)),
            Arc::new(strings(|r| &r.video.category_id)),
            Arc::new(strings(|r| &r.video.category_name)),
            Arc::new(StringArray::from(
                rows.iter()
                    .map(|r| r.video.published_at.map(|ts| ts.to_rfc3339()))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(counts(|r| r.video.duration_seconds)),
            Arc::new(floats(|r| r.video.duration_minutes)),
            Arc::new(counts(|r| r.video.view_count)),
            Arc::new(counts(|r| r.video.like_count)),
            Arc::new(counts(|r| r.video.comment_count)),
            Arc::new(UInt32Array::from(
                rows.iter().map(|r| r.video.ad_break_count).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                rows.iter().map(|r| r.metrics.ad_density).collect::<Vec<_>>(),
            )),
            Arc::new(floats(|r| r.metrics.estimated_ad_seconds)),
            Arc::new(floats(|r| r.metrics.ad_ratio)),
            Arc::new(floats(|r| r.metrics.engagement_rate)),
            Arc::new(strings(|r| r.metrics.duration_bucket.as_str())),
            Arc::new(Int64Array::from(
                rows.iter().map(|r| r.metrics.age_days).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                rows.iter().map(|r| r.metrics.views_per_day).collect::<Vec<_>>(),
            )),
            Arc::new(strings(|r| r.metrics.channel_tier.as_str())),
            Arc::new(UInt64Array::from(
                rows.iter()
                    .map(|r| r.channel.as_ref().map(|c| c.subscriber_count))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(UInt64Array::from(
                rows.iter()
                    .map(|r| r.channel.as_ref().map(|c| c.total_views))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter()
                    .map(|r| r.channel.as_ref().map(|c| c.channel_category.as_str()))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter()
                    .map(|r| r.video.fetched_at.to_rfc3339())
                    .collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building videos record batch")?;
    write_parquet(path, batch)
}

pub(crate) fn write_video_tags_parquet(path: &Path, rows: &[ProcessedRow]) -> Result<()> {
    let pairs = rows
        .iter()
        .flat_map(|r| {
            r.video
                .tags
                .iter()
                .map(move |tag| (r.video.video_id.as_str(), tag.as_str()))
        })
        .collect::<Vec<_>>();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("video_id", DataType::Utf8, false),
        ArrowField::new("tag", DataType::Utf8, false),
    ]));
    let ids = StringArray::from(pairs.iter().map(|(id, _)| *id).collect::<Vec<_>>());
    let tags = StringArray::from(pairs.iter().map(|(_, tag)| *tag).collect::<Vec<_>>());
    let batch = RecordBatch::try_new(schema, vec![Arc::new(ids), Arc::new(tags)])
        .context("building video tags record batch")?;
    write_parquet(path, batch)
}

pub(crate) fn write_rollups_parquet(path: &Path, rollups: &[CategoryRollup]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("category_id", DataType::Utf8, false),
        ArrowField::new("category_name", DataType::Utf8, false),
        ArrowField::new("video_count", DataType::UInt64, false),
        ArrowField::new("undefined_density_count", DataType::UInt64, false),
        ArrowField::new("mean_ad_density", DataType::Float64, true),
        ArrowField::new("mean_ad_ratio", DataType::Float64, false),
        ArrowField::new("mean_engagement_rate", DataType::Float64, false),
    ]));

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(
                rollups.iter().map(|r| r.category_id.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rollups.iter().map(|r| r.category_name.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(UInt64Array::from(
                rollups.iter().map(|r| r.video_count as u64).collect::<Vec<_>>(),
            )),
            Arc::new(UInt64Array::from(
                rollups
                    .iter()
                    .map(|r| r.undefined_density_count as u64)
                    .collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                rollups.iter().map(|r| r.mean_ad_density).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                rollups.iter().map(|r| r.mean_ad_ratio).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                rollups.iter().map(|r| r.mean_engagement_rate).collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building category rollups record batch")?;
    write_parquet(path, batch)
}
