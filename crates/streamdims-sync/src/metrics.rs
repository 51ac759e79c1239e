//! Ad-saturation and engagement metrics, plus per-category rollups.

use std::collections::BTreeMap;

use streamdims_core::{
    category_name, CategoryRollup, ChannelTier, DurationBucket, MetricsRecord, ProcessedRow,
    VideoRecord,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsConfig {
    /// Assumed length of one ad break. The platform reports break markers, not
    /// ad lengths, so `ad_ratio` is an estimate built on this constant.
    pub seconds_per_ad_break: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            seconds_per_ad_break: 20.0,
        }
    }
}

pub fn compute(videos: &[VideoRecord], config: &MetricsConfig) -> Vec<MetricsRecord> {
    videos.iter().map(|video| metrics_for(video, config)).collect()
}

pub fn metrics_for(video: &VideoRecord, config: &MetricsConfig) -> MetricsRecord {
    let breaks = f64::from(video.ad_break_count);
    let ad_density = (video.duration_minutes > 0.0).then(|| breaks / video.duration_minutes);

    let estimated_ad_seconds = breaks * config.seconds_per_ad_break;
    let ad_ratio = if video.duration_seconds == 0 {
        if video.ad_break_count > 0 {
            1.0
        } else {
            0.0
        }
    } else {
        (estimated_ad_seconds / video.duration_seconds as f64).clamp(0.0, 1.0)
    };

    // Measured against the fetch time, not the wall clock.
    let age_days = video
        .published_at
        .map(|published| (video.fetched_at - published).num_days().max(0));
    let views_per_day = age_days.map(|age| video.view_count as f64 / age.max(1) as f64);

    MetricsRecord {
        video_id: video.video_id.clone(),
        ad_density,
        estimated_ad_seconds,
        ad_ratio,
        engagement_rate: video.like_count as f64 / video.view_count.max(1) as f64,
        duration_bucket: DurationBucket::for_minutes(video.duration_minutes),
        age_days,
        views_per_day,
        channel_tier: ChannelTier::for_views(video.view_count),
    }
}

#[derive(Default)]
struct RollupAcc {
    videos: usize,
    density_sum: f64,
    density_defined: usize,
    ratio_sum: f64,
    engagement_sum: f64,
}

/// Category means, keyed and ordered by category id. Undefined densities are
/// counted but left out of the density mean.
pub fn rollup(rows: &[ProcessedRow]) -> Vec<CategoryRollup> {
    let mut by_category: BTreeMap<&str, RollupAcc> = BTreeMap::new();
    for row in rows {
        let acc = by_category.entry(row.video.category_id.as_str()).or_default();
        acc.videos += 1;
        if let Some(density) = row.metrics.ad_density {
            acc.density_sum += density;
            acc.density_defined += 1;
        }
        acc.ratio_sum += row.metrics.ad_ratio;
        acc.engagement_sum += row.metrics.engagement_rate;
    }

    by_category
        .into_iter()
        .map(|(category_id, acc)| {
            let n = acc.videos as f64;
            CategoryRollup {
                category_id: category_id.to_string(),
                category_name: category_name(category_id).to_string(),
                video_count: acc.videos,
                undefined_density_count: acc.videos - acc.density_defined,
                mean_ad_density: (acc.density_defined > 0)
                    .then(|| acc.density_sum / acc.density_defined as f64),
                mean_ad_ratio: acc.ratio_sum / n,
                mean_engagement_rate: acc.engagement_sum / n,
            }
        })
        .collect()
}
