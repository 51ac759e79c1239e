use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use streamdims_adapters::{ApiCredential, FetchSettings, DEFAULT_API_BASE_URL, MAX_PAGE_SIZE};
use streamdims_storage::RetryPolicy;

use tracing::warn;

use crate::metrics::MetricsConfig;

/// Retry knobs as they appear in env and YAML, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 5_000,
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

/// Everything one pipeline run needs.
///
/// Built from the environment, optionally overlaid by a YAML file, then by CLI flags.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Category ids to fetch. Empty fetches the unfiltered chart.
    pub categories: BTreeSet<String>,
    /// Maximum number of videos fetched per run.
    pub item_limit: usize,
    /// Quota units the run may spend.
    pub quota_budget: u64,
    /// Quota units charged per request.
    pub page_cost: u64,
    /// Requested page size, capped at the platform maximum of 50.
    pub page_size: u32,
    pub region_code: String,
    /// Per-request retries inside the fetcher.
    pub fetch_retry: RetrySettings,
    /// Whole-stage fetch restarts from the last resume point.
    pub orchestrator_retry: RetrySettings,
    pub http_timeout_secs: u64,
    /// Concurrent requests allowed against the API.
    pub max_in_flight: usize,
    /// Assumed length of one ad break when estimating `ad_ratio`.
    pub seconds_per_ad_break: f64,
    /// Records normalized between cancellation checks.
    pub normalize_batch_size: usize,
    /// Dataset store root.
    pub data_dir: PathBuf,
    pub api_base_url: String,
    pub user_agent: String,
    pub credential: Option<ApiCredential>,
    /// Cron expressions (seconds field first) for scheduled runs.
    pub scheduler_crons: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`PipelineConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let retry = |prefix: &str, default: RetrySettings| RetrySettings {
            max_attempts: parsed(&lookup, &format!("{prefix}_MAX_ATTEMPTS"))
                .unwrap_or(default.max_attempts),
            base_delay_ms: parsed(&lookup, &format!("{prefix}_BASE_DELAY_MS"))
                .unwrap_or(default.base_delay_ms),
            max_delay_ms: parsed(&lookup, &format!("{prefix}_MAX_DELAY_MS"))
                .unwrap_or(default.max_delay_ms),
        };

        let credential = lookup("STREAMDIMS_BEARER_TOKEN")
            .filter(|v| !v.is_empty())
            .map(ApiCredential::Bearer)
            .or_else(|| {
                lookup("YOUTUBE_API_KEY")
                    .or_else(|| lookup("STREAMDIMS_API_KEY"))
                    .filter(|v| !v.is_empty())
                    .map(ApiCredential::ApiKey)
            });

        Self {
            categories: lookup("STREAMDIMS_CATEGORIES")
                .map(|v| split_list(&v, ','))
                .unwrap_or_default(),
            item_limit: parsed(&lookup, "STREAMDIMS_ITEM_LIMIT").unwrap_or(200),
            quota_budget: parsed(&lookup, "STREAMDIMS_QUOTA_BUDGET").unwrap_or(10_000),
            page_cost: parsed(&lookup, "STREAMDIMS_PAGE_COST").unwrap_or(1),
            page_size: parsed(&lookup, "STREAMDIMS_PAGE_SIZE").unwrap_or(MAX_PAGE_SIZE),
            region_code: lookup("STREAMDIMS_REGION_CODE").unwrap_or_else(|| "US".to_string()),
            fetch_retry: retry("STREAMDIMS_FETCH_RETRY", RetrySettings::default()),
            orchestrator_retry: retry(
                "STREAMDIMS_RUN_RETRY",
                RetrySettings {
                    max_attempts: 2,
                    base_delay_ms: 2_000,
                    max_delay_ms: 30_000,
                },
            ),
            http_timeout_secs: parsed(&lookup, "STREAMDIMS_HTTP_TIMEOUT_SECS").unwrap_or(20),
            max_in_flight: parsed(&lookup, "STREAMDIMS_MAX_IN_FLIGHT").unwrap_or(4),
            seconds_per_ad_break: parsed(&lookup, "STREAMDIMS_SECONDS_PER_AD_BREAK")
                .unwrap_or(MetricsConfig::default().seconds_per_ad_break),
            normalize_batch_size: parsed(&lookup, "STREAMDIMS_NORMALIZE_BATCH_SIZE").unwrap_or(500),
            data_dir: lookup("STREAMDIMS_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            api_base_url: lookup("STREAMDIMS_API_BASE_URL")
                .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
            user_agent: lookup("STREAMDIMS_USER_AGENT")
                .unwrap_or_else(|| "streamdims-etl/0.1".to_string()),
            credential,
            scheduler_crons: lookup("STREAMDIMS_SCHEDULER_CRONS")
                .map(|v| split_list(&v, ';').into_iter().collect())
                .unwrap_or_else(|| vec!["0 0 6 * * *".to_string(), "0 0 18 * * *".to_string()]),
        }
    }

    /// Overlay the fields present in a YAML file onto `self`.
    pub fn with_overlay_file(self, path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        self.with_overlay_yaml(&text)
            .with_context(|| format!("parsing {}", path.display()))
    }

    pub fn with_overlay_yaml(mut self, text: &str) -> Result<Self> {
        let overlay: ConfigOverlay = serde_yaml::from_str(text)?;
        overlay.apply(&mut self);
        Ok(self)
    }

    /// Reject settings no run can work with.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            bail!("page_size must be between 1 and {MAX_PAGE_SIZE}, got {}", self.page_size);
        }
        if self.page_cost == 0 {
            bail!("page_cost must be at least 1");
        }
        if !self.seconds_per_ad_break.is_finite() || self.seconds_per_ad_break < 0.0 {
            bail!(
                "seconds_per_ad_break must be a non-negative number, got {}",
                self.seconds_per_ad_break
            );
        }
        if self.http_timeout_secs == 0 {
            bail!("http_timeout_secs must be at least 1");
        }
        if self.normalize_batch_size == 0 {
            bail!("normalize_batch_size must be at least 1");
        }
        if let Some(bad) = self
            .categories
            .iter()
            .find(|c| c.is_empty() || !c.chars().all(|ch| ch.is_ascii_digit()))
        {
            bail!("category ids are numeric, got {bad:?}");
        }
        Ok(())
    }

    pub fn fetch_settings(&self) -> FetchSettings {
        FetchSettings {
            page_cost: self.page_cost,
            page_size: self.page_size,
            region_code: self.region_code.clone(),
            retry: self.fetch_retry.policy(),
            max_in_flight: self.max_in_flight,
        }
    }

    pub fn metrics_config(&self) -> MetricsConfig {
        MetricsConfig {
            seconds_per_ad_break: self.seconds_per_ad_break,
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

/// Unparseable values are logged and fall back to the default.
fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable environment value; using default");
            None
        }
    }
}

fn split_list(value: &str, separator: char) -> BTreeSet<String> {
    value
        .split(separator)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// The YAML file shape: every field optional, absent fields keep their value.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigOverlay {
    categories: Option<Vec<String>>,
    item_limit: Option<usize>,
    quota_budget: Option<u64>,
    page_cost: Option<u64>,
    page_size: Option<u32>,
    region_code: Option<String>,
    fetch_retry: Option<RetryOverlay>,
    orchestrator_retry: Option<RetryOverlay>,
    http_timeout_secs: Option<u64>,
    max_in_flight: Option<usize>,
    seconds_per_ad_break: Option<f64>,
    normalize_batch_size: Option<usize>,
    data_dir: Option<PathBuf>,
    api_base_url: Option<String>,
    user_agent: Option<String>,
    scheduler_crons: Option<Vec<String>>,
}

impl ConfigOverlay {
    fn apply(self, config: &mut PipelineConfig) {
        if let Some(categories) = self.categories {
            config.categories = categories.into_iter().map(|c| c.trim().to_string()).collect();
        }
        if let Some(retry) = self.fetch_retry {
            retry.apply(&mut config.fetch_retry);
        }
        if let Some(retry) = self.orchestrator_retry {
            retry.apply(&mut config.orchestrator_retry);
        }
        macro_rules! overlay {
            ($($field:ident),* $(,)?) => {
                $(if let Some(value) = self.$field {
                    config.$field = value;
                })*
            };
        }
        overlay!(
            item_limit,
            quota_budget,
            page_cost,
            page_size,
            region_code,
            http_timeout_secs,
            max_in_flight,
            seconds_per_ad_break,
            normalize_batch_size,
            data_dir,
            api_base_url,
            user_agent,
            scheduler_crons,
        );
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RetryOverlay {
    max_attempts: Option<u32>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
}

impl RetryOverlay {
    fn apply(self, settings: &mut RetrySettings) {
        if let Some(value) = self.max_attempts {
            settings.max_attempts = value;
        }
        if let Some(value) = self.base_delay_ms {
            settings.base_delay_ms = value;
        }
        if let Some(value) = self.max_delay_ms {
            settings.max_delay_ms = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn defaults_apply_without_environment() {
        let config = PipelineConfig::default();
        assert!(config.categories.is_empty());
        assert_eq!(config.page_size, 50);
        assert_eq!(config.seconds_per_ad_break, 20.0);
        assert_eq!(config.credential, None);
        assert_eq!(config.scheduler_crons.len(), 2);
        config.validate().unwrap();
    }

    #[test]
    fn environment_values_are_parsed() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("STREAMDIMS_CATEGORIES", "20, 10,,10"),
            ("STREAMDIMS_ITEM_LIMIT", "75"),
            ("STREAMDIMS_FETCH_RETRY_MAX_ATTEMPTS", "5"),
            ("STREAMDIMS_PAGE_SIZE", "not-a-number"),
            ("YOUTUBE_API_KEY", "k"),
            ("STREAMDIMS_SCHEDULER_CRONS", "0 0 * * * *; 0 30 * * * *"),
        ]));
        assert_eq!(
            config.categories.into_iter().collect::<Vec<_>>(),
            vec!["10".to_string(), "20".to_string()]
        );
        assert_eq!(config.item_limit, 75);
        assert_eq!(config.fetch_retry.max_attempts, 5);
        assert_eq!(config.fetch_retry.base_delay_ms, 250);
        assert_eq!(config.page_size, 50);
        assert_eq!(config.credential, Some(ApiCredential::ApiKey("k".into())));
        assert_eq!(config.scheduler_crons.len(), 2);
    }

    #[test]
    fn bearer_token_wins_over_api_key() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("YOUTUBE_API_KEY", "k"),
            ("STREAMDIMS_BEARER_TOKEN", "t"),
        ]));
        assert_eq!(config.credential, Some(ApiCredential::Bearer("t".into())));
    }

    #[test]
    fn yaml_overlay_replaces_only_present_fields() {
        let config = PipelineConfig::default()
            .with_overlay_yaml(
                "categories: ['24']\nquota_budget: 500\norchestrator_retry:\n  max_attempts: 4\n",
            )
            .unwrap();
        assert_eq!(config.categories, BTreeSet::from(["24".to_string()]));
        assert_eq!(config.quota_budget, 500);
        assert_eq!(config.orchestrator_retry.max_attempts, 4);
        assert_eq!(config.item_limit, 200);
    }

    #[test]
    fn nested_retry_overlay_keeps_unset_fields() {
        let before = PipelineConfig::default();
        let config = before
            .clone()
            .with_overlay_yaml("orchestrator_retry:\n  max_attempts: 4\nfetch_retry:\n  max_delay_ms: 900\n")
            .unwrap();
        assert_eq!(config.orchestrator_retry.max_attempts, 4);
        assert_eq!(config.orchestrator_retry.base_delay_ms, 2_000);
        assert_eq!(config.orchestrator_retry.max_delay_ms, 30_000);
        assert_eq!(config.fetch_retry.max_attempts, before.fetch_retry.max_attempts);
        assert_eq!(config.fetch_retry.base_delay_ms, 250);
        assert_eq!(config.fetch_retry.max_delay_ms, 900);

        let err = PipelineConfig::default()
            .with_overlay_yaml("fetch_retry:\n  attempts: 2\n")
            .unwrap_err();
        assert!(err.to_string().contains("attempts"));
    }

    #[test]
    fn malformed_environment_numbers_fall_back_to_defaults() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("STREAMDIMS_QUOTA_BUDGET", "5k"),
            ("STREAMDIMS_HTTP_TIMEOUT_SECS", " 7 "),
        ]));
        assert_eq!(config.quota_budget, 10_000);
        assert_eq!(config.http_timeout_secs, 7);
    }

    #[test]
    fn overlay_file_errors_name_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.yaml");
        std::fs::write(&path, "item_limt: 3\n").unwrap();
        let err = PipelineConfig::default().with_overlay_file(&path).unwrap_err();
        assert!(err.to_string().contains("pipeline.yaml"));
    }

    #[test]
    fn validation_rejects_unusable_settings() {
        let mut config = PipelineConfig::default();
        config.page_size = 51;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.seconds_per_ad_break = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.http_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.categories.insert("music".into());
        assert!(config.validate().is_err());
    }
}
