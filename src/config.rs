use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::model::VenueDefinition;
use crate::normalize::PatternSpec;
use crate::retry::RetryPolicy;

pub const DEFAULT_CONFIG_PATH: &str = "screening-ingest.toml";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/143.0.0.0 Safari/537.36";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub scrape: ScrapeConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub tmdb: TmdbConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub normalize: NormalizeConfig,
    #[serde(default)]
    pub venues: Vec<VenueDefinition>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScrapeConfig {
    pub requests_per_minute: u32,
    /// Fixed delay enforced between two requests from the same client.
    pub min_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub user_agent: String,
    pub max_attempts: u32,
    pub backoff_ms: Vec<u64>,
    /// Pause after a failed date/page before moving on to the next one.
    pub unit_backoff_ms: u64,
    /// How many days ahead calendar-driven scrapers walk.
    pub horizon_days: u32,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 30,
            min_delay_ms: 1_000,
            request_timeout_secs: 30,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            max_attempts: 3,
            backoff_ms: vec![2_000, 5_000],
            unit_backoff_ms: 3_000,
            horizon_days: 14,
        }
    }
}

impl ScrapeConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(
            self.max_attempts,
            self.backoff_ms.iter().map(|ms| Duration::from_millis(*ms)).collect(),
        )
    }

    pub fn unit_backoff(&self) -> Duration {
        Duration::from_millis(self.unit_backoff_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub node_binary: String,
    pub bridge_script: String,
    pub headless: bool,
    pub locale: String,
    pub timezone: String,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub page_load_timeout_secs: u64,
    pub challenge_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub max_attempts: u32,
    pub backoff_ms: Vec<u64>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            node_binary: "node".to_string(),
            bridge_script: "scripts/browser-bridge.mjs".to_string(),
            headless: true,
            locale: "en-GB".to_string(),
            timezone: "Europe/London".to_string(),
            viewport_width: 1366,
            viewport_height: 768,
            page_load_timeout_secs: 45,
            challenge_timeout_secs: 60,
            poll_interval_ms: 2_000,
            max_attempts: 3,
            backoff_ms: vec![5_000, 15_000],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    pub normalized_confidence: f64,
    /// Fuzzy candidates scoring below this are discarded.
    pub fuzzy_floor: f64,
    pub fuzzy_auto_apply: f64,
    pub ai_auto_apply: f64,
    /// Confidence given to a mechanical cleanup when the extractor fails.
    pub fallback_confidence: f64,
    pub year_tolerance: i32,
    pub max_provider_candidates: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            normalized_confidence: 0.9,
            fuzzy_floor: 0.7,
            fuzzy_auto_apply: 0.8,
            ai_auto_apply: 0.8,
            fallback_confidence: 0.3,
            year_tolerance: 1,
            max_provider_candidates: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub enabled: bool,
    pub base_url: String,
    pub model: String,
    pub api_key_env: String,
    pub min_interval_ms: u64,
    pub timeout_secs: u64,
    /// When set, extracted titles are persisted here between runs.
    pub cache_path: Option<String>,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "LLM_API_KEY".to_string(),
            min_interval_ms: 1_000,
            timeout_secs: 20,
            cache_path: Some("data/title-cache.json".to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TmdbConfig {
    pub base_url: String,
    pub image_base_url: String,
    pub api_key_env: String,
    pub language: String,
    pub timeout_secs: u64,
    pub requests_per_minute: u32,
}

impl Default for TmdbConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.themoviedb.org/3".to_string(),
            image_base_url: "https://image.tmdb.org/t/p".to_string(),
            api_key_env: "TMDB_API_KEY".to_string(),
            language: "en-GB".to_string(),
            timeout_secs: 15,
            requests_per_minute: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub default_tolerance_percent: f64,
    /// Drops at or beyond this percentage hold the run for review.
    pub block_drop_percent: f64,
    /// Weight of the newest sample in the moving average.
    pub smoothing: f64,
    pub max_update_attempts: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            default_tolerance_percent: 30.0,
            block_drop_percent: 50.0,
            smoothing: 0.3,
            max_update_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_concurrent_venues: usize,
    pub max_concurrent_browsers: usize,
    pub venue_timeout_secs: u64,
    pub store_path: String,
    pub cleanup_grace_hours: i64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_venues: 4,
            max_concurrent_browsers: 1,
            venue_timeout_secs: 900,
            store_path: "data/store.json".to_string(),
            cleanup_grace_hours: 6,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct NormalizeConfig {
    /// Replaces the built-in event pattern table when present.
    pub patterns: Option<Vec<PatternSpec>>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn venue(&self, id: &str) -> Option<&VenueDefinition> {
        self.venues.iter().find(|v| v.id == id)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for venue in &self.venues {
            if venue.id.trim().is_empty() {
                return Err(ConfigError::Invalid("venue with empty id".to_string()));
            }
            if !seen.insert(venue.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate venue id `{}`", venue.id)));
            }
            if venue.strategy != venue.scraper.strategy() {
                return Err(ConfigError::Invalid(format!(
                    "venue `{}` declares {:?} strategy but its scraper requires {:?}",
                    venue.id,
                    venue.strategy,
                    venue.scraper.strategy()
                )));
            }
        }

        let m = &self.matching;
        for (name, value) in [
            ("matching.normalized_confidence", m.normalized_confidence),
            ("matching.fuzzy_floor", m.fuzzy_floor),
            ("matching.fuzzy_auto_apply", m.fuzzy_auto_apply),
            ("matching.ai_auto_apply", m.ai_auto_apply),
            ("matching.fallback_confidence", m.fallback_confidence),
            ("health.smoothing", self.health.smoothing),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!("{name} must be within 0..=1, got {value}")));
            }
        }
        if self.scrape.requests_per_minute == 0 {
            return Err(ConfigError::Invalid("scrape.requests_per_minute must be positive".to_string()));
        }
        if self.pipeline.max_concurrent_venues == 0 || self.pipeline.max_concurrent_browsers == 0 {
            return Err(ConfigError::Invalid("pipeline concurrency limits must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ScrapeStrategy;
    use crate::venues::ScraperKind;

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.scrape.requests_per_minute, 30);
        assert_eq!(config.health.default_tolerance_percent, 30.0);
        assert_eq!(config.matching.fuzzy_auto_apply, 0.8);
        assert!(config.venues.is_empty());
    }

    #[test]
    fn parses_venues_and_overrides() {
        let config = Config::from_toml(
            r#"
            [health]
            block_drop_percent = 60.0

            [[venues]]
            id = "ica"
            name = "ICA"
            base_url = "https://www.ica.art"
            strategy = "static"
            scraper = "ica"
            tolerance_percent = 40.0

            [[venues]]
            id = "bfi-southbank"
            name = "BFI Southbank"
            base_url = "https://whatson.bfi.org.uk"
            strategy = "browser"
            scraper = "bfi_southbank"
            "#,
        )
        .unwrap();

        assert_eq!(config.health.block_drop_percent, 60.0);
        let ica = config.venue("ica").unwrap();
        assert_eq!(ica.scraper, ScraperKind::Ica);
        assert_eq!(ica.tolerance_percent, Some(40.0));
        assert!(ica.enabled);
        assert_eq!(config.venue("bfi-southbank").unwrap().strategy, ScrapeStrategy::Browser);
    }

    #[test]
    fn rejects_unknown_scraper() {
        let err = Config::from_toml(
            r#"
            [[venues]]
            id = "nowhere"
            name = "Nowhere"
            base_url = "https://example.com"
            strategy = "static"
            scraper = "not_a_cinema"
            "#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn rejects_strategy_mismatch() {
        let err = Config::from_toml(
            r#"
            [[venues]]
            id = "bfi"
            name = "BFI"
            base_url = "https://whatson.bfi.org.uk"
            strategy = "static"
            scraper = "bfi_southbank"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("requires"));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let venue = r#"
            [[venues]]
            id = "rio"
            name = "Rio"
            base_url = "https://riocinema.org.uk"
            strategy = "static"
            scraper = "rio"
        "#;
        let err = Config::from_toml(&format!("{venue}{venue}")).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }
}
