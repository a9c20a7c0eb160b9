use std::path::{Path, PathBuf};
use std::time::Duration;

use jobwatch_adapters::{AdzunaConfig, JsonFeedConfig, ProviderSettings, SearchOptions, ADZUNA_DEFAULT_BASE_URL};
use jobwatch_core::Region;
use jobwatch_storage::{HttpClientConfig, TokenBucketConfig};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading watchlists {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing watchlists {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("no watchlist defines any role synonym")]
    NoRoles,
    #[error("no regions configured")]
    NoRegions,
    #[error("watchlist `{0}` has an empty synonym")]
    EmptySynonym(String),
    #[error("region `{0}` has an empty `where`")]
    EmptyWhere(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Watchlist {
    pub name: String,
    #[serde(default)]
    pub synonyms: Vec<String>,
}

/// Role synonyms and regions to search, as supplied by configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WatchlistConfig {
    pub watchlists: Vec<Watchlist>,
    pub regions: Vec<Region>,
}

impl WatchlistConfig {
    pub fn from_yaml_str(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let parsed: WatchlistConfig = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text, path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for wl in &self.watchlists {
            if wl.synonyms.iter().any(|s| s.trim().is_empty()) {
                return Err(ConfigError::EmptySynonym(wl.name.clone()));
            }
        }
        if self.watchlists.iter().all(|wl| wl.synonyms.is_empty()) {
            return Err(ConfigError::NoRoles);
        }
        if self.regions.is_empty() {
            return Err(ConfigError::NoRegions);
        }
        if let Some(region) = self.regions.iter().find(|r| r.where_.trim().is_empty()) {
            return Err(ConfigError::EmptyWhere(region.name.clone()));
        }
        Ok(())
    }

    /// Every distinct synonym across watchlists, first occurrence order.
    pub fn roles(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for synonym in self.watchlists.iter().flat_map(|wl| wl.synonyms.iter()) {
            if !out.iter().any(|s| s == synonym) {
                out.push(synonym.clone());
            }
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub watchlists_path: PathBuf,
    pub output_dir: PathBuf,
    pub database_url: String,
    pub providers: ProviderSettings,
    pub results_per_page: u32,
    pub max_days_old: Option<u32>,
    pub concurrency: usize,
    pub politeness_ms: u64,
    pub cache_ttl_hours: i64,
    pub seen_retention_days: i64,
    pub market_max_daily_calls: u32,
    pub market_min_sample_postings: usize,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub refresh_cron: String,
    pub web_port: u16,
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_string(name).and_then(|v| v.trim().parse().ok())
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            watchlists_path: PathBuf::from("config/watchlists.yaml"),
            output_dir: PathBuf::from("website/data"),
            database_url: "sqlite://jobwatch.db".to_string(),
            providers: ProviderSettings::default(),
            results_per_page: 50,
            max_days_old: None,
            concurrency: 1,
            politeness_ms: 300,
            cache_ttl_hours: 24,
            seen_retention_days: 90,
            market_max_daily_calls: 50,
            market_min_sample_postings: 0,
            user_agent: "jobwatch-bot/0.1".to_string(),
            http_timeout_secs: 20,
            scheduler_enabled: false,
            sync_cron: "0 0 6 * * *".to_string(),
            refresh_cron: "0 */15 * * * *".to_string(),
            web_port: 8000,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let adzuna = match (env_string("ADZUNA_APP_ID"), env_string("ADZUNA_APP_KEY")) {
            (Some(app_id), Some(app_key)) => Some(AdzunaConfig {
                app_id,
                app_key,
                country: env_string("ADZUNA_COUNTRY").unwrap_or_else(|| "ca".to_string()),
                base_url: env_string("ADZUNA_BASE_URL")
                    .unwrap_or_else(|| ADZUNA_DEFAULT_BASE_URL.to_string()),
            }),
            _ => None,
        };
        let json_feed = match (env_string("WORKBC_BASE_URL"), env_string("WORKBC_API_KEY")) {
            (Some(base_url), Some(api_key)) => Some(JsonFeedConfig {
                name: "workbc".to_string(),
                base_url,
                api_key,
            }),
            _ => None,
        };

        Self {
            watchlists_path: env_string("JOBWATCH_WATCHLISTS")
                .map(PathBuf::from)
                .unwrap_or(defaults.watchlists_path),
            output_dir: env_string("JOBWATCH_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            database_url: env_string("DATABASE_URL").unwrap_or(defaults.database_url),
            providers: ProviderSettings { adzuna, json_feed },
            results_per_page: env_parse("JOBWATCH_RESULTS_PER_PAGE").unwrap_or(defaults.results_per_page),
            max_days_old: env_parse("JOBWATCH_MAX_DAYS_OLD"),
            concurrency: env_parse("JOBWATCH_CONCURRENCY").unwrap_or(defaults.concurrency),
            politeness_ms: env_parse("JOBWATCH_POLITENESS_MS").unwrap_or(defaults.politeness_ms),
            cache_ttl_hours: env_parse("JOBWATCH_CACHE_TTL_HOURS").unwrap_or(defaults.cache_ttl_hours),
            seen_retention_days: env_parse("JOBWATCH_SEEN_RETENTION_DAYS")
                .unwrap_or(defaults.seen_retention_days),
            market_max_daily_calls: env_parse("MARKET_MAX_DAILY_CALLS")
                .unwrap_or(defaults.market_max_daily_calls),
            market_min_sample_postings: env_parse("MARKET_MIN_SAMPLE_POSTINGS")
                .unwrap_or(defaults.market_min_sample_postings),
            user_agent: env_string("JOBWATCH_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("JOBWATCH_HTTP_TIMEOUT_SECS").unwrap_or(defaults.http_timeout_secs),
            scheduler_enabled: env_string("JOBWATCH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: env_string("SYNC_CRON").unwrap_or(defaults.sync_cron),
            refresh_cron: env_string("REFRESH_CRON").unwrap_or(defaults.refresh_cron),
            web_port: env_parse("JOBWATCH_WEB_PORT").unwrap_or(defaults.web_port),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            token_bucket: (self.politeness_ms > 0).then(|| TokenBucketConfig {
                capacity: 1,
                refill_every: Duration::from_millis(self.politeness_ms),
            }),
            ..Default::default()
        }
    }

    pub fn search_options(&self, region: &Region) -> SearchOptions {
        SearchOptions {
            results_per_page: self.results_per_page,
            max_days_old: self.max_days_old,
            remote_only: region.is_remote(),
            ..SearchOptions::default()
        }
    }

    pub fn cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.cache_ttl_hours.max(1))
    }

    pub fn seen_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.seen_retention_days.max(1))
    }

    pub fn load_watchlists(&self) -> Result<WatchlistConfig, ConfigError> {
        WatchlistConfig::load(&self.watchlists_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobwatch_core::RegionType;

    const SAMPLE: &str = r#"
watchlists:
  - name: backend
    synonyms: ["Backend Engineer", "Rust Developer"]
  - name: data
    synonyms: ["Data Analyst", "Backend Engineer"]
regions:
  - name: Toronto
    where: Toronto, ON
    type: onsite
  - name: Remote Canada
    where: Canada
    type: remote
"#;

    #[test]
    fn parses_watchlists_and_regions() {
        let cfg = WatchlistConfig::from_yaml_str(SAMPLE, Path::new("inline.yaml")).unwrap();
        assert_eq!(cfg.watchlists.len(), 2);
        assert_eq!(cfg.regions[1].kind, RegionType::Remote);
        assert_eq!(cfg.regions[0].where_, "Toronto, ON");
        assert_eq!(
            cfg.roles(),
            vec!["Backend Engineer", "Rust Developer", "Data Analyst"]
        );
    }

    #[test]
    fn validation_failures_are_config_errors() {
        let no_regions = "watchlists:\n  - name: a\n    synonyms: [Dev]\nregions: []\n";
        assert!(matches!(
            WatchlistConfig::from_yaml_str(no_regions, Path::new("x")),
            Err(ConfigError::NoRegions)
        ));

        let empty_where = "watchlists:\n  - name: a\n    synonyms: [Dev]\nregions:\n  - {name: X, where: ' ', type: onsite}\n";
        assert!(matches!(
            WatchlistConfig::from_yaml_str(empty_where, Path::new("x")),
            Err(ConfigError::EmptyWhere(name)) if name == "X"
        ));

        let no_roles = "watchlists:\n  - name: a\n    synonyms: []\nregions:\n  - {name: X, where: Y, type: onsite}\n";
        assert!(matches!(
            WatchlistConfig::from_yaml_str(no_roles, Path::new("x")),
            Err(ConfigError::NoRoles)
        ));

        let bad_type = "watchlists: []\nregions:\n  - {name: X, where: Y, type: orbital}\n";
        assert!(matches!(
            WatchlistConfig::from_yaml_str(bad_type, Path::new("x")),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn shipped_watchlists_file_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/watchlists.yaml");
        let cfg = WatchlistConfig::load(&path).unwrap();
        assert!(!cfg.roles().is_empty());
        assert!(cfg.regions.iter().any(Region::is_remote));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = WatchlistConfig::load(Path::new("/definitely/not/here.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn search_options_follow_region_type() {
        let config = SyncConfig::default();
        let remote = Region {
            name: "Remote".into(),
            where_: "Canada".into(),
            kind: RegionType::Remote,
        };
        let options = config.search_options(&remote);
        assert!(options.remote_only);
        assert_eq!(options.results_per_page, 50);
        assert_eq!(config.cache_ttl(), chrono::Duration::hours(24));
        assert!(config.http_client_config().token_bucket.is_some());
    }
}
