use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub source: SourceSettings,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub throttle: ThrottleSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub classifier: ClassifierSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSettings {
    /// Collection polled for new items
    #[serde(default)]
    pub collection: String,

    /// Collection qualifying items are cross-posted into
    #[serde(default)]
    pub destination: String,

    #[serde(default = "default_credentials_file")]
    pub credentials_file: PathBuf,

    #[serde(default = "default_api_url")]
    pub api_url: String,

    #[serde(default = "default_auth_url")]
    pub auth_url: String,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    #[serde(default = "default_page_limit")]
    pub page_limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// Seconds to wait between a cross-post and its approval
    #[serde(default = "default_approve_delay")]
    pub approve_delay: u64,

    /// Sleep after a cycle that saw nothing new
    #[serde(default = "default_idle_interval")]
    pub idle_interval: u64,

    /// Sleep after a cycle that processed items but forwarded none
    #[serde(default = "default_quiet_interval")]
    pub quiet_interval: u64,

    /// Sleep after a cycle that forwarded at least one item
    #[serde(default = "default_active_interval")]
    pub active_interval: u64,

    #[serde(default = "default_max_pages_per_cycle")]
    pub max_pages_per_cycle: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_randomization_factor")]
    pub randomization_factor: f64,

    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,

    /// 0 retries forever
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Seconds; 0 disables the elapsed-time ceiling
    #[serde(default = "default_max_elapsed")]
    pub max_elapsed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleSettings {
    /// Extra wait past the advertised reset
    #[serde(default = "default_safety_margin_ms")]
    pub safety_margin_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Seconds a processed marker is kept before pruning
    #[serde(default = "default_ttl")]
    pub processed_ttl: u64,

    /// Seconds a disqualification is honoured
    #[serde(default = "default_ttl")]
    pub disqualified_ttl: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierSettings {
    /// Case-insensitive substrings that mark paid-content promotion
    #[serde(default = "default_markers")]
    pub markers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub log_to_file: bool,

    #[serde(default = "default_log_file")]
    pub log_file: String,

    #[serde(default)]
    pub json_format: bool,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .map_err(|_| Error::NotFound(path.as_ref().display().to_string()))?;

        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .map_err(|_| Error::NotFound(path.as_ref().display().to_string()))?;

        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Invalid(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.source.collection.trim().is_empty() {
            return Err(Error::Config("source.collection must be set".to_string()));
        }

        if self.source.destination.trim().is_empty() {
            return Err(Error::Config("source.destination must be set".to_string()));
        }

        for (name, value) in [("api_url", &self.source.api_url), ("auth_url", &self.source.auth_url)] {
            url::Url::parse(value)
                .map_err(|e| Error::Config(format!("source.{} is not a valid URL: {}", name, e)))?;
        }

        if self.source.page_limit == 0 || self.source.page_limit > 100 {
            return Err(Error::Config("source.page_limit must be between 1 and 100".to_string()));
        }

        if self.pipeline.max_concurrent_jobs == 0 {
            return Err(Error::Config("pipeline.max_concurrent_jobs must be greater than 0".to_string()));
        }

        if self.pipeline.max_pages_per_cycle == 0 {
            return Err(Error::Config("pipeline.max_pages_per_cycle must be greater than 0".to_string()));
        }

        if self.retry.multiplier < 1.0 {
            return Err(Error::Config("retry.multiplier must be at least 1.0".to_string()));
        }

        if !(0.0..=1.0).contains(&self.retry.randomization_factor) {
            return Err(Error::Config("retry.randomization_factor must be within 0.0..=1.0".to_string()));
        }

        if self.classifier.markers.iter().all(|m| m.trim().is_empty()) {
            return Err(Error::Config("classifier.markers must contain at least one marker".to_string()));
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(collection) = std::env::var("REPOST_GUARD_COLLECTION") {
            self.source.collection = collection;
        }

        if let Ok(destination) = std::env::var("REPOST_GUARD_DESTINATION") {
            self.source.destination = destination;
        }

        if let Ok(path) = std::env::var("REPOST_GUARD_CREDENTIALS") {
            self.source.credentials_file = PathBuf::from(path);
        }

        if let Ok(dir) = std::env::var("REPOST_GUARD_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }

        if let Ok(jobs) = std::env::var("REPOST_GUARD_MAX_CONCURRENT_JOBS") {
            if let Ok(val) = jobs.parse() {
                self.pipeline.max_concurrent_jobs = val;
            }
        }

        if let Ok(level) = std::env::var("REPOST_GUARD_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    pub fn config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("repost-guard"))
            .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))
    }

    pub fn data_dir() -> Result<PathBuf> {
        dirs::data_dir()
            .map(|dir| dir.join("repost-guard"))
            .ok_or_else(|| Error::Config("Could not determine data directory".to_string()))
    }
}

impl PipelineSettings {
    pub fn approve_delay(&self) -> Duration {
        Duration::from_secs(self.approve_delay)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_secs(self.idle_interval)
    }

    pub fn quiet_interval(&self) -> Duration {
        Duration::from_secs(self.quiet_interval)
    }

    pub fn active_interval(&self) -> Duration {
        Duration::from_secs(self.active_interval)
    }
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            collection: String::new(),
            destination: String::new(),
            credentials_file: default_credentials_file(),
            api_url: default_api_url(),
            auth_url: default_auth_url(),
            user_agent: default_user_agent(),
            timeout: default_timeout(),
            page_limit: default_page_limit(),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            approve_delay: default_approve_delay(),
            idle_interval: default_idle_interval(),
            quiet_interval: default_quiet_interval(),
            active_interval: default_active_interval(),
            max_pages_per_cycle: default_max_pages_per_cycle(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval_ms(),
            multiplier: default_multiplier(),
            randomization_factor: default_randomization_factor(),
            max_interval_ms: default_max_interval_ms(),
            max_attempts: default_max_attempts(),
            max_elapsed: default_max_elapsed(),
        }
    }
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        Self {
            safety_margin_ms: default_safety_margin_ms(),
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            processed_ttl: default_ttl(),
            disqualified_ttl: default_ttl(),
        }
    }
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            markers: default_markers(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_to_file: false,
            log_file: default_log_file(),
            json_format: false,
        }
    }
}

fn default_credentials_file() -> PathBuf { PathBuf::from("password.json") }
fn default_api_url() -> String { "https://oauth.reddit.com".to_string() }
fn default_auth_url() -> String { "https://www.reddit.com".to_string() }
fn default_user_agent() -> String {
    format!("repost-guard/{}", env!("CARGO_PKG_VERSION"))
}
fn default_timeout() -> u64 { 30 }
fn default_page_limit() -> u32 { 100 }

fn default_max_concurrent_jobs() -> usize { 2 }
fn default_approve_delay() -> u64 { 5 }
fn default_idle_interval() -> u64 { 90 }
fn default_quiet_interval() -> u64 { 300 }
fn default_active_interval() -> u64 { 30 }
fn default_max_pages_per_cycle() -> usize { 10 }

fn default_initial_interval_ms() -> u64 { 500 }
fn default_multiplier() -> f64 { 1.5 }
fn default_randomization_factor() -> f64 { 0.5 }
fn default_max_interval_ms() -> u64 { 60_000 }
fn default_max_attempts() -> u32 { 10 }
fn default_max_elapsed() -> u64 { 15 * 60 }

fn default_safety_margin_ms() -> u64 { 1_000 }

fn default_data_dir() -> PathBuf {
    Config::data_dir().unwrap_or_else(|_| PathBuf::from("data"))
}
fn default_ttl() -> u64 { 48 * 60 * 60 }

fn default_markers() -> Vec<String> {
    vec!["onlyfans".to_string(), "fansly".to_string()]
}

fn default_log_level() -> String { "info".to_string() }
fn default_log_file() -> String { "logs/repost-guard.log".to_string() }

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MINIMAL: &str = r#"
[source]
collection = "pics"
destination = "u_pics_repost_bot"
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, MINIMAL).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.source.collection, "pics");
        assert_eq!(config.pipeline.max_concurrent_jobs, 2);
        assert_eq!(config.pipeline.idle_interval(), Duration::from_secs(90));
        assert_eq!(config.pipeline.quiet_interval(), Duration::from_secs(300));
        assert_eq!(config.pipeline.active_interval(), Duration::from_secs(30));
        assert_eq!(config.storage.processed_ttl, 48 * 3600);
        assert_eq!(config.classifier.markers, vec!["onlyfans", "fansly"]);
    }

    #[test]
    fn test_save_and_reload() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");

        let mut config = Config::default();
        config.source.collection = "pics".to_string();
        config.source.destination = "u_bot".to_string();
        config.pipeline.max_concurrent_jobs = 4;
        config.save(&path).unwrap();

        let reloaded = Config::load(&path).unwrap();
        assert_eq!(reloaded.pipeline.max_concurrent_jobs, 4);
        assert_eq!(reloaded.source.destination, "u_bot");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        assert!(config.validate().is_ok());

        config.pipeline.max_concurrent_jobs = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        config.pipeline.max_concurrent_jobs = 2;

        config.source.api_url = "not a url".to_string();
        assert!(config.validate().is_err());
        config.source.api_url = default_api_url();

        config.classifier.markers = vec!["  ".to_string()];
        assert!(config.validate().is_err());
        config.classifier.markers = default_markers();

        config.source.collection.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_not_found() {
        assert!(matches!(
            Config::load("/nonexistent/config.toml"),
            Err(Error::NotFound(_))
        ));
    }
}
