//! Configuration loader and validator for the scrape tracker service.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub server: Server,
    #[serde(default)]
    pub runs: Runs,
    pub worker: Worker,
    pub generator: Generator,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Server {
    pub bind: String,
}

/// Run execution and progress cache tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Runs {
    /// Upper bound on items a test run may scrape.
    pub test_item_limit: u32,
    /// How many of the latest progress messages a status poll returns.
    pub recent_messages: u32,
    pub cache_sweep_interval_secs: u64,
    pub cache_max_age_secs: u64,
}

impl Default for Runs {
    fn default() -> Self {
        Self {
            test_item_limit: 200,
            recent_messages: 5,
            cache_sweep_interval_secs: 30 * 60,
            cache_max_age_secs: 2 * 60 * 60,
        }
    }
}

/// External script worker endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Worker {
    pub url: String,
    pub timeout_secs: u64,
}

/// External AI generator endpoint used by authoring sessions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Generator {
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// SQLite URL used when `DATABASE_URL` is not set.
    pub fn default_database_url(&self) -> String {
        format!("sqlite://{}/scrape-tracker.db", self.app.data_dir.trim_end_matches('/'))
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.server.bind.trim().is_empty() {
        return Err(ConfigError::Invalid("server.bind must be non-empty"));
    }

    if cfg.runs.test_item_limit == 0 {
        return Err(ConfigError::Invalid("runs.test_item_limit must be > 0"));
    }
    if cfg.runs.recent_messages == 0 {
        return Err(ConfigError::Invalid("runs.recent_messages must be > 0"));
    }
    if cfg.runs.cache_sweep_interval_secs == 0 {
        return Err(ConfigError::Invalid("runs.cache_sweep_interval_secs must be > 0"));
    }

    if cfg.worker.url.trim().is_empty() {
        return Err(ConfigError::Invalid("worker.url must be non-empty"));
    }
    if cfg.worker.timeout_secs == 0 {
        return Err(ConfigError::Invalid("worker.timeout_secs must be > 0"));
    }

    if cfg.generator.url.trim().is_empty() {
        return Err(ConfigError::Invalid("generator.url must be non-empty"));
    }
    if cfg.generator.timeout_secs == 0 {
        return Err(ConfigError::Invalid("generator.timeout_secs must be > 0"));
    }

    Ok(())
}

/// Returns an example YAML configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

server:
  bind: "127.0.0.1:8080"

runs:
  test_item_limit: 200
  recent_messages: 5
  cache_sweep_interval_secs: 1800
  cache_max_age_secs: 7200

worker:
  url: "http://127.0.0.1:9000/execute"
  timeout_secs: 600

generator:
  url: "http://127.0.0.1:9100/generate"
  api_key: "YOUR_GENERATOR_API_KEY"
  timeout_secs: 120
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.runs, Runs::default());
    }

    #[test]
    fn runs_section_is_optional() {
        let yaml = example().replace(
            "runs:\n  test_item_limit: 200\n  recent_messages: 5\n  cache_sweep_interval_secs: 1800\n  cache_max_age_secs: 7200\n",
            "",
        );
        let cfg: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(cfg.runs.recent_messages, 5);
        assert_eq!(cfg.runs.test_item_limit, 200);
    }

    #[test]
    fn invalid_worker_url() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.worker.url = "  ".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("worker.url")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_run_limits() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.runs.recent_messages = 0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("recent_messages")),
            _ => panic!("wrong error"),
        }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.runs.test_item_limit = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.generator.timeout_secs = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
        assert!(cfg.default_database_url().ends_with("/data/scrape-tracker.db"));
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.server.bind, "127.0.0.1:8080");
        assert_eq!(cfg.generator.api_key.as_deref(), Some("YOUR_GENERATOR_API_KEY"));
    }
}
