use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

const GIB: u64 = 1024 * 1024 * 1024;
const DEFAULT_CONFIG_FILE: &str = "scanwarden.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_url: String,
    pub poll_interval_secs: u64,
    pub poll_jitter_ms: u64,
    pub scan_timeout_secs: u64,
    pub stop_grace_secs: u64,
    pub memory_limit_bytes: u64,
    /// Fraction of one CPU core the scanner may use.
    pub cpu_share: f64,
    pub scanner_image: String,
    pub artifacts_dir: PathBuf,
    pub docker_bin: String,
    pub network: String,
    pub request_timeout_secs: u64,
    pub max_record_bytes: usize,
    pub scope_allowlist: Vec<String>,
}

impl AppConfig {
    /// Reads the JSON file at `path`, or `scanwarden.json` when it exists, then applies
    /// `SW_*` environment overrides and validates the result.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        // Only the default file is optional; an explicitly named one must be readable.
        let raw = match path {
            Some(path) => Some(
                fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
            ),
            None => fs::read_to_string(DEFAULT_CONFIG_FILE).ok(),
        };
        let shown = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        let file_cfg: Option<AppConfig> = raw
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .with_context(|| format!("failed to parse {}", shown.display()))?;

        let mut cfg = file_cfg.unwrap_or_default();
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env(&mut self) -> anyhow::Result<()> {
        if let Ok(v) = env::var("SW_DATABASE_URL") {
            self.database_url = v;
        }
        if let Some(v) = env_parse("SW_POLL_INTERVAL_SECS")? {
            self.poll_interval_secs = v;
        }
        if let Some(v) = env_parse("SW_POLL_JITTER_MS")? {
            self.poll_jitter_ms = v;
        }
        if let Some(v) = env_parse("SW_SCAN_TIMEOUT_SECS")? {
            self.scan_timeout_secs = v;
        }
        if let Some(v) = env_parse("SW_STOP_GRACE_SECS")? {
            self.stop_grace_secs = v;
        }
        if let Some(v) = env_parse("SW_MEMORY_LIMIT_BYTES")? {
            self.memory_limit_bytes = v;
        }
        if let Some(v) = env_parse("SW_CPU_SHARE")? {
            self.cpu_share = v;
        }
        if let Ok(v) = env::var("SW_SCANNER_IMAGE") {
            self.scanner_image = v;
        }
        if let Ok(v) = env::var("SW_ARTIFACTS_DIR") {
            self.artifacts_dir = PathBuf::from(v);
        }
        if let Ok(v) = env::var("SW_DOCKER_BIN") {
            self.docker_bin = v;
        }
        if let Ok(v) = env::var("SW_NETWORK") {
            self.network = v;
        }
        if let Some(v) = env_parse("SW_REQUEST_TIMEOUT_SECS")? {
            self.request_timeout_secs = v;
        }
        if let Some(v) = env_parse("SW_MAX_RECORD_BYTES")? {
            self.max_record_bytes = v;
        }
        if let Ok(v) = env::var("SW_SCOPE_ALLOWLIST") {
            self.scope_allowlist = split_list(&v);
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poll_interval_secs == 0 {
            bail!("poll_interval_secs must be greater than zero");
        }
        if self.scan_timeout_secs == 0 {
            bail!("scan_timeout_secs must be greater than zero");
        }
        if self.cpu_share.is_nan() || self.cpu_share <= 0.0 {
            bail!("cpu_share must be positive, got {}", self.cpu_share);
        }
        if self.memory_limit_bytes < 64 * 1024 * 1024 {
            bail!("memory_limit_bytes must be at least 64 MiB");
        }
        if self.scanner_image.trim().is_empty() {
            bail!("scanner_image must not be empty");
        }
        if self.max_record_bytes == 0 {
            bail!("max_record_bytes must be greater than zero");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn poll_jitter(&self) -> Duration {
        Duration::from_millis(self.poll_jitter_ms)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://scanwarden.db".to_string(),
            poll_interval_secs: 5,
            poll_jitter_ms: 250,
            scan_timeout_secs: 30 * 60,
            stop_grace_secs: 10,
            memory_limit_bytes: 2 * GIB,
            cpu_share: 0.5,
            scanner_image: "projectdiscovery/nuclei:latest".to_string(),
            artifacts_dir: PathBuf::from("./artifacts"),
            docker_bin: "docker".to_string(),
            network: "bridge".to_string(),
            request_timeout_secs: 30,
            max_record_bytes: 1024 * 1024,
            scope_allowlist: Vec::new(),
        }
    }
}

fn env_parse<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid value for {key}: {e}")),
        Err(_) => Ok(None),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_policy() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.poll_interval(), Duration::from_secs(5));
        assert_eq!(cfg.scan_timeout(), Duration::from_secs(1800));
        assert_eq!(cfg.memory_limit_bytes, 2 * GIB);
        assert_eq!(cfg.cpu_share, 0.5);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let cfg: AppConfig =
            serde_json::from_str(r#"{"scan_timeout_secs": 60, "network": "scan-net"}"#)
                .expect("config should parse");
        assert_eq!(cfg.scan_timeout_secs, 60);
        assert_eq!(cfg.network, "scan-net");
        assert_eq!(cfg.poll_interval_secs, 5);
    }

    #[test]
    fn validate_rejects_nonsense_limits() {
        let mut cfg = AppConfig::default();
        cfg.cpu_share = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.scan_timeout_secs = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.memory_limit_bytes = 1024;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.scanner_image = "  ".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn load_reads_the_given_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.json");
        fs::write(&path, r#"{"scanner_image": "nuclei:pinned", "stop_grace_secs": 3}"#).unwrap();
        let cfg = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.scanner_image, "nuclei:pinned");
        assert_eq!(cfg.stop_grace(), Duration::from_secs(3));
    }

    #[test]
    fn load_rejects_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(AppConfig::load(Some(&path)).is_err());
    }

    #[test]
    fn load_fails_when_the_named_file_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = AppConfig::load(Some(&dir.path().join("absent.json"))).unwrap_err();
        assert!(err.to_string().contains("absent.json"), "{err}");
    }

    #[test]
    fn allowlist_splitting_drops_blanks() {
        assert_eq!(
            split_list("10.0.0.0/8, example.com ,,"),
            vec!["10.0.0.0/8".to_string(), "example.com".to_string()]
        );
    }
}
