//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::services::fingerprint::FingerprintVersion;
use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SiteConfig {
    /// Identifier stamped into session records
    #[serde(default = "default_site_id")]
    pub id: String,
}

fn default_site_id() -> String {
    "ble-presence".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PresenceConfig {
    /// Seconds without a sighting before a device is considered gone
    #[serde(default = "default_absence_timeout_secs")]
    pub absence_timeout_secs: u64,
    /// Interval of the absence sweep
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Skip tracking of the anonymous fingerprint bucket
    #[serde(default = "default_suppress_anonymous")]
    pub suppress_anonymous: bool,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            absence_timeout_secs: default_absence_timeout_secs(),
            sweep_interval_ms: default_sweep_interval_ms(),
            suppress_anonymous: default_suppress_anonymous(),
        }
    }
}

fn default_absence_timeout_secs() -> u64 {
    60
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

fn default_suppress_anonymous() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct FingerprintConfig {
    #[serde(default)]
    pub version: FingerprintVersion,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    /// File path for the presence history (JSONL format)
    #[serde(default = "default_history_file")]
    pub file: String,
    /// Days of sealed aggregates kept in memory
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { file: default_history_file(), retention_days: default_retention_days() }
    }
}

fn default_history_file() -> String {
    "presence.jsonl".to_string()
}

fn default_retention_days() -> u32 {
    35
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifyConfig {
    #[serde(default = "default_notify_enabled")]
    pub enabled: bool,
    #[serde(default = "default_notify_url")]
    pub url: String,
    /// Hard per-call timeout
    #[serde(default = "default_notify_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_notify_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_notify_queue_size")]
    pub queue_size: usize,
    /// Device names that never trigger a notification (case-insensitive)
    #[serde(default)]
    pub suppress_names: Vec<String>,
    /// Only notify for devices with a name or a known vendor
    #[serde(default = "default_require_identity")]
    pub require_identity: bool,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: default_notify_enabled(),
            url: default_notify_url(),
            timeout_ms: default_notify_timeout_ms(),
            max_in_flight: default_notify_max_in_flight(),
            queue_size: default_notify_queue_size(),
            suppress_names: Vec::new(),
            require_identity: default_require_identity(),
        }
    }
}

fn default_notify_enabled() -> bool {
    true
}

fn default_notify_url() -> String {
    "http://127.0.0.1:8123/api/webhook/ble_new_device".to_string()
}

fn default_notify_timeout_ms() -> u64 {
    3000
}

fn default_notify_max_in_flight() -> usize {
    8
}

fn default_notify_queue_size() -> usize {
    256
}

fn default_require_identity() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanConfig {
    /// Observation input: "-" for stdin, otherwise a JSONL file path
    #[serde(default = "default_scan_input")]
    pub input: String,
    #[serde(default = "default_scan_channel_size")]
    pub channel_size: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self { input: default_scan_input(), channel_size: default_scan_channel_size() }
    }
}

fn default_scan_input() -> String {
    "-".to_string()
}

fn default_scan_channel_size() -> usize {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval() }
    }
}

fn default_metrics_interval() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub fingerprint: FingerprintConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    absence_timeout_secs: u64,
    sweep_interval_ms: u64,
    suppress_anonymous: bool,
    fingerprint_version: FingerprintVersion,
    history_file: String,
    retention_days: u32,
    notify_enabled: bool,
    notify_url: String,
    notify_timeout_ms: u64,
    notify_max_in_flight: usize,
    notify_queue_size: usize,
    notify_suppress_names: Vec<String>,
    notify_require_identity: bool,
    scan_input: String,
    scan_channel_size: usize,
    metrics_interval_secs: u64,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        Self {
            site_id: toml_config.site.id,
            absence_timeout_secs: toml_config.presence.absence_timeout_secs,
            sweep_interval_ms: toml_config.presence.sweep_interval_ms,
            suppress_anonymous: toml_config.presence.suppress_anonymous,
            fingerprint_version: toml_config.fingerprint.version,
            history_file: toml_config.history.file,
            retention_days: toml_config.history.retention_days,
            notify_enabled: toml_config.notify.enabled,
            notify_url: toml_config.notify.url,
            notify_timeout_ms: toml_config.notify.timeout_ms,
            notify_max_in_flight: toml_config.notify.max_in_flight.max(1),
            notify_queue_size: toml_config.notify.queue_size.max(1),
            notify_suppress_names: toml_config
                .notify
                .suppress_names
                .into_iter()
                .map(|n| n.trim().to_lowercase())
                .collect(),
            notify_require_identity: toml_config.notify.require_identity,
            scan_input: toml_config.scan.input,
            scan_channel_size: toml_config.scan.channel_size.max(1),
            metrics_interval_secs: toml_config.metrics.interval_secs.max(1),
            config_file,
        }
    }

    /// Determine config file path: explicit `--config`, then the
    /// `CONFIG_FILE` environment variable, then the default
    pub fn resolve_config_path(explicit: Option<&str>) -> String {
        if let Some(path) = explicit {
            return path.to_string();
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self::from_toml(toml_config, path.display().to_string()))
    }

    /// Load configuration from a path, falling back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load(explicit: Option<&str>) -> Self {
        Self::load_from_path(&Self::resolve_config_path(explicit))
    }

    /// Whether a local name is on the notification suppress list
    pub fn is_name_suppressed(&self, name: Option<&str>) -> bool {
        let normalized = name.unwrap_or_default().trim().to_lowercase();
        !normalized.is_empty() && self.notify_suppress_names.iter().any(|n| *n == normalized)
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn absence_timeout(&self) -> Duration {
        Duration::from_secs(self.absence_timeout_secs)
    }

    pub fn absence_timeout_secs(&self) -> u64 {
        self.absence_timeout_secs
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(10))
    }

    pub fn suppress_anonymous(&self) -> bool {
        self.suppress_anonymous
    }

    pub fn fingerprint_version(&self) -> FingerprintVersion {
        self.fingerprint_version
    }

    pub fn history_file(&self) -> &str {
        &self.history_file
    }

    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }

    pub fn notify_enabled(&self) -> bool {
        self.notify_enabled
    }

    pub fn notify_url(&self) -> &str {
        &self.notify_url
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_millis(self.notify_timeout_ms)
    }

    pub fn notify_max_in_flight(&self) -> usize {
        self.notify_max_in_flight
    }

    pub fn notify_queue_size(&self) -> usize {
        self.notify_queue_size
    }

    pub fn notify_require_identity(&self) -> bool {
        self.notify_require_identity
    }

    pub fn scan_input(&self) -> &str {
        &self.scan_input
    }

    pub fn scan_channel_size(&self) -> usize {
        self.scan_channel_size
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    // Builders used by tests and embedding callers

    pub fn with_absence_timeout_secs(mut self, secs: u64) -> Self {
        self.absence_timeout_secs = secs;
        self
    }

    pub fn with_sweep_interval_ms(mut self, ms: u64) -> Self {
        self.sweep_interval_ms = ms;
        self
    }

    pub fn with_suppress_anonymous(mut self, suppress: bool) -> Self {
        self.suppress_anonymous = suppress;
        self
    }

    pub fn with_history_file(mut self, file: &str) -> Self {
        self.history_file = file.to_string();
        self
    }

    pub fn with_notify_url(mut self, url: &str) -> Self {
        self.notify_url = url.to_string();
        self
    }

    pub fn with_notify_timeout_ms(mut self, ms: u64) -> Self {
        self.notify_timeout_ms = ms;
        self
    }

    pub fn with_notify_require_identity(mut self, require: bool) -> Self {
        self.notify_require_identity = require;
        self
    }

    pub fn with_suppressed_names(mut self, names: &[&str]) -> Self {
        self.notify_suppress_names = names.iter().map(|n| n.trim().to_lowercase()).collect();
        self
    }
}
