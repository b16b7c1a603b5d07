//! Configuration management for sdnroute.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::peermon::{Thresholds, DEFAULT_WINDOW_SIZE};

/// Environment variable enabling route cleanup on exit.
pub const ENV_CLEANUP_ON_EXIT: &str = "SDNROUTE_CLEANUP_ON_EXIT";
/// Environment variable marking the host as a VPN client (allows default routes).
pub const ENV_VPN_CLIENT: &str = "SDNROUTE_VPN_CLIENT";
/// Environment variable overriding the peer statistics window.
pub const ENV_PEERCHECK_WINDOW: &str = "SDNROUTE_PEERCHECK_WINDOW";
/// Environment variable overriding reroute thresholds, as `"<diff>,<ratio>"`.
pub const ENV_REROUTE_THRESHOLDS: &str = "SDNROUTE_REROUTE_THRESHOLDS";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Router configuration.
    #[serde(default)]
    pub router: RouterConfig,

    /// Probe configuration.
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config: {e}")))?;

        Ok(())
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        self.router.validate()?;
        self.probe.validate()?;

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(Error::InvalidConfig(format!(
                "Unknown log format: {}",
                self.logging.format
            )));
        }

        Ok(())
    }

    /// Get default config path.
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("net", "sdnroute", "sdnroute").map_or_else(
            || PathBuf::from("sdnroute.toml"),
            |dirs| dirs.config_dir().join("config.toml"),
        )
    }

    /// Create example configuration.
    pub fn example() -> Self {
        Self {
            router: RouterConfig {
                reroute_diff: 10.0,
                reroute_ratio: 1.1,
                cleanup_on_exit: true,
                ..Default::default()
            },
            probe: ProbeConfig {
                interval: Duration::from_secs(10),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides using `lookup` as the environment.
    ///
    /// Unparsable values are ignored with a warning.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_CLEANUP_ON_EXIT) {
            match parse_bool(&value) {
                Some(flag) => self.router.cleanup_on_exit = flag,
                None => tracing::warn!(key = ENV_CLEANUP_ON_EXIT, %value, "Ignoring invalid override"),
            }
        }

        if let Some(value) = lookup(ENV_VPN_CLIENT) {
            match parse_bool(&value) {
                Some(flag) => self.router.vpn_client = flag,
                None => tracing::warn!(key = ENV_VPN_CLIENT, %value, "Ignoring invalid override"),
            }
        }

        if let Some(value) = lookup(ENV_PEERCHECK_WINDOW) {
            match value.trim().parse::<usize>() {
                Ok(size) if size > 0 => self.router.window_size = size,
                _ => tracing::warn!(key = ENV_PEERCHECK_WINDOW, %value, "Ignoring invalid override"),
            }
        }

        if let Some(value) = lookup(ENV_REROUTE_THRESHOLDS) {
            match parse_thresholds(&value) {
                Some((diff, ratio)) => {
                    self.router.reroute_diff = diff;
                    self.router.reroute_ratio = ratio;
                }
                None => tracing::warn!(key = ENV_REROUTE_THRESHOLDS, %value, "Ignoring invalid override"),
            }
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "yes" | "on" => Some(true),
        "0" | "f" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse `"<diff>,<ratio>"`.
fn parse_thresholds(value: &str) -> Option<(f32, f32)> {
    let (diff, ratio) = value.split_once(',')?;
    let diff: f32 = diff.trim().parse().ok()?;
    let ratio: f32 = ratio.trim().parse().ok()?;
    (diff >= 0.0 && ratio >= 0.0).then_some((diff, ratio))
}

/// Router configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Probe rounds kept per peer node.
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Absolute latency margin (ms) a better path must win by.
    #[serde(default)]
    pub reroute_diff: f32,

    /// Relative latency margin a better path must win by.
    #[serde(default)]
    pub reroute_ratio: f32,

    /// Withdraw installed routes on shutdown.
    #[serde(default)]
    pub cleanup_on_exit: bool,

    /// Host sends all traffic through the overlay (allows default routes).
    #[serde(default)]
    pub vpn_client: bool,
}

fn default_window_size() -> usize {
    DEFAULT_WINDOW_SIZE
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            reroute_diff: 0.0,
            reroute_ratio: 0.0,
            cleanup_on_exit: false,
            vpn_client: false,
        }
    }
}

impl RouterConfig {
    /// Reroute thresholds handed to every peer monitor.
    pub fn thresholds(&self) -> Thresholds {
        Thresholds::new(self.reroute_diff, self.reroute_ratio)
    }

    fn validate(&self) -> Result<()> {
        if self.window_size == 0 {
            return Err(Error::InvalidConfig("router.window_size must be positive".into()));
        }
        if !(self.reroute_diff >= 0.0 && self.reroute_ratio >= 0.0) {
            return Err(Error::InvalidConfig(
                "router reroute thresholds must not be negative".into(),
            ));
        }
        Ok(())
    }
}

/// Probe configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Time between probe rounds.
    #[serde(default = "default_probe_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Time limit for one interface's probes.
    #[serde(default = "default_probe_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Time between route commits.
    #[serde(default = "default_apply_interval", with = "humantime_serde")]
    pub apply_interval: Duration,

    /// Probes sent to every target per round.
    #[serde(default = "default_probe_count")]
    pub count: u32,
}

fn default_probe_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_probe_timeout() -> Duration {
    Duration::from_secs(3)
}
fn default_apply_interval() -> Duration {
    Duration::from_secs(10)
}
fn default_probe_count() -> u32 {
    3
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval: default_probe_interval(),
            timeout: default_probe_timeout(),
            apply_interval: default_apply_interval(),
            count: default_probe_count(),
        }
    }
}

impl ProbeConfig {
    fn validate(&self) -> Result<()> {
        if self.interval.is_zero() || self.apply_interval.is_zero() {
            return Err(Error::InvalidConfig("probe intervals must be positive".into()));
        }
        if self.timeout.is_zero() {
            return Err(Error::InvalidConfig("probe.timeout must be positive".into()));
        }
        if self.count == 0 {
            return Err(Error::InvalidConfig("probe.count must be positive".into()));
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text or json).
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable colored output.
    #[serde(default = "default_color")]
    pub color: bool,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}
fn default_color() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            color: default_color(),
        }
    }
}

/// Initialize logging.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    } else {
        subscriber
            .with(fmt::layer().with_ansi(config.color))
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    }

    Ok(())
}
