//! ==============================================================================
//! config.rs - Device Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `sensorbox.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - WifiNetwork: ordered (ssid, passphrase) preference list.
//!     - SensorWiring: which cable label is wired to which ROM code.
//!     - RemoteConfig: where sensor metadata comes from and where records go.
//!     - TimeConfig: NTP server and timeout.
//!     - HardwareConfig: sysfs roots, watchdog node, GPIO pins.
//!
//! the whole value is handed to the bring-up sequencer at construction,
//! nothing in the crate reads configuration from globals.
//!
//! ==============================================================================

use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::RomCode;

/// Environment variable consulted when `remote.token` is empty.
pub const TOKEN_ENV_VAR: &str = "SENSORBOX_TOKEN";

/// Root configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct DeviceConfig {
    #[serde(default)]
    pub wifi: Vec<WifiNetwork>,
    pub sensors: Vec<SensorWiring>,
    pub remote: RemoteConfig,
    #[serde(default)]
    pub time: TimeConfig,
    #[serde(default)]
    pub hardware: HardwareConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct WifiNetwork {
    pub ssid: String,
    pub passphrase: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct SensorWiring {
    pub label: String,
    pub address: RomCode,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RemoteConfig {
    pub config_url: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    pub owner: String,
    pub repo: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TimeConfig {
    #[serde(default = "default_ntp_server")]
    pub server: String,
    #[serde(default = "default_ntp_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HardwareConfig {
    #[serde(default = "default_one_wire_root")]
    pub one_wire_root: PathBuf,
    #[serde(default = "default_watchdog_device")]
    pub watchdog_device: PathBuf,
    /// BCM pin of the status LED (hardware feature only).
    #[serde(default)]
    pub status_led_pin: Option<u8>,
    /// BCM pin of the developer jumper, pulled up, jumpered to GND (hardware feature only).
    #[serde(default)]
    pub dev_jumper_pin: Option<u8>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
}

fn default_api_base() -> String {
    "https://api.github.com".to_string()
}

fn default_branch() -> String {
    "gh-pages".to_string()
}

fn default_http_timeout_secs() -> u64 {
    5
}

fn default_ntp_server() -> String {
    "pool.ntp.org".to_string()
}

fn default_ntp_timeout_ms() -> u64 {
    3_000
}

fn default_one_wire_root() -> PathBuf {
    PathBuf::from("/sys/bus/w1/devices")
}

fn default_watchdog_device() -> PathBuf {
    PathBuf::from("/dev/watchdog")
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self { server: default_ntp_server(), timeout_ms: default_ntp_timeout_ms() }
    }
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            one_wire_root: default_one_wire_root(),
            watchdog_device: default_watchdog_device(),
            status_led_pin: None,
            dev_jumper_pin: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

impl TimeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl RemoteConfig {
    /// Configured token, or the environment fallback.
    pub fn resolved_token(&self) -> String {
        if !self.token.is_empty() {
            return self.token.clone();
        }
        std::env::var(TOKEN_ENV_VAR).unwrap_or_default()
    }

    /// Contents API url for a record path.
    pub fn contents_url(&self, path: &str) -> String {
        format!(
            "{}/repos/{}/{}/contents/{}",
            self.api_base.trim_end_matches('/'),
            self.owner,
            self.repo,
            path
        )
    }
}

impl DeviceConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("Failed to read config file: {}", e))?;

        Self::parse(&content)
    }

    /// Parse and validate a TOML document
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: DeviceConfig = toml::from_str(content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Load with default fallback
    pub fn load_or_default() -> Self {
        let paths = [
            PathBuf::from("config").join("sensorbox.toml"),
            PathBuf::from("..").join("config").join("sensorbox.toml"),
        ];

        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => {
                        println!("[CONFIG] Loaded from {}", path.display());
                        return config;
                    }
                    Err(e) => {
                        eprintln!("[CONFIG] Failed to load {}: {}", path.display(), e);
                    }
                }
            }
        }

        println!("[CONFIG] No config file found - using defaults");
        Self::default()
    }

    /// Reject wiring tables the bring-up sequencer cannot work with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sensors.is_empty() {
            anyhow::bail!("at least one [[sensors]] entry is required");
        }
        let mut labels = HashSet::new();
        let mut addresses = HashSet::new();
        for wiring in &self.sensors {
            if !labels.insert(wiring.label.as_str()) {
                anyhow::bail!("duplicate sensor label {}", wiring.label);
            }
            if !addresses.insert(wiring.address) {
                anyhow::bail!("duplicate sensor address {}", wiring.address);
            }
        }
        if self.wifi.iter().any(|n| n.ssid.is_empty()) {
            anyhow::bail!("wifi entries need a non-empty ssid");
        }
        Ok(())
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        println!("┌─────────────────────────────────────────┐");
        println!("│          SENSORBOX CONFIGURATION        │");
        println!("├─────────────────────────────────────────┤");
        println!("│ Sensors: {}", self.sensors.len());
        for wiring in &self.sensors {
            println!("│   {} -> {}", wiring.label, wiring.address);
        }
        println!("│ Wi-Fi networks: {}", self.wifi.len());
        println!("│ Store: {}/{} ({})", self.remote.owner, self.remote.repo, self.remote.branch);
        println!("│ NTP: {}", self.time.server);
        println!("│ Log Level: {}", self.logging.level);
        println!("└─────────────────────────────────────────┘");
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            wifi: Vec::new(),
            sensors: vec![
                SensorWiring { label: "1".to_string(), address: RomCode::new([0x28, 0, 0, 0, 0, 0, 0, 0x01]) },
                SensorWiring { label: "2".to_string(), address: RomCode::new([0x28, 0, 0, 0, 0, 0, 0, 0x02]) },
            ],
            remote: RemoteConfig {
                config_url: "http://localhost/_data/config.json".to_string(),
                api_base: default_api_base(),
                owner: "example".to_string(),
                repo: "TempSensors".to_string(),
                branch: default_branch(),
                token: String::new(),
                http_timeout_secs: default_http_timeout_secs(),
            },
            time: TimeConfig::default(),
            hardware: HardwareConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
