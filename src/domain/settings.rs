use crate::bridge::BridgeConfig;
use crate::domain::backoff::BackoffPolicy;
use crate::domain::buffer::DEFAULT_CAPACITY;
use crate::domain::models::Credentials;
use crate::infrastructure::bluetooth::connection::ConnectionConfig;
use crate::infrastructure::bluetooth::protocol::{self, AxisMapping};
use crate::infrastructure::cloud::relay::RelayConfig;
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Where and how the bridge logs. Missing keys take their default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// `EnvFilter` directive, overridden by `RUST_LOG`
    pub level: String,
    pub file_logging_enabled: bool,
    pub console_logging_enabled: bool,
    pub log_dir: String,
    pub file_name_prefix: String,
    pub show_file_line: bool,
    pub show_thread_ids: bool,
    pub show_target: bool,
    /// Console only; the log file is always plain
    pub ansi_colors: bool,
    /// See [`crate::infrastructure::logging::parse_rotation`]
    pub rotation: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_logging_enabled: true,
            console_logging_enabled: true,
            log_dir: "logs".to_string(),
            file_name_prefix: "bracelet_bridge".to_string(),
            show_file_line: true,
            show_thread_ids: false,
            show_target: true,
            ansi_colors: true,
            rotation: "daily".to_string(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Bracelet identification and frame handling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    #[serde(default = "default_advertised_name")]
    pub advertised_name: String,
    #[serde(default = "default_service_uuid")]
    pub service_uuid: Uuid,
    #[serde(default = "default_notify_uuid")]
    pub notify_char_uuid: Uuid,
    #[serde(default = "default_control_uuid")]
    pub control_char_uuid: Uuid,
    #[serde(default = "default_axis_scale")]
    pub axis_scale: f32,
    #[serde(default)]
    pub axis_offset: f32,
    #[serde(default = "default_max_command_len")]
    pub max_command_len: usize,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            advertised_name: default_advertised_name(),
            service_uuid: default_service_uuid(),
            notify_char_uuid: default_notify_uuid(),
            control_char_uuid: default_control_uuid(),
            axis_scale: default_axis_scale(),
            axis_offset: 0.0,
            max_command_len: default_max_command_len(),
        }
    }
}

fn default_advertised_name() -> String {
    protocol::DEVICE_NAME.to_string()
}
fn default_service_uuid() -> Uuid {
    protocol::SERVICE_UUID
}
fn default_notify_uuid() -> Uuid {
    protocol::NOTIFY_CHAR_UUID
}
fn default_control_uuid() -> Uuid {
    protocol::CONTROL_CHAR_UUID
}
fn default_axis_scale() -> f32 {
    1.0
}
fn default_max_command_len() -> usize {
    protocol::MAX_COMMAND_LEN
}

/// Broker endpoint and device identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudSettings {
    #[serde(default)]
    pub broker_host: String,
    #[serde(default = "default_broker_port")]
    pub broker_port: u16,
    #[serde(default = "default_true")]
    pub use_tls: bool,
    #[serde(default)]
    pub product_id: String,
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub device_secret: String,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

impl Default for CloudSettings {
    fn default() -> Self {
        Self {
            broker_host: String::new(),
            broker_port: default_broker_port(),
            use_tls: true,
            product_id: String::new(),
            device_name: String::new(),
            device_secret: String::new(),
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

fn default_broker_port() -> u16 {
    8883
}
fn default_keep_alive_secs() -> u64 {
    60
}

/// Retry and timeout tuning, all in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingSettings {
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_scan_window_ms")]
    pub scan_window_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub broker_connect_timeout_ms: u64,
    #[serde(default = "default_subscribe_timeout_ms")]
    pub subscribe_timeout_ms: u64,
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            scan_window_ms: default_scan_window_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            discovery_timeout_ms: default_discovery_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            broker_connect_timeout_ms: default_connect_timeout_ms(),
            subscribe_timeout_ms: default_subscribe_timeout_ms(),
            publish_timeout_ms: default_publish_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

fn default_backoff_initial_ms() -> u64 {
    1000
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_scan_window_ms() -> u64 {
    10_000
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_discovery_timeout_ms() -> u64 {
    10_000
}
fn default_write_timeout_ms() -> u64 {
    2000
}
fn default_subscribe_timeout_ms() -> u64 {
    5000
}
fn default_publish_timeout_ms() -> u64 {
    2000
}
fn default_shutdown_timeout_ms() -> u64 {
    3000
}
fn default_buffer_capacity() -> usize {
    DEFAULT_CAPACITY
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,

    #[serde(default)]
    pub device: DeviceSettings,

    #[serde(default)]
    pub cloud: CloudSettings,

    #[serde(default)]
    pub timing: TimingSettings,

    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            device: DeviceSettings::default(),
            cloud: CloudSettings::default(),
            timing: TimingSettings::default(),
            buffer_capacity: default_buffer_capacity(),
        }
    }
}

impl Settings {
    /// Resolve the session credentials, rejecting an incomplete cloud section.
    pub fn credentials(&self) -> anyhow::Result<Credentials> {
        let cloud = &self.cloud;
        let required = [
            ("cloud.broker_host", &cloud.broker_host),
            ("cloud.product_id", &cloud.product_id),
            ("cloud.device_name", &cloud.device_name),
            ("cloud.device_secret", &cloud.device_secret),
            ("device.advertised_name", &self.device.advertised_name),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                bail!("{name} must be set");
            }
        }
        if cloud.product_id.contains(['/', ';']) || cloud.device_name.contains(['/', ';']) {
            bail!("cloud.product_id and cloud.device_name must not contain '/' or ';'");
        }

        Ok(Credentials {
            broker_host: cloud.broker_host.clone(),
            broker_port: cloud.broker_port,
            use_tls: cloud.use_tls,
            product_id: cloud.product_id.clone(),
            device_name: cloud.device_name.clone(),
            device_secret: cloud.device_secret.clone(),
            advertised_name: self.device.advertised_name.clone(),
            service_uuid: self.device.service_uuid,
            notify_char_uuid: self.device.notify_char_uuid,
            control_char_uuid: self.device.control_char_uuid,
        })
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        let timing = &self.timing;
        let ms = Duration::from_millis;
        let backoff = BackoffPolicy {
            initial: ms(timing.backoff_initial_ms.max(1)),
            max: ms(timing.backoff_max_ms.max(timing.backoff_initial_ms).max(1)),
        };
        let max_command_len = self.device.max_command_len.max(1);

        BridgeConfig {
            buffer_capacity: self.buffer_capacity.max(1),
            device: ConnectionConfig {
                scan_window: ms(timing.scan_window_ms),
                connect_timeout: ms(timing.connect_timeout_ms),
                discovery_timeout: ms(timing.discovery_timeout_ms),
                write_timeout: ms(timing.write_timeout_ms),
                shutdown_timeout: ms(timing.shutdown_timeout_ms),
                backoff,
                mapping: AxisMapping {
                    scale: self.device.axis_scale,
                    offset: self.device.axis_offset,
                },
                max_command_len,
                ..ConnectionConfig::default()
            },
            relay: RelayConfig {
                // rumqttc rejects keep-alives under one second
                keep_alive: Duration::from_secs(self.cloud.keep_alive_secs.max(1)),
                connect_timeout: ms(timing.broker_connect_timeout_ms),
                subscribe_timeout: ms(timing.subscribe_timeout_ms),
                publish_timeout: ms(timing.publish_timeout_ms),
                shutdown_timeout: ms(timing.shutdown_timeout_ms),
                backoff,
                max_command_len,
                ..RelayConfig::default()
            },
            ..BridgeConfig::default()
        }
    }
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::from_path(settings_path))
    }

    /// Load from `path`, falling back to defaults when missing or unreadable.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let settings_path = path.into();
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!("Using default settings ({:#})", e);
                Settings::default()
            }
        };
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BraceletBridge");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let settings = serde_json::from_str(&contents)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}
