use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use volumed_core::{GatewayTimeouts, MonitorConfig, Result, VolumeError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    pub database: DatabaseConfig,
    pub provider: ProviderConfig,
    #[serde(default)]
    pub device_monitor: DeviceMonitorConfig,
    #[serde(default)]
    pub nbd: NbdConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceMonitorConfig {
    #[serde(default = "default_scan_dir")]
    pub scan_dir: PathBuf,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_debounce_scans")]
    pub debounce_scans: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NbdConfig {
    #[serde(default = "default_conf_dir")]
    pub conf_dir: PathBuf,
    #[serde(default = "default_pidfile")]
    pub pidfile: PathBuf,
    #[serde(default = "default_nbd_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_create_secs")]
    pub create_secs: u64,
    #[serde(default = "default_attach_secs")]
    pub attach_secs: u64,
    #[serde(default = "default_detach_secs")]
    pub detach_secs: u64,
    #[serde(default = "default_delete_secs")]
    pub delete_secs: u64,
    #[serde(default = "default_job_poll_secs")]
    pub job_poll_secs: u64,
    /// Longer than attach_secs: the provider can report success with the
    /// device still settling on the bus.
    #[serde(default = "default_correlation_secs")]
    pub correlation_secs: u64,
}

fn default_scan_dir() -> PathBuf {
    PathBuf::from("/sys/block")
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_debounce_scans() -> u32 {
    2
}

fn default_conf_dir() -> PathBuf {
    PathBuf::from("/etc/nbd/conf.d")
}

fn default_pidfile() -> PathBuf {
    PathBuf::from("/run/nbd-server.pid")
}

fn default_nbd_port() -> u16 {
    volumed_core::NBD_PORT
}

fn default_create_secs() -> u64 {
    600
}

fn default_attach_secs() -> u64 {
    120
}

fn default_detach_secs() -> u64 {
    120
}

fn default_delete_secs() -> u64 {
    300
}

fn default_job_poll_secs() -> u64 {
    2
}

fn default_correlation_secs() -> u64 {
    180
}

impl Default for DeviceMonitorConfig {
    fn default() -> Self {
        Self {
            scan_dir: default_scan_dir(),
            poll_interval_ms: default_poll_interval_ms(),
            debounce_scans: default_debounce_scans(),
        }
    }
}

impl Default for NbdConfig {
    fn default() -> Self {
        Self {
            conf_dir: default_conf_dir(),
            pidfile: default_pidfile(),
            port: default_nbd_port(),
        }
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            create_secs: default_create_secs(),
            attach_secs: default_attach_secs(),
            detach_secs: default_detach_secs(),
            delete_secs: default_delete_secs(),
            job_poll_secs: default_job_poll_secs(),
            correlation_secs: default_correlation_secs(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("VOLUMED").separator("__"))
            .build()
            .map_err(|e| VolumeError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| VolumeError::Config(e.to_string()))?;

        Ok(config)
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            scan_dir: self.device_monitor.scan_dir.clone(),
            poll_interval: Duration::from_millis(self.device_monitor.poll_interval_ms),
            debounce_scans: self.device_monitor.debounce_scans,
        }
    }

    pub fn gateway_timeouts(&self) -> GatewayTimeouts {
        GatewayTimeouts {
            create: Duration::from_secs(self.timeouts.create_secs),
            attach: Duration::from_secs(self.timeouts.attach_secs),
            detach: Duration::from_secs(self.timeouts.detach_secs),
            delete: Duration::from_secs(self.timeouts.delete_secs),
            poll_interval: Duration::from_secs(self.timeouts.job_poll_secs),
        }
    }

    pub fn correlation_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.correlation_secs)
    }
}
