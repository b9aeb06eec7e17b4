use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::trace;

/// Supported satellites, identified by their configuration alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Satellite {
    #[serde(rename = "G18")]
    Galaxy18,
    #[serde(rename = "E113")]
    Eutelsat113,
    #[serde(rename = "T11N AFR")]
    Telstar11nAfrica,
    #[serde(rename = "T11N EU")]
    Telstar11nEurope,
    #[serde(rename = "T18V C")]
    Telstar18vC,
    #[serde(rename = "T18V Ku")]
    Telstar18vKu,
}

impl Satellite {
    pub fn alias(&self) -> &'static str {
        match self {
            Satellite::Galaxy18 => "G18",
            Satellite::Eutelsat113 => "E113",
            Satellite::Telstar11nAfrica => "T11N AFR",
            Satellite::Telstar11nEurope => "T11N EU",
            Satellite::Telstar18vC => "T18V C",
            Satellite::Telstar18vKu => "T18V Ku",
        }
    }
}

impl std::fmt::Display for Satellite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.alias())
    }
}

/// Receiver setup, one variant per demodulator kind.
///
/// The orchestrator selects the matching sampler adapter at startup and never
/// switches afterwards.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ReceiverConfig {
    /// Network-attached standalone demodulator controlled over SNMP.
    Standalone {
        /// Demodulator management address
        address: String,

        /// SNMP community string
        #[serde(default = "default_snmp_community")]
        community: String,

        /// SNMP request timeout in seconds
        #[serde(default = "default_snmp_timeout")]
        timeout: u64,
    },

    /// USB DVB adapter driven by an external zap tool.
    Usb {
        /// DVB adapter number (/dev/dvb/adapterN)
        adapter: u32,

        /// Frontend number within the adapter
        #[serde(default)]
        frontend: u32,

        /// Path to the channels configuration file passed to the zap tool
        channel_conf: PathBuf,
    },

    /// Software-defined receiver reporting status over a local pipe.
    Sdr {
        /// Path to the FIFO written by the demodulation graph
        pipe: PathBuf,
    },

    /// Sat-IP antenna polled over HTTP.
    #[serde(rename = "sat-ip")]
    SatIp {
        /// Sat-IP server address
        address: String,

        /// Sat-IP server HTTP port
        #[serde(default = "default_satip_port")]
        port: u16,

        /// HTTP session username
        #[serde(default = "default_satip_user")]
        username: String,

        /// HTTP session password
        password: String,
    },
}

fn default_snmp_community() -> String {
    "public".to_string()
}

fn default_snmp_timeout() -> u64 {
    5
}

fn default_satip_port() -> u16 {
    8000
}

fn default_satip_user() -> String {
    "admin".to_string()
}

/// LNB setup. Recorded in the config file by the setup glue; the monitoring
/// core only passes it along.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct LnbConfig {
    pub model: Option<String>,
    pub lo_freq: Option<f64>,
    pub polarization: Option<String>,
}

/// Receiver configuration read from `config.json` in the config directory.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    pub satellite: Satellite,
    pub receiver: ReceiverConfig,
    pub lnb: Option<LnbConfig>,

    /// Network interface receiving the satellite traffic
    pub interface: Option<String>,
}

pub fn read_config_file(cfg_dir: &Path) -> anyhow::Result<Config> {
    let path = cfg_dir.join("config.json");
    let file_content = std::fs::read_to_string(&path)
        .map_err(|e| anyhow::anyhow!("could not read {}: {e}", path.display()))?;
    serde_json::from_str(&file_content)
        .map_err(|_| anyhow::anyhow!("Invalid configuration file provided!"))
        .inspect(|config| trace!("loaded config: {config:?}"))
}

/// Reporting destination and credentials source.
#[derive(Debug, Clone)]
pub struct ReportOptions {
    /// Report destination base URL
    pub dest: String,

    /// Whether `dest` is the receiver registry (signed reports and the
    /// registration handshake) rather than a general-purpose server.
    pub registry: bool,

    /// Hostname attached to unsigned reports
    pub hostname: Option<String>,

    /// Keyring passphrase; prompted for when absent
    pub passphrase: Option<String>,
}

/// Monitor runtime options, resolved from the CLI.
#[derive(Debug, Clone)]
pub struct MonitorOptions {
    pub log_file: bool,
    pub scrolling: bool,
    pub echo: bool,
    pub log_interval: Duration,
    pub utc: bool,
    pub server: bool,
    pub port: u16,
    pub report: Option<ReportOptions>,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            log_file: false,
            scrolling: false,
            echo: true,
            log_interval: Duration::from_secs(1),
            utc: true,
            server: false,
            port: default_monitor_port(),
            report: None,
        }
    }
}

pub fn default_monitor_port() -> u16 {
    9004
}

/// Everything a component needs to know about this receiver, passed
/// explicitly at construction.
#[derive(Debug, Clone)]
pub struct MonitorContext {
    pub cfg_dir: PathBuf,
    pub config: Config,
    pub options: MonitorOptions,
}

impl MonitorContext {
    pub fn new(cfg_dir: PathBuf, config: Config, options: MonitorOptions) -> Self {
        Self {
            cfg_dir,
            config,
            options,
        }
    }

    pub fn keyring_path(&self) -> PathBuf {
        self.cfg_dir.join("keyring").join("key.json")
    }

    pub fn inbox_dir(&self) -> PathBuf {
        self.cfg_dir.join("inbox")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.cfg_dir.join("logs")
    }
}
