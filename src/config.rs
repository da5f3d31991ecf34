//! Daemon configuration tree (spec §6).
//!
//! Loading this from disk is an external collaborator's job (the YAML
//! loader named in spec §1); this module only owns the typed, defaulted
//! shape the core consumes, plus a small JSON-based `load()` for the
//! bundled binaries, in the style of the teacher's `load_config()`.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_STEP_LIMIT: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_NTP_POLL_INTERVAL: Duration = Duration::from_secs(4);
pub const DEFAULT_NMEA_BAUD: u32 = 9600;
pub const DEFAULT_PTP_PRIORITY: u8 = 128;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub adjust_clock: bool,
    #[serde(default = "default_step_limit", with = "duration_string")]
    pub step_limit: Duration,
    #[serde(default)]
    pub primary_clocks: Vec<SourceConfig>,
    #[serde(default)]
    pub secondary_clocks: Vec<SourceConfig>,
    /// How long a stale-but-usable selected source is coasted on before the
    /// clock state is driven to FreeRunning (spec §4.6).
    #[serde(default = "default_holdover_timeout", with = "duration_string")]
    pub holdover_timeout: Duration,
}

fn default_step_limit() -> Duration {
    DEFAULT_STEP_LIMIT
}

fn default_holdover_timeout() -> Duration {
    Duration::from_secs(300)
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            adjust_clock: false,
            step_limit: DEFAULT_STEP_LIMIT,
            primary_clocks: vec![SourceConfig {
                protocol: ProtocolConfig::Mock,
                disable: false,
                monitor_only: false,
            }],
            secondary_clocks: Vec::new(),
            holdover_timeout: default_holdover_timeout(),
        }
    }
}

impl DaemonConfig {
    /// Reads and parses a config file. On any failure, logs a warning and
    /// returns the default config rather than failing the daemon outright —
    /// matches the teacher's `load_config()` fallback behavior.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(cfg) => cfg,
                Err(e) => {
                    log::warn!("failed to parse config at {}: {e}; using defaults", path.display());
                    DaemonConfig::default()
                }
            },
            Err(e) => {
                log::warn!("failed to read config at {}: {e}; using defaults", path.display());
                DaemonConfig::default()
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for src in self.primary_clocks.iter().chain(self.secondary_clocks.iter()) {
            src.protocol.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(flatten)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub disable: bool,
    #[serde(default)]
    pub monitor_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum ProtocolConfig {
    Ptp(PtpConfig),
    Ntp(NtpConfig),
    Pps(PpsConfig),
    Nmea(NmeaConfig),
    Phc(PhcConfig),
    Timecard(TimeCardConfig),
    OcpTimecard(TimeCardConfig),
    Mock,
}

impl ProtocolConfig {
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolConfig::Ptp(_) => "ptp",
            ProtocolConfig::Ntp(_) => "ntp",
            ProtocolConfig::Pps(_) => "pps",
            ProtocolConfig::Nmea(_) => "nmea",
            ProtocolConfig::Phc(_) => "phc",
            ProtocolConfig::Timecard(_) => "timecard",
            ProtocolConfig::OcpTimecard(_) => "ocp_timecard",
            ProtocolConfig::Mock => "mock",
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            ProtocolConfig::Ptp(c) => {
                if c.interface.is_empty() {
                    return Err(ConfigError::MissingField {
                        protocol: "ptp".into(),
                        field: "interface".into(),
                    });
                }
                Ok(())
            }
            ProtocolConfig::Ntp(c) => {
                if c.ip.is_empty() {
                    return Err(ConfigError::MissingField {
                        protocol: "ntp".into(),
                        field: "ip".into(),
                    });
                }
                Ok(())
            }
            ProtocolConfig::Pps(c) => {
                if c.device.is_none() && c.gpio_pin.is_none() {
                    return Err(ConfigError::MissingField {
                        protocol: "pps".into(),
                        field: "device or gpio_pin".into(),
                    });
                }
                Ok(())
            }
            ProtocolConfig::Nmea(c) => {
                if c.device.is_empty() {
                    return Err(ConfigError::MissingField {
                        protocol: "nmea".into(),
                        field: "device".into(),
                    });
                }
                Ok(())
            }
            ProtocolConfig::Phc(c) => {
                if c.device.is_none() && c.phc_index.is_none() && c.interface.is_none() {
                    return Err(ConfigError::MissingField {
                        protocol: "phc".into(),
                        field: "device, phc_index or interface".into(),
                    });
                }
                Ok(())
            }
            ProtocolConfig::Timecard(c) | ProtocolConfig::OcpTimecard(c) => {
                if c.device.is_none() && c.pci_addr.is_none() {
                    return Err(ConfigError::MissingField {
                        protocol: "timecard".into(),
                        field: "device or pci_addr".into(),
                    });
                }
                Ok(())
            }
            ProtocolConfig::Mock => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayStrategy {
    E2e,
    P2p,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PtpConfig {
    pub interface: String,
    #[serde(default)]
    pub domain: u8,
    #[serde(default = "default_delay_strategy")]
    pub delay_strategy: DelayStrategy,
    #[serde(default = "default_log_announce_interval")]
    pub log_announce_interval: i8,
    #[serde(default = "default_log_sync_interval")]
    pub log_sync_interval: i8,
    #[serde(default = "default_log_delayreq_interval")]
    pub log_delayreq_interval: i8,
    #[serde(default = "default_ptp_priority")]
    pub priority1: u8,
    #[serde(default = "default_ptp_priority")]
    pub priority2: u8,
}

fn default_delay_strategy() -> DelayStrategy {
    DelayStrategy::E2e
}
fn default_log_announce_interval() -> i8 {
    1
}
fn default_log_sync_interval() -> i8 {
    0
}
fn default_log_delayreq_interval() -> i8 {
    0
}
fn default_ptp_priority() -> u8 {
    DEFAULT_PTP_PRIORITY
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NtpConfig {
    pub ip: String,
    #[serde(default = "default_ntp_poll", with = "duration_string")]
    pub poll_interval: Duration,
}

fn default_ntp_poll() -> Duration {
    DEFAULT_NTP_POLL_INTERVAL
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeMode {
    Rising,
    Falling,
    Both,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PpsConfig {
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub gpio_pin: Option<u32>,
    #[serde(default = "default_edge_mode")]
    pub edge_mode: EdgeMode,
    #[serde(default)]
    pub cable_delay_ns: i64,
}

fn default_edge_mode() -> EdgeMode {
    EdgeMode::Rising
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NmeaConfig {
    pub device: String,
    #[serde(default = "default_nmea_baud")]
    pub baud: u32,
    #[serde(default)]
    pub offset_ns: i64,
}

fn default_nmea_baud() -> u32 {
    DEFAULT_NMEA_BAUD
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhcConfig {
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub phc_index: Option<u32>,
    #[serde(default)]
    pub interface: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeCardConfig {
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub pci_addr: Option<String>,
    #[serde(default)]
    pub shm_segment: Option<u32>,
    #[serde(default)]
    pub card_config: Vec<String>,
}

/// (de)serializes `Duration` as a human string accepting the spec §6 unit
/// suffixes: `d|h|m|s|ms|µs|ns`.
mod duration_string {
    use super::{format_duration, parse_duration};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

pub fn format_duration(d: Duration) -> String {
    format!("{}ms", d.as_millis())
}

/// Parses a duration string of the form `<number><unit>`, unit one of
/// `d`, `h`, `m`, `s`, `ms`, `us`/`µs`, `ns`.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let raw = raw.trim();
    let split_at = raw
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .ok_or_else(|| ConfigError::InvalidDuration(raw.to_string()))?;
    let (number, unit) = raw.split_at(split_at);
    let value: f64 = number
        .parse()
        .map_err(|_| ConfigError::InvalidDuration(raw.to_string()))?;

    let nanos = match unit {
        "d" => value * 86_400.0 * 1e9,
        "h" => value * 3_600.0 * 1e9,
        "m" => value * 60.0 * 1e9,
        "s" => value * 1e9,
        "ms" => value * 1e6,
        "us" | "µs" => value * 1e3,
        "ns" => value,
        _ => return Err(ConfigError::InvalidDuration(raw.to_string())),
    };

    if nanos < 0.0 || !nanos.is_finite() {
        return Err(ConfigError::InvalidDuration(raw.to_string()));
    }

    Ok(Duration::from_nanos(nanos.round() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_unit() {
        assert_eq!(parse_duration("15m").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("100us").unwrap(), Duration::from_micros(100));
        assert_eq!(parse_duration("100ns").unwrap(), Duration::from_nanos(100));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("15").is_err());
        assert!(parse_duration("-5s").is_err());
    }

    #[test]
    fn default_config_has_one_mock_primary() {
        let cfg = DaemonConfig::default();
        assert_eq!(cfg.primary_clocks.len(), 1);
        assert!(matches!(cfg.primary_clocks[0].protocol, ProtocolConfig::Mock));
        assert_eq!(cfg.step_limit, DEFAULT_STEP_LIMIT);
        cfg.validate().unwrap();
    }

    #[test]
    fn validate_rejects_missing_fields() {
        let cfg = DaemonConfig {
            primary_clocks: vec![SourceConfig {
                protocol: ProtocolConfig::Ntp(NtpConfig {
                    ip: String::new(),
                    poll_interval: DEFAULT_NTP_POLL_INTERVAL,
                }),
                disable: false,
                monitor_only: false,
            }],
            ..DaemonConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
