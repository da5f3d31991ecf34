//! The uniform `SourceHandler` surface and the shared `TimeInfo`/status
//! types every protocol handler produces (spec §3, §4.5).

pub mod mock;
pub mod nmea;
pub mod ntp;
pub mod phc_source;
pub mod pps;
pub mod ptp_source;
pub mod timecard_source;

use crate::config::ProtocolConfig;
use crate::error::SourceError;
use crate::status::FixType;
use std::collections::VecDeque;
use std::time::{Duration, SystemTime};

/// A single measurement produced by a handler (spec §3 `TimeInfo`).
/// Immutable once returned.
#[derive(Debug, Clone, Copy)]
pub struct TimeInfo {
    pub timestamp: SystemTime,
    /// System clock minus source, signed.
    pub offset: SignedDuration,
    /// One-way network/cable delay estimate, non-negative.
    pub delay: Duration,
    pub quality: u8,
    /// 0 for non-NTP-lineage sources.
    pub stratum: u8,
    /// Signed power-of-two exponent of seconds.
    pub precision: i8,
    pub latitude_deg: Option<f64>,
    pub longitude_deg: Option<f64>,
    pub altitude_m: Option<f64>,
    pub fix_type: Option<FixType>,
    pub satellites_used: Option<u8>,
}

/// A signed duration, represented as magnitude + sign to avoid pulling in a
/// signed-duration crate: the teacher's codebase stores `step_clock`'s
/// offset the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignedDuration {
    pub magnitude: Duration,
    pub negative: bool,
}

impl SignedDuration {
    pub fn from_nanos(nanos: i64) -> SignedDuration {
        SignedDuration {
            magnitude: Duration::from_nanos(nanos.unsigned_abs()),
            negative: nanos < 0,
        }
    }

    pub fn as_nanos_i64(&self) -> i64 {
        let n = self.magnitude.as_nanos().min(i64::MAX as u128) as i64;
        if self.negative {
            -n
        } else {
            n
        }
    }

    pub fn as_millis_f64(&self) -> f64 {
        let ms = self.magnitude.as_secs_f64() * 1000.0;
        if self.negative {
            -ms
        } else {
            ms
        }
    }
}

impl TimeInfo {
    pub fn offset_ns(&self) -> i64 {
        self.offset.as_nanos_i64()
    }
}

/// Connectedness + counters a handler reports independent of the last
/// sample (spec §4.5 `get_status`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub error_count: u64,
}

/// Per-source mutable state the selection manager owns and updates each
/// tick (spec §3 `SourceStatus`).
#[derive(Debug, Clone)]
pub struct SourceStatus {
    pub active: bool,
    pub last_sync: Option<SystemTime>,
    pub offset_ns: i64,
    pub quality: u8,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub selected: bool,
    pub priority: i32,
}

impl SourceStatus {
    pub fn new(priority: i32) -> SourceStatus {
        SourceStatus {
            active: false,
            last_sync: None,
            offset_ns: 0,
            quality: 0,
            error_count: 0,
            last_error: None,
            selected: false,
            priority,
        }
    }

    pub fn record_success(&mut self, info: &TimeInfo) {
        self.active = true;
        self.last_sync = Some(info.timestamp);
        self.offset_ns = info.offset_ns();
        self.quality = info.quality;
        self.last_error = None;
    }

    pub fn record_failure(&mut self, error: &SourceError) {
        self.active = false;
        self.error_count += 1;
        self.last_error = Some(error.to_string());
    }
}

const HISTORY_CAPACITY: usize = 100;

/// Monotonic counters plus a bounded ring buffer of recent samples (spec §3
/// `SourceMetrics`). Insert-only except ring eviction.
#[derive(Debug, Clone, Default)]
pub struct SourceMetrics {
    pub packets_received: u64,
    pub packets_sent: u64,
    pub sync_count: u64,
    pub error_count: u64,
    recent_offsets: VecDeque<i64>,
    recent_delays: VecDeque<Duration>,
}

impl SourceMetrics {
    pub fn record_sample(&mut self, offset_ns: i64, delay: Duration) {
        self.sync_count += 1;
        push_bounded(&mut self.recent_offsets, offset_ns, HISTORY_CAPACITY);
        push_bounded(&mut self.recent_delays, delay, HISTORY_CAPACITY);
    }

    pub fn recent_offsets(&self) -> &VecDeque<i64> {
        &self.recent_offsets
    }

    pub fn recent_delays(&self) -> &VecDeque<Duration> {
        &self.recent_delays
    }
}

fn push_bounded<T>(buf: &mut VecDeque<T>, value: T, capacity: usize) {
    if buf.len() == capacity {
        buf.pop_front();
    }
    buf.push_back(value);
}

/// Every protocol handler implements this uniform surface (spec §4.5).
/// Protocol-specific extensions (e.g. PTP's `port_state`) live behind
/// capability queries on the concrete type rather than in this trait, per
/// the redesign note on avoiding deep inheritance chains.
pub trait SourceHandler: Send {
    fn start(&mut self) -> Result<(), SourceError>;
    /// Idempotent: releases resources; subsequent `get_time_info` must fail.
    fn stop(&mut self) -> Result<(), SourceError>;
    fn get_time_info(&self) -> Result<TimeInfo, SourceError>;
    fn get_status(&self) -> ConnectionStatus;
    /// Returns the protocol configuration this handler was built from
    /// (spec §4.5 `get_config`).
    fn get_config(&self) -> ProtocolConfig;
    fn protocol_name(&self) -> &'static str;
}

/// Builds the concrete handler for a configured protocol. `clock_identity`
/// is only consulted for PTP (spec §3 `PortIdentity`); every other protocol
/// ignores it.
pub fn build_handler(protocol: &ProtocolConfig, clock_identity: [u8; 8]) -> Box<dyn SourceHandler> {
    match protocol {
        ProtocolConfig::Ptp(cfg) => Box::new(ptp_source::PtpSource::new(cfg.clone(), clock_identity)),
        ProtocolConfig::Ntp(cfg) => Box::new(ntp::NtpSource::new(cfg.clone())),
        ProtocolConfig::Pps(cfg) => Box::new(pps::PpsSource::new(cfg.clone())),
        ProtocolConfig::Nmea(cfg) => Box::new(nmea::NmeaSource::new(cfg.clone())),
        ProtocolConfig::Phc(cfg) => Box::new(phc_source::PhcSource::new(cfg.clone())),
        ProtocolConfig::Timecard(cfg) => Box::new(timecard_source::TimeCardSource::new(cfg.clone(), false)),
        ProtocolConfig::OcpTimecard(cfg) => Box::new(timecard_source::TimeCardSource::new(cfg.clone(), true)),
        ProtocolConfig::Mock => Box::new(mock::MockSource::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_duration_round_trips_sign() {
        assert_eq!(SignedDuration::from_nanos(-500).as_nanos_i64(), -500);
        assert_eq!(SignedDuration::from_nanos(500).as_nanos_i64(), 500);
        assert_eq!(SignedDuration::from_nanos(0).as_nanos_i64(), 0);
    }

    #[test]
    fn metrics_ring_buffer_evicts_oldest() {
        let mut metrics = SourceMetrics::default();
        for i in 0..150i64 {
            metrics.record_sample(i, Duration::from_millis(1));
        }
        assert_eq!(metrics.recent_offsets().len(), HISTORY_CAPACITY);
        assert_eq!(*metrics.recent_offsets().front().unwrap(), 50);
        assert_eq!(*metrics.recent_offsets().back().unwrap(), 149);
    }

    #[test]
    fn source_status_records_success_and_failure() {
        let mut status = SourceStatus::new(200);
        status.record_failure(&SourceError::Transient("timeout".into()));
        assert!(!status.active);
        assert_eq!(status.error_count, 1);
        assert!(status.last_error.is_some());

        let info = TimeInfo {
            timestamp: SystemTime::now(),
            offset: SignedDuration::from_nanos(1000),
            delay: Duration::from_micros(100),
            quality: 240,
            stratum: 0,
            precision: -6,
            latitude_deg: None,
            longitude_deg: None,
            altitude_m: None,
            fix_type: None,
            satellites_used: None,
        };
        status.record_success(&info);
        assert!(status.active);
        assert_eq!(status.offset_ns, 1000);
        assert!(status.last_error.is_none());
    }
}
