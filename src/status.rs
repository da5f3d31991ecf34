//! Thread-safe status snapshots for external collaborators (metrics, HTTP,
//! CLI). Readers obtain consistent copies, never interior references —
//! spec §3 "Ownership".

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Overall clock discipline state (spec §3, transitions in §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockState {
    Unknown,
    Synchronized,
    Unsynchronized,
    FreeRunning,
    Holdover,
}

impl Default for ClockState {
    fn default() -> Self {
        ClockState::Unknown
    }
}

/// GNSS fix type carried by GNSS-capable sources (NMEA, TimeCard).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixType {
    None = 0,
    Gps = 1,
    Dgps = 2,
    Pps = 3,
    Rtk = 4,
    FloatRtk = 5,
}

impl FixType {
    pub fn from_code(code: u8) -> FixType {
        match code {
            1 => FixType::Gps,
            2 => FixType::Dgps,
            3 => FixType::Pps,
            4 => FixType::Rtk,
            5 => FixType::FloatRtk,
            _ => FixType::None,
        }
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Per-source snapshot exposed externally (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSnapshot {
    pub id: String,
    pub protocol: String,
    pub active: bool,
    pub selected: bool,
    pub last_sync_unix: u64,
    pub offset_ns: i64,
    pub delay_ns: i64,
    pub quality: u8,
    pub stratum: Option<u8>,
    pub error_count: u64,
    pub last_error: Option<String>,
}

/// Top-level manager snapshot exposed externally (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerSnapshot {
    pub clock_state: ClockState,
    pub selected_source_id: Option<String>,
    pub primary_sources: Vec<SourceSnapshot>,
    pub secondary_sources: Vec<SourceSnapshot>,
    pub timestamp_unix: u64,
}

impl ManagerSnapshot {
    pub fn empty() -> Self {
        ManagerSnapshot {
            clock_state: ClockState::Unknown,
            selected_source_id: None,
            primary_sources: Vec::new(),
            secondary_sources: Vec::new(),
            timestamp_unix: now_unix(),
        }
    }

    /// Health signal consumed by the HTTP collaborator (spec §7).
    pub fn healthy(&self) -> bool {
        let active_sources = self
            .primary_sources
            .iter()
            .chain(self.secondary_sources.iter())
            .filter(|s| s.active)
            .count();
        !matches!(self.clock_state, ClockState::Unsynchronized | ClockState::Unknown) && active_sources > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_clock_state_is_unknown() {
        assert_eq!(ClockState::default(), ClockState::Unknown);
    }

    #[test]
    fn fix_type_from_code_roundtrips_known_values() {
        assert_eq!(FixType::from_code(0), FixType::None);
        assert_eq!(FixType::from_code(1), FixType::Gps);
        assert_eq!(FixType::from_code(4), FixType::Rtk);
        assert_eq!(FixType::from_code(99), FixType::None);
    }

    #[test]
    fn empty_snapshot_is_unhealthy() {
        let snap = ManagerSnapshot::empty();
        assert!(!snap.healthy());
    }

    #[test]
    fn snapshot_with_active_source_and_sync_is_healthy() {
        let mut snap = ManagerSnapshot::empty();
        snap.clock_state = ClockState::Synchronized;
        snap.primary_sources.push(SourceSnapshot {
            id: "primary_0".into(),
            protocol: "mock".into(),
            active: true,
            selected: true,
            last_sync_unix: now_unix(),
            offset_ns: 0,
            delay_ns: 0,
            quality: 250,
            stratum: None,
            error_count: 0,
            last_error: None,
        });
        assert!(snap.healthy());
    }

    #[test]
    fn serde_roundtrip() {
        let snap = ManagerSnapshot::empty();
        let json = serde_json::to_string(&snap).unwrap();
        let restored: ManagerSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.clock_state, snap.clock_state);
    }
}
