//! Source selection, the clock-state machine, and the steering hand-off
//! (spec §4.6 "SelectionManager").
//!
//! Polls every configured, non-disabled source at 1 Hz, scores the active
//! ones, hands the winner's sample to the [`crate::steerer::Steerer`], and
//! applies the resulting adjustment to a [`crate::clock::SystemClock`].

use crate::clock::SystemClock;
use crate::config::{DaemonConfig, SourceConfig};
use crate::error::SteeringError;
use crate::sources::{build_handler, SourceHandler, SourceMetrics, SourceStatus, TimeInfo};
use crate::status::{ClockState, ManagerSnapshot, SourceSnapshot};
use crate::steerer::{Adjustment, Candidate, OutlierPolicy, Steerer};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Base priority for all primary-group sources before the error/quality/
/// offset adjustments (spec §4.6 "Scoring").
const PRIMARY_BASE_PRIORITY: i32 = 200;
/// Base priority for all secondary-group sources.
const SECONDARY_BASE_PRIORITY: i32 = 100;
/// A previously-selected source going silent for longer than this enters
/// holdover rather than an immediate drop to Unsynchronized (spec §4.6).
const HOLDOVER_GRACE: Duration = Duration::from_secs(30);

struct SourceEntry {
    id: String,
    is_primary: bool,
    priority: i32,
    config: SourceConfig,
    handler: Box<dyn SourceHandler>,
    started: bool,
    status: SourceStatus,
    last_info: Option<TimeInfo>,
    metrics: SourceMetrics,
}

impl SourceEntry {
    fn eligible(&self) -> bool {
        !self.config.disable && !self.config.monitor_only && self.status.active
    }

    /// `score = priority - 10×error_count + quality - |offset_in_ms|`
    /// (spec §4.6 "Scoring").
    fn score(&self) -> f64 {
        let Some(info) = &self.last_info else { return f64::MIN };
        self.priority as f64 - 10.0 * self.status.error_count as f64 + info.quality as f64 - info.offset.as_millis_f64().abs()
    }
}

pub struct SelectionManager {
    entries: Vec<SourceEntry>,
    steerer: Steerer,
    clock: Box<dyn SystemClock>,
    adjust_clock: bool,
    holdover_timeout: Duration,
    clock_state: ClockState,
    selected_id: Option<String>,
    last_synchronized_at: Option<Instant>,
    holdover_entered_at: Option<Instant>,
}

impl SelectionManager {
    /// Builds handlers for every configured source (spec §4.6 "Lifecycle"
    /// step 0) and assigns base priorities. `clock_identity` is passed
    /// through to PTP handlers only.
    pub fn new(config: &DaemonConfig, clock: Box<dyn SystemClock>, clock_identity: [u8; 8]) -> SelectionManager {
        let mut entries = Vec::with_capacity(config.primary_clocks.len() + config.secondary_clocks.len());
        for (i, src) in config.primary_clocks.iter().enumerate() {
            entries.push(make_entry(src, true, PRIMARY_BASE_PRIORITY, i, clock_identity));
        }
        for (i, src) in config.secondary_clocks.iter().enumerate() {
            entries.push(make_entry(src, false, SECONDARY_BASE_PRIORITY, i, clock_identity));
        }

        SelectionManager {
            entries,
            steerer: Steerer::new(OutlierPolicy::Moderate, config.step_limit),
            clock,
            adjust_clock: config.adjust_clock,
            holdover_timeout: config.holdover_timeout,
            clock_state: ClockState::Unknown,
            selected_id: None,
            last_synchronized_at: None,
            holdover_entered_at: None,
        }
    }

    pub fn clock_state(&self) -> ClockState {
        self.clock_state
    }

    pub fn selected_source_id(&self) -> Option<&str> {
        self.selected_id.as_deref()
    }

    /// Starts every non-disabled handler (spec §4.6 "Lifecycle" step 1). A
    /// handler that fails to start is logged and left inactive; other
    /// sources continue.
    pub fn start_all(&mut self) {
        for entry in &mut self.entries {
            if entry.config.disable {
                continue;
            }
            match entry.handler.start() {
                Ok(()) => entry.started = true,
                Err(e) => log::warn!("{} failed to start: {e}", entry.id),
            }
        }
    }

    pub fn stop_all(&mut self) {
        for entry in &mut self.entries {
            if entry.started {
                if let Err(e) = entry.handler.stop() {
                    log::warn!("{} failed to stop: {e}", entry.id);
                }
                entry.started = false;
            }
        }
    }

    /// Runs one 1 Hz selection cycle: poll, score, select, steer (spec
    /// §4.6 "Lifecycle" steps 2-4).
    pub fn tick(&mut self) {
        self.poll_all();

        for entry in &mut self.entries {
            entry.status.selected = false;
        }

        match self.select() {
            Some(idx) => self.steer_selected(idx),
            None => {
                log::warn!("{}", SteeringError::NoSelectableSource);
                self.handle_no_selection();
            }
        }
    }

    fn poll_all(&mut self) {
        for entry in &mut self.entries {
            if entry.config.disable || !entry.started {
                continue;
            }
            match entry.handler.get_time_info() {
                Ok(info) => {
                    entry.status.record_success(&info);
                    entry.metrics.record_sample(info.offset_ns(), info.delay);
                    entry.last_info = Some(info);
                }
                Err(e) => {
                    entry.status.record_failure(&e);
                    entry.last_info = None;
                }
            }
        }
    }

    /// Picks the max-score primary source; falls back to secondary only if
    /// no primary is active. Ties break by configuration order (spec
    /// §4.6).
    fn select(&self) -> Option<usize> {
        let primary_pool: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_primary && e.eligible())
            .map(|(i, _)| i)
            .collect();

        let pool = if !primary_pool.is_empty() {
            primary_pool
        } else {
            self.entries
                .iter()
                .enumerate()
                .filter(|(_, e)| !e.is_primary && e.eligible())
                .map(|(i, _)| i)
                .collect()
        };

        pool.into_iter().fold(None, |best, idx| match best {
            None => Some(idx),
            Some(best_idx) => {
                if self.entries[idx].score() > self.entries[best_idx].score() {
                    Some(idx)
                } else {
                    Some(best_idx)
                }
            }
        })
    }

    fn steer_selected(&mut self, idx: usize) {
        let entry = &self.entries[idx];
        let info = entry.last_info.as_ref().expect("eligible entries have last_info");
        let candidate = Candidate {
            offset_ns: info.offset.as_nanos_i64(),
            quality: info.quality,
            delay: info.delay,
        };
        let id = entry.id.clone();

        match self.steerer.apply(&[candidate]) {
            Ok(adjustment) => {
                self.apply_adjustment(adjustment);
                self.entries[idx].status.selected = true;
                self.selected_id = Some(id);
                self.clock_state = ClockState::Synchronized;
                self.last_synchronized_at = Some(Instant::now());
                self.holdover_entered_at = None;
            }
            Err(SteeringError::OversizedCorrection { offset_ns, step_limit_ns }) => {
                log::warn!("{id} offset {offset_ns}ns exceeds step_limit {step_limit_ns}ns, refusing to steer");
                self.handle_no_selection();
            }
            Err(e) => {
                log::warn!("steering {id} failed: {e}");
                self.handle_no_selection();
            }
        }
    }

    fn apply_adjustment(&mut self, adjustment: Adjustment) {
        if !self.adjust_clock {
            return;
        }
        let result = match adjustment {
            Adjustment::Step { offset_ns } => {
                let sign: i8 = if offset_ns < 0 { -1 } else { 1 };
                self.clock.step_clock(Duration::from_nanos(offset_ns.unsigned_abs()), sign)
            }
            Adjustment::Slew { frequency_ppm } => self.clock.adjust_frequency(1.0 + frequency_ppm / 1_000_000.0),
        };
        if let Err(e) = result {
            log::warn!("failed to apply clock adjustment: {e}");
        }
    }

    /// No source is selectable this tick (spec §4.6 "Clock state"). Coasts
    /// on the last steering history into Holdover if it's been less than
    /// [`HOLDOVER_GRACE`]... no, more than it, with usable history; drops
    /// straight to Unsynchronized otherwise, and promotes Holdover to
    /// FreeRunning once `holdover_timeout` has elapsed.
    fn handle_no_selection(&mut self) {
        self.selected_id = None;

        if let Some(last_sync) = self.last_synchronized_at {
            if last_sync.elapsed() > HOLDOVER_GRACE && self.steerer.history().count() > 0 {
                if self.clock_state != ClockState::Holdover {
                    self.holdover_entered_at = Some(Instant::now());
                }
                self.clock_state = ClockState::Holdover;

                if let Some(entered) = self.holdover_entered_at {
                    if entered.elapsed() > self.holdover_timeout {
                        self.clock_state = ClockState::FreeRunning;
                    }
                }
                return;
            }
        }

        self.clock_state = ClockState::Unsynchronized;
        self.holdover_entered_at = None;
    }

    pub fn snapshot(&self) -> ManagerSnapshot {
        let (primary, secondary): (Vec<&SourceEntry>, Vec<&SourceEntry>) = self.entries.iter().partition(|e| e.is_primary);
        ManagerSnapshot {
            clock_state: self.clock_state,
            selected_source_id: self.selected_id.clone(),
            primary_sources: primary.into_iter().map(entry_snapshot).collect(),
            secondary_sources: secondary.into_iter().map(entry_snapshot).collect(),
            timestamp_unix: SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0),
        }
    }
}

fn entry_snapshot(entry: &SourceEntry) -> SourceSnapshot {
    SourceSnapshot {
        id: entry.id.clone(),
        protocol: entry.handler.protocol_name().to_string(),
        active: entry.status.active,
        selected: entry.status.selected,
        last_sync_unix: entry
            .status
            .last_sync
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0),
        offset_ns: entry.status.offset_ns,
        delay_ns: entry.last_info.map(|i| i.delay.as_nanos().min(i64::MAX as u128) as i64).unwrap_or(0),
        quality: entry.status.quality,
        stratum: entry.last_info.map(|i| i.stratum),
        error_count: entry.status.error_count,
        last_error: entry.status.last_error.clone(),
    }
}

fn make_entry(src: &SourceConfig, is_primary: bool, base_priority: i32, index: usize, clock_identity: [u8; 8]) -> SourceEntry {
    let group = if is_primary { "primary" } else { "secondary" };
    SourceEntry {
        id: format!("{group}_{index}"),
        is_primary,
        priority: base_priority,
        config: src.clone(),
        handler: build_handler(&src.protocol, clock_identity),
        started: false,
        status: SourceStatus::new(base_priority),
        last_info: None,
        metrics: SourceMetrics::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProtocolConfig, SourceConfig};
    use anyhow::Result;

    struct NoopClock {
        steps: Vec<(Duration, i8)>,
        frequencies: Vec<f64>,
    }

    impl SystemClock for NoopClock {
        fn adjust_frequency(&mut self, factor: f64) -> Result<()> {
            self.frequencies.push(factor);
            Ok(())
        }
        fn step_clock(&mut self, offset: Duration, sign: i8) -> Result<()> {
            self.steps.push((offset, sign));
            Ok(())
        }
    }

    fn mock_source_config() -> SourceConfig {
        SourceConfig {
            protocol: ProtocolConfig::Mock,
            disable: false,
            monitor_only: false,
        }
    }

    fn manager_with_mocks(primary: usize, secondary: usize) -> SelectionManager {
        let config = DaemonConfig {
            adjust_clock: false,
            step_limit: Duration::from_secs(900),
            primary_clocks: (0..primary).map(|_| mock_source_config()).collect(),
            secondary_clocks: (0..secondary).map(|_| mock_source_config()).collect(),
            holdover_timeout: Duration::from_secs(60),
        };
        let clock: Box<dyn SystemClock> = Box::new(NoopClock {
            steps: Vec::new(),
            frequencies: Vec::new(),
        });
        SelectionManager::new(&config, clock, [0xAA; 8])
    }

    #[test]
    fn starts_unknown_and_unsynchronized_before_any_tick() {
        let manager = manager_with_mocks(1, 0);
        assert_eq!(manager.clock_state(), ClockState::Unknown);
        assert!(manager.selected_source_id().is_none());
    }

    #[test]
    fn becomes_synchronized_once_a_primary_is_selected() {
        let mut manager = manager_with_mocks(1, 1);
        manager.start_all();
        manager.tick();
        assert_eq!(manager.clock_state(), ClockState::Synchronized);
        assert_eq!(manager.selected_source_id(), Some("primary_0"));
    }

    #[test]
    fn falls_back_to_secondary_when_primary_disabled() {
        let config = DaemonConfig {
            adjust_clock: false,
            step_limit: Duration::from_secs(900),
            primary_clocks: vec![SourceConfig {
                protocol: ProtocolConfig::Mock,
                disable: true,
                monitor_only: false,
            }],
            secondary_clocks: vec![mock_source_config()],
            holdover_timeout: Duration::from_secs(60),
        };
        let clock: Box<dyn SystemClock> = Box::new(NoopClock {
            steps: Vec::new(),
            frequencies: Vec::new(),
        });
        let mut manager = SelectionManager::new(&config, clock, [0xAA; 8]);
        manager.start_all();
        manager.tick();
        assert_eq!(manager.selected_source_id(), Some("secondary_0"));
    }

    #[test]
    fn monitor_only_source_is_never_selected() {
        let config = DaemonConfig {
            adjust_clock: false,
            step_limit: Duration::from_secs(900),
            primary_clocks: vec![SourceConfig {
                protocol: ProtocolConfig::Mock,
                disable: false,
                monitor_only: true,
            }],
            secondary_clocks: Vec::new(),
            holdover_timeout: Duration::from_secs(60),
        };
        let clock: Box<dyn SystemClock> = Box::new(NoopClock {
            steps: Vec::new(),
            frequencies: Vec::new(),
        });
        let mut manager = SelectionManager::new(&config, clock, [0xAA; 8]);
        manager.start_all();
        manager.tick();
        assert_eq!(manager.clock_state(), ClockState::Unsynchronized);
        assert!(manager.selected_source_id().is_none());
    }

    #[test]
    fn no_sources_leaves_state_unsynchronized() {
        let mut manager = manager_with_mocks(0, 0);
        manager.start_all();
        manager.tick();
        assert_eq!(manager.clock_state(), ClockState::Unsynchronized);
    }

    #[test]
    fn enters_holdover_after_grace_period_with_usable_history() {
        let mut manager = manager_with_mocks(1, 0);
        manager.last_synchronized_at = Some(Instant::now() - Duration::from_secs(40));
        manager
            .steerer
            .apply(&[Candidate {
                offset_ns: 0,
                quality: 200,
                delay: Duration::ZERO,
            }])
            .unwrap();

        manager.handle_no_selection();
        assert_eq!(manager.clock_state(), ClockState::Holdover);
    }

    #[test]
    fn promotes_to_free_running_once_holdover_timeout_elapses() {
        let mut manager = manager_with_mocks(1, 0);
        manager.last_synchronized_at = Some(Instant::now() - Duration::from_secs(200));
        manager.holdover_entered_at = Some(Instant::now() - Duration::from_secs(120));
        manager
            .steerer
            .apply(&[Candidate {
                offset_ns: 0,
                quality: 200,
                delay: Duration::ZERO,
            }])
            .unwrap();

        manager.handle_no_selection();
        assert_eq!(manager.clock_state(), ClockState::FreeRunning);
    }

    #[test]
    fn drops_straight_to_unsynchronized_without_prior_sync_history() {
        let mut manager = manager_with_mocks(1, 0);
        manager.handle_no_selection();
        assert_eq!(manager.clock_state(), ClockState::Unsynchronized);
    }
}
