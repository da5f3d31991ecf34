//! End-to-end scenarios from the §8 testable-property list, driven through
//! the public `SelectionManager`/`Steerer` surface the way the teacher's
//! `simulation_e2e.rs` drives its controller through a physics engine —
//! here the "physics" is a scripted offset sequence rather than a PI-loop
//! simulation, since the steering algorithm is a stateless per-tick
//! weighted mean rather than a rate servo.

use anyhow::Result;
use refclockd::clock::SystemClock;
use refclockd::config::{DaemonConfig, ProtocolConfig, SourceConfig};
use refclockd::selection::SelectionManager;
use refclockd::status::ClockState;
use refclockd::steerer::{Adjustment, Candidate, OutlierPolicy, Steerer};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Default)]
struct RecordingClock {
    inner: Arc<Mutex<Recorded>>,
}

#[derive(Default)]
struct Recorded {
    steps: Vec<(Duration, i8)>,
    frequency_factors: Vec<f64>,
}

impl SystemClock for RecordingClock {
    fn adjust_frequency(&mut self, factor: f64) -> Result<()> {
        self.inner.lock().unwrap().frequency_factors.push(factor);
        Ok(())
    }

    fn step_clock(&mut self, offset: Duration, sign: i8) -> Result<()> {
        self.inner.lock().unwrap().steps.push((offset, sign));
        Ok(())
    }
}

fn mock_config() -> SourceConfig {
    SourceConfig {
        protocol: ProtocolConfig::Mock,
        disable: false,
        monitor_only: false,
    }
}

/// A single active mock primary reaches steady-state synchronization
/// within the first tick and stays there.
#[test]
fn steady_state_synchronization_with_a_single_primary() {
    let config = DaemonConfig {
        adjust_clock: true,
        step_limit: Duration::from_secs(900),
        primary_clocks: vec![mock_config()],
        secondary_clocks: Vec::new(),
        holdover_timeout: Duration::from_secs(60),
    };
    let clock = RecordingClock::default();
    let mut manager = SelectionManager::new(&config, Box::new(clock.clone()), [0xAA; 8]);
    manager.start_all();

    for _ in 0..5 {
        manager.tick();
        assert_eq!(manager.clock_state(), ClockState::Synchronized);
        assert_eq!(manager.selected_source_id(), Some("primary_0"));
    }

    manager.stop_all();
}

/// When every primary is disabled, selection falls back to the secondary
/// group and still reaches Synchronized.
#[test]
fn failover_from_primary_to_secondary() {
    let config = DaemonConfig {
        adjust_clock: false,
        step_limit: Duration::from_secs(900),
        primary_clocks: vec![SourceConfig {
            protocol: ProtocolConfig::Mock,
            disable: true,
            monitor_only: false,
        }],
        secondary_clocks: vec![mock_config()],
        holdover_timeout: Duration::from_secs(60),
    };
    let clock = RecordingClock::default();
    let mut manager = SelectionManager::new(&config, Box::new(clock), [0xAA; 8]);
    manager.start_all();
    manager.tick();

    assert_eq!(manager.clock_state(), ClockState::Synchronized);
    assert_eq!(manager.selected_source_id(), Some("secondary_0"));
}

/// Scripted offset sequence crossing the 128ms step/slew boundary and the
/// configured step_limit, mirroring the teacher's physics-engine-driven
/// servo tests but against the weighted-mean steerer.
#[test]
fn step_vs_slew_and_step_limit_refusal_across_a_scripted_sequence() {
    let mut steerer = Steerer::new(OutlierPolicy::Moderate, Duration::from_millis(200));

    let sample = |offset_ns: i64| Candidate {
        offset_ns,
        quality: 240,
        delay: Duration::from_micros(200),
    };

    // Small offset: slew.
    let adjustment = steerer.apply(&[sample(50_000_000)]).unwrap();
    assert!(matches!(adjustment, Adjustment::Slew { .. }));

    // Crosses 128ms: step, but still within the 200ms step_limit.
    let adjustment = steerer.apply(&[sample(150_000_000)]).unwrap();
    assert!(matches!(adjustment, Adjustment::Step { offset_ns } if offset_ns == 150_000_000));

    // Exceeds step_limit entirely: refused, not silently capped.
    let result = steerer.apply(&[sample(500_000_000)]);
    assert!(result.is_err());

    // Back to a small offset: steering resumes normally afterward.
    let adjustment = steerer.apply(&[sample(10_000_000)]).unwrap();
    assert!(matches!(adjustment, Adjustment::Slew { .. }));
}

/// Multiple candidates in a tick with one wild outlier: the outlier is
/// rejected and the surviving candidates still produce a sane offset.
#[test]
fn outlier_rejection_keeps_the_steering_decision_sane() {
    let mut steerer = Steerer::new(OutlierPolicy::Strict, Duration::from_secs(900));

    let candidates = [
        Candidate {
            offset_ns: 1_000_000,
            quality: 240,
            delay: Duration::from_micros(200),
        },
        Candidate {
            offset_ns: 1_200_000,
            quality: 240,
            delay: Duration::from_micros(200),
        },
        Candidate {
            offset_ns: 900_000,
            quality: 240,
            delay: Duration::from_micros(200),
        },
        Candidate {
            offset_ns: 2_000_000_000,
            quality: 240,
            delay: Duration::from_micros(200),
        },
    ];

    let adjustment = steerer.apply(&candidates).unwrap();
    match adjustment {
        Adjustment::Slew { .. } => {}
        Adjustment::Step { offset_ns } => panic!("outlier should have been rejected, got step of {offset_ns}ns"),
    }
}
