//! A synthetic source used by tests and by the default configuration
//! (spec §4.5 "Mock").

use crate::config::ProtocolConfig;
use crate::error::SourceError;
use crate::sources::{ConnectionStatus, SignedDuration, SourceHandler, TimeInfo};
use rand::Rng;
use std::time::{Duration, SystemTime};

pub struct MockSource {
    running: bool,
    error_count: u64,
}

impl Default for MockSource {
    fn default() -> Self {
        MockSource {
            running: false,
            error_count: 0,
        }
    }
}

impl SourceHandler for MockSource {
    fn start(&mut self) -> Result<(), SourceError> {
        if self.running {
            return Err(SourceError::AlreadyRunning);
        }
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), SourceError> {
        self.running = false;
        Ok(())
    }

    fn get_time_info(&self) -> Result<TimeInfo, SourceError> {
        if !self.running {
            return Err(SourceError::NotRunning);
        }
        let mut rng = rand::thread_rng();
        let offset_ns: i64 = rng.gen_range(-500_000..=500_000);
        let delay_us: u64 = rng.gen_range(100..=1100);
        let quality: u8 = rng.gen_range(200..=250);

        Ok(TimeInfo {
            timestamp: SystemTime::now(),
            offset: SignedDuration::from_nanos(offset_ns),
            delay: Duration::from_micros(delay_us),
            quality,
            stratum: 0,
            precision: -6,
            latitude_deg: None,
            longitude_deg: None,
            altitude_m: None,
            fix_type: None,
            satellites_used: None,
        })
    }

    fn get_status(&self) -> ConnectionStatus {
        ConnectionStatus {
            connected: self.running,
            error_count: self.error_count,
        }
    }

    fn get_config(&self) -> ProtocolConfig {
        ProtocolConfig::Mock
    }

    fn protocol_name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_ready_before_start() {
        let source = MockSource::default();
        assert!(matches!(source.get_time_info(), Err(SourceError::NotRunning)));
    }

    #[test]
    fn samples_stay_within_documented_ranges() {
        let mut source = MockSource::default();
        source.start().unwrap();
        for _ in 0..200 {
            let info = source.get_time_info().unwrap();
            let offset = info.offset_ns();
            assert!((-500_000..=500_000).contains(&offset));
            assert!(info.delay >= Duration::from_micros(100) && info.delay <= Duration::from_micros(1100));
            assert!((200..=250).contains(&info.quality));
        }
    }

    #[test]
    fn stop_makes_subsequent_calls_fail() {
        let mut source = MockSource::default();
        source.start().unwrap();
        source.stop().unwrap();
        assert!(matches!(source.get_time_info(), Err(SourceError::NotRunning)));
    }
}
