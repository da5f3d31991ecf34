//! Wraps [`crate::phc::PhcClock`] as a `SourceHandler` (spec §4.5
//! "PHC-as-source").

use crate::config::{PhcConfig, ProtocolConfig};
use crate::error::SourceError;
use crate::phc::{PhcClock, PhcOffsetSample};
use crate::sources::{ConnectionStatus, SignedDuration, SourceHandler, TimeInfo};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const STALE_AFTER: Duration = Duration::from_secs(10);

fn resolve_device_path(config: &PhcConfig) -> Result<PathBuf, SourceError> {
    if let Some(device) = &config.device {
        return Ok(PathBuf::from(device));
    }
    if let Some(index) = config.phc_index {
        return Ok(PathBuf::from(format!("/dev/ptp{index}")));
    }
    if let Some(interface) = &config.interface {
        let ptp_dir = format!("/sys/class/net/{interface}/device/ptp");
        let entry = std::fs::read_dir(&ptp_dir)
            .map_err(|e| SourceError::ResourceAcquisition(format!("read {ptp_dir}: {e}")))?
            .next()
            .ok_or_else(|| SourceError::ResourceAcquisition(format!("no ptp device under {ptp_dir}")))?
            .map_err(|e| SourceError::ResourceAcquisition(e.to_string()))?;
        let name = entry.file_name();
        return Ok(PathBuf::from(format!("/dev/{}", name.to_string_lossy())));
    }
    Err(SourceError::ResourceAcquisition("phc config has no device, phc_index or interface".into()))
}

struct Sample {
    sample: PhcOffsetSample,
    observed_at: Instant,
}

pub struct PhcSource {
    config: PhcConfig,
    clock: Option<PhcClock>,
    last_sample: Mutex<Option<Sample>>,
    error_count: u64,
}

impl PhcSource {
    pub fn new(config: PhcConfig) -> PhcSource {
        PhcSource {
            config,
            clock: None,
            last_sample: Mutex::new(None),
            error_count: 0,
        }
    }
}

impl SourceHandler for PhcSource {
    fn start(&mut self) -> Result<(), SourceError> {
        if self.clock.is_some() {
            return Err(SourceError::AlreadyRunning);
        }
        let path = resolve_device_path(&self.config)?;
        let clock = PhcClock::open(&path).map_err(|e| SourceError::ResourceAcquisition(e.to_string()))?;
        self.clock = Some(clock);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), SourceError> {
        self.clock = None;
        *self.last_sample.lock().expect("phc source mutex poisoned") = None;
        Ok(())
    }

    fn get_time_info(&self) -> Result<TimeInfo, SourceError> {
        let clock = self.clock.as_ref().ok_or(SourceError::NotRunning)?;

        let measured = clock.measure_offset();
        let mut guard = self.last_sample.lock().expect("phc source mutex poisoned");

        match measured {
            Ok(sample) => {
                *guard = Some(Sample {
                    sample,
                    observed_at: Instant::now(),
                });
            }
            Err(e) => {
                log::debug!("phc measure_offset failed, using last known sample: {e}");
            }
        }

        let Sample { sample, observed_at } = guard.as_ref().ok_or(SourceError::NotReady)?;
        let age = observed_at.elapsed();
        let quality = if age <= STALE_AFTER { 250 } else { 150 };

        Ok(TimeInfo {
            timestamp: sample.phc_time,
            offset: SignedDuration::from_nanos(sample.offset_ns),
            delay: Duration::ZERO,
            quality,
            stratum: 0,
            precision: -9,
            latitude_deg: None,
            longitude_deg: None,
            altitude_m: None,
            fix_type: None,
            satellites_used: None,
        })
    }

    fn get_status(&self) -> ConnectionStatus {
        ConnectionStatus {
            connected: self.clock.is_some(),
            error_count: self.error_count,
        }
    }

    fn get_config(&self) -> ProtocolConfig {
        ProtocolConfig::Phc(self.config.clone())
    }

    fn protocol_name(&self) -> &'static str {
        "phc"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_prefers_explicit_device() {
        let config = PhcConfig {
            device: Some("/dev/ptp3".into()),
            phc_index: Some(0),
            interface: None,
        };
        assert_eq!(resolve_device_path(&config).unwrap(), PathBuf::from("/dev/ptp3"));
    }

    #[test]
    fn resolve_falls_back_to_phc_index() {
        let config = PhcConfig {
            device: None,
            phc_index: Some(2),
            interface: None,
        };
        assert_eq!(resolve_device_path(&config).unwrap(), PathBuf::from("/dev/ptp2"));
    }

    #[test]
    fn resolve_fails_with_no_fields_set() {
        let config = PhcConfig {
            device: None,
            phc_index: None,
            interface: None,
        };
        assert!(resolve_device_path(&config).is_err());
    }
}
