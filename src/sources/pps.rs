//! PPS pulse source: `/dev/ppsN` via the kernel PPS API, or a GPIO pin
//! exported through sysfs (spec §4.5 "PPS (Linux)").

use crate::config::{EdgeMode, PpsConfig, ProtocolConfig};
use crate::error::SourceError;
use crate::sources::{ConnectionStatus, SignedDuration, SourceHandler, TimeInfo};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::{Duration, Instant, SystemTime};

const PPS_CAPTUREASSERT: i32 = 0x01;
const PPS_CAPTURECLEAR: i32 = 0x02;
const PPS_CAPTUREBOTH: i32 = 0x03;
const PPS_TSFMT_TSPEC: i32 = 0x1000;
/// Spec §5: "PPS pulse wait: 1 s per poll cycle (returns empty)".
const POLL_TIMEOUT: Duration = Duration::from_secs(1);
const STALE_AFTER: Duration = Duration::from_secs(5);

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct PpsKtime {
    sec: i64,
    nsec: i32,
    flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct PpsKparams {
    api_version: i32,
    mode: i32,
    assert_off_tu: PpsKtime,
    clear_off_tu: PpsKtime,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct PpsKinfo {
    assert_sequence: u32,
    clear_sequence: u32,
    assert_tu: PpsKtime,
    clear_tu: PpsKtime,
    current_mode: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct PpsFdata {
    info: PpsKinfo,
    timeout: PpsKtime,
}

nix::ioctl_read!(pps_getcap, b'1', 0xa3, i32);
nix::ioctl_write_ptr!(pps_setparams, b'1', 0xa2, PpsKparams);
nix::ioctl_readwrite!(pps_fetch, b'1', 0xa4, PpsFdata);

fn edge_mode_to_pps_mode(edge: EdgeMode) -> i32 {
    match edge {
        EdgeMode::Rising => PPS_CAPTUREASSERT,
        EdgeMode::Falling => PPS_CAPTURECLEAR,
        EdgeMode::Both => PPS_CAPTUREBOTH,
    }
}

enum Backend {
    Device(File),
    Gpio { value_file: File },
    Unopened,
}

pub struct PpsSource {
    config: PpsConfig,
    backend: Backend,
    last_pulse: Option<Instant>,
    error_count: u64,
}

impl PpsSource {
    pub fn new(config: PpsConfig) -> PpsSource {
        PpsSource {
            config,
            backend: Backend::Unopened,
            last_pulse: None,
            error_count: 0,
        }
    }

    fn open_device(&self, device: &str) -> Result<Backend, SourceError> {
        let file = OpenOptions::new()
            .read(true)
            .open(device)
            .map_err(|e| SourceError::ResourceAcquisition(format!("open {device}: {e}")))?;

        let fd = file.as_raw_fd();
        let mut caps = 0i32;
        unsafe { pps_getcap(fd, &mut caps) }
            .map_err(|e| SourceError::ResourceAcquisition(format!("PPS_GETCAP: {e}")))?;

        let params = PpsKparams {
            api_version: 1,
            mode: edge_mode_to_pps_mode(self.config.edge_mode) | PPS_TSFMT_TSPEC,
            ..Default::default()
        };
        unsafe { pps_setparams(fd, &params) }
            .map_err(|e| SourceError::ResourceAcquisition(format!("PPS_SETPARAMS: {e}")))?;

        Ok(Backend::Device(file))
    }

    fn open_gpio(&self, pin: u32) -> Result<Backend, SourceError> {
        let export_result = std::fs::write("/sys/class/gpio/export", pin.to_string().as_bytes());
        if let Err(e) = export_result {
            if e.kind() != std::io::ErrorKind::AlreadyExists {
                log::debug!("gpio export for pin {pin} failed (may already be exported): {e}");
            }
        }
        let base = format!("/sys/class/gpio/gpio{pin}");
        std::fs::write(format!("{base}/direction"), b"in")
            .map_err(|e| SourceError::ResourceAcquisition(format!("set gpio{pin} direction: {e}")))?;
        let edge_str = match self.config.edge_mode {
            EdgeMode::Rising => "rising",
            EdgeMode::Falling => "falling",
            EdgeMode::Both => "both",
        };
        std::fs::write(format!("{base}/edge"), edge_str.as_bytes())
            .map_err(|e| SourceError::ResourceAcquisition(format!("set gpio{pin} edge: {e}")))?;

        let value_file = OpenOptions::new()
            .read(true)
            .open(format!("{base}/value"))
            .map_err(|e| SourceError::ResourceAcquisition(format!("open gpio{pin} value: {e}")))?;

        Ok(Backend::Gpio { value_file })
    }

    fn poll_device(&self, file: &File) -> Result<bool, SourceError> {
        let fd = file.as_raw_fd();
        let mut fdata = PpsFdata {
            timeout: PpsKtime {
                sec: POLL_TIMEOUT.as_secs() as i64,
                nsec: 0,
                flags: 0,
            },
            ..Default::default()
        };
        match unsafe { pps_fetch(fd, &mut fdata) } {
            Ok(_) => Ok(true),
            Err(nix::Error::ETIMEDOUT) => Ok(false),
            Err(e) => Err(SourceError::Transient(format!("PPS_FETCH: {e}"))),
        }
    }

    fn poll_gpio(&self, value_file: &File) -> Result<bool, SourceError> {
        let fd = value_file.as_raw_fd();
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLPRI | libc::POLLERR,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pfd, 1, POLL_TIMEOUT.as_millis() as libc::c_int) };
        if ret < 0 {
            return Err(SourceError::Transient(format!("poll() on gpio value: {}", std::io::Error::last_os_error())));
        }
        if ret == 0 {
            return Ok(false);
        }
        let mut buf = [0u8; 8];
        let mut f = value_file.try_clone().map_err(|e| SourceError::Transient(e.to_string()))?;
        f.seek(SeekFrom::Start(0)).map_err(|e| SourceError::Transient(e.to_string()))?;
        let _ = f.read(&mut buf);
        Ok(true)
    }
}

impl SourceHandler for PpsSource {
    fn start(&mut self) -> Result<(), SourceError> {
        if !matches!(self.backend, Backend::Unopened) {
            return Err(SourceError::AlreadyRunning);
        }
        self.backend = if let Some(device) = &self.config.device {
            self.open_device(device)?
        } else if let Some(pin) = self.config.gpio_pin {
            self.open_gpio(pin)?
        } else {
            return Err(SourceError::ResourceAcquisition("pps source has neither device nor gpio_pin".into()));
        };
        Ok(())
    }

    fn stop(&mut self) -> Result<(), SourceError> {
        if let Backend::Gpio { .. } = &self.backend {
            if let Some(pin) = self.config.gpio_pin {
                let _ = std::fs::write("/sys/class/gpio/unexport", pin.to_string().as_bytes());
            }
        }
        self.backend = Backend::Unopened;
        Ok(())
    }

    fn get_time_info(&self) -> Result<TimeInfo, SourceError> {
        let pulse_seen = match &self.backend {
            Backend::Unopened => return Err(SourceError::NotRunning),
            Backend::Device(file) => self.poll_device(file)?,
            Backend::Gpio { value_file } => self.poll_gpio(value_file)?,
        };

        if !pulse_seen {
            return match self.last_pulse {
                None => Err(SourceError::NotReady),
                Some(_) => self.emit_from_last_pulse(),
            };
        }

        Ok(self.build_info(Duration::ZERO))
    }

    fn get_status(&self) -> ConnectionStatus {
        ConnectionStatus {
            connected: !matches!(self.backend, Backend::Unopened),
            error_count: self.error_count,
        }
    }

    fn get_config(&self) -> ProtocolConfig {
        ProtocolConfig::Pps(self.config.clone())
    }

    fn protocol_name(&self) -> &'static str {
        "pps"
    }
}

impl PpsSource {
    fn build_info(&self, age: Duration) -> TimeInfo {
        let quality = if age <= STALE_AFTER { 240 } else { 100 };
        TimeInfo {
            timestamp: SystemTime::now(),
            offset: SignedDuration::from_nanos(self.config.cable_delay_ns),
            delay: Duration::from_nanos(self.config.cable_delay_ns.unsigned_abs()),
            quality,
            stratum: 0,
            precision: -6,
            latitude_deg: None,
            longitude_deg: None,
            altitude_m: None,
            fix_type: None,
            satellites_used: None,
        }
    }

    fn emit_from_last_pulse(&self) -> Result<TimeInfo, SourceError> {
        let age = self.last_pulse.map(|t| t.elapsed()).unwrap_or(Duration::MAX);
        Ok(self.build_info(age))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_mode_maps_to_documented_pps_flags() {
        assert_eq!(edge_mode_to_pps_mode(EdgeMode::Rising), PPS_CAPTUREASSERT);
        assert_eq!(edge_mode_to_pps_mode(EdgeMode::Falling), PPS_CAPTURECLEAR);
        assert_eq!(edge_mode_to_pps_mode(EdgeMode::Both), PPS_CAPTUREBOTH);
    }

    #[test]
    fn not_running_before_start() {
        let source = PpsSource::new(PpsConfig {
            device: Some("/dev/pps0".into()),
            gpio_pin: None,
            edge_mode: EdgeMode::Rising,
            cable_delay_ns: 0,
        });
        assert!(matches!(source.get_time_info(), Err(SourceError::NotRunning)));
    }

    #[test]
    fn quality_degrades_when_pulse_is_stale() {
        let source = PpsSource::new(PpsConfig {
            device: None,
            gpio_pin: Some(17),
            edge_mode: EdgeMode::Both,
            cable_delay_ns: 50,
        });
        let fresh = source.build_info(Duration::from_secs(1));
        let stale = source.build_info(Duration::from_secs(6));
        assert_eq!(fresh.quality, 240);
        assert_eq!(stale.quality, 100);
    }
}
