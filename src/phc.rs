//! `PhcClock`: reads a hardware PTP clock device (`/dev/ptpN`) and measures
//! its offset against the system clock (spec §4.2).
//!
//! Struct layouts and ioctl numbers mirror `linux/ptp_clock.h`.

use crate::error::PhcError;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const PTP_CLK_MAGIC: u8 = b'=';
const PTP_MAX_SAMPLES: usize = 25;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct PtpClockTime {
    sec: i64,
    nsec: u32,
    reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct PtpClockCaps {
    max_adj: i32,
    n_alarm: i32,
    n_ext_ts: i32,
    n_per_out: i32,
    pps: i32,
    n_pins: i32,
    cross_timestamping: i32,
    adjust_phase: i32,
    rsv: [i32; 12],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct PtpSysOffset {
    n_samples: u32,
    rsv: [u32; 3],
    ts: [PtpClockTime; 2 * PTP_MAX_SAMPLES + 1],
}

impl Default for PtpSysOffset {
    fn default() -> Self {
        PtpSysOffset {
            n_samples: 1,
            rsv: [0; 3],
            ts: [PtpClockTime::default(); 2 * PTP_MAX_SAMPLES + 1],
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
struct PtpSysOffsetExtended {
    n_samples: u32,
    rsv: [u32; 3],
    // [sys_before, phc, sys_after] per sample.
    ts: [[PtpClockTime; 3]; PTP_MAX_SAMPLES],
}

impl Default for PtpSysOffsetExtended {
    fn default() -> Self {
        PtpSysOffsetExtended {
            n_samples: 1,
            rsv: [0; 3],
            ts: [[PtpClockTime::default(); 3]; PTP_MAX_SAMPLES],
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct PtpExttsRequest {
    index: u32,
    flags: u32,
    rsv: [u32; 2],
}

const PTP_EXTTS_ENABLE: u32 = 1 << 0;

nix::ioctl_read!(ptp_clock_getcaps, PTP_CLK_MAGIC, 1, PtpClockCaps);
nix::ioctl_readwrite!(ptp_sys_offset_ioctl, PTP_CLK_MAGIC, 5, PtpSysOffset);
nix::ioctl_readwrite!(ptp_sys_offset_extended_ioctl, PTP_CLK_MAGIC, 9, PtpSysOffsetExtended);
nix::ioctl_write_ptr!(ptp_extts_request_ioctl, PTP_CLK_MAGIC, 10, PtpExttsRequest);

/// Capabilities cached from `PTP_CLOCK_GETCAPS` at open time (spec §4.2).
#[derive(Debug, Clone, Copy)]
pub struct PhcCapabilities {
    pub max_adj_ppb: i64,
    pub n_ext_ts: u32,
    pub n_per_out: u32,
    pub pps_available: bool,
    pub n_channels: u32,
    pub cross_ts_available: bool,
}

/// A single offset measurement: the signed offset plus the raw timestamps
/// it was derived from.
#[derive(Debug, Clone, Copy)]
pub struct PhcOffsetSample {
    pub offset_ns: i64,
    pub sys_before: SystemTime,
    pub sys_after: SystemTime,
    pub phc_time: SystemTime,
}

pub struct PhcClock {
    file: File,
    capabilities: PhcCapabilities,
}

fn clock_time_to_system_time(t: PtpClockTime) -> SystemTime {
    if t.sec >= 0 {
        UNIX_EPOCH + Duration::new(t.sec as u64, t.nsec)
    } else {
        UNIX_EPOCH - Duration::new((-t.sec) as u64, 0) + Duration::from_nanos(t.nsec as u64)
    }
}

fn midpoint(a: SystemTime, b: SystemTime) -> SystemTime {
    match b.duration_since(a) {
        Ok(delta) => a + delta / 2,
        Err(e) => a - e.duration() / 2,
    }
}

fn signed_nanos_between(earlier: SystemTime, later: SystemTime) -> i64 {
    match later.duration_since(earlier) {
        Ok(d) => d.as_nanos() as i64,
        Err(e) => -(e.duration().as_nanos() as i64),
    }
}

impl PhcClock {
    /// Opens `/dev/ptpN` read-write and caches its capabilities (spec §4.2
    /// `open`). Resource acquisition failure is fatal for the owning source
    /// handler.
    pub fn open(device_path: &Path) -> Result<PhcClock, PhcError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(device_path)
            .map_err(|e| PhcError::IoctlFailed(format!("open {}: {e}", device_path.display())))?;

        let mut caps = PtpClockCaps::default();
        unsafe { ptp_clock_getcaps(file.as_raw_fd(), &mut caps) }
            .map_err(|e| PhcError::IoctlFailed(format!("PTP_CLOCK_GETCAPS: {e}")))?;

        let capabilities = PhcCapabilities {
            max_adj_ppb: caps.max_adj as i64,
            n_ext_ts: caps.n_ext_ts.max(0) as u32,
            n_per_out: caps.n_per_out.max(0) as u32,
            pps_available: caps.pps != 0,
            n_channels: caps.n_pins.max(0) as u32,
            cross_ts_available: caps.cross_timestamping != 0,
        };

        Ok(PhcClock { file, capabilities })
    }

    pub fn capabilities(&self) -> PhcCapabilities {
        self.capabilities
    }

    /// Measures the PHC-to-system offset (spec §4.2 `measure_offset`):
    /// `offset = phc_time - (sys_before + (sys_after - sys_before) / 2)`.
    pub fn measure_offset(&self) -> Result<PhcOffsetSample, PhcError> {
        let (sys_before, phc_time, sys_after) = if self.capabilities.cross_ts_available {
            self.measure_offset_extended()?
        } else {
            self.measure_offset_basic()?
        };

        let mid = midpoint(sys_before, sys_after);
        let offset_ns = signed_nanos_between(mid, phc_time);

        Ok(PhcOffsetSample {
            offset_ns,
            sys_before,
            sys_after,
            phc_time,
        })
    }

    fn measure_offset_basic(&self) -> Result<(SystemTime, SystemTime, SystemTime), PhcError> {
        let mut req = PtpSysOffset { n_samples: 1, ..Default::default() };
        unsafe { ptp_sys_offset_ioctl(self.file.as_raw_fd(), &mut req) }
            .map_err(|e| PhcError::IoctlFailed(format!("PTP_SYS_OFFSET: {e}")))?;

        // ts layout: [sys_before_0, phc_0, sys_after_0, sys_before_1, ...]
        let sys_before = clock_time_to_system_time(req.ts[0]);
        let phc_time = clock_time_to_system_time(req.ts[1]);
        let sys_after = clock_time_to_system_time(req.ts[2]);
        Ok((sys_before, phc_time, sys_after))
    }

    fn measure_offset_extended(&self) -> Result<(SystemTime, SystemTime, SystemTime), PhcError> {
        let mut req = PtpSysOffsetExtended { n_samples: 1, ..Default::default() };
        unsafe { ptp_sys_offset_extended_ioctl(self.file.as_raw_fd(), &mut req) }
            .map_err(|e| PhcError::IoctlFailed(format!("PTP_SYS_OFFSET_EXTENDED: {e}")))?;

        let [sys_before, phc, sys_after] = req.ts[0];
        Ok((
            clock_time_to_system_time(sys_before),
            clock_time_to_system_time(phc),
            clock_time_to_system_time(sys_after),
        ))
    }

    /// Adjusts the PHC's free-running frequency, refusing anything beyond
    /// the cached `max_adj_ppb` (spec §4.2 `adjust_frequency`). The kernel
    /// fixed-point conversion is `ppb * 65536 / 1_000_000`.
    pub fn adjust_frequency(&self, ppb: i64) -> Result<(), PhcError> {
        if ppb.abs() > self.capabilities.max_adj_ppb {
            return Err(PhcError::AdjustmentOutOfRange {
                requested_ppb: ppb,
                max_ppb: self.capabilities.max_adj_ppb,
            });
        }

        let freq_fixed_point = (ppb as i128 * 65536 / 1_000_000) as i64;
        let mut tx: libc::timex = unsafe { std::mem::zeroed() };
        tx.modes = libc::ADJ_FREQUENCY as u32;
        tx.freq = freq_fixed_point as libc::c_long;

        let ret = unsafe { libc::clock_adjtime(self.clock_id(), &mut tx) };
        if ret < 0 {
            return Err(PhcError::IoctlFailed(format!(
                "clock_adjtime(ADJ_FREQUENCY): {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    /// Enables or disables an external timestamp channel (spec §4.2
    /// `enable_ext_ts`), refusing an out-of-range index.
    pub fn enable_ext_ts(&self, index: u32, enable: bool) -> Result<(), PhcError> {
        if index >= self.capabilities.n_ext_ts {
            return Err(PhcError::ExtTsIndexOutOfRange {
                index,
                n_ext_ts: self.capabilities.n_ext_ts,
            });
        }

        let mut req = PtpExttsRequest {
            index,
            flags: if enable { PTP_EXTTS_ENABLE } else { 0 },
            rsv: [0; 2],
        };
        unsafe { ptp_extts_request_ioctl(self.file.as_raw_fd(), &mut req) }
            .map_err(|e| PhcError::IoctlFailed(format!("PTP_EXTTS_REQUEST: {e}")))?;
        Ok(())
    }

    /// `/dev/ptpN`'s `clockid_t`, derived the same way the kernel's
    /// `ptp4l` does: `(~fd << 3) | 3` (`CLOCKFD` encoding).
    fn clock_id(&self) -> libc::clockid_t {
        const CLOCKFD: libc::c_int = 3;
        ((!self.file.as_raw_fd()) << 3) | CLOCKFD
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_time_conversion_round_trips_positive_seconds() {
        let t = PtpClockTime { sec: 1_700_000_000, nsec: 123_456_789, reserved: 0 };
        let st = clock_time_to_system_time(t);
        let back = st.duration_since(UNIX_EPOCH).unwrap();
        assert_eq!(back.as_secs(), 1_700_000_000);
        assert_eq!(back.subsec_nanos(), 123_456_789);
    }

    #[test]
    fn midpoint_is_halfway_between_two_instants() {
        let a = UNIX_EPOCH + Duration::from_secs(100);
        let b = UNIX_EPOCH + Duration::from_secs(200);
        assert_eq!(midpoint(a, b), UNIX_EPOCH + Duration::from_secs(150));
    }

    #[test]
    fn signed_nanos_between_is_negative_when_later_precedes_earlier() {
        let a = UNIX_EPOCH + Duration::from_secs(200);
        let b = UNIX_EPOCH + Duration::from_secs(100);
        assert_eq!(signed_nanos_between(a, b), -100_000_000_000);
    }

    #[test]
    fn ppb_to_fixed_point_matches_kernel_formula() {
        let ppb = 1_000_000i64;
        let fixed = (ppb as i128 * 65536 / 1_000_000) as i64;
        assert_eq!(fixed, 65536);
    }
}
