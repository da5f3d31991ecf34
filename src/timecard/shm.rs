//! SysV shared-memory publisher compatible with the classic NTP/chrony
//! `SHM` refclock layout (spec §4.1 `ShmWriter`).

use crate::error::SourceError;
use std::time::SystemTime;

/// Base key; the configured `shm_segment` index is added to it.
pub const SHM_KEY_BASE: i32 = 0x4E54_5030;

/// Mirrors the classic `struct shmTime` (ntpd/chrony `refclock_shm`): 96
/// bytes with `time_t` fields 8-byte aligned.
#[repr(C)]
struct ShmTime {
    mode: i32,
    count: i32,
    clock_time_stamp_sec: i64,
    clock_time_stamp_usec: i32,
    // The compiler inserts 4 bytes of padding here to 8-align the next i64,
    // matching the real shmTime layout.
    receive_time_stamp_sec: i64,
    receive_time_stamp_usec: i32,
    leap: i32,
    precision: i32,
    nsamples: i32,
    valid: i32,
    clock_time_stamp_nsec: u32,
    receive_time_stamp_nsec: u32,
    dummy: [i32; 8],
}

const _: () = assert!(std::mem::size_of::<ShmTime>() == 96);

/// Attaches (creating if absent, mode 0600) a SysV shared-memory segment
/// keyed `SHM_KEY_BASE + segment` and writes time samples into it using the
/// refclock-SHM write-ordering protocol.
pub struct ShmWriter {
    shmid: libc::c_int,
    ptr: *mut ShmTime,
}

// SAFETY: the segment is only ever touched through `write()`, which
// performs the ordered volatile writes the protocol requires; no other
// process-local aliasing occurs.
unsafe impl Send for ShmWriter {}

impl ShmWriter {
    pub fn attach(segment: u32) -> Result<ShmWriter, SourceError> {
        let key = SHM_KEY_BASE.wrapping_add(segment as i32);
        let size = std::mem::size_of::<ShmTime>();

        let shmid = unsafe { libc::shmget(key, size, libc::IPC_CREAT | 0o600) };
        if shmid < 0 {
            return Err(SourceError::ResourceAcquisition(format!(
                "shmget(key={key:#x}): {}",
                std::io::Error::last_os_error()
            )));
        }

        let ptr = unsafe { libc::shmat(shmid, std::ptr::null(), 0) };
        if ptr as isize == -1 {
            return Err(SourceError::ResourceAcquisition(format!(
                "shmat(shmid={shmid}): {}",
                std::io::Error::last_os_error()
            )));
        }

        Ok(ShmWriter {
            shmid,
            ptr: ptr as *mut ShmTime,
        })
    }

    /// Publishes one sample. Field order matches spec §4.1 exactly:
    /// increment `count` (readers see in-progress), clear `valid`, store
    /// seconds/microseconds/nanoseconds twice (clock and receive), store
    /// leap/precision/nsamples, set `valid = 1`, increment `count` again.
    pub fn write(&self, clock_time: SystemTime, receive_time: SystemTime) {
        let (clock_sec, clock_usec, clock_nsec) = split_time(clock_time);
        let (recv_sec, recv_usec, recv_nsec) = split_time(receive_time);

        unsafe {
            let p = self.ptr;
            vwrite(&mut (*p).count, (*p).count + 1);
            vwrite(&mut (*p).valid, 0);

            vwrite(&mut (*p).clock_time_stamp_sec, clock_sec);
            vwrite(&mut (*p).clock_time_stamp_usec, clock_usec);
            vwrite(&mut (*p).clock_time_stamp_nsec, clock_nsec);
            vwrite(&mut (*p).receive_time_stamp_sec, recv_sec);
            vwrite(&mut (*p).receive_time_stamp_usec, recv_usec);
            vwrite(&mut (*p).receive_time_stamp_nsec, recv_nsec);

            vwrite(&mut (*p).leap, 0);
            vwrite(&mut (*p).precision, -1);
            vwrite(&mut (*p).nsamples, 3);

            vwrite(&mut (*p).valid, 1);
            let count = (*p).count;
            vwrite(&mut (*p).count, count + 1);
        }
    }

    /// Detaches the segment. Per spec §4.1, this does not remove it — the
    /// next attach (by this process or another) reuses it.
    pub fn close(self) {
        unsafe {
            libc::shmdt(self.ptr as *const libc::c_void);
        }
    }
}

unsafe fn vwrite<T: Copy>(dst: &mut T, value: T) {
    std::ptr::write_volatile(dst as *mut T, value);
}

fn split_time(t: SystemTime) -> (i64, i32, u32) {
    let d = t
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or(std::time::Duration::ZERO);
    (d.as_secs() as i64, (d.subsec_micros()) as i32, d.subsec_nanos())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shm_time_struct_is_96_bytes() {
        assert_eq!(std::mem::size_of::<ShmTime>(), 96);
    }

    #[test]
    fn split_time_derives_micros_and_nanos_from_same_instant() {
        let t = std::time::UNIX_EPOCH + std::time::Duration::new(1_700_000_000, 123_456_789);
        let (sec, usec, nsec) = split_time(t);
        assert_eq!(sec, 1_700_000_000);
        assert_eq!(usec, 123_456);
        assert_eq!(nsec, 123_456_789);
    }
}
