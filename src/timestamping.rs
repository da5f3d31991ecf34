//! Hardware + software RX/TX timestamping for PTP UDP sockets (spec §4.3).
//!
//! Enables `SO_TIMESTAMPING` with the hardware/software/raw-hardware flags,
//! then extracts the three-timespec `SCM_TIMESTAMPING` ancillary block from
//! each received datagram: `[0]` software, `[1]` legacy hardware (unused),
//! `[2]` raw hardware. Policy: prefer `[2]` if non-zero, else `[0]`, else
//! fall back to the wall clock at receipt.

use anyhow::Result;
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::io::RawFd;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[cfg(target_os = "linux")]
const SOF_TIMESTAMPING_RX_HARDWARE: libc::c_uint = 1 << 2;
#[cfg(target_os = "linux")]
const SOF_TIMESTAMPING_TX_HARDWARE: libc::c_uint = 1 << 0;
#[cfg(target_os = "linux")]
const SOF_TIMESTAMPING_RX_SOFTWARE: libc::c_uint = 1 << 3;
#[cfg(target_os = "linux")]
const SOF_TIMESTAMPING_TX_SOFTWARE: libc::c_uint = 1 << 1;
#[cfg(target_os = "linux")]
const SOF_TIMESTAMPING_RAW_HARDWARE: libc::c_uint = 1 << 6;
#[cfg(target_os = "linux")]
const SOF_TIMESTAMPING_OPT_CMSG: libc::c_uint = 1 << 10;
#[cfg(target_os = "linux")]
const SO_TIMESTAMPING: libc::c_int = 37;

/// Enables the flag combination spec §4.3 names:
/// `SOF_TIMESTAMPING_{RX,TX}_HARDWARE | *_SOFTWARE | RAW_HARDWARE`.
#[cfg(target_os = "linux")]
pub fn enable_timestamping(fd: RawFd) -> Result<()> {
    let flags: libc::c_uint = SOF_TIMESTAMPING_RX_HARDWARE
        | SOF_TIMESTAMPING_TX_HARDWARE
        | SOF_TIMESTAMPING_RX_SOFTWARE
        | SOF_TIMESTAMPING_TX_SOFTWARE
        | SOF_TIMESTAMPING_RAW_HARDWARE
        | SOF_TIMESTAMPING_OPT_CMSG;

    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            SO_TIMESTAMPING,
            &flags as *const _ as *const libc::c_void,
            std::mem::size_of_val(&flags) as libc::socklen_t,
        )
    };
    if ret < 0 {
        anyhow::bail!("setsockopt(SO_TIMESTAMPING) failed: {}", std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn enable_timestamping(_fd: RawFd) -> Result<()> {
    Ok(())
}

/// The three-timespec `SCM_TIMESTAMPING` ancillary block.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScmTimestamping {
    pub software: Option<Duration>,
    pub legacy_hardware: Option<Duration>,
    pub raw_hardware: Option<Duration>,
}

impl ScmTimestamping {
    /// Parses three back-to-back `timespec` structs as laid out by
    /// `SCM_TIMESTAMPING`.
    pub fn parse(raw: &[libc::timespec; 3]) -> ScmTimestamping {
        let to_duration = |ts: &libc::timespec| -> Option<Duration> {
            if ts.tv_sec == 0 && ts.tv_nsec == 0 {
                None
            } else {
                Some(Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32))
            }
        };

        ScmTimestamping {
            software: to_duration(&raw[0]),
            legacy_hardware: to_duration(&raw[1]),
            raw_hardware: to_duration(&raw[2]),
        }
    }

    /// Applies the §4.3 policy: prefer raw hardware, else software, else the
    /// wall clock at receipt.
    pub fn best_timestamp(&self) -> SystemTime {
        if let Some(raw) = self.raw_hardware {
            if raw != Duration::ZERO {
                return UNIX_EPOCH + raw;
            }
        }
        if let Some(sw) = self.software {
            return UNIX_EPOCH + sw;
        }
        SystemTime::now()
    }
}

/// Receives one datagram, returning the best available timestamp per the
/// §4.3 policy. On Linux this reads via `recvmsg` and extracts the
/// `SCM_TIMESTAMPING` ancillary block; elsewhere it falls back to the wall
/// clock at receipt.
pub fn recv_with_timestamp(socket: &UdpSocket, buf: &mut [u8]) -> Result<(usize, SocketAddr, SystemTime)> {
    #[cfg(target_os = "linux")]
    {
        recv_with_timestamp_linux(socket, buf)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let (n, addr) = socket.recv_from(buf)?;
        Ok((n, addr, SystemTime::now()))
    }
}

#[cfg(target_os = "linux")]
fn recv_with_timestamp_linux(socket: &UdpSocket, buf: &mut [u8]) -> Result<(usize, SocketAddr, SystemTime)> {
    use std::os::unix::io::AsRawFd;

    let fd = socket.as_raw_fd();
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut src_addr: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut cmsg_buf = [0u8; 128];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_name = &mut src_addr as *mut _ as *mut libc::c_void;
    msg.msg_namelen = std::mem::size_of::<libc::sockaddr_storage>() as u32;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len() as _;

    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if n < 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    let mut scm = ScmTimestamping::default();
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            let header = &*cmsg;
            if header.cmsg_level == libc::SOL_SOCKET && header.cmsg_type == SO_TIMESTAMPING {
                let data_ptr = libc::CMSG_DATA(cmsg) as *const libc::timespec;
                let specs = [*data_ptr, *data_ptr.add(1), *data_ptr.add(2)];
                scm = ScmTimestamping::parse(&specs);
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    let addr = sockaddr_storage_to_socket_addr(&src_addr)?;
    Ok((n as usize, addr, scm.best_timestamp()))
}

#[cfg(target_os = "linux")]
fn sockaddr_storage_to_socket_addr(storage: &libc::sockaddr_storage) -> Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let addr_in: libc::sockaddr_in = unsafe { *(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(addr_in.sin_addr.s_addr));
            let port = u16::from_be(addr_in.sin_port);
            Ok(SocketAddr::from((ip, port)))
        }
        other => anyhow::bail!("unsupported address family {other} from recvmsg"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(sec: i64, nsec: i64) -> libc::timespec {
        libc::timespec { tv_sec: sec, tv_nsec: nsec }
    }

    #[test]
    fn prefers_raw_hardware_when_present() {
        let parsed = ScmTimestamping::parse(&[ts(100, 0), ts(0, 0), ts(200, 5)]);
        assert_eq!(parsed.best_timestamp(), UNIX_EPOCH + Duration::new(200, 5));
    }

    #[test]
    fn falls_back_to_software_when_hardware_zero() {
        let parsed = ScmTimestamping::parse(&[ts(100, 7), ts(0, 0), ts(0, 0)]);
        assert_eq!(parsed.best_timestamp(), UNIX_EPOCH + Duration::new(100, 7));
    }

    #[test]
    fn falls_back_to_wall_clock_when_all_zero() {
        let parsed = ScmTimestamping::parse(&[ts(0, 0), ts(0, 0), ts(0, 0)]);
        let before = SystemTime::now();
        let result = parsed.best_timestamp();
        assert!(result >= before);
    }
}
