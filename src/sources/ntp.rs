//! An SNTP/NTPv3 client source: builds a 48-byte request, computes offset
//! and delay with the classic four-timestamp formulas (spec §4.5 "NTP").

use crate::config::{NtpConfig, ProtocolConfig};
use crate::error::SourceError;
use crate::sources::{ConnectionStatus, SignedDuration, SourceHandler, TimeInfo};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use std::net::UdpSocket;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const PACKET_LEN: usize = 48;
/// Seconds between the NTP epoch (1900-01-01) and the Unix epoch.
const NTP_UNIX_EPOCH_DELTA: u64 = 2_208_988_800;
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// A 32.32 fixed-point NTP timestamp, kept as raw (seconds, fraction) so the
/// arithmetic below stays exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NtpTimestamp {
    seconds: u32,
    fraction: u32,
}

impl NtpTimestamp {
    fn from_system_time(t: SystemTime) -> NtpTimestamp {
        let since_unix = t.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
        let ntp_seconds = since_unix.as_secs().wrapping_add(NTP_UNIX_EPOCH_DELTA) as u32;
        let fraction = ((since_unix.subsec_nanos() as u64) << 32) / 1_000_000_000;
        NtpTimestamp {
            seconds: ntp_seconds,
            fraction: fraction as u32,
        }
    }

    fn to_nanos_since_unix(self) -> i128 {
        let unix_seconds = self.seconds as i64 - NTP_UNIX_EPOCH_DELTA as i64;
        let frac_nanos = (self.fraction as u128 * 1_000_000_000) >> 32;
        unix_seconds as i128 * 1_000_000_000 + frac_nanos as i128
    }

    fn read(cur: &mut Cursor<&[u8]>) -> std::io::Result<NtpTimestamp> {
        Ok(NtpTimestamp {
            seconds: cur.read_u32::<BigEndian>()?,
            fraction: cur.read_u32::<BigEndian>()?,
        })
    }

    fn write(self, buf: &mut Vec<u8>) {
        buf.write_u32::<BigEndian>(self.seconds).unwrap();
        buf.write_u32::<BigEndian>(self.fraction).unwrap();
    }
}

fn build_request(transmit: SystemTime) -> Vec<u8> {
    let mut buf = Vec::with_capacity(PACKET_LEN);
    // LI=0 (no warning), VN=3, Mode=3 (client).
    buf.push((0 << 6) | (3 << 3) | 3);
    buf.push(0); // stratum (unspecified in requests)
    buf.push(0); // poll
    buf.push(0); // precision
    buf.write_u32::<BigEndian>(0).unwrap(); // root delay
    buf.write_u32::<BigEndian>(0).unwrap(); // root dispersion
    buf.write_u32::<BigEndian>(0).unwrap(); // reference id
    NtpTimestamp { seconds: 0, fraction: 0 }.write(&mut buf); // reference timestamp
    NtpTimestamp { seconds: 0, fraction: 0 }.write(&mut buf); // origin timestamp
    NtpTimestamp { seconds: 0, fraction: 0 }.write(&mut buf); // receive timestamp
    NtpTimestamp::from_system_time(transmit).write(&mut buf); // transmit timestamp
    buf
}

struct ParsedResponse {
    stratum: u8,
    precision: i8,
    origin: NtpTimestamp,
    receive: NtpTimestamp,
    transmit: NtpTimestamp,
}

fn parse_response(raw: &[u8]) -> Result<ParsedResponse, SourceError> {
    if raw.len() < PACKET_LEN {
        return Err(SourceError::Decode(format!("short ntp packet: {} bytes", raw.len())));
    }
    let mut cur = Cursor::new(raw);
    let first = cur.read_u8().map_err(decode_err)?;
    let mode = first & 0x7;
    if mode != 4 && mode != 5 {
        return Err(SourceError::Decode(format!("unexpected ntp mode {mode} in response")));
    }
    let stratum = cur.read_u8().map_err(decode_err)?;
    let _poll = cur.read_u8().map_err(decode_err)?;
    let precision = cur.read_i8().map_err(decode_err)?;
    let _root_delay = cur.read_u32::<BigEndian>().map_err(decode_err)?;
    let _root_dispersion = cur.read_u32::<BigEndian>().map_err(decode_err)?;
    let _reference_id = cur.read_u32::<BigEndian>().map_err(decode_err)?;
    let _reference_timestamp = NtpTimestamp::read(&mut cur).map_err(decode_err)?;
    let origin = NtpTimestamp::read(&mut cur).map_err(decode_err)?;
    let receive = NtpTimestamp::read(&mut cur).map_err(decode_err)?;
    let transmit = NtpTimestamp::read(&mut cur).map_err(decode_err)?;

    Ok(ParsedResponse {
        stratum,
        precision,
        origin,
        receive,
        transmit,
    })
}

fn decode_err(e: std::io::Error) -> SourceError {
    SourceError::Decode(e.to_string())
}

fn quality_from_stratum(stratum: u8) -> u8 {
    255i32.saturating_sub(stratum as i32 * 10).max(0) as u8
}

pub struct NtpSource {
    config: NtpConfig,
    socket: Option<UdpSocket>,
    error_count: u64,
}

impl NtpSource {
    pub fn new(config: NtpConfig) -> NtpSource {
        NtpSource {
            config,
            socket: None,
            error_count: 0,
        }
    }
}

impl SourceHandler for NtpSource {
    fn start(&mut self) -> Result<(), SourceError> {
        if self.socket.is_some() {
            return Err(SourceError::AlreadyRunning);
        }
        let socket = UdpSocket::bind("0.0.0.0:0")
            .map_err(|e| SourceError::ResourceAcquisition(format!("bind ntp client socket: {e}")))?;
        socket
            .set_read_timeout(Some(READ_TIMEOUT))
            .map_err(|e| SourceError::ResourceAcquisition(e.to_string()))?;
        socket
            .connect((self.config.ip.as_str(), 123))
            .map_err(|e| SourceError::ResourceAcquisition(format!("connect to {}: {e}", self.config.ip)))?;
        self.socket = Some(socket);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), SourceError> {
        self.socket = None;
        Ok(())
    }

    fn get_time_info(&self) -> Result<TimeInfo, SourceError> {
        let socket = self.socket.as_ref().ok_or(SourceError::NotRunning)?;

        let t1 = SystemTime::now();
        let request = build_request(t1);
        socket
            .send(&request)
            .map_err(|e| SourceError::Transient(format!("send failed: {e}")))?;

        let mut buf = [0u8; 512];
        let n = socket
            .recv(&mut buf)
            .map_err(|e| SourceError::Transient(format!("recv failed: {e}")))?;
        let t4 = SystemTime::now();

        let parsed = parse_response(&buf[..n])?;

        let t1n = NtpTimestamp::from_system_time(t1).to_nanos_since_unix();
        let t2n = parsed.receive.to_nanos_since_unix();
        let t3n = parsed.transmit.to_nanos_since_unix();
        let t4n = NtpTimestamp::from_system_time(t4).to_nanos_since_unix();

        let offset_ns = ((t2n - t1n) + (t3n - t4n)) / 2;
        let delay_ns = ((t4n - t1n) - (t3n - t2n)).max(0);

        let _ = parsed.origin; // present for completeness; not used in the formulas above

        Ok(TimeInfo {
            timestamp: t4,
            offset: SignedDuration::from_nanos(offset_ns as i64),
            delay: Duration::from_nanos(delay_ns as u64),
            quality: quality_from_stratum(parsed.stratum),
            stratum: parsed.stratum,
            precision: parsed.precision,
            latitude_deg: None,
            longitude_deg: None,
            altitude_m: None,
            fix_type: None,
            satellites_used: None,
        })
    }

    fn get_status(&self) -> ConnectionStatus {
        ConnectionStatus {
            connected: self.socket.is_some(),
            error_count: self.error_count,
        }
    }

    fn get_config(&self) -> ProtocolConfig {
        ProtocolConfig::Ntp(self.config.clone())
    }

    fn protocol_name(&self) -> &'static str {
        "ntp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_has_li0_vn3_mode3() {
        let req = build_request(SystemTime::now());
        assert_eq!(req.len(), PACKET_LEN);
        assert_eq!(req[0], 0b00_011_011);
    }

    #[test]
    fn ntp_timestamp_round_trips_through_nanos() {
        let t = UNIX_EPOCH + Duration::new(1_700_000_000, 500_000_000);
        let ntp = NtpTimestamp::from_system_time(t);
        let nanos = ntp.to_nanos_since_unix();
        assert_eq!(nanos / 1_000_000_000, 1_700_000_000);
        // sub-second precision is only ~232 picoseconds, allow small error
        assert!((nanos % 1_000_000_000 - 500_000_000).abs() < 10);
    }

    #[test]
    fn quality_formula_clamps_at_zero() {
        assert_eq!(quality_from_stratum(0), 255);
        assert_eq!(quality_from_stratum(1), 245);
        assert_eq!(quality_from_stratum(30), 0);
    }

    #[test]
    fn parse_response_rejects_short_packets() {
        let buf = [0u8; 10];
        assert!(parse_response(&buf).is_err());
    }

    #[test]
    fn parse_response_rejects_client_mode_replies() {
        let mut buf = vec![0u8; PACKET_LEN];
        buf[0] = 3; // mode 3 (client) is not a valid server reply
        assert!(parse_response(&buf).is_err());
    }
}
