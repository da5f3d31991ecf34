//! PTP (IEEE-1588-2008) wire codec: a 34-byte common header plus a
//! variable trailing body (spec §3).
//!
//! All multi-byte integers are big-endian. Timestamps are a 6-byte seconds
//! field followed by a 4-byte nanoseconds field, both big-endian. Messages
//! shorter than 34 bytes, or whose `domain` differs from the configured
//! domain, are discarded silently by the caller (spec §4.4) — this module
//! only returns decode errors, it does not know the configured domain.

use crate::error::PtpError;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

pub const HEADER_LEN: usize = 34;
pub const PTP_VERSION: u8 = 2;
pub const PORT_IDENTITY_LEN: usize = 10;

/// Port states of the PTP ordinary-clock state machine (spec §4.4). The
/// core only ever transitions through Initializing/Listening/Slave; the
/// rest exist so a decoded Announce or a misconfiguration can be named.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Initializing,
    Faulty,
    Disabled,
    Listening,
    PreMaster,
    Master,
    Passive,
    Uncalibrated,
    Slave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Sync,
    DelayReq,
    PDelayReq,
    PDelayResp,
    FollowUp,
    DelayResp,
    PDelayRespFollowUp,
    Announce,
    Signaling,
    Management,
}

impl MessageType {
    fn from_nibble(n: u8) -> Result<MessageType, PtpError> {
        Ok(match n {
            0x0 => MessageType::Sync,
            0x1 => MessageType::DelayReq,
            0x2 => MessageType::PDelayReq,
            0x3 => MessageType::PDelayResp,
            0x8 => MessageType::FollowUp,
            0x9 => MessageType::DelayResp,
            0xA => MessageType::PDelayRespFollowUp,
            0xB => MessageType::Announce,
            0xC => MessageType::Signaling,
            0xD => MessageType::Management,
            other => return Err(PtpError::InvalidPacket(format!("unknown message type nibble {other:#x}"))),
        })
    }

    fn to_nibble(self) -> u8 {
        match self {
            MessageType::Sync => 0x0,
            MessageType::DelayReq => 0x1,
            MessageType::PDelayReq => 0x2,
            MessageType::PDelayResp => 0x3,
            MessageType::FollowUp => 0x8,
            MessageType::DelayResp => 0x9,
            MessageType::PDelayRespFollowUp => 0xA,
            MessageType::Announce => 0xB,
            MessageType::Signaling => 0xC,
            MessageType::Management => 0xD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortIdentity {
    pub clock_identity: [u8; 8],
    pub port_number: u16,
}

impl PortIdentity {
    fn decode(cur: &mut Cursor<&[u8]>) -> Result<PortIdentity, PtpError> {
        let mut clock_identity = [0u8; 8];
        cur.read_exact(&mut clock_identity)
            .map_err(|e| PtpError::InvalidPacket(e.to_string()))?;
        let port_number = cur.read_u16::<BigEndian>().map_err(|e| PtpError::InvalidPacket(e.to_string()))?;
        Ok(PortIdentity { clock_identity, port_number })
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.clock_identity);
        buf.write_u16::<BigEndian>(self.port_number).unwrap();
    }
}

/// The common 34-byte header (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtpHeader {
    pub message_type: MessageType,
    pub version: u8,
    pub length: u16,
    pub domain: u8,
    pub flags: u16,
    /// Signed fixed-point nanoseconds, scaled by 2^-16 (the raw 64-bit
    /// field as transmitted on the wire).
    pub correction_field_raw: i64,
    pub source_port_identity: PortIdentity,
    pub sequence_id: u16,
    pub control: u8,
    pub log_message_interval: i8,
}

impl PtpHeader {
    /// `correction_field` in whole nanoseconds, rounded toward zero.
    pub fn correction_ns(&self) -> i64 {
        self.correction_field_raw >> 16
    }

    fn decode(cur: &mut Cursor<&[u8]>) -> Result<PtpHeader, PtpError> {
        let b0 = cur.read_u8().map_err(|e| PtpError::InvalidPacket(e.to_string()))?;
        let message_type = MessageType::from_nibble(b0 & 0x0F)?;

        let b1 = cur.read_u8().map_err(|e| PtpError::InvalidPacket(e.to_string()))?;
        let version = b1 & 0x0F;
        if version != PTP_VERSION {
            return Err(PtpError::InvalidPacket(format!("unsupported PTP version {version}")));
        }

        let length = cur.read_u16::<BigEndian>().map_err(|e| PtpError::InvalidPacket(e.to_string()))?;
        let domain = cur.read_u8().map_err(|e| PtpError::InvalidPacket(e.to_string()))?;
        let _reserved1 = cur.read_u8().map_err(|e| PtpError::InvalidPacket(e.to_string()))?;
        let flags = cur.read_u16::<BigEndian>().map_err(|e| PtpError::InvalidPacket(e.to_string()))?;
        let correction_field_raw = cur.read_i64::<BigEndian>().map_err(|e| PtpError::InvalidPacket(e.to_string()))?;
        let _reserved2 = cur.read_u32::<BigEndian>().map_err(|e| PtpError::InvalidPacket(e.to_string()))?;
        let source_port_identity = PortIdentity::decode(cur)?;
        let sequence_id = cur.read_u16::<BigEndian>().map_err(|e| PtpError::InvalidPacket(e.to_string()))?;
        let control = cur.read_u8().map_err(|e| PtpError::InvalidPacket(e.to_string()))?;
        let log_message_interval = cur.read_i8().map_err(|e| PtpError::InvalidPacket(e.to_string()))?;

        Ok(PtpHeader {
            message_type,
            version,
            length,
            domain,
            flags,
            correction_field_raw,
            source_port_identity,
            sequence_id,
            control,
            log_message_interval,
        })
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.message_type.to_nibble() & 0x0F);
        buf.push(self.version & 0x0F);
        buf.write_u16::<BigEndian>(self.length).unwrap();
        buf.push(self.domain);
        buf.push(0); // reserved
        buf.write_u16::<BigEndian>(self.flags).unwrap();
        buf.write_i64::<BigEndian>(self.correction_field_raw).unwrap();
        buf.write_u32::<BigEndian>(0).unwrap(); // reserved
        self.source_port_identity.encode(buf);
        buf.write_u16::<BigEndian>(self.sequence_id).unwrap();
        buf.push(self.control);
        buf.write_i8(self.log_message_interval).unwrap();
    }
}

/// A full PTP message: header plus raw trailing body bytes. Callers
/// interpret the body according to `header.message_type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtpMessage {
    pub header: PtpHeader,
    pub body: Vec<u8>,
}

impl PtpMessage {
    pub fn decode(raw: &[u8]) -> Result<PtpMessage, PtpError> {
        if raw.len() < HEADER_LEN {
            return Err(PtpError::InvalidPacket(format!(
                "packet too short: {} bytes, need at least {HEADER_LEN}",
                raw.len()
            )));
        }
        let mut cur = Cursor::new(raw);
        let header = PtpHeader::decode(&mut cur)?;

        if (header.length as usize) < HEADER_LEN {
            return Err(PtpError::InvalidPacket(format!(
                "declared length {} is shorter than the header ({HEADER_LEN} bytes)",
                header.length
            )));
        }
        if header.length as usize > raw.len() {
            return Err(PtpError::InvalidPacket(format!(
                "declared length {} exceeds received {} bytes",
                header.length,
                raw.len()
            )));
        }

        let body_end = (header.length as usize).min(raw.len());
        let body = raw[HEADER_LEN..body_end].to_vec();
        Ok(PtpMessage { header, body })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.body.len());
        let mut header = self.header;
        header.length = (HEADER_LEN + self.body.len()) as u16;
        header.encode(&mut buf);
        buf.extend_from_slice(&self.body);
        buf
    }
}

/// Encodes a PTP timestamp: 6-byte seconds (big-endian) + 4-byte
/// nanoseconds (big-endian).
pub fn encode_timestamp(seconds: u64, nanos: u32) -> [u8; 10] {
    let mut out = [0u8; 10];
    let sec_bytes = seconds.to_be_bytes(); // 8 bytes, take the low 6
    out[0..6].copy_from_slice(&sec_bytes[2..8]);
    out[6..10].copy_from_slice(&nanos.to_be_bytes());
    out
}

/// Decodes a PTP timestamp. Returns an error if fewer than 10 bytes remain.
pub fn decode_timestamp(raw: &[u8]) -> Result<(u64, u32), PtpError> {
    if raw.len() < 10 {
        return Err(PtpError::InvalidPacket("timestamp field too short".into()));
    }
    let mut sec_bytes = [0u8; 8];
    sec_bytes[2..8].copy_from_slice(&raw[0..6]);
    let seconds = u64::from_be_bytes(sec_bytes);
    let nanos = u32::from_be_bytes(raw[6..10].try_into().unwrap());
    Ok((seconds, nanos))
}

/// Announce message body fields relevant to BMCA (spec §3's
/// `AnnounceDataSet`), decoded from a raw Announce body.
pub struct AnnounceBody {
    pub origin_timestamp: (u64, u32),
    pub current_utc_offset: i16,
    pub grandmaster_priority1: u8,
    pub grandmaster_clock_quality: ClockQuality,
    pub grandmaster_priority2: u8,
    pub grandmaster_identity: [u8; 8],
    pub steps_removed: u16,
    pub time_source: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockQuality {
    pub clock_class: u8,
    pub clock_accuracy: u8,
    pub offset_scaled_log_variance: u16,
}

impl AnnounceBody {
    pub fn decode(body: &[u8]) -> Result<AnnounceBody, PtpError> {
        if body.len() < 20 {
            return Err(PtpError::InvalidPacket(format!("announce body too short: {} bytes", body.len())));
        }
        let origin_timestamp = decode_timestamp(&body[0..10])?;
        let mut cur = Cursor::new(&body[10..]);
        let current_utc_offset = cur.read_i16::<BigEndian>().map_err(|e| PtpError::InvalidPacket(e.to_string()))?;
        let _reserved = cur.read_u8().map_err(|e| PtpError::InvalidPacket(e.to_string()))?;
        let grandmaster_priority1 = cur.read_u8().map_err(|e| PtpError::InvalidPacket(e.to_string()))?;
        let clock_class = cur.read_u8().map_err(|e| PtpError::InvalidPacket(e.to_string()))?;
        let clock_accuracy = cur.read_u8().map_err(|e| PtpError::InvalidPacket(e.to_string()))?;
        let offset_scaled_log_variance = cur.read_u16::<BigEndian>().map_err(|e| PtpError::InvalidPacket(e.to_string()))?;
        let grandmaster_priority2 = cur.read_u8().map_err(|e| PtpError::InvalidPacket(e.to_string()))?;
        let mut grandmaster_identity = [0u8; 8];
        cur.read_exact(&mut grandmaster_identity)
            .map_err(|e| PtpError::InvalidPacket(e.to_string()))?;
        let steps_removed = cur.read_u16::<BigEndian>().map_err(|e| PtpError::InvalidPacket(e.to_string()))?;
        let time_source = cur.read_u8().map_err(|e| PtpError::InvalidPacket(e.to_string()))?;

        Ok(AnnounceBody {
            origin_timestamp,
            current_utc_offset,
            grandmaster_priority1,
            grandmaster_clock_quality: ClockQuality {
                clock_class,
                clock_accuracy,
                offset_scaled_log_variance,
            },
            grandmaster_priority2,
            grandmaster_identity,
            steps_removed,
            time_source,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(20);
        buf.extend_from_slice(&encode_timestamp(self.origin_timestamp.0, self.origin_timestamp.1));
        buf.write_i16::<BigEndian>(self.current_utc_offset).unwrap();
        buf.push(0);
        buf.push(self.grandmaster_priority1);
        buf.push(self.grandmaster_clock_quality.clock_class);
        buf.push(self.grandmaster_clock_quality.clock_accuracy);
        buf.write_u16::<BigEndian>(self.grandmaster_clock_quality.offset_scaled_log_variance).unwrap();
        buf.push(self.grandmaster_priority2);
        buf.extend_from_slice(&self.grandmaster_identity);
        buf.write_u16::<BigEndian>(self.steps_removed).unwrap();
        buf.push(self.time_source);
        buf
    }
}

/// A Follow-Up body carries only the precise origin timestamp.
pub fn decode_followup_body(body: &[u8]) -> Result<(u64, u32), PtpError> {
    decode_timestamp(body)
}

pub fn encode_followup_body(seconds: u64, nanos: u32) -> Vec<u8> {
    encode_timestamp(seconds, nanos).to_vec()
}

/// A Delay-Resp body: receive timestamp followed by the requesting port
/// identity.
pub struct DelayRespBody {
    pub receive_timestamp: (u64, u32),
    pub requesting_port_identity: PortIdentity,
}

impl DelayRespBody {
    pub fn decode(body: &[u8]) -> Result<DelayRespBody, PtpError> {
        if body.len() < 10 + PORT_IDENTITY_LEN {
            return Err(PtpError::InvalidPacket("delay-resp body too short".into()));
        }
        let receive_timestamp = decode_timestamp(&body[0..10])?;
        let mut cur = Cursor::new(&body[10..]);
        let requesting_port_identity = PortIdentity::decode(&mut cur)?;
        Ok(DelayRespBody {
            receive_timestamp,
            requesting_port_identity,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(10 + PORT_IDENTITY_LEN);
        buf.extend_from_slice(&encode_timestamp(self.receive_timestamp.0, self.receive_timestamp.1));
        self.requesting_port_identity.encode(&mut buf);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header(message_type: MessageType, sequence_id: u16) -> PtpHeader {
        PtpHeader {
            message_type,
            version: PTP_VERSION,
            length: 0, // filled in by encode()
            domain: 0,
            flags: 0,
            correction_field_raw: 12345,
            source_port_identity: PortIdentity {
                clock_identity: [1, 2, 3, 4, 5, 6, 7, 8],
                port_number: 1,
            },
            sequence_id,
            control: 0,
            log_message_interval: 0,
        }
    }

    #[test]
    fn header_round_trips() {
        let header = sample_header(MessageType::Sync, 42);
        let msg = PtpMessage { header, body: vec![0xAA; 10] };
        let encoded = msg.encode();
        let decoded = PtpMessage::decode(&encoded).unwrap();
        assert_eq!(decoded.header.message_type, MessageType::Sync);
        assert_eq!(decoded.header.sequence_id, 42);
        assert_eq!(decoded.header.version, PTP_VERSION);
        assert_eq!(decoded.header.correction_field_raw, 12345);
        assert_eq!(decoded.body, vec![0xAA; 10]);
    }

    #[test]
    fn timestamp_round_trips_for_representable_range() {
        for (sec, ns) in [(0u64, 0u32), (1, 999_999_999), (1 << 40, 500_000), ((1u64 << 48) - 1, 0)] {
            let encoded = encode_timestamp(sec, ns);
            let (dsec, dns) = decode_timestamp(&encoded).unwrap();
            assert_eq!(dsec, sec);
            assert_eq!(dns, ns);
        }
    }

    #[test]
    fn rejects_short_packets() {
        let raw = [0u8; 10];
        assert!(PtpMessage::decode(&raw).is_err());
    }

    #[test]
    fn rejects_wrong_version() {
        let mut header = sample_header(MessageType::Announce, 1);
        header.version = 1;
        let mut buf = Vec::new();
        buf.push(header.message_type.to_nibble());
        buf.push(header.version);
        buf.resize(HEADER_LEN, 0);
        assert!(PtpMessage::decode(&buf).is_err());
    }

    #[test]
    fn announce_body_round_trips() {
        let body = AnnounceBody {
            origin_timestamp: (1000, 500),
            current_utc_offset: 37,
            grandmaster_priority1: 128,
            grandmaster_clock_quality: ClockQuality {
                clock_class: 248,
                clock_accuracy: 0x20,
                offset_scaled_log_variance: 0xFFFF,
            },
            grandmaster_priority2: 128,
            grandmaster_identity: [0xAA; 8],
            steps_removed: 0,
            time_source: 0xA0,
        };
        let encoded = body.encode();
        let decoded = AnnounceBody::decode(&encoded).unwrap();
        assert_eq!(decoded.grandmaster_priority1, 128);
        assert_eq!(decoded.grandmaster_clock_quality.clock_class, 248);
        assert_eq!(decoded.grandmaster_identity, [0xAA; 8]);
    }

    #[test]
    fn correction_ns_shifts_fixed_point() {
        let header = PtpHeader {
            correction_field_raw: 5i64 << 16,
            ..sample_header(MessageType::Sync, 0)
        };
        assert_eq!(header.correction_ns(), 5);
    }
}
