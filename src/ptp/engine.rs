//! The PTP ordinary-clock slave state machine (spec §4.4): two multicast
//! UDP sockets, the wire codec in [`crate::ptp::message`], and the BMCA in
//! [`crate::ptp::bmca`].

use crate::config::PtpConfig;
use crate::error::PtpError;
use crate::net;
use crate::ptp::bmca::{self, AnnounceDataSet};
use crate::ptp::message::{
    AnnounceBody, DelayRespBody, MessageType, PortIdentity, PortState, PtpHeader, PtpMessage,
};
use crate::timestamping;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const RECV_BUF_LEN: usize = 1500;
/// Spec §5: "PTP socket read: 1 s (to allow cancellation)".
const SOCKET_READ_TIMEOUT: Duration = Duration::from_secs(1);

fn nanos_since_epoch(t: SystemTime) -> i128 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i128,
        Err(e) => -(e.duration().as_nanos() as i128),
    }
}

fn timestamp_to_nanos(seconds: u64, nanos: u32) -> i128 {
    seconds as i128 * 1_000_000_000 + nanos as i128
}

/// Per-episode timestamps and sequence-matching state. Reset on every
/// master change and every successful/expired episode (spec §3 "Timestamps
/// are reset on master change").
#[derive(Default, Debug)]
struct Episode {
    sync_sequence_id: Option<u16>,
    sync_received_at: Option<Instant>,
    t1: Option<i128>,
    t2: Option<i128>,
    delay_req_sequence_id: Option<u16>,
    t3: Option<i128>,
    t4: Option<i128>,
}

impl Episode {
    fn reset(&mut self) {
        *self = Episode::default();
    }

    fn ready(&self) -> bool {
        self.t1.is_some() && self.t2.is_some() && self.t3.is_some() && self.t4.is_some()
    }
}

/// Measured state the source handler / selection manager reads (spec §4.4
/// "the engine exposes `offset`, `mean_path_delay`, and quality").
#[derive(Debug, Clone, Copy, Default)]
pub struct PtpMeasurement {
    pub offset_ns: i64,
    pub mean_path_delay_ns: i64,
    pub quality: u8,
}

pub struct PtpEngine {
    event_socket: UdpSocket,
    general_socket: UdpSocket,
    domain: u8,
    delay_req_interval: Duration,
    own_identity: PortIdentity,
    port_state: PortState,
    best_master: Option<(AnnounceDataSet, [u8; 8])>,
    episode: Episode,
    next_sequence_id: u16,
    last_delay_req_sent: Option<Instant>,
    last_measurement: Option<PtpMeasurement>,
    error_count: u64,
}

impl PtpEngine {
    /// Joins both sockets to `224.0.1.129` on the configured interface and
    /// enables hardware/software timestamping (spec §4.3, §4.4 "Sockets").
    /// Socket creation failure is fatal (spec §4.4 "Failures").
    pub fn new(config: &PtpConfig, clock_identity: [u8; 8]) -> Result<PtpEngine, PtpError> {
        let interface_ip = net::resolve_interface(&config.interface)
            .map_err(|e| PtpError::SocketCreation(e.to_string()))?;

        let event_socket = net::create_multicast_socket(net::PTP_EVENT_PORT, interface_ip, SOCKET_READ_TIMEOUT)
            .map_err(|e| PtpError::SocketCreation(e.to_string()))?;
        let general_socket = net::create_multicast_socket(net::PTP_GENERAL_PORT, interface_ip, SOCKET_READ_TIMEOUT)
            .map_err(|e| PtpError::SocketCreation(e.to_string()))?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let _ = timestamping::enable_timestamping(event_socket.as_raw_fd());
            let _ = timestamping::enable_timestamping(general_socket.as_raw_fd());
        }

        let delay_req_interval = log_interval_to_duration(config.log_delayreq_interval);

        Ok(PtpEngine {
            event_socket,
            general_socket,
            domain: config.domain,
            delay_req_interval,
            own_identity: PortIdentity {
                clock_identity,
                port_number: 1,
            },
            port_state: PortState::Listening,
            best_master: None,
            episode: Episode::default(),
            next_sequence_id: 0,
            last_delay_req_sent: None,
            last_measurement: None,
            error_count: 0,
        })
    }

    pub fn port_state(&self) -> PortState {
        self.port_state
    }

    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    pub fn last_measurement(&self) -> Option<PtpMeasurement> {
        self.last_measurement
    }

    /// One iteration of the engine's event loop: drain both sockets (bounded
    /// by their 1 s read timeout) and send a Delay-Req if due. Intended to be
    /// called in a loop by the owning source handler thread.
    pub fn tick(&mut self) -> Result<(), PtpError> {
        self.drain_socket(true);
        self.drain_socket(false);
        self.maybe_send_delay_req()?;
        Ok(())
    }

    fn drain_socket(&mut self, event: bool) {
        let mut buf = [0u8; RECV_BUF_LEN];
        let socket_name = if event { "event" } else { "general" };
        let (n, rx_time) = {
            let socket = if event { &self.event_socket } else { &self.general_socket };
            match timestamping::recv_with_timestamp(socket, &mut buf) {
                Ok((n, _addr, t)) => (n, t),
                Err(e) => {
                    // Read timeout is the expected idle case, not an error.
                    if !is_timeout(&e) {
                        log::debug!("ptp {socket_name} socket read error: {e}");
                        self.error_count += 1;
                    }
                    return;
                }
            }
        };

        match PtpMessage::decode(&buf[..n]) {
            Ok(msg) if msg.header.domain == self.domain => {
                if event {
                    self.handle_event_message(&msg, rx_time);
                } else {
                    self.handle_general_message(&msg);
                }
            }
            Ok(_) => {
                log::debug!("discarding ptp message with mismatched domain");
            }
            Err(e) => {
                log::debug!("discarding malformed ptp message on {socket_name} socket: {e}");
                self.error_count += 1;
            }
        }
    }

    fn handle_event_message(&mut self, msg: &PtpMessage, rx_time: SystemTime) {
        if msg.header.message_type == MessageType::Sync {
            self.handle_sync(&msg.header, rx_time);
        }
    }

    fn handle_general_message(&mut self, msg: &PtpMessage) {
        match msg.header.message_type {
            MessageType::Announce => self.handle_announce(msg),
            MessageType::FollowUp => self.handle_follow_up(&msg.header, &msg.body),
            MessageType::DelayResp => self.handle_delay_resp(&msg.header, &msg.body),
            _ => {}
        }
    }

    fn handle_announce(&mut self, msg: &PtpMessage) {
        let body = match AnnounceBody::decode(&msg.body) {
            Ok(b) => b,
            Err(e) => {
                log::debug!("discarding malformed announce: {e}");
                self.error_count += 1;
                return;
            }
        };
        let candidate = AnnounceDataSet::from_body(&body);
        let sender = msg.header.source_port_identity.clock_identity;

        let adopt = match &self.best_master {
            None => true,
            Some((current, _)) => bmca::is_better(&candidate, current),
        };

        if adopt {
            log::info!(
                "ptp: adopting new master (grandmaster_identity={:02x?}, priority1={})",
                candidate.grandmaster_identity,
                candidate.priority1
            );
            self.best_master = Some((candidate, sender));
            self.port_state = PortState::Slave;
            self.episode.reset();
        }
    }

    fn handle_sync(&mut self, header: &PtpHeader, rx_time: SystemTime) {
        if !self.from_current_master(header.source_port_identity.clock_identity) {
            return;
        }

        if let Some(received_at) = self.episode.sync_received_at {
            let timeout = self.sync_follow_up_timeout();
            if received_at.elapsed() > timeout {
                log::debug!("follow-up never arrived for previous sync, discarding t2");
                self.episode.t1 = None;
                self.episode.t2 = None;
            }
        }

        self.episode.sync_sequence_id = Some(header.sequence_id);
        self.episode.sync_received_at = Some(Instant::now());
        self.episode.t2 = Some(nanos_since_epoch(rx_time));
    }

    fn handle_follow_up(&mut self, header: &PtpHeader, body: &[u8]) {
        if !self.from_current_master(header.source_port_identity.clock_identity) {
            return;
        }
        if self.episode.sync_sequence_id != Some(header.sequence_id) {
            log::debug!("discarding follow-up with mismatched sequence_id");
            return;
        }
        let (sec, ns) = match crate::ptp::message::decode_followup_body(body) {
            Ok(t) => t,
            Err(e) => {
                log::debug!("discarding malformed follow-up: {e}");
                self.error_count += 1;
                return;
            }
        };
        self.episode.t1 = Some(timestamp_to_nanos(sec, ns));
        self.try_complete_episode();
    }

    fn maybe_send_delay_req(&mut self) -> Result<(), PtpError> {
        let due = match self.last_delay_req_sent {
            None => true,
            Some(last) => last.elapsed() >= self.delay_req_interval,
        };
        if !due || self.port_state != PortState::Slave {
            return Ok(());
        }

        let sequence_id = self.next_sequence_id;
        self.next_sequence_id = self.next_sequence_id.wrapping_add(1);

        let header = PtpHeader {
            message_type: MessageType::DelayReq,
            version: crate::ptp::message::PTP_VERSION,
            length: 0,
            domain: self.domain,
            flags: 0,
            correction_field_raw: 0,
            source_port_identity: self.own_identity,
            sequence_id,
            control: 1,
            log_message_interval: 0x7F,
        };
        let msg = PtpMessage {
            header,
            body: crate::ptp::message::encode_timestamp(0, 0).to_vec(),
        };
        let encoded = msg.encode();

        let dest: SocketAddr = format!("{}:{}", net::PTP_MULTICAST_GROUP, net::PTP_EVENT_PORT)
            .parse()
            .expect("multicast group/port constants are well-formed");

        let tx_time = SystemTime::now();
        match self.event_socket.send_to(&encoded, dest) {
            Ok(_) => {
                self.episode.delay_req_sequence_id = Some(sequence_id);
                self.episode.t4 = Some(nanos_since_epoch(tx_time));
                self.last_delay_req_sent = Some(Instant::now());
                Ok(())
            }
            Err(e) => {
                log::debug!("delay-req send failed: {e}");
                self.error_count += 1;
                Err(PtpError::Transient(e.to_string()))
            }
        }
    }

    fn handle_delay_resp(&mut self, header: &PtpHeader, body: &[u8]) {
        if !self.from_current_master(header.source_port_identity.clock_identity) {
            return;
        }
        let resp = match DelayRespBody::decode(body) {
            Ok(r) => r,
            Err(e) => {
                log::debug!("discarding malformed delay-resp: {e}");
                self.error_count += 1;
                return;
            }
        };
        if resp.requesting_port_identity != self.own_identity {
            return;
        }
        if self.episode.delay_req_sequence_id != Some(header.sequence_id) {
            log::debug!("discarding delay-resp with mismatched sequence_id");
            return;
        }

        self.episode.t3 = Some(timestamp_to_nanos(resp.receive_timestamp.0, resp.receive_timestamp.1));
        self.try_complete_episode();
    }

    /// Computes offset and path delay once t1..t4 all belong to the same
    /// episode (spec §4.4 "Offset & path delay"). Note the reference
    /// formula's asymmetric sign convention: `offset` uses `(t3 - t4)`, not
    /// `(t4 - t3)`.
    fn try_complete_episode(&mut self) {
        if !self.episode.ready() {
            return;
        }
        let (t1, t2, t3, t4) = (
            self.episode.t1.unwrap(),
            self.episode.t2.unwrap(),
            self.episode.t3.unwrap(),
            self.episode.t4.unwrap(),
        );

        let offset_ns = ((t2 - t1) + (t3 - t4)) / 2;
        let mean_path_delay_ns = ((t2 - t1) + (t4 - t3)) / 2;

        if mean_path_delay_ns < 0 {
            log::debug!("discarding episode with negative mean_path_delay ({mean_path_delay_ns}ns)");
            self.episode.reset();
            return;
        }

        let quality = self
            .best_master
            .as_ref()
            .map(|(set, _)| 255u16.saturating_sub(set.clock_quality.clock_class as u16) as u8)
            .unwrap_or(0);

        self.last_measurement = Some(PtpMeasurement {
            offset_ns: offset_ns as i64,
            mean_path_delay_ns: mean_path_delay_ns as i64,
            quality,
        });
        self.episode.reset();
    }

    fn from_current_master(&self, sender: [u8; 8]) -> bool {
        matches!(&self.best_master, Some((_, identity)) if *identity == sender)
    }

    fn sync_follow_up_timeout(&self) -> Duration {
        self.delay_req_interval.max(Duration::from_millis(100)) * 2
    }
}

fn is_timeout(err: &anyhow::Error) -> bool {
    err.downcast_ref::<std::io::Error>()
        .map(|e| matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut))
        .unwrap_or(false)
}

/// Converts a PTP `logMessageInterval` (log2 of the interval in seconds) to
/// a `Duration`.
fn log_interval_to_duration(log_interval: i8) -> Duration {
    if log_interval >= 0 {
        Duration::from_secs(1u64 << log_interval.min(30))
    } else {
        let divisor = 1u64 << (-log_interval).min(30);
        Duration::from_nanos((1_000_000_000 / divisor).max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_interval_zero_is_one_second() {
        assert_eq!(log_interval_to_duration(0), Duration::from_secs(1));
    }

    #[test]
    fn log_interval_negative_one_is_half_second() {
        assert_eq!(log_interval_to_duration(-1), Duration::from_millis(500));
    }

    #[test]
    fn log_interval_positive_doubles() {
        assert_eq!(log_interval_to_duration(2), Duration::from_secs(4));
    }

    #[test]
    fn episode_ready_requires_all_four_timestamps() {
        let mut ep = Episode::default();
        assert!(!ep.ready());
        ep.t1 = Some(1);
        ep.t2 = Some(2);
        ep.t3 = Some(3);
        assert!(!ep.ready());
        ep.t4 = Some(4);
        assert!(ep.ready());
    }

    #[test]
    fn nanos_since_epoch_handles_pre_epoch_gracefully() {
        // UNIX_EPOCH itself should round-trip to zero.
        assert_eq!(nanos_since_epoch(UNIX_EPOCH), 0);
    }
}
