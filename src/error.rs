//! Error taxonomy (kinds, not type names) per the core's error handling design.
//!
//! Resource-acquisition errors are fatal for the handler (or the daemon, at
//! startup); everything else is recovered locally by the owning component.

use thiserror::Error;

/// Errors raised while loading or validating the daemon configuration.
/// Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),
    #[error("invalid duration string: {0}")]
    InvalidDuration(String),
    #[error("port out of range: {0}")]
    PortOutOfRange(u32),
    #[error("missing required field `{field}` for protocol `{protocol}`")]
    MissingField { protocol: String, field: String },
    #[error("io error reading config: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed config json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by a `SourceHandler`.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Resource acquisition (socket bind, device open, PCI mmap). Fatal for
    /// that handler at start; other handlers continue.
    #[error("resource acquisition failed: {0}")]
    ResourceAcquisition(String),
    /// Transient I/O (read timeout, EINTR, one-off ioctl failure). The next
    /// tick retries.
    #[error("transient I/O error: {0}")]
    Transient(String),
    /// Protocol decode failure (short packet, wrong version/domain, bad
    /// checksum). Silently discarded by the caller; error_count increments.
    #[error("protocol decode error: {0}")]
    Decode(String),
    /// No sample has been produced yet.
    #[error("no sample available yet")]
    NotReady,
    /// The handler has not been started, or has been stopped.
    #[error("handler is not running")]
    NotRunning,
    /// `start()` called twice on the same handler.
    #[error("handler is already running")]
    AlreadyRunning,
}

/// Errors raised by the PTP ordinary-clock engine.
#[derive(Debug, Error)]
pub enum PtpError {
    #[error("socket creation failed: {0}")]
    SocketCreation(String),
    #[error("invalid packet: {0}")]
    InvalidPacket(String),
    #[error("transient I/O error: {0}")]
    Transient(String),
    #[error("entering port state {0:?} is a fatal configuration error in slave-only mode")]
    UnsupportedPortState(crate::ptp::message::PortState),
}

/// Errors raised by the PHC device layer.
#[derive(Debug, Error)]
pub enum PhcError {
    #[error("ioctl failed: {0}")]
    IoctlFailed(String),
    #[error("device is closed")]
    DeviceClosed,
    #[error("requested frequency adjustment {requested_ppb} ppb exceeds max_adj_ppb {max_ppb}")]
    AdjustmentOutOfRange { requested_ppb: i64, max_ppb: i64 },
    #[error("external timestamp index {index} out of range (n_ext_ts = {n_ext_ts})")]
    ExtTsIndexOutOfRange { index: u32, n_ext_ts: u32 },
}

/// Errors raised by the steerer while deciding or applying a correction.
#[derive(Debug, Error)]
pub enum SteeringError {
    /// `|offset| > step_limit`. Logged and not applied; never silently
    /// capped.
    #[error("oversized correction: offset {offset_ns}ns exceeds step_limit {step_limit_ns}ns")]
    OversizedCorrection { offset_ns: i64, step_limit_ns: i64 },
    /// All sample weights collapsed to zero; fall back to the previous
    /// frequency estimate.
    #[error("zero total weight across candidate samples")]
    ZeroTotalWeight,
    /// No source could be selected; drives clock state to Unsynchronized
    /// then Holdover.
    #[error("no selectable source")]
    NoSelectableSource,
}
