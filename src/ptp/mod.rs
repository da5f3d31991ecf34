//! IEEE-1588-2008 ordinary-clock slave engine: wire codec, BMCA, and the
//! session state machine (spec §3, §4.4).

pub mod bmca;
pub mod engine;
pub mod message;

pub use bmca::AnnounceDataSet;
pub use engine::{PtpEngine, PtpMeasurement};
pub use message::{MessageType, PortState, PtpHeader, PtpMessage};
