pub mod clock;
pub mod config;
pub mod error;
pub mod net;
pub mod phc;
pub mod ptp;
pub mod selection;
pub mod sources;
pub mod spike_filter;
pub mod status;
pub mod steerer;
pub mod timecard;
pub mod timestamping;
