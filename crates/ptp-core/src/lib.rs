//! IEEE 1588-2002 (PTP v1) ordinary clock engine.
//!
//! Wire codec, transport, time-source abstraction, filters, clock servo,
//! best-master-clock election and the port state machine, assembled by the
//! `ptpd` binary into a multicast ordinary clock daemon.

pub mod bmc;
pub mod config;
pub mod constants;
pub mod net;
#[cfg(target_os = "linux")]
pub mod nic;
pub mod protocol;
pub mod servo;
pub mod stats;
pub mod time;
pub mod timer;
pub mod timesource;
pub mod wire;

pub use config::{RunTimeOpts, TimeMode};
pub use protocol::{PortState, PtpClock};
pub use stats::StatsFormat;
pub use time::{TimeInternal, TimeRepresentation};
