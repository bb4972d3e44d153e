//! Error and flow control protocol for the RINA data-transfer stack.
//!
//! This crate implements the paired DTP/DTCP state machines of a connection:
//! sliding-window flow control, optional rate pacing, selective
//! retransmission, the closed-window queue, and the policy-pluggable DTCP
//! engine, plus the builder that wires the two halves together.

pub mod connection;
pub mod cwq;
pub mod dt;
pub mod dtcp;
pub mod dtp;
pub mod error;
pub mod rmt;
pub mod rtxq;
pub mod timer;

pub use connection::{Connection, DtcpConfig};
pub use cwq::ClosedWindowQueue;
pub use dt::{Dt, DtBuilder};
pub use dtcp::{Dtcp, DtcpPolicySet, DtcpSv, FlowState, PolicyRegistry, DEFAULT_POLICY_SET};
pub use dtp::Dtp;
pub use error::EfcpError;
pub use rmt::RmtSender;
pub use rtxq::{retry_outcome, RetransmissionQueue, RetryOutcome};
pub use timer::TaskHandle;
