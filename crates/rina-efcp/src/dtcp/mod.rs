//! DTCP: the data-transfer control protocol.
//!
//! Control-plane state machine for a connection: sequence-space management,
//! ACK/NACK/FC control-PDU generation and consumption, sliding-window edge
//! maintenance, and the policy-pluggable engine structure.

pub mod engine;
pub mod policies;
pub mod sv;

pub use engine::{Dtcp, FlowState};
pub use policies::{DtcpPolicySet, PolicyRegistry, DEFAULT_POLICY_SET};
pub use sv::DtcpSv;
