//! Boundary with the relay-multiplexing table.
//!
//! The RMT is the next layer down that actually moves bytes. Sends are
//! non-blocking and the caller retains no ownership on success; delivery
//! toward a connection is single-threaded and FIFO per (src, dst, qos).

use rina_core::{Address, Pdu, QosId};

use crate::error::EfcpError;

/// Outbound half of the RMT boundary.
pub trait RmtSender: Send + Sync {
    /// Hand a PDU to the relay. Non-blocking; ownership of the PDU passes
    /// to the RMT whether or not the send succeeds.
    fn rmt_send(&self, dst_addr: Address, qos_id: QosId, pdu: Pdu) -> Result<(), EfcpError>;
}

impl std::fmt::Debug for dyn RmtSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RmtSender")
    }
}
