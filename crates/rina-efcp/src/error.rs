//! EFCP error types.
//!
//! Within a single PDU's processing, sub-policy failures are accumulated and
//! logged but the PDU is still consumed; across operations, failures surface
//! to the caller that initiated the work. `RetransmissionExhausted` is fatal
//! for the connection.

use rina_core::PciError;

#[derive(Debug, thiserror::Error)]
pub enum EfcpError {
    #[error("bad argument: {0}")]
    BadArgument(&'static str),

    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    #[error("sequence {seq} outside window [{lo}, {hi})")]
    SequenceWindow { seq: u32, lo: u32, hi: u32 },

    #[error("retransmission limit reached for seq {seq} after {retries} attempts")]
    RetransmissionExhausted { seq: u32, retries: u32 },

    #[error("policy failure: {0}")]
    PolicyFailure(&'static str),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("connection closed")]
    Closed,

    #[error("pci error: {0}")]
    Pci(#[from] PciError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_all_variants() {
        let variants: Vec<EfcpError> = vec![
            EfcpError::BadArgument("missing peer"),
            EfcpError::ProtocolViolation("non-control pdu"),
            EfcpError::SequenceWindow {
                seq: 12,
                lo: 1,
                hi: 11,
            },
            EfcpError::RetransmissionExhausted { seq: 2, retries: 5 },
            EfcpError::PolicyFailure("sv_update"),
            EfcpError::ResourceExhausted("cwq"),
            EfcpError::Timeout,
            EfcpError::Cancelled,
            EfcpError::Closed,
            EfcpError::Pci(PciError::MissingControlBlock),
        ];
        for v in &variants {
            assert!(!v.to_string().is_empty(), "{v:?} should have non-empty Display");
        }
    }

    #[test]
    fn pci_error_converts() {
        let e: EfcpError = PciError::InvalidPduType(0x7F).into();
        assert!(matches!(e, EfcpError::Pci(_)));
    }
}
