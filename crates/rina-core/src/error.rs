//! Error types for the rina-core crate.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciError {
    TooShort { min: usize, actual: usize },
    InvalidPduType(u8),
    MissingControlBlock,
    UnexpectedControlBlock,
}

impl fmt::Display for PciError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PciError::TooShort { min, actual } => {
                write!(f, "pci too short: need at least {min} bytes, got {actual}")
            }
            PciError::InvalidPduType(v) => write!(f, "invalid pdu type: 0x{v:02x}"),
            PciError::MissingControlBlock => {
                write!(f, "control pdu type without control fields")
            }
            PciError::UnexpectedControlBlock => {
                write!(f, "data pdu type with control fields")
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for PciError {}
