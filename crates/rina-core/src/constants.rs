//! Protocol constants: PDU type codes and PCI header sizes.

use crate::error::PciError;

/// PDU type byte for a data-transfer PDU.
pub const PDU_TYPE_DT: u8 = 0x80;

/// Base value for control PDU types; the subtype occupies the low 6 bits.
pub const PDU_TYPE_CTRL_BASE: u8 = 0xC0;

/// Control subtype: acknowledgement.
pub const CTRL_SUBTYPE_ACK: u8 = 0x01;
/// Control subtype: negative acknowledgement.
pub const CTRL_SUBTYPE_NACK: u8 = 0x02;
/// Control subtype: flow control.
pub const CTRL_SUBTYPE_FC: u8 = 0x03;
/// Control subtype: acknowledgement + flow control.
pub const CTRL_SUBTYPE_ACK_FC: u8 = 0x05;
/// Control subtype: negative acknowledgement + flow control.
pub const CTRL_SUBTYPE_NACK_FC: u8 = 0x06;

/// Size of the base PCI header on the wire:
/// `src_addr(4) + dst_addr(4) + src_cep(4) + dst_cep(4) + qos(4) + type(1)
/// + flags(1) + seq(4)`.
pub const BASE_PCI_SIZE: usize = 26;

/// Size of the control extension appended to the base header:
/// `last_ctl_seq(4) + ack_seq(4) + my_lwe(4) + my_rwe(4) + new_lwe(4)
/// + new_rwe(4)`.
pub const CTRL_PCI_EXTENSION_SIZE: usize = 24;

/// Total PCI size for control PDUs.
pub const CTRL_PCI_SIZE: usize = BASE_PCI_SIZE + CTRL_PCI_EXTENSION_SIZE;

/// First sequence number assigned to a data PDU on a fresh connection.
pub const FIRST_DATA_SEQ: u32 = 1;

/// The kind of a PDU, as carried in the type byte of the PCI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use]
pub enum PduType {
    /// Data transfer.
    Dt,
    /// Acknowledgement.
    Ack,
    /// Negative acknowledgement.
    Nack,
    /// Flow control.
    Fc,
    /// Acknowledgement + flow control.
    AckFc,
    /// Negative acknowledgement + flow control.
    NackFc,
}

impl PduType {
    /// The wire byte for this type.
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        match self {
            PduType::Dt => PDU_TYPE_DT,
            PduType::Ack => PDU_TYPE_CTRL_BASE | CTRL_SUBTYPE_ACK,
            PduType::Nack => PDU_TYPE_CTRL_BASE | CTRL_SUBTYPE_NACK,
            PduType::Fc => PDU_TYPE_CTRL_BASE | CTRL_SUBTYPE_FC,
            PduType::AckFc => PDU_TYPE_CTRL_BASE | CTRL_SUBTYPE_ACK_FC,
            PduType::NackFc => PDU_TYPE_CTRL_BASE | CTRL_SUBTYPE_NACK_FC,
        }
    }

    /// Whether this is a control PDU type.
    #[must_use]
    pub const fn is_control(self) -> bool {
        !matches!(self, PduType::Dt)
    }

    /// Whether this type carries an acknowledgement field worth acting on.
    #[must_use]
    pub const fn carries_ack(self) -> bool {
        matches!(
            self,
            PduType::Ack | PduType::Nack | PduType::AckFc | PduType::NackFc
        )
    }

    /// Whether this type carries flow-control window edges.
    #[must_use]
    pub const fn carries_fc(self) -> bool {
        matches!(self, PduType::Fc | PduType::AckFc | PduType::NackFc)
    }
}

impl TryFrom<u8> for PduType {
    type Error = PciError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            PDU_TYPE_DT => Ok(PduType::Dt),
            b if b & PDU_TYPE_CTRL_BASE == PDU_TYPE_CTRL_BASE => {
                match b & !PDU_TYPE_CTRL_BASE {
                    CTRL_SUBTYPE_ACK => Ok(PduType::Ack),
                    CTRL_SUBTYPE_NACK => Ok(PduType::Nack),
                    CTRL_SUBTYPE_FC => Ok(PduType::Fc),
                    CTRL_SUBTYPE_ACK_FC => Ok(PduType::AckFc),
                    CTRL_SUBTYPE_NACK_FC => Ok(PduType::NackFc),
                    _ => Err(PciError::InvalidPduType(byte)),
                }
            }
            _ => Err(PciError::InvalidPduType(byte)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_byte_values() {
        assert_eq!(PduType::Dt.to_byte(), 0x80);
        assert_eq!(PduType::Ack.to_byte(), 0xC1);
        assert_eq!(PduType::Nack.to_byte(), 0xC2);
        assert_eq!(PduType::Fc.to_byte(), 0xC3);
        assert_eq!(PduType::AckFc.to_byte(), 0xC5);
        assert_eq!(PduType::NackFc.to_byte(), 0xC6);
    }

    #[test]
    fn type_byte_roundtrip() {
        for ty in [
            PduType::Dt,
            PduType::Ack,
            PduType::Nack,
            PduType::Fc,
            PduType::AckFc,
            PduType::NackFc,
        ] {
            assert_eq!(PduType::try_from(ty.to_byte()).unwrap(), ty);
        }
    }

    #[test]
    fn unknown_type_byte_rejected() {
        assert!(PduType::try_from(0x00).is_err());
        assert!(PduType::try_from(0x81).is_err());
        // Control base with unknown subtype
        assert!(PduType::try_from(0xC4).is_err());
        assert!(PduType::try_from(0xC7).is_err());
    }

    #[test]
    fn control_classification() {
        assert!(!PduType::Dt.is_control());
        for ty in [
            PduType::Ack,
            PduType::Nack,
            PduType::Fc,
            PduType::AckFc,
            PduType::NackFc,
        ] {
            assert!(ty.is_control());
        }
    }

    #[test]
    fn ack_and_fc_classification() {
        assert!(PduType::Ack.carries_ack());
        assert!(!PduType::Ack.carries_fc());
        assert!(!PduType::Fc.carries_ack());
        assert!(PduType::Fc.carries_fc());
        assert!(PduType::AckFc.carries_ack());
        assert!(PduType::AckFc.carries_fc());
    }
}
