//! PCI (protocol control information) wire format.
//!
//! Every PDU carries a fixed 26-byte base header; control PDUs extend it
//! with a 24-byte block of control sequencing, acknowledgement, and window
//! fields. All integers are big-endian network order.
//!
//! ```text
//! base:    src_addr(4) dst_addr(4) src_cep(4) dst_cep(4) qos(4) type(1) flags(1) seq(4)
//! control: last_ctl_seq(4) ack_seq(4) my_lwe(4) my_rwe(4) new_lwe(4) new_rwe(4)
//! ```

extern crate alloc;
use alloc::vec::Vec;

use crate::constants::{BASE_PCI_SIZE, CTRL_PCI_SIZE, PduType};
use crate::error::PciError;
use crate::seqnum::SeqNum;
use crate::types::{Address, CepId, QosId};

/// Control fields appended to the base PCI on control PDUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[must_use]
pub struct CtrlPci {
    /// Sequence number of the last control PDU received on this connection.
    pub last_ctl_seq_rcvd: SeqNum,
    /// Acknowledged sequence number (the receiver left-window edge, or
    /// LWE + 1 for negative acknowledgements).
    pub ack_seq: SeqNum,
    /// The sender's own left window edge.
    pub my_left_wind_edge: SeqNum,
    /// The sender's own right window edge.
    pub my_rt_wind_edge: SeqNum,
    /// New left window edge granted to the peer.
    pub new_left_wind_edge: SeqNum,
    /// New right window edge granted to the peer.
    pub new_rt_wind_edge: SeqNum,
}

/// A parsed PCI header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct Pci {
    pub pdu_type: PduType,
    pub flags: u8,
    pub src_addr: Address,
    pub dst_addr: Address,
    pub src_cep: CepId,
    pub dst_cep: CepId,
    pub qos_id: QosId,
    pub seq_num: SeqNum,
    /// Present exactly when `pdu_type.is_control()`.
    pub ctrl: Option<CtrlPci>,
}

impl Pci {
    /// Build a data-transfer PCI.
    pub fn new_dt(
        src_addr: Address,
        dst_addr: Address,
        src_cep: CepId,
        dst_cep: CepId,
        qos_id: QosId,
        seq_num: SeqNum,
    ) -> Self {
        Self {
            pdu_type: PduType::Dt,
            flags: 0,
            src_addr,
            dst_addr,
            src_cep,
            dst_cep,
            qos_id,
            seq_num,
            ctrl: None,
        }
    }

    /// Build a control PCI of the given type.
    #[allow(clippy::too_many_arguments)]
    pub fn new_control(
        pdu_type: PduType,
        src_addr: Address,
        dst_addr: Address,
        src_cep: CepId,
        dst_cep: CepId,
        qos_id: QosId,
        seq_num: SeqNum,
        ctrl: CtrlPci,
    ) -> Result<Self, PciError> {
        if !pdu_type.is_control() {
            return Err(PciError::UnexpectedControlBlock);
        }
        Ok(Self {
            pdu_type,
            flags: 0,
            src_addr,
            dst_addr,
            src_cep,
            dst_cep,
            qos_id,
            seq_num,
            ctrl: Some(ctrl),
        })
    }

    /// Size of this header on the wire.
    #[must_use]
    pub fn wire_size(&self) -> usize {
        if self.pdu_type.is_control() {
            CTRL_PCI_SIZE
        } else {
            BASE_PCI_SIZE
        }
    }

    /// Serialize to wire format.
    pub fn serialize(&self) -> Result<Vec<u8>, PciError> {
        let mut buf = Vec::with_capacity(self.wire_size());
        buf.extend_from_slice(&self.src_addr.value().to_be_bytes());
        buf.extend_from_slice(&self.dst_addr.value().to_be_bytes());
        buf.extend_from_slice(&self.src_cep.value().to_be_bytes());
        buf.extend_from_slice(&self.dst_cep.value().to_be_bytes());
        buf.extend_from_slice(&self.qos_id.value().to_be_bytes());
        buf.push(self.pdu_type.to_byte());
        buf.push(self.flags);
        buf.extend_from_slice(&self.seq_num.value().to_be_bytes());

        match (self.pdu_type.is_control(), self.ctrl) {
            (true, Some(ctrl)) => {
                buf.extend_from_slice(&ctrl.last_ctl_seq_rcvd.value().to_be_bytes());
                buf.extend_from_slice(&ctrl.ack_seq.value().to_be_bytes());
                buf.extend_from_slice(&ctrl.my_left_wind_edge.value().to_be_bytes());
                buf.extend_from_slice(&ctrl.my_rt_wind_edge.value().to_be_bytes());
                buf.extend_from_slice(&ctrl.new_left_wind_edge.value().to_be_bytes());
                buf.extend_from_slice(&ctrl.new_rt_wind_edge.value().to_be_bytes());
            }
            (true, None) => return Err(PciError::MissingControlBlock),
            (false, Some(_)) => return Err(PciError::UnexpectedControlBlock),
            (false, None) => {}
        }

        Ok(buf)
    }

    /// Parse a PCI from wire bytes, returning the header and its size.
    pub fn parse(raw: &[u8]) -> Result<(Self, usize), PciError> {
        if raw.len() < BASE_PCI_SIZE {
            return Err(PciError::TooShort {
                min: BASE_PCI_SIZE,
                actual: raw.len(),
            });
        }

        let src_addr = Address::new(read_u32(raw, 0));
        let dst_addr = Address::new(read_u32(raw, 4));
        let src_cep = CepId::new(read_u32(raw, 8));
        let dst_cep = CepId::new(read_u32(raw, 12));
        let qos_id = QosId::new(read_u32(raw, 16));
        let pdu_type = PduType::try_from(raw[20])?;
        let flags = raw[21];
        let seq_num = SeqNum::new(read_u32(raw, 22));

        let (ctrl, size) = if pdu_type.is_control() {
            if raw.len() < CTRL_PCI_SIZE {
                return Err(PciError::TooShort {
                    min: CTRL_PCI_SIZE,
                    actual: raw.len(),
                });
            }
            let ctrl = CtrlPci {
                last_ctl_seq_rcvd: SeqNum::new(read_u32(raw, 26)),
                ack_seq: SeqNum::new(read_u32(raw, 30)),
                my_left_wind_edge: SeqNum::new(read_u32(raw, 34)),
                my_rt_wind_edge: SeqNum::new(read_u32(raw, 38)),
                new_left_wind_edge: SeqNum::new(read_u32(raw, 42)),
                new_rt_wind_edge: SeqNum::new(read_u32(raw, 46)),
            };
            (Some(ctrl), CTRL_PCI_SIZE)
        } else {
            (None, BASE_PCI_SIZE)
        };

        Ok((
            Self {
                pdu_type,
                flags,
                src_addr,
                dst_addr,
                src_cep,
                dst_cep,
                qos_id,
                seq_num,
                ctrl,
            },
            size,
        ))
    }
}

fn read_u32(raw: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
}

/// A protocol data unit: a PCI header plus an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct Pdu {
    pub pci: Pci,
    pub payload: Vec<u8>,
}

impl Pdu {
    pub fn new(pci: Pci, payload: Vec<u8>) -> Self {
        Self { pci, payload }
    }

    /// The data sequence number (or control sequence number for control PDUs).
    #[must_use]
    pub fn seq_num(&self) -> SeqNum {
        self.pci.seq_num
    }

    /// Whether this is a control PDU.
    #[must_use]
    pub fn is_control(&self) -> bool {
        self.pci.pdu_type.is_control()
    }

    /// Serialize header and payload to wire format.
    pub fn serialize(&self) -> Result<Vec<u8>, PciError> {
        let mut buf = self.pci.serialize()?;
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Parse a PDU from wire bytes.
    pub fn parse(raw: &[u8]) -> Result<Self, PciError> {
        let (pci, header_size) = Pci::parse(raw)?;
        Ok(Self {
            pci,
            payload: raw[header_size..].to_vec(),
        })
    }
}
