//! Core types, constants, and wire formats for the RINA data-transfer stack.
//!
//! This crate defines the sequence-number arithmetic, protocol newtype
//! wrappers, PCI (protocol control information) wire format, and core error
//! types shared by the data-transfer and enrollment crates.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod constants;
pub mod error;
pub mod pci;
pub mod seqnum;
pub mod types;

pub use constants::PduType;
pub use error::PciError;
pub use pci::{CtrlPci, Pci, Pdu};
pub use seqnum::{between_mod, Millis, SeqNum};
pub use types::{Address, CepId, PortId, QosId};
