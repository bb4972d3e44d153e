//! Neighbor records kept in the RIB.

use rina_core::PortId;

/// A known peer IPC process in the same DIF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbor {
    pub name: String,
    pub address: u32,
    pub supporting_difs: Vec<String>,
    pub underlying_port_id: PortId,
    pub enrolled: bool,
    /// Wall-clock milliseconds of the last message heard from this
    /// neighbor; zero means never.
    pub last_heard_from_ms: u64,
    pub average_rtt_ms: u64,
    pub enrollment_attempts: u32,
}

impl Neighbor {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            address: 0,
            supporting_difs: Vec::new(),
            underlying_port_id: PortId::new(0),
            enrolled: false,
            last_heard_from_ms: 0,
            average_rtt_ms: 0,
            enrollment_attempts: 0,
        }
    }
}
