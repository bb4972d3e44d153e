//! Per-connection identity and the policy-parameter bundle.
//!
//! A `Connection` is immutable after creation; it is shared between the DTP
//! and DTCP halves as an `Arc` and needs no locking.

use rina_core::{Address, CepId, Millis, QosId};

/// The DTCP policy-parameter bundle, fixed at connection setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtcpConfig {
    /// Master flow-control toggle.
    pub flow_control: bool,
    /// Window-based flow control.
    pub window_based: bool,
    /// Rate-based pacing.
    pub rate_based: bool,
    /// Retransmission control.
    pub rtx_control: bool,
    /// Initial window credit, in PDUs.
    pub initial_credit: u32,
    /// Maximum retransmissions of a PDU before the connection fails.
    pub data_retransmit_max: u32,
    /// Length of the rate time unit.
    pub time_unit_ms: Millis,
    /// PDUs per time unit; zero means unlimited.
    pub sender_rate: u32,
    /// Delayed-ACK interval; zero disables delayed ACK.
    pub a_timer_ms: Millis,
}

impl Default for DtcpConfig {
    fn default() -> Self {
        Self {
            flow_control: true,
            window_based: true,
            rate_based: false,
            rtx_control: true,
            initial_credit: 10,
            data_retransmit_max: 5,
            time_unit_ms: 1000,
            sender_rate: 0,
            a_timer_ms: 0,
        }
    }
}

/// Immutable connection identity.
#[derive(Debug, Clone)]
#[must_use]
pub struct Connection {
    src_cep: CepId,
    dst_cep: CepId,
    src_addr: Address,
    dst_addr: Address,
    qos_id: QosId,
    config: DtcpConfig,
}

impl Connection {
    pub fn new(
        src_cep: CepId,
        dst_cep: CepId,
        src_addr: Address,
        dst_addr: Address,
        qos_id: QosId,
        config: DtcpConfig,
    ) -> Self {
        Self {
            src_cep,
            dst_cep,
            src_addr,
            dst_addr,
            qos_id,
            config,
        }
    }

    pub fn src_cep(&self) -> CepId {
        self.src_cep
    }

    pub fn dst_cep(&self) -> CepId {
        self.dst_cep
    }

    pub fn src_addr(&self) -> Address {
        self.src_addr
    }

    pub fn dst_addr(&self) -> Address {
        self.dst_addr
    }

    pub fn qos_id(&self) -> QosId {
        self.qos_id
    }

    #[must_use]
    pub fn config(&self) -> &DtcpConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_knob_defaults() {
        let cfg = DtcpConfig::default();
        assert!(cfg.flow_control);
        assert!(cfg.window_based);
        assert!(!cfg.rate_based);
        assert!(cfg.rtx_control);
        assert_eq!(cfg.initial_credit, 10);
        assert_eq!(cfg.data_retransmit_max, 5);
        assert_eq!(cfg.time_unit_ms, 1000);
        assert_eq!(cfg.sender_rate, 0);
        assert_eq!(cfg.a_timer_ms, 0);
    }

    #[test]
    fn accessors_return_constructed_values() {
        let conn = Connection::new(
            CepId::new(1),
            CepId::new(2),
            Address::new(10),
            Address::new(20),
            QosId::new(3),
            DtcpConfig::default(),
        );
        assert_eq!(conn.src_cep(), CepId::new(1));
        assert_eq!(conn.dst_cep(), CepId::new(2));
        assert_eq!(conn.src_addr(), Address::new(10));
        assert_eq!(conn.dst_addr(), Address::new(20));
        assert_eq!(conn.qos_id(), QosId::new(3));
        assert_eq!(conn.config().initial_credit, 10);
    }
}
