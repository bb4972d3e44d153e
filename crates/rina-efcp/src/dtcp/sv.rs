//! The DTCP state vector.
//!
//! Every field lives under the single per-instance mutex held by the engine;
//! this module only defines the data and its pure derivations so they can be
//! tested in isolation.

use rina_core::constants::FIRST_DATA_SEQ;
use rina_core::{Millis, SeqNum};

use crate::connection::DtcpConfig;

/// The DTCP state vector.
///
/// Outbound fields track this endpoint as a data sender; inbound fields
/// track it as a data receiver. Both roles coexist on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtcpSv {
    // ---- Control sequencing ----
    /// Sequence number most recently assigned to an outgoing control PDU.
    pub next_snd_ctl_seq: SeqNum,
    /// Sequence number of the last in-order control PDU received.
    pub last_rcv_ctl_seq: SeqNum,

    // ---- Outbound (sender role) ----
    /// Last acknowledgement value this endpoint sent to its peer.
    pub last_snd_data_ack: SeqNum,
    /// Last acknowledgement value received from the peer.
    pub last_rcv_data_ack: SeqNum,
    /// Lowest sequence not yet acknowledged; head of the retransmission
    /// queue.
    pub snd_lft_win: SeqNum,
    /// One past the highest sequence the peer currently permits.
    pub snd_rt_wind_edge: SeqNum,
    /// Window credit granted by the peer, in PDUs.
    pub sndr_credit: u32,
    /// PDUs per time unit this endpoint may send; zero means unlimited.
    pub sndr_rate: u32,
    /// PDUs already sent in the current time unit.
    pub pdus_sent_in_time_unit: u32,
    /// Maximum retransmissions before the connection fails.
    pub data_retransmit_max: u32,

    // ---- Inbound (receiver role) ----
    /// Window credit this endpoint grants its peer, in PDUs.
    pub rcvr_credit: u32,
    /// Receiver left-window edge plus `rcvr_credit`.
    pub rcvr_rt_wind_edge: SeqNum,
    /// Rate this endpoint told the peer it may send at.
    pub rcvr_rate: u32,
    /// PDUs received in the current time unit.
    pub pdus_rcvd_in_time_unit: u32,

    // ---- Timekeeping ----
    /// Length of the rate time unit.
    pub time_unit_ms: Millis,

    // ---- Duplicate-control accounting ----
    /// Duplicate ACK / ACK+FC control PDUs seen.
    pub acks: u64,
    /// Duplicate FC / ACK+FC / NACK+FC control PDUs seen.
    pub flow_ctl: u64,
}

impl DtcpSv {
    /// Initialize from the policy-parameter bundle.
    ///
    /// Both window edges open `initial_credit` PDUs past the first data
    /// sequence; `data_retransmit_max` is only honored when retransmission
    /// control is configured.
    pub fn from_config(cfg: &DtcpConfig) -> Self {
        let origin = SeqNum::new(FIRST_DATA_SEQ);
        Self {
            next_snd_ctl_seq: SeqNum::ZERO,
            last_rcv_ctl_seq: SeqNum::ZERO,
            last_snd_data_ack: origin,
            last_rcv_data_ack: origin,
            snd_lft_win: origin,
            snd_rt_wind_edge: origin.add(cfg.initial_credit),
            sndr_credit: cfg.initial_credit,
            sndr_rate: cfg.sender_rate,
            pdus_sent_in_time_unit: 0,
            data_retransmit_max: if cfg.rtx_control {
                cfg.data_retransmit_max
            } else {
                0
            },
            rcvr_credit: cfg.initial_credit,
            rcvr_rt_wind_edge: origin.add(cfg.initial_credit),
            rcvr_rate: cfg.sender_rate,
            pdus_rcvd_in_time_unit: 0,
            time_unit_ms: cfg.time_unit_ms,
            acks: 0,
            flow_ctl: 0,
        }
    }

    /// Pre-increment and return the next control sequence number.
    pub fn take_next_ctl_seq(&mut self) -> SeqNum {
        self.next_snd_ctl_seq = self.next_snd_ctl_seq.next();
        self.next_snd_ctl_seq
    }

    /// Credit left before the send window closes, measured from the highest
    /// sequence already handed to the RMT.
    ///
    /// A window edge behind `max_seq_sent` yields the `u32::MAX` sentinel.
    #[must_use]
    pub fn remaining_credit(&self, max_seq_sent: SeqNum) -> u32 {
        if self.snd_rt_wind_edge.lt(max_seq_sent) {
            u32::MAX
        } else {
            max_seq_sent.distance(self.snd_rt_wind_edge)
        }
    }

    /// Rate-gate allowance for the current time unit. `None` means the rate
    /// is unlimited.
    #[must_use]
    pub fn rate_allowance(&self) -> Option<u32> {
        if self.sndr_rate == 0 {
            None
        } else {
            Some(self.sndr_rate.saturating_sub(self.pdus_sent_in_time_unit))
        }
    }

    /// The window-edge ordering invariant, modulo-wrap:
    /// `snd_lft_win ≤ last_rcv_data_ack ≤ snd_rt_wind_edge`.
    #[must_use]
    pub fn ordering_invariant_holds(&self) -> bool {
        self.snd_lft_win.le(self.last_rcv_data_ack)
            && self.last_rcv_data_ack.le(self.snd_rt_wind_edge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_from_default_config() {
        let sv = DtcpSv::from_config(&DtcpConfig::default());
        assert_eq!(sv.next_snd_ctl_seq, SeqNum::ZERO);
        assert_eq!(sv.last_rcv_ctl_seq, SeqNum::ZERO);
        assert_eq!(sv.snd_lft_win, SeqNum::new(1));
        assert_eq!(sv.snd_rt_wind_edge, SeqNum::new(11));
        assert_eq!(sv.rcvr_rt_wind_edge, SeqNum::new(11));
        assert_eq!(sv.sndr_credit, 10);
        assert_eq!(sv.rcvr_credit, 10);
        assert_eq!(sv.data_retransmit_max, 5);
        assert_eq!(sv.acks, 0);
        assert_eq!(sv.flow_ctl, 0);
        assert!(sv.ordering_invariant_holds());
    }

    #[test]
    fn rtx_max_zeroed_when_rtx_disabled() {
        let cfg = DtcpConfig {
            rtx_control: false,
            ..DtcpConfig::default()
        };
        assert_eq!(DtcpSv::from_config(&cfg).data_retransmit_max, 0);
    }

    #[test]
    fn ctl_seq_pre_increments() {
        let mut sv = DtcpSv::from_config(&DtcpConfig::default());
        assert_eq!(sv.take_next_ctl_seq(), SeqNum::new(1));
        assert_eq!(sv.take_next_ctl_seq(), SeqNum::new(2));
        assert_eq!(sv.next_snd_ctl_seq, SeqNum::new(2));
    }

    #[test]
    fn remaining_credit_counts_down() {
        let sv = DtcpSv::from_config(&DtcpConfig {
            initial_credit: 4,
            ..DtcpConfig::default()
        });
        // Edge at 5; nothing sent past the origin yet.
        assert_eq!(sv.remaining_credit(SeqNum::new(1)), 4);
        assert_eq!(sv.remaining_credit(SeqNum::new(4)), 1);
        assert_eq!(sv.remaining_credit(SeqNum::new(5)), 0);
    }

    #[test]
    fn remaining_credit_overflow_sentinel() {
        let sv = DtcpSv::from_config(&DtcpConfig {
            initial_credit: 4,
            ..DtcpConfig::default()
        });
        // max_seq_sent past the edge: the sentinel, not a wrapped distance.
        assert_eq!(sv.remaining_credit(SeqNum::new(6)), u32::MAX);
    }

    #[test]
    fn rate_allowance_unlimited_when_rate_zero() {
        let sv = DtcpSv::from_config(&DtcpConfig::default());
        assert_eq!(sv.rate_allowance(), None);
    }

    #[test]
    fn rate_allowance_counts_down_and_floors() {
        let mut sv = DtcpSv::from_config(&DtcpConfig {
            rate_based: true,
            sender_rate: 3,
            ..DtcpConfig::default()
        });
        assert_eq!(sv.rate_allowance(), Some(3));
        sv.pdus_sent_in_time_unit = 2;
        assert_eq!(sv.rate_allowance(), Some(1));
        sv.pdus_sent_in_time_unit = 5;
        assert_eq!(sv.rate_allowance(), Some(0));
    }

    #[test]
    fn ordering_invariant_detects_violation() {
        let mut sv = DtcpSv::from_config(&DtcpConfig::default());
        sv.last_rcv_data_ack = SeqNum::new(20);
        assert!(!sv.ordering_invariant_holds());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn fresh_sv_upholds_invariants(credit in 0..100_000u32, rate in any::<u32>()) {
            let cfg = DtcpConfig {
                initial_credit: credit,
                sender_rate: rate,
                ..DtcpConfig::default()
            };
            let sv = DtcpSv::from_config(&cfg);
            prop_assert!(sv.ordering_invariant_holds());
            prop_assert_eq!(sv.snd_lft_win.distance(sv.snd_rt_wind_edge), credit);
            prop_assert_eq!(sv.snd_rt_wind_edge, sv.rcvr_rt_wind_edge);
        }

        #[test]
        fn acked_window_keeps_credit_distance(credit in 1..10_000u32, acked in 0..1_000_000u32) {
            // An in-window ACK moves both the ack mark and (via the peer's
            // FC fields) the right edge, keeping the credit distance.
            let cfg = DtcpConfig {
                initial_credit: credit,
                ..DtcpConfig::default()
            };
            let mut sv = DtcpSv::from_config(&cfg);
            let ack = sv.snd_lft_win.add(acked);
            sv.snd_lft_win = ack;
            sv.last_rcv_data_ack = ack;
            sv.snd_rt_wind_edge = ack.add(credit);
            prop_assert!(sv.ordering_invariant_holds());
            prop_assert_eq!(sv.remaining_credit(ack), credit);
        }

        #[test]
        fn ctl_seq_is_strictly_increasing(steps in 1..200u32) {
            let mut sv = DtcpSv::from_config(&DtcpConfig::default());
            let mut prev = sv.next_snd_ctl_seq;
            for _ in 0..steps {
                let next = sv.take_next_ctl_seq();
                prop_assert!(prev.lt(next));
                prev = next;
            }
        }
    }
}
