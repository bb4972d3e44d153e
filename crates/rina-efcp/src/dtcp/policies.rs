//! The DTCP policy set and its defaults.
//!
//! The engine is organized around a record of policy functions invoked at
//! well-defined hooks. Defaults compose at construction, so callers never
//! see an absent hook. Policy functions must not reacquire the state-vector
//! lock; they go through the engine's accessor surface.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use rina_core::SeqNum;

use crate::dtcp::engine::Dtcp;
use crate::error::EfcpError;

/// A hook taking only the engine instance.
pub type Policy = fn(&Dtcp) -> Result<(), EfcpError>;
/// A hook taking the engine instance and a sequence number.
pub type SeqPolicy = fn(&Dtcp, SeqNum) -> Result<(), EfcpError>;
/// A hook taking the engine instance and a PDU it now owns.
pub type PduPolicy = fn(&Dtcp, rina_core::Pdu) -> Result<(), EfcpError>;

/// The policy vtable. Every hook has a default; replace individual entries
/// to specialize behavior.
#[derive(Debug, Clone, Copy)]
pub struct DtcpPolicySet {
    /// One-time setup when DTP opens the flow.
    pub flow_init: Policy,
    /// Advance receiver state after delivery up to a sequence; invokes the
    /// window, rate, and retransmission sub-policies in that order.
    pub sv_update: SeqPolicy,
    /// A gap was detected in the control-sequence namespace.
    pub lost_control_pdu: Policy,
    /// Update the RTT estimate on an ACK.
    pub rtt_estimator: Policy,
    /// The retransmission-queue head's timer fired.
    pub retransmission_timer_expiry: Policy,
    /// A duplicate data PDU was received.
    pub received_retransmission: Policy,
    /// Receiver-side ACK emission.
    pub rcvr_ack: SeqPolicy,
    /// Sender-side ACK consumption: trim the RTXQ, advance the left edge.
    pub sender_ack: SeqPolicy,
    /// Generate an ACK after A-timer expiry.
    pub sending_ack: Policy,
    /// Rate-based startup.
    pub initial_rate: Policy,
    /// Non-retransmission flow-control tick.
    pub receiving_flow_control: SeqPolicy,
    /// Receiver credit recomputation.
    pub update_credit: Policy,
    /// A data PDU exceeded the receiver window.
    pub flow_control_overrun: PduPolicy,
    /// Arbitrate when window- and rate-based flow control disagree.
    pub reconcile_flow_conflict: Policy,
    /// Grow the receiver right window edge.
    pub rcvr_flow_control: SeqPolicy,
    /// Slow the sender after backpressure.
    pub rate_reduction: Policy,
    /// Handle control-ack reception.
    pub rcvr_control_ack: Policy,
    /// Alternative to `rate_reduction` that keeps the rate.
    pub no_rate_slow_down: Policy,
    /// Clamp the peak sending rate.
    pub no_override_default_peak: Policy,
}

impl Default for DtcpPolicySet {
    fn default() -> Self {
        Self {
            flow_init: default_flow_init,
            sv_update: default_sv_update,
            lost_control_pdu: default_lost_control_pdu,
            rtt_estimator: default_rtt_estimator,
            retransmission_timer_expiry: default_retransmission_timer_expiry,
            received_retransmission: default_received_retransmission,
            rcvr_ack: default_rcvr_ack,
            sender_ack: default_sender_ack,
            sending_ack: default_sending_ack,
            initial_rate: default_initial_rate,
            receiving_flow_control: default_receiving_flow_control,
            update_credit: default_update_credit,
            flow_control_overrun: default_flow_control_overrun,
            reconcile_flow_conflict: default_reconcile_flow_conflict,
            rcvr_flow_control: default_rcvr_flow_control,
            rate_reduction: default_rate_reduction,
            rcvr_control_ack: default_rcvr_control_ack,
            no_rate_slow_down: default_no_rate_slow_down,
            no_override_default_peak: default_no_override_default_peak,
        }
    }
}

// ---------------------------------------------------------------------------
// Default hook implementations
// ---------------------------------------------------------------------------

fn default_flow_init(_dtcp: &Dtcp) -> Result<(), EfcpError> {
    Ok(())
}

/// Window, rate, then retransmission sub-policies. Sub-policy failures are
/// logged and accumulated; the first failure is reported after every
/// applicable hook has run.
fn default_sv_update(dtcp: &Dtcp, seq: SeqNum) -> Result<(), EfcpError> {
    let cfg = *dtcp.config();
    let p = dtcp.policies();
    let mut failure: Option<EfcpError> = None;

    tracing::trace!(seq = %seq, "sv_update");

    if cfg.flow_control {
        if cfg.window_based {
            if let Err(e) = (p.rcvr_flow_control)(dtcp, seq) {
                tracing::warn!(error = %e, "rcvr_flow_control policy failed");
                failure.get_or_insert(e);
            }
        }
        if cfg.rate_based {
            if let Err(e) = (p.rate_reduction)(dtcp) {
                tracing::warn!(error = %e, "rate_reduction policy failed");
                failure.get_or_insert(e);
            }
        }
        if !cfg.rtx_control {
            if let Err(e) = (p.receiving_flow_control)(dtcp, seq) {
                tracing::warn!(error = %e, "receiving_flow_control policy failed");
                failure.get_or_insert(e);
            }
            return failure.map_or(Ok(()), Err);
        }
    }

    if cfg.rtx_control {
        if let Err(e) = (p.rcvr_ack)(dtcp, seq) {
            tracing::warn!(error = %e, "rcvr_ack policy failed");
            failure.get_or_insert(e);
        }
    }

    failure.map_or(Ok(()), Err)
}

fn default_lost_control_pdu(_dtcp: &Dtcp) -> Result<(), EfcpError> {
    tracing::debug!("control pdu lost; peer edges resync on the next control pdu");
    Ok(())
}

fn default_rtt_estimator(_dtcp: &Dtcp) -> Result<(), EfcpError> {
    Ok(())
}

fn default_retransmission_timer_expiry(_dtcp: &Dtcp) -> Result<(), EfcpError> {
    Ok(())
}

fn default_received_retransmission(_dtcp: &Dtcp) -> Result<(), EfcpError> {
    Ok(())
}

/// Generate and send an ACK (or ACK+FC, per flow-control mode).
fn default_rcvr_ack(dtcp: &Dtcp, seq: SeqNum) -> Result<(), EfcpError> {
    dtcp.ack_flow_control_pdu_send(seq)
}

/// Trim the retransmission queue up to the acked sequence and advance the
/// sender left-window edge. Without retransmission control the ACK only
/// slides the window edges via the flow-control fields.
fn default_sender_ack(dtcp: &Dtcp, ack: SeqNum) -> Result<(), EfcpError> {
    if dtcp.config().rtx_control {
        let dtp = dtcp.dtp()?;
        // The ACK value is the peer's left-window edge: one past the
        // highest sequence it has delivered.
        let highest_acked = ack.prev();
        dtp.rtxq().ack(highest_acked, dtp.rtx_time(), Instant::now());
    }
    dtcp.advance_snd_lft_win(ack);
    Ok(())
}

/// Run delimiting for the expired A-timer, then update the state vector.
fn default_sending_ack(dtcp: &Dtcp) -> Result<(), EfcpError> {
    let dtp = dtcp.dtp()?;
    let seq = dtp.process_a_expiry();
    (dtcp.policies().sv_update)(dtcp, seq)
}

fn default_initial_rate(_dtcp: &Dtcp) -> Result<(), EfcpError> {
    Ok(())
}

/// Emit a bare flow-control PDU.
fn default_receiving_flow_control(dtcp: &Dtcp, _seq: SeqNum) -> Result<(), EfcpError> {
    dtcp.send_fc_pdu()
}

fn default_update_credit(_dtcp: &Dtcp) -> Result<(), EfcpError> {
    Ok(())
}

/// Drop the offending PDU.
fn default_flow_control_overrun(_dtcp: &Dtcp, pdu: rina_core::Pdu) -> Result<(), EfcpError> {
    tracing::warn!(seq = %pdu.seq_num(), "dropping pdu past the receiver window");
    drop(pdu);
    Ok(())
}

fn default_reconcile_flow_conflict(_dtcp: &Dtcp) -> Result<(), EfcpError> {
    Ok(())
}

/// `rcvr_rt_wind_edge := receiver LWE + rcvr_credit`.
fn default_rcvr_flow_control(dtcp: &Dtcp, _seq: SeqNum) -> Result<(), EfcpError> {
    dtcp.update_rcvr_rt_wind_edge()?;
    Ok(())
}

fn default_rate_reduction(_dtcp: &Dtcp) -> Result<(), EfcpError> {
    tracing::debug!("rate reduction requested; no default behavior");
    Ok(())
}

fn default_rcvr_control_ack(_dtcp: &Dtcp) -> Result<(), EfcpError> {
    Ok(())
}

fn default_no_rate_slow_down(_dtcp: &Dtcp) -> Result<(), EfcpError> {
    Ok(())
}

fn default_no_override_default_peak(_dtcp: &Dtcp) -> Result<(), EfcpError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Policy registry
// ---------------------------------------------------------------------------

/// Name under which the default policy set is always registered.
pub const DEFAULT_POLICY_SET: &str = "default";

/// Named policy sets, passed explicitly into connection setup.
///
/// Tests construct isolated registries instead of sharing module-level
/// state.
#[derive(Debug)]
pub struct PolicyRegistry {
    sets: Mutex<HashMap<String, DtcpPolicySet>>,
}

impl PolicyRegistry {
    /// A registry with the default set pre-registered.
    pub fn new() -> Self {
        let mut sets = HashMap::new();
        sets.insert(DEFAULT_POLICY_SET.to_string(), DtcpPolicySet::default());
        Self {
            sets: Mutex::new(sets),
        }
    }

    /// Register or replace a named policy set.
    pub fn register(&self, name: &str, set: DtcpPolicySet) {
        self.sets
            .lock()
            .expect("registry lock poisoned")
            .insert(name.to_string(), set);
    }

    /// Look up a policy set by name.
    pub fn get(&self, name: &str) -> Option<DtcpPolicySet> {
        self.sets
            .lock()
            .expect("registry lock poisoned")
            .get(name)
            .copied()
    }

    /// Registered set names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .sets
            .lock()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_has_default_set() {
        let reg = PolicyRegistry::new();
        assert!(reg.get(DEFAULT_POLICY_SET).is_some());
        assert_eq!(reg.names(), vec!["default".to_string()]);
    }

    #[test]
    fn registry_lookup_unknown_is_none() {
        let reg = PolicyRegistry::new();
        assert!(reg.get("loss-tolerant").is_none());
    }

    #[test]
    fn registry_register_and_fetch() {
        let reg = PolicyRegistry::new();
        let mut set = DtcpPolicySet::default();
        set.lost_control_pdu = |_| Err(EfcpError::PolicyFailure("custom"));
        reg.register("strict", set);
        assert!(reg.get("strict").is_some());
        assert_eq!(
            reg.names(),
            vec!["default".to_string(), "strict".to_string()]
        );
    }

    #[test]
    fn registries_are_isolated() {
        let a = PolicyRegistry::new();
        let b = PolicyRegistry::new();
        a.register("only-in-a", DtcpPolicySet::default());
        assert!(b.get("only-in-a").is_none());
    }
}
