//! The DTCP engine.
//!
//! Owns the mutexed state vector, the immutable policy set, the control-PDU
//! factory, and the common control receive path. The engine counts every
//! control PDU it currently owns in `cpdus_in_transit`; teardown waits for
//! the counter to drain before the instance goes away.

use std::cell::Cell;
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use rina_core::{CtrlPci, Pci, Pdu, PduType, SeqNum};

use crate::connection::{Connection, DtcpConfig};
use crate::dtcp::policies::DtcpPolicySet;
use crate::dtcp::sv::DtcpSv;
use crate::dtp::Dtp;
use crate::error::EfcpError;
use crate::rmt::RmtSender;

/// Per-connection lifecycle, DTCP view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// Created but not yet opened.
    Idle,
    /// Data and control PDUs flow.
    Open,
    /// No new data admitted; ACKs, NACKs, and retransmissions continue.
    Draining,
    /// Terminal.
    Closed,
}

impl FlowState {
    /// A string name for the current state.
    pub fn name(self) -> &'static str {
        match self {
            FlowState::Idle => "IDLE",
            FlowState::Open => "OPEN",
            FlowState::Draining => "DRAINING",
            FlowState::Closed => "CLOSED",
        }
    }
}

/// The DTCP instance of a connection.
#[derive(Debug)]
pub struct Dtcp {
    sv: Mutex<DtcpSv>,
    policies: DtcpPolicySet,
    conn: Arc<Connection>,
    rmt: Arc<dyn RmtSender>,
    dtp: OnceLock<Weak<Dtp>>,
    state: Mutex<FlowState>,
    cpdus_in_transit: Mutex<u32>,
    cpdus_drained: Condvar,
}

/// RAII accounting of a control PDU the engine currently owns. Dropping the
/// guard decrements the counter on every exit path and wakes teardown when
/// the count reaches zero.
struct InTransitGuard<'a> {
    dtcp: &'a Dtcp,
}

impl<'a> InTransitGuard<'a> {
    fn new(dtcp: &'a Dtcp) -> Self {
        let mut count = dtcp
            .cpdus_in_transit
            .lock()
            .expect("cpdus lock poisoned");
        *count += 1;
        Self { dtcp }
    }
}

impl Drop for InTransitGuard<'_> {
    fn drop(&mut self) {
        let drained = {
            let mut count = self
                .dtcp
                .cpdus_in_transit
                .lock()
                .expect("cpdus lock poisoned");
            *count -= 1;
            *count == 0
        };
        if drained {
            self.dtcp.cpdus_drained.notify_all();
            self.dtcp.try_finish_draining();
        }
    }
}

impl Dtcp {
    pub(crate) fn new(
        conn: Arc<Connection>,
        rmt: Arc<dyn RmtSender>,
        policies: DtcpPolicySet,
    ) -> Self {
        let sv = DtcpSv::from_config(conn.config());
        tracing::debug!(
            sndr_credit = sv.sndr_credit,
            snd_rt_wind_edge = %sv.snd_rt_wind_edge,
            rcvr_credit = sv.rcvr_credit,
            rcvr_rt_wind_edge = %sv.rcvr_rt_wind_edge,
            data_retransmit_max = sv.data_retransmit_max,
            "dtcp state vector initialized"
        );
        Self {
            sv: Mutex::new(sv),
            policies,
            conn,
            rmt,
            dtp: OnceLock::new(),
            state: Mutex::new(FlowState::Idle),
            cpdus_in_transit: Mutex::new(0),
            cpdus_drained: Condvar::new(),
        }
    }

    pub(crate) fn register_dtp(&self, dtp: &Arc<Dtp>) {
        let _ = self.dtp.set(Arc::downgrade(dtp));
    }

    pub(crate) fn dtp(&self) -> Result<Arc<Dtp>, EfcpError> {
        self.dtp
            .get()
            .and_then(Weak::upgrade)
            .ok_or(EfcpError::BadArgument("dtp peer not registered"))
    }

    /// The connection's policy-parameter bundle.
    pub fn config(&self) -> &DtcpConfig {
        self.conn.config()
    }

    /// The installed policy set.
    pub fn policies(&self) -> &DtcpPolicySet {
        &self.policies
    }

    /// A snapshot of the state vector, for diagnostics and tests.
    pub fn sv_snapshot(&self) -> DtcpSv {
        *self.sv.lock().expect("sv lock poisoned")
    }

    // ------------------------------------------------------------------ //
    // Flow lifecycle
    // ------------------------------------------------------------------ //

    pub fn flow_state(&self) -> FlowState {
        *self.state.lock().expect("state lock poisoned")
    }

    /// `Idle → Open`, running the flow-init policy.
    pub fn flow_init(&self) -> Result<(), EfcpError> {
        {
            let state = self.state.lock().expect("state lock poisoned");
            if *state != FlowState::Idle {
                return Err(EfcpError::ProtocolViolation("flow already opened"));
            }
        }
        (self.policies.flow_init)(self)?;
        if self.config().rate_based {
            (self.policies.initial_rate)(self)?;
        }
        *self.state.lock().expect("state lock poisoned") = FlowState::Open;
        tracing::info!("flow opened");
        Ok(())
    }

    /// `Open → Draining` on an upper-layer close request.
    pub fn start_draining(&self) {
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            if *state != FlowState::Open {
                return;
            }
            *state = FlowState::Draining;
        }
        tracing::info!("flow draining");
        self.try_finish_draining();
    }

    /// `Draining → Closed` once the retransmission queue is empty and no
    /// control PDUs are in transit.
    pub(crate) fn try_finish_draining(&self) {
        let rtxq_empty = match self.dtp() {
            Ok(dtp) => dtp.rtxq().is_empty(),
            Err(_) => true,
        };
        if !rtxq_empty {
            return;
        }
        if *self.cpdus_in_transit.lock().expect("cpdus lock poisoned") != 0 {
            return;
        }
        let mut state = self.state.lock().expect("state lock poisoned");
        if *state == FlowState::Draining {
            *state = FlowState::Closed;
            tracing::info!("flow closed");
        }
    }

    /// Unconditional transition to `Closed` after a fatal error.
    fn fatal_close(&self, error: &EfcpError) {
        tracing::error!(error = %error, "connection failed, closing");
        *self.state.lock().expect("state lock poisoned") = FlowState::Closed;
    }

    /// Block until all in-transit control PDUs are accounted for, bounded by
    /// `deadline`; on expiry the close is forced.
    pub fn shutdown(&self, deadline: Duration) {
        let count = self
            .cpdus_in_transit
            .lock()
            .expect("cpdus lock poisoned");
        let (count, wait) = self
            .cpdus_drained
            .wait_timeout_while(count, deadline, |c| *c > 0)
            .expect("cpdus lock poisoned");
        if wait.timed_out() && *count > 0 {
            tracing::warn!(in_transit = *count, "forcing close with control pdus in transit");
        }
        drop(count);
        *self.state.lock().expect("state lock poisoned") = FlowState::Closed;
    }

    // ------------------------------------------------------------------ //
    // State-vector access for the policy layer
    // ------------------------------------------------------------------ //

    pub fn snd_rt_wind_edge(&self) -> SeqNum {
        self.sv.lock().expect("sv lock poisoned").snd_rt_wind_edge
    }

    pub fn snd_lft_win(&self) -> SeqNum {
        self.sv.lock().expect("sv lock poisoned").snd_lft_win
    }

    pub fn rcvr_rt_wind_edge(&self) -> SeqNum {
        self.sv.lock().expect("sv lock poisoned").rcvr_rt_wind_edge
    }

    pub fn last_rcv_ctl_seq(&self) -> SeqNum {
        self.sv.lock().expect("sv lock poisoned").last_rcv_ctl_seq
    }

    /// Duplicate ACK count.
    pub fn dup_acks(&self) -> u64 {
        self.sv.lock().expect("sv lock poisoned").acks
    }

    /// Duplicate flow-control count.
    pub fn dup_flow_ctl(&self) -> u64 {
        self.sv.lock().expect("sv lock poisoned").flow_ctl
    }

    /// Advance the sender left-window edge to the acked value; the edge
    /// never moves backwards.
    pub(crate) fn advance_snd_lft_win(&self, ack: SeqNum) {
        let mut sv = self.sv.lock().expect("sv lock poisoned");
        if sv.snd_lft_win.lt(ack) {
            sv.snd_lft_win = ack;
        }
        if sv.last_rcv_data_ack.lt(ack) {
            sv.last_rcv_data_ack = ack;
        }
        debug_assert!(sv.ordering_invariant_holds());
        tracing::trace!(snd_lft_win = %sv.snd_lft_win, "sender left edge advanced");
    }

    /// `rcvr_rt_wind_edge := receiver LWE + rcvr_credit`.
    pub(crate) fn update_rcvr_rt_wind_edge(&self) -> Result<(), EfcpError> {
        let lwe = self.dtp()?.rcv_lft_win();
        let mut sv = self.sv.lock().expect("sv lock poisoned");
        sv.rcvr_rt_wind_edge = lwe.add(sv.rcvr_credit);
        tracing::trace!(rcvr_rt_wind_edge = %sv.rcvr_rt_wind_edge, "receiver right edge grown");
        Ok(())
    }

    /// Count a data PDU handed to the RMT against the rate gate.
    pub(crate) fn note_pdu_sent(&self) {
        if !self.config().rate_based {
            return;
        }
        let mut sv = self.sv.lock().expect("sv lock poisoned");
        sv.pdus_sent_in_time_unit += 1;
    }

    /// Count a received data PDU against the receiver rate.
    pub(crate) fn note_pdu_rcvd(&self) {
        if !self.config().rate_based {
            return;
        }
        let mut sv = self.sv.lock().expect("sv lock poisoned");
        sv.pdus_rcvd_in_time_unit += 1;
    }

    /// Whether the rate gate admits another PDU in this time unit.
    pub(crate) fn rate_gate_allows(&self) -> bool {
        self.sv
            .lock()
            .expect("sv lock poisoned")
            .rate_allowance()
            .is_none_or(|allowance| allowance > 0)
    }

    /// Whether the receiver still accepts data within its advertised rate
    /// for this time unit.
    pub(crate) fn rcvr_rate_admits(&self) -> bool {
        let sv = self.sv.lock().expect("sv lock poisoned");
        sv.rcvr_rate == 0 || sv.pdus_rcvd_in_time_unit < sv.rcvr_rate
    }

    /// Invoke the overrun policy for a PDU past the receiver window.
    pub(crate) fn flow_control_overrun(&self, pdu: Pdu) -> Result<(), EfcpError> {
        (self.policies.flow_control_overrun)(self, pdu)
    }

    /// Invoke the duplicate-data policy.
    pub(crate) fn on_received_retransmission(&self) {
        if let Err(e) = (self.policies.received_retransmission)(self) {
            tracing::warn!(error = %e, "received_retransmission policy failed");
        }
    }

    /// Run the state-vector update policy after delivery up to `seq`.
    pub fn sv_update(&self, seq: SeqNum) -> Result<(), EfcpError> {
        (self.policies.sv_update)(self, seq)
    }

    // ------------------------------------------------------------------ //
    // Control-PDU factory
    // ------------------------------------------------------------------ //

    /// Build a control PDU of the given type: fresh control sequence,
    /// connection addressing, the last control sequence received, and, when
    /// window-based flow control is on, the four window-edge fields.
    fn build_ctrl_pdu(&self, ty: PduType) -> Result<Pdu, EfcpError> {
        let lwe = self.dtp()?.rcv_lft_win();
        let cfg = self.config();

        let (ctl_seq, ctrl) = {
            let mut sv = self.sv.lock().expect("sv lock poisoned");
            let ctl_seq = sv.take_next_ctl_seq();
            let mut ctrl = CtrlPci {
                last_ctl_seq_rcvd: sv.last_rcv_ctl_seq,
                ..CtrlPci::default()
            };
            if cfg.flow_control && cfg.window_based {
                ctrl.my_left_wind_edge = sv.snd_lft_win;
                ctrl.my_rt_wind_edge = sv.snd_rt_wind_edge;
                ctrl.new_left_wind_edge = lwe;
                ctrl.new_rt_wind_edge = sv.rcvr_rt_wind_edge;
            }
            (ctl_seq, ctrl)
        };

        let mut ctrl = ctrl;
        ctrl.ack_seq = match ty {
            PduType::Ack | PduType::AckFc => lwe,
            PduType::Nack | PduType::NackFc => lwe.next(),
            PduType::Dt | PduType::Fc => ctrl.ack_seq,
        };

        let pci = Pci::new_control(
            ty,
            self.conn.src_addr(),
            self.conn.dst_addr(),
            self.conn.src_cep(),
            self.conn.dst_cep(),
            self.conn.qos_id(),
            ctl_seq,
            ctrl,
        )?;
        Ok(Pdu::new(pci, Vec::new()))
    }

    /// Control-PDU type for scheduled ACK emission, or `None` when there is
    /// nothing new to acknowledge.
    ///
    /// Updates `last_snd_data_ack` to the receiver left-window edge when it
    /// moved. Selective NACK emission stays disabled.
    fn ctrl_type_for_ack(&self) -> Result<Option<PduType>, EfcpError> {
        let lwe = self.dtp()?.rcv_lft_win();
        let mut sv = self.sv.lock().expect("sv lock poisoned");
        if sv.last_snd_data_ack.lt(lwe) {
            sv.last_snd_data_ack = lwe;
            let ty = if self.config().flow_control {
                PduType::AckFc
            } else {
                PduType::Ack
            };
            Ok(Some(ty))
        } else {
            tracing::trace!(lwe = %lwe, "left edge already acked, suppressing");
            Ok(None)
        }
    }

    fn send_ctrl(&self, pdu: Pdu) -> Result<(), EfcpError> {
        tracing::debug!(
            ctl_seq = %pdu.seq_num(),
            ty = ?pdu.pci.pdu_type,
            ack = %pdu.pci.ctrl.map(|c| c.ack_seq).unwrap_or_default(),
            "sending control pdu"
        );
        self.rmt
            .rmt_send(self.conn.dst_addr(), self.conn.qos_id(), pdu)
    }

    /// Emit an ACK / ACK+FC for the current receiver left-window edge, or
    /// nothing when the edge is already acknowledged.
    pub fn ack_flow_control_pdu_send(&self, seq: SeqNum) -> Result<(), EfcpError> {
        let _guard = InTransitGuard::new(self);
        tracing::trace!(seq = %seq, "scheduled ack emission");
        let Some(ty) = self.ctrl_type_for_ack()? else {
            return Ok(());
        };
        let pdu = self.build_ctrl_pdu(ty)?;
        self.send_ctrl(pdu)
    }

    /// Emit a bare flow-control PDU.
    pub(crate) fn send_fc_pdu(&self) -> Result<(), EfcpError> {
        let _guard = InTransitGuard::new(self);
        let pdu = self.build_ctrl_pdu(PduType::Fc)?;
        self.send_ctrl(pdu)
    }

    // ------------------------------------------------------------------ //
    // Common control receive path
    // ------------------------------------------------------------------ //

    /// Process an inbound control PDU.
    ///
    /// Duplicates bump the per-type counter and are dropped without state
    /// mutation; a gap in the control-sequence namespace triggers the
    /// lost-control-PDU policy before the PDU is processed.
    pub fn common_rcv_control(&self, pdu: Pdu) -> Result<(), EfcpError> {
        let _guard = InTransitGuard::new(self);

        if !pdu.is_control() {
            return Err(EfcpError::ProtocolViolation(
                "non-control pdu on the control path",
            ));
        }
        let ty = pdu.pci.pdu_type;
        let ctrl = pdu
            .pci
            .ctrl
            .ok_or(EfcpError::ProtocolViolation("control pdu without fields"))?;
        let seq = pdu.seq_num();

        let last_ctrl = self.last_rcv_ctl_seq();
        tracing::debug!(
            ctl_seq = %seq,
            last_ctrl = %last_ctrl,
            ty = ?ty,
            ack = %ctrl.ack_seq,
            new_rwe = %ctrl.new_rt_wind_edge,
            "control pdu received"
        );

        if last_ctrl.next().lt(seq) {
            if let Err(e) = (self.policies.lost_control_pdu)(self) {
                tracing::warn!(error = %e, "lost_control_pdu policy failed");
            }
        }

        if seq.le(last_ctrl) {
            let mut sv = self.sv.lock().expect("sv lock poisoned");
            match ty {
                PduType::Ack => sv.acks += 1,
                PduType::Fc | PduType::NackFc => sv.flow_ctl += 1,
                PduType::AckFc => {
                    sv.acks += 1;
                    sv.flow_ctl += 1;
                }
                PduType::Nack | PduType::Dt => {}
            }
            tracing::debug!(ctl_seq = %seq, "duplicate control pdu dropped");
            return Ok(());
        }

        {
            let mut sv = self.sv.lock().expect("sv lock poisoned");
            sv.last_rcv_ctl_seq = seq;
        }

        match ty {
            PduType::Ack => (self.policies.sender_ack)(self, ctrl.ack_seq),
            PduType::Nack => self.rcv_nack(ctrl.ack_seq),
            PduType::Fc => self.rcv_flow_ctl(ctrl.new_rt_wind_edge),
            PduType::AckFc => {
                if let Err(e) = (self.policies.sender_ack)(self, ctrl.ack_seq) {
                    tracing::warn!(error = %e, "sender_ack policy failed");
                }
                self.rcv_flow_ctl(ctrl.new_rt_wind_edge)
            }
            PduType::NackFc | PduType::Dt => {
                Err(EfcpError::ProtocolViolation("unhandled control pdu type"))
            }
        }
    }

    /// Flow-control consumption: adopt the peer's new right window edge,
    /// drain the closed-window queue, and reopen the window when everything
    /// parked fits again.
    fn rcv_flow_ctl(&self, new_rt_wind_edge: SeqNum) -> Result<(), EfcpError> {
        {
            let mut sv = self.sv.lock().expect("sv lock poisoned");
            sv.snd_rt_wind_edge = new_rt_wind_edge;
            debug_assert!(sv.ordering_invariant_holds());
        }
        tracing::debug!(snd_rt_wind_edge = %new_rt_wind_edge, "sender right edge updated");

        if let Err(e) = self.push_pdus_to_rmt() {
            tracing::warn!(error = %e, "cwq drain failed");
        }

        let dtp = self.dtp()?;
        if dtp.cwq().is_empty() && dtp.max_seq_sent().lt(self.snd_rt_wind_edge()) {
            dtp.set_window_closed(false);
        }
        Ok(())
    }

    /// Negative-acknowledgement consumption: resend the named PDU at once.
    fn rcv_nack(&self, nack_seq: SeqNum) -> Result<(), EfcpError> {
        if !self.config().rtx_control {
            return Ok(());
        }
        let dtp = self.dtp()?;
        let result = dtp.rtxq().nack(
            nack_seq,
            dtp.rtx_time(),
            Instant::now(),
            |pdu| {
                self.rmt
                    .rmt_send(self.conn.dst_addr(), self.conn.qos_id(), pdu)
            },
        );
        if let Err(e) = &result {
            if matches!(e, EfcpError::RetransmissionExhausted { .. }) {
                self.fatal_close(e);
            }
        }
        result
    }

    /// Drain the closed-window queue toward the RMT while the window and the
    /// rate gate permit.
    pub(crate) fn push_pdus_to_rmt(&self) -> Result<usize, EfcpError> {
        let dtp = self.dtp()?;
        let (edge, allowance) = {
            let sv = self.sv.lock().expect("sv lock poisoned");
            (sv.snd_rt_wind_edge, sv.rate_allowance())
        };
        let cfg = self.config();
        let window_gated = cfg.flow_control && cfg.window_based;
        let budget = Cell::new(allowance);

        dtp.cwq().deliver(
            |seq| {
                (!window_gated || seq.lt(edge))
                    && budget.get().is_none_or(|left| left > 0)
            },
            |pdu| {
                dtp.transmit_pdu(pdu)?;
                if let Some(left) = budget.get() {
                    budget.set(Some(left - 1));
                }
                Ok(())
            },
        )
    }

    // ------------------------------------------------------------------ //
    // Scheduled ticks
    // ------------------------------------------------------------------ //

    /// A-timer expiry: run the sending-ack policy.
    pub fn on_a_timer(&self) -> Result<(), EfcpError> {
        (self.policies.sending_ack)(self)
    }

    /// Rate-unit boundary: reset the per-unit counters and release anything
    /// the rate gate was holding back.
    pub fn on_rate_tick(&self) -> Result<(), EfcpError> {
        {
            let mut sv = self.sv.lock().expect("sv lock poisoned");
            sv.pdus_sent_in_time_unit = 0;
            sv.pdus_rcvd_in_time_unit = 0;
        }
        self.push_pdus_to_rmt()?;
        let dtp = self.dtp()?;
        if dtp.cwq().is_empty() && dtp.max_seq_sent().lt(self.snd_rt_wind_edge()) {
            dtp.set_window_closed(false);
        }
        Ok(())
    }

    /// Retransmission tick: resend every expired entry. Exhaustion of the
    /// retry budget is fatal for the connection.
    pub fn on_retransmission_tick(&self, now: Instant) -> Result<usize, EfcpError> {
        if !self.config().rtx_control {
            return Ok(0);
        }
        let dtp = self.dtp()?;
        if dtp.rtxq().head_expired(now) {
            if let Err(e) = (self.policies.retransmission_timer_expiry)(self) {
                tracing::warn!(error = %e, "retransmission_timer_expiry policy failed");
            }
        }
        let result = dtp.rtxq().retransmit_expired(now, dtp.rtx_time(), |pdu| {
            self.rmt
                .rmt_send(self.conn.dst_addr(), self.conn.qos_id(), pdu)
        });
        if let Err(e) = &result {
            if matches!(e, EfcpError::RetransmissionExhausted { .. }) {
                self.fatal_close(e);
            }
        }
        result
    }
}
