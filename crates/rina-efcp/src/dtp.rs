//! DTP sender/receiver state vector and data paths.
//!
//! The DTP half owns the data sequence namespace, the closed-window queue,
//! and the retransmission queue. Its DTCP peer reads and updates a small set
//! of DTP-owned values through the narrow accessor surface here; those calls
//! take the DTP lock internally.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use rina_core::constants::FIRST_DATA_SEQ;
use rina_core::{Millis, Pci, Pdu, SeqNum};

use crate::connection::Connection;
use crate::cwq::ClosedWindowQueue;
use crate::dtcp::{Dtcp, FlowState};
use crate::error::EfcpError;
use crate::rmt::RmtSender;
use crate::rtxq::RetransmissionQueue;

/// Default retransmission timeout until an RTT estimator adjusts it.
const DEFAULT_RTX_TIME_MS: Millis = 1000;

/// The DTP-owned state vector.
#[derive(Debug)]
struct DtpSv {
    /// Next sequence number to assign to an outgoing data PDU.
    next_seq: SeqNum,
    /// Highest data sequence handed to the RMT.
    max_seq_sent: SeqNum,
    /// Receiver left-window edge: one past the highest in-order sequence
    /// delivered.
    rcv_lft_win: SeqNum,
    /// Whether the send window is currently closed.
    window_closed: bool,
    /// Delayed-ACK interval; zero means no delayed ACK.
    a_timer_ms: Millis,
    /// Retransmission timeout.
    rtx_time_ms: Millis,
    /// Payloads received ahead of the left-window edge, keyed by sequence.
    out_of_order: HashMap<u32, Vec<u8>>,
}

/// The DTP instance of a connection.
#[derive(Debug)]
pub struct Dtp {
    sv: Mutex<DtpSv>,
    cwq: ClosedWindowQueue,
    rtxq: RetransmissionQueue,
    conn: Arc<Connection>,
    rmt: Arc<dyn RmtSender>,
    dtcp: OnceLock<Weak<Dtcp>>,
}

impl Dtp {
    pub(crate) fn new(conn: Arc<Connection>, rmt: Arc<dyn RmtSender>) -> Self {
        let cfg = conn.config();
        Self {
            sv: Mutex::new(DtpSv {
                next_seq: SeqNum::new(FIRST_DATA_SEQ),
                max_seq_sent: SeqNum::ZERO,
                rcv_lft_win: SeqNum::new(FIRST_DATA_SEQ),
                window_closed: false,
                a_timer_ms: cfg.a_timer_ms,
                rtx_time_ms: DEFAULT_RTX_TIME_MS,
                out_of_order: HashMap::new(),
            }),
            cwq: ClosedWindowQueue::new(),
            rtxq: RetransmissionQueue::new(cfg.data_retransmit_max),
            conn,
            rmt,
            dtcp: OnceLock::new(),
        }
    }

    pub(crate) fn register_dtcp(&self, dtcp: &Arc<Dtcp>) {
        let _ = self.dtcp.set(Arc::downgrade(dtcp));
    }

    fn dtcp_opt(&self) -> Option<Arc<Dtcp>> {
        self.dtcp.get().and_then(Weak::upgrade)
    }

    fn dtcp(&self) -> Result<Arc<Dtcp>, EfcpError> {
        self.dtcp_opt()
            .ok_or(EfcpError::BadArgument("dtcp peer not registered"))
    }

    // ------------------------------------------------------------------ //
    // Narrow interface consumed by DTCP
    // ------------------------------------------------------------------ //

    /// Receiver left-window edge.
    pub fn rcv_lft_win(&self) -> SeqNum {
        self.sv.lock().expect("dtp lock poisoned").rcv_lft_win
    }

    /// Current A-timer value; zero means no delayed ACK.
    pub fn a_timer(&self) -> Millis {
        self.sv.lock().expect("dtp lock poisoned").a_timer_ms
    }

    /// Highest data sequence handed to the RMT.
    pub fn max_seq_sent(&self) -> SeqNum {
        self.sv.lock().expect("dtp lock poisoned").max_seq_sent
    }

    pub fn window_closed(&self) -> bool {
        self.sv.lock().expect("dtp lock poisoned").window_closed
    }

    /// Set or clear the window-closed flag. Clearing drains the
    /// closed-window queue toward the RMT.
    pub fn set_window_closed(&self, closed: bool) {
        {
            let mut sv = self.sv.lock().expect("dtp lock poisoned");
            if sv.window_closed != closed {
                tracing::debug!(closed, "window-closed flag changed");
            }
            sv.window_closed = closed;
        }
        if !closed {
            if let Some(dtcp) = self.dtcp_opt() {
                if let Err(e) = dtcp.push_pdus_to_rmt() {
                    tracing::warn!(error = %e, "cwq drain after window reopen failed");
                }
            }
        }
    }

    /// Current retransmission timeout.
    pub fn rtx_time(&self) -> Duration {
        Duration::from_millis(self.sv.lock().expect("dtp lock poisoned").rtx_time_ms)
    }

    /// Adjust the retransmission timeout (RTT estimator hook point).
    pub fn set_rtx_time(&self, rtx_time_ms: Millis) {
        self.sv.lock().expect("dtp lock poisoned").rtx_time_ms = rtx_time_ms;
    }

    /// The closed-window queue.
    pub fn cwq(&self) -> &ClosedWindowQueue {
        &self.cwq
    }

    /// The retransmission queue.
    pub fn rtxq(&self) -> &RetransmissionQueue {
        &self.rtxq
    }

    /// Delimiting step of A-timer expiry: the left-window edge to
    /// acknowledge.
    pub(crate) fn process_a_expiry(&self) -> SeqNum {
        self.rcv_lft_win()
    }

    // ------------------------------------------------------------------ //
    // Send path
    // ------------------------------------------------------------------ //

    /// Accept an SDU from the upper layer: assign the next sequence number
    /// and either hand the PDU to the RMT or park it on the closed-window
    /// queue. Returns the assigned sequence number.
    pub fn send(&self, payload: Vec<u8>) -> Result<SeqNum, EfcpError> {
        let dtcp = self.dtcp()?;
        match dtcp.flow_state() {
            FlowState::Open => {}
            FlowState::Idle => {
                return Err(EfcpError::ProtocolViolation("flow not open"));
            }
            FlowState::Draining | FlowState::Closed => return Err(EfcpError::Closed),
        }

        let seq = {
            let mut sv = self.sv.lock().expect("dtp lock poisoned");
            let seq = sv.next_seq;
            sv.next_seq = seq.next();
            seq
        };

        let pdu = Pdu::new(
            Pci::new_dt(
                self.conn.src_addr(),
                self.conn.dst_addr(),
                self.conn.src_cep(),
                self.conn.dst_cep(),
                self.conn.qos_id(),
                seq,
            ),
            payload,
        );

        let cfg = self.conn.config();
        let window_ok =
            !(cfg.flow_control && cfg.window_based) || seq.lt(dtcp.snd_rt_wind_edge());
        let rate_ok = !(cfg.flow_control && cfg.rate_based) || dtcp.rate_gate_allows();

        if window_ok && rate_ok {
            self.transmit_pdu(pdu)?;
        } else {
            tracing::debug!(seq = %seq, window_ok, rate_ok, "parking pdu on cwq");
            self.cwq.push(pdu);
            self.sv.lock().expect("dtp lock poisoned").window_closed = true;
        }
        Ok(seq)
    }

    /// Hand a data PDU to the RMT, tracking it for retransmission and
    /// advancing `max_seq_sent`.
    pub(crate) fn transmit_pdu(&self, pdu: Pdu) -> Result<(), EfcpError> {
        let seq = pdu.seq_num();
        let cfg = self.conn.config();
        if cfg.rtx_control {
            self.rtxq.push(pdu.clone(), self.rtx_time(), Instant::now());
        }
        self.rmt
            .rmt_send(self.conn.dst_addr(), self.conn.qos_id(), pdu)?;
        {
            let mut sv = self.sv.lock().expect("dtp lock poisoned");
            sv.max_seq_sent = sv.max_seq_sent.later(seq);
        }
        if let Some(dtcp) = self.dtcp_opt() {
            dtcp.note_pdu_sent();
        }
        tracing::trace!(seq = %seq, "data pdu handed to rmt");
        Ok(())
    }

    // ------------------------------------------------------------------ //
    // Receive path
    // ------------------------------------------------------------------ //

    /// Process an inbound data PDU. Returns the payloads delivered in order
    /// to the upper layer by this reception.
    pub fn receive(&self, pdu: Pdu) -> Result<Vec<Vec<u8>>, EfcpError> {
        if pdu.is_control() {
            return Err(EfcpError::ProtocolViolation(
                "control pdu on the data path",
            ));
        }
        let dtcp = self.dtcp()?;
        let seq = pdu.seq_num();
        let cfg = self.conn.config();

        if cfg.flow_control && cfg.window_based {
            let rwe = dtcp.rcvr_rt_wind_edge();
            if rwe.le(seq) {
                tracing::debug!(seq = %seq, rwe = %rwe, "data pdu beyond receiver window");
                dtcp.flow_control_overrun(pdu)?;
                return Ok(Vec::new());
            }
        }

        // Once the advertised rate is consumed the receiver may discard
        // anything further until a new time unit begins.
        if cfg.flow_control && cfg.rate_based && !dtcp.rcvr_rate_admits() {
            tracing::debug!(seq = %seq, "receiver rate consumed, discarding pdu");
            dtcp.flow_control_overrun(pdu)?;
            return Ok(Vec::new());
        }

        let (delivered, lwe) = {
            let mut sv = self.sv.lock().expect("dtp lock poisoned");
            if seq.lt(sv.rcv_lft_win) {
                drop(sv);
                tracing::debug!(seq = %seq, "duplicate data pdu");
                dtcp.on_received_retransmission();
                return Ok(Vec::new());
            }

            let mut delivered = Vec::new();
            if seq == sv.rcv_lft_win {
                delivered.push(pdu.payload);
                sv.rcv_lft_win = sv.rcv_lft_win.next();
                while let Some(payload) = {
                    let key = sv.rcv_lft_win.value();
                    sv.out_of_order.remove(&key)
                } {
                    delivered.push(payload);
                    sv.rcv_lft_win = sv.rcv_lft_win.next();
                }
            } else {
                sv.out_of_order.insert(seq.value(), pdu.payload);
            }
            (delivered, sv.rcv_lft_win)
        };

        dtcp.note_pdu_rcvd();

        // With A = 0 the state-vector update (and any resulting ACK) runs
        // immediately; otherwise the A-timer batches it.
        if self.a_timer() == 0 {
            if let Err(e) = dtcp.sv_update(lwe) {
                tracing::warn!(error = %e, "sv_update after data reception failed");
            }
        }

        Ok(delivered)
    }
}
