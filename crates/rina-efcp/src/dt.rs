//! The DT pair: builder and shared handle for a connection's DTP and DTCP
//! halves.
//!
//! DTP and DTCP each hold a non-owning back-reference to the other,
//! registered by the builder that owns both. Neither destroys its peer.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rina_core::{Millis, Pdu, SeqNum};

use crate::connection::Connection;
use crate::dtcp::policies::{DtcpPolicySet, PolicyRegistry};
use crate::dtcp::Dtcp;
use crate::dtp::Dtp;
use crate::error::EfcpError;
use crate::rmt::RmtSender;
use crate::timer::{self, TaskHandle};

/// Retransmission-tick period. The timer wheel granularity is not part of
/// the protocol contract.
const RTX_TICK_MS: Millis = 100;

/// Builder for a connection's DT pair.
#[must_use]
pub struct DtBuilder {
    conn: Connection,
    rmt: Arc<dyn RmtSender>,
    policies: DtcpPolicySet,
}

impl DtBuilder {
    pub fn new(conn: Connection, rmt: Arc<dyn RmtSender>) -> Self {
        Self {
            conn,
            rmt,
            policies: DtcpPolicySet::default(),
        }
    }

    /// Install an explicit policy set.
    pub fn with_policy_set(mut self, policies: DtcpPolicySet) -> Self {
        self.policies = policies;
        self
    }

    /// Resolve a named policy set from a registry.
    pub fn with_registered_policies(
        mut self,
        registry: &PolicyRegistry,
        name: &str,
    ) -> Result<Self, EfcpError> {
        self.policies = registry
            .get(name)
            .ok_or(EfcpError::BadArgument("unknown policy set"))?;
        Ok(self)
    }

    /// Create both halves, register the mutual back-references, and open the
    /// flow.
    pub fn build(self) -> Result<Dt, EfcpError> {
        let conn = Arc::new(self.conn);
        let dtp = Arc::new(Dtp::new(Arc::clone(&conn), Arc::clone(&self.rmt)));
        let dtcp = Arc::new(Dtcp::new(conn, self.rmt, self.policies));
        dtp.register_dtcp(&dtcp);
        dtcp.register_dtp(&dtp);
        dtcp.flow_init()?;
        Ok(Dt {
            dtp,
            dtcp,
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// A connection's DTP/DTCP pair plus its scheduled tasks.
#[derive(Debug)]
pub struct Dt {
    dtp: Arc<Dtp>,
    dtcp: Arc<Dtcp>,
    tasks: Mutex<Vec<TaskHandle>>,
}

impl Dt {
    pub fn dtp(&self) -> &Arc<Dtp> {
        &self.dtp
    }

    pub fn dtcp(&self) -> &Arc<Dtcp> {
        &self.dtcp
    }

    /// Send an SDU from the upper layer.
    pub fn send(&self, payload: Vec<u8>) -> Result<SeqNum, EfcpError> {
        self.dtp.send(payload)
    }

    /// The per-connection receive callback invoked by the RMT, FIFO per
    /// (src, dst, qos). Control PDUs go to the DTCP engine; data PDUs
    /// return the payloads delivered in order.
    pub fn receive(&self, pdu: Pdu) -> Result<Vec<Vec<u8>>, EfcpError> {
        if pdu.is_control() {
            self.dtcp.common_rcv_control(pdu)?;
            Ok(Vec::new())
        } else {
            self.dtp.receive(pdu)
        }
    }

    /// Start the periodic tasks this configuration needs: the
    /// retransmission tick, the rate-unit tick, and the A-timer.
    pub fn start_timers(&self) {
        let cfg = *self.dtcp.config();
        let mut tasks = self.tasks.lock().expect("task list poisoned");

        if cfg.rtx_control {
            let dtcp = Arc::downgrade(&self.dtcp);
            tasks.push(timer::schedule_periodic(
                Duration::from_millis(RTX_TICK_MS),
                move || match dtcp.upgrade() {
                    Some(dtcp) => {
                        let _ = dtcp.on_retransmission_tick(std::time::Instant::now());
                        dtcp.flow_state() != crate::dtcp::FlowState::Closed
                    }
                    None => false,
                },
            ));
        }

        if cfg.rate_based && cfg.time_unit_ms > 0 {
            let dtcp = Arc::downgrade(&self.dtcp);
            tasks.push(timer::schedule_periodic(
                Duration::from_millis(cfg.time_unit_ms),
                move || match dtcp.upgrade() {
                    Some(dtcp) => {
                        if let Err(e) = dtcp.on_rate_tick() {
                            tracing::warn!(error = %e, "rate tick failed");
                        }
                        dtcp.flow_state() != crate::dtcp::FlowState::Closed
                    }
                    None => false,
                },
            ));
        }

        if cfg.a_timer_ms > 0 {
            let dtcp = Arc::downgrade(&self.dtcp);
            tasks.push(timer::schedule_periodic(
                Duration::from_millis(cfg.a_timer_ms),
                move || match dtcp.upgrade() {
                    Some(dtcp) => {
                        if let Err(e) = dtcp.on_a_timer() {
                            tracing::warn!(error = %e, "a-timer tick failed");
                        }
                        dtcp.flow_state() != crate::dtcp::FlowState::Closed
                    }
                    None => false,
                },
            ));
        }
    }

    /// Upper-layer close request: stop admitting new data, keep
    /// acknowledging and retransmitting until the queues drain.
    pub fn close(&self) {
        self.dtcp.start_draining();
    }

    /// Tear down: cancel every scheduled task, then wait (bounded) for
    /// in-transit control PDUs to drain.
    pub fn shutdown(&self, deadline: Duration) {
        for task in self.tasks.lock().expect("task list poisoned").drain(..) {
            task.cancel();
        }
        self.dtcp.shutdown(deadline);
    }
}
