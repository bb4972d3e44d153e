//! The enrollment task: machine registry, CDAP dispatch, and the periodic
//! liveness and neighbor-enroller loops.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{unbounded, Receiver, Sender};

use rina_core::{Millis, PortId};
use rina_efcp::timer::{self, TaskHandle};

use crate::cdap::{obj, CdapMessage, CdapOp, ObjValue};
use crate::enrollee::Enrollee;
use crate::enroller::Enroller;
use crate::error::EnrollmentError;
use crate::neighbor::Neighbor;
use crate::rib::Rib;
use crate::watchdog::{Watchdog, WatchdogAction};

/// Period of the internal-event pump when running on timers.
const INTERNAL_PUMP_MS: Millis = 100;

/// Enrollment-task configuration knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnrollmentConfig {
    pub enrollment_timeout_ms: Millis,
    pub watchdog_period_ms: Millis,
    pub declared_dead_interval_ms: Millis,
    pub neighbor_enroller_period_ms: Millis,
    pub max_enrollment_attempts: u32,
}

impl Default for EnrollmentConfig {
    fn default() -> Self {
        Self {
            enrollment_timeout_ms: 10_000,
            watchdog_period_ms: 30_000,
            declared_dead_interval_ms: 120_000,
            neighbor_enroller_period_ms: 10_000,
            max_enrollment_attempts: 3,
        }
    }
}

/// Outbound half of the layer-management flow.
pub trait CdapSender: Send + Sync {
    fn send_cdap(&self, port: PortId, msg: CdapMessage) -> Result<(), EnrollmentError>;
}

/// Allocation of N-1 flows dedicated to layer management.
pub trait FlowAllocator: Send + Sync {
    /// Request a flow; the returned handle is matched by
    /// [`EnrollmentTask::flow_allocated`].
    fn allocate_flow(&self, local: &str, remote: &str, dif: &str)
        -> Result<u64, EnrollmentError>;
    fn deallocate_flow(&self, port: PortId);
}

/// Address validity and assignment decisions.
pub trait NamespaceManager: Send + Sync {
    fn is_valid_address(&self, address: u32, ap_name: &str) -> bool;
    fn allocate_address(&self, ap_name: &str) -> Option<u32>;
}

/// Admission decisions; authentication mechanisms plug in here.
pub trait SecurityPolicy: Send + Sync {
    fn allowed_to_join(&self, ap_name: &str) -> bool;
}

/// The permissive default security policy.
#[derive(Debug, Default)]
pub struct AllowAll;

impl SecurityPolicy for AllowAll {
    fn allowed_to_join(&self, _ap_name: &str) -> bool {
        true
    }
}

/// Events surfaced toward the IPC manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrollmentEvent {
    Completed {
        peer: String,
        port: PortId,
        enrollee: bool,
        address: u32,
        dif_name: String,
    },
    Failed {
        peer: String,
        port: PortId,
        reason: String,
    },
    NeighborDeclaredDead {
        name: String,
    },
}

/// Events the task delivers to itself (timer context to task context).
#[derive(Debug, Clone)]
pub enum InternalEvent {
    EnrollmentTimeout {
        port: PortId,
        reason: &'static str,
    },
}

/// Shared handles the state machines act through.
#[derive(Clone)]
pub struct EnrollmentServices {
    pub cdap: Arc<dyn CdapSender>,
    pub rib: Arc<Mutex<Rib>>,
    pub internal: Sender<InternalEvent>,
    pub events: Sender<EnrollmentEvent>,
    pub local_name: String,
}

#[derive(Debug)]
enum Machine {
    Enrollee(Enrollee),
    Enroller(Enroller),
}

impl Machine {
    fn peer_name(&self) -> &str {
        match self {
            Machine::Enrollee(m) => m.peer_name(),
            Machine::Enroller(m) => m.peer_name(),
        }
    }

    fn is_active(&self) -> bool {
        match self {
            Machine::Enrollee(m) => m.state() != crate::enrollee::EnrolleeState::Null,
            Machine::Enroller(m) => m.state() != crate::enroller::EnrollerState::Null,
        }
    }

    fn cancel_timeout(&mut self) {
        match self {
            Machine::Enrollee(m) => m.cancel_timeout(),
            Machine::Enroller(m) => m.cancel_timeout(),
        }
    }
}

#[derive(Debug, Clone)]
struct PendingRequest {
    neighbor_name: String,
    supporting_dif: String,
}

/// Wall-clock milliseconds since the epoch.
pub fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The enrollment task of one IPC process.
pub struct EnrollmentTask {
    config: EnrollmentConfig,
    svc: EnrollmentServices,
    machines: Mutex<HashMap<u32, Machine>>,
    pending_flows: Mutex<HashMap<u64, PendingRequest>>,
    internal_rx: Receiver<InternalEvent>,
    flows: Arc<dyn FlowAllocator>,
    nsm: Arc<dyn NamespaceManager>,
    security: Arc<dyn SecurityPolicy>,
    watchdog: Mutex<Watchdog>,
    background: Mutex<Vec<TaskHandle>>,
}

impl EnrollmentTask {
    /// Build the task; the returned receiver carries events for the IPC
    /// manager.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EnrollmentConfig,
        local_name: &str,
        rib: Arc<Mutex<Rib>>,
        cdap: Arc<dyn CdapSender>,
        flows: Arc<dyn FlowAllocator>,
        nsm: Arc<dyn NamespaceManager>,
        security: Arc<dyn SecurityPolicy>,
    ) -> (Arc<Self>, Receiver<EnrollmentEvent>) {
        let (events_tx, events_rx) = unbounded();
        let (internal_tx, internal_rx) = unbounded();
        let task = Arc::new(Self {
            config,
            svc: EnrollmentServices {
                cdap,
                rib,
                internal: internal_tx,
                events: events_tx,
                local_name: local_name.to_string(),
            },
            machines: Mutex::new(HashMap::new()),
            pending_flows: Mutex::new(HashMap::new()),
            internal_rx,
            flows,
            nsm,
            security,
            watchdog: Mutex::new(Watchdog::new(
                config.watchdog_period_ms,
                config.declared_dead_interval_ms,
            )),
            background: Mutex::new(Vec::new()),
        });
        (task, events_rx)
    }

    pub fn rib(&self) -> &Arc<Mutex<Rib>> {
        &self.svc.rib
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.enrollment_timeout_ms)
    }

    /// Whether any active state machine points at this peer.
    pub fn is_enrolled_to(&self, name: &str) -> bool {
        self.machines
            .lock()
            .expect("machines lock poisoned")
            .values()
            .any(|m| m.peer_name() == name && m.is_active())
    }

    // ------------------------------------------------------------------ //
    // IPC-manager boundary
    // ------------------------------------------------------------------ //

    /// Begin enrolling to a neighbor over a supporting DIF. Returns the
    /// flow-allocation handle; enrollment proceeds once the flow is up.
    pub fn enroll_to_dif(
        &self,
        neighbor_name: &str,
        supporting_dif: &str,
    ) -> Result<u64, EnrollmentError> {
        if self.is_enrolled_to(neighbor_name) {
            return Err(EnrollmentError::AlreadyEnrolled(neighbor_name.to_string()));
        }
        let handle =
            self.flows
                .allocate_flow(&self.svc.local_name, neighbor_name, supporting_dif)?;
        self.pending_flows
            .lock()
            .expect("pending lock poisoned")
            .insert(
                handle,
                PendingRequest {
                    neighbor_name: neighbor_name.to_string(),
                    supporting_dif: supporting_dif.to_string(),
                },
            );
        tracing::debug!(neighbor = neighbor_name, handle, "layer-management flow requested");
        Ok(handle)
    }

    /// The N-1 flow for a pending request came up: create the enrollee
    /// machine and initiate.
    pub fn flow_allocated(&self, handle: u64, port: PortId) -> Result<(), EnrollmentError> {
        let Some(request) = self
            .pending_flows
            .lock()
            .expect("pending lock poisoned")
            .remove(&handle)
        else {
            return Err(EnrollmentError::UnknownMachine);
        };

        let mut machine = Enrollee::new(
            &request.neighbor_name,
            port,
            self.timeout(),
            vec![request.supporting_dif],
        );
        let result = machine.initiate(&self.svc);
        self.machines
            .lock()
            .expect("machines lock poisoned")
            .insert(port.value(), Machine::Enrollee(machine));
        if let Err(e) = result {
            self.enrollment_failed(port, &e.to_string(), true);
            return Err(e);
        }
        Ok(())
    }

    /// The N-1 flow for a pending request could not be allocated.
    pub fn flow_allocation_failed(&self, handle: u64) {
        if let Some(request) = self
            .pending_flows
            .lock()
            .expect("pending lock poisoned")
            .remove(&handle)
        {
            tracing::warn!(
                neighbor = %request.neighbor_name,
                handle,
                "management flow allocation failed"
            );
            let _ = self.svc.events.send(EnrollmentEvent::Failed {
                peer: request.neighbor_name,
                port: PortId::new(0),
                reason: "management flow allocation failed".to_string(),
            });
        }
    }

    // ------------------------------------------------------------------ //
    // Inbound CDAP dispatch
    // ------------------------------------------------------------------ //

    /// Process one CDAP message delivered on a layer-management flow.
    pub fn handle_cdap(&self, port: PortId, msg: CdapMessage) -> Result<(), EnrollmentError> {
        tracing::trace!(port = %port, op = ?msg.op, obj = %msg.obj_class, "cdap message");
        self.note_heard_from(&msg.src_ap_name);

        let result = match msg.op {
            CdapOp::Connect => self.on_connect(port, &msg),
            CdapOp::ConnectR => self.with_enrollee(port, |m, svc| {
                m.connect_response(svc, msg.result, &msg.result_reason)
            }),
            CdapOp::Start => self.on_start_request(port, &msg),
            CdapOp::StartR => self.with_enrollee(port, |m, svc| {
                m.start_response(svc, msg.result, &msg.result_reason, &msg.value)
            }),
            CdapOp::Stop => match &msg.value {
                ObjValue::EnrollmentInfo(info) => {
                    self.with_enrollee(port, |m, svc| m.stop(svc, info, msg.invoke_id))
                }
                _ => Err(EnrollmentError::Rejected(
                    "stop without enrollment information".to_string(),
                )),
            },
            CdapOp::StopR => self.with_enroller(port, |m, svc| {
                m.stop_response(svc, msg.result, &msg.result_reason)
            }),
            CdapOp::Create => {
                self.on_create(&msg);
                Ok(())
            }
            CdapOp::Read => self.on_read(port, &msg),
            CdapOp::ReadR => self.on_read_response(port, msg.clone()),
            CdapOp::Release => {
                self.on_release(port, msg.invoke_id);
                Ok(())
            }
            CdapOp::ReleaseR => Ok(()),
        };

        if let Err(e) = &result {
            tracing::warn!(port = %port, error = %e, "enrollment message failed");
            self.enrollment_failed(port, &e.to_string(), true);
        }
        result
    }

    fn on_connect(&self, port: PortId, msg: &CdapMessage) -> Result<(), EnrollmentError> {
        let peer = msg.src_ap_name.clone();

        if self.is_enrolled_to(&peer) {
            let reason = "already enrolled to this ipc process";
            let _ = self.svc.cdap.send_cdap(
                port,
                CdapMessage::response(CdapOp::ConnectR, msg.invoke_id, -2, reason, ObjValue::None)
                    .between(&self.svc.local_name, &peer),
            );
            self.flows.deallocate_flow(port);
            return Err(EnrollmentError::AlreadyEnrolled(peer));
        }

        let mut machine = Enroller::new(&peer, port, self.timeout());
        let allowed = self.security.allowed_to_join(&peer);
        let result = machine.connect(&self.svc, allowed, msg.invoke_id);
        self.machines
            .lock()
            .expect("machines lock poisoned")
            .insert(port.value(), Machine::Enroller(machine));
        result
    }

    fn on_start_request(&self, port: PortId, msg: &CdapMessage) -> Result<(), EnrollmentError> {
        match msg.obj_class.as_str() {
            obj::ENROLLMENT_INFO_CLASS => {
                let info = match &msg.value {
                    ObjValue::EnrollmentInfo(info) => Some(info.clone()),
                    _ => None,
                };
                let nsm = Arc::clone(&self.nsm);
                self.with_enroller(port, |m, svc| {
                    m.start(svc, nsm.as_ref(), info, msg.invoke_id)
                })
            }
            obj::OPERATIONAL_STATUS_CLASS => {
                self.with_enrollee(port, |m, svc| m.start(svc, msg.result))
            }
            _ => Err(EnrollmentError::Rejected(format!(
                "start on unexpected object {}",
                msg.obj_class
            ))),
        }
    }

    /// Objects the enroller pushes during enrollment land directly in the
    /// RIB.
    fn on_create(&self, msg: &CdapMessage) {
        let mut rib = self.svc.rib.lock().expect("rib lock poisoned");
        match msg.value.clone() {
            ObjValue::Constants(constants) => rib.create_constants(constants),
            ObjValue::QosCubes(cubes) => rib.merge_qos_cubes(cubes),
            ObjValue::WhatevercastNames(names) => rib.merge_whatevercast_names(names),
            ObjValue::Neighbors(neighbors) => rib.merge_neighbor_descriptors(neighbors),
            ObjValue::DftEntries(entries) => rib.merge_dft_entries(entries),
            other => {
                tracing::warn!(obj = %msg.obj_class, ?other, "create for an unhandled object");
            }
        }
    }

    /// Serve a read of one of our RIB objects (enrollment pulls and
    /// watchdog probes alike).
    fn on_read(&self, port: PortId, msg: &CdapMessage) -> Result<(), EnrollmentError> {
        let value = {
            let rib = self.svc.rib.lock().expect("rib lock poisoned");
            match msg.obj_class.as_str() {
                obj::ADDRESS_CLASS => Some(ObjValue::Int(rib.address as i64)),
                obj::DATA_TRANSFER_CONSTANTS_CLASS => {
                    rib.constants.clone().map(ObjValue::Constants)
                }
                obj::QOS_CUBE_SET_CLASS => Some(ObjValue::QosCubes(rib.qos_cubes.clone())),
                obj::NEIGHBOR_SET_CLASS => {
                    Some(ObjValue::Neighbors(rib.neighbor_descriptors()))
                }
                obj::WHATEVERCAST_NAME_SET_CLASS => {
                    Some(ObjValue::WhatevercastNames(rib.whatevercast_names.clone()))
                }
                obj::DFT_ENTRY_SET_CLASS => Some(ObjValue::DftEntries(rib.dft_entries.clone())),
                _ => None,
            }
        };

        let response = match value {
            Some(value) => {
                let mut r =
                    CdapMessage::response(CdapOp::ReadR, msg.invoke_id, 0, "", value);
                r.obj_class = msg.obj_class.clone();
                r.obj_name = msg.obj_name.clone();
                r
            }
            None => CdapMessage::response(
                CdapOp::ReadR,
                msg.invoke_id,
                -1,
                "no such object",
                ObjValue::None,
            ),
        };
        self.svc.cdap.send_cdap(
            port,
            response.between(&self.svc.local_name, &msg.src_ap_name),
        )
    }

    fn on_read_response(&self, port: PortId, msg: CdapMessage) -> Result<(), EnrollmentError> {
        // Watchdog probes read the peer's address object; everything else
        // belongs to an enrollee pulling missing state.
        if msg.obj_class == obj::ADDRESS_CLASS {
            self.watchdog_read_response(&msg.src_ap_name, unix_now_ms());
            return Ok(());
        }
        self.with_enrollee(port, |m, svc| {
            m.read_response(svc, msg.result, &msg.result_reason, msg.value)
        })
    }

    fn on_release(&self, port: PortId, invoke_id: u32) {
        if let Some(mut machine) = self
            .machines
            .lock()
            .expect("machines lock poisoned")
            .remove(&port.value())
        {
            machine.cancel_timeout();
            let _ = self.svc.cdap.send_cdap(
                port,
                CdapMessage::response(CdapOp::ReleaseR, invoke_id, 0, "", ObjValue::None)
                    .between(&self.svc.local_name, machine.peer_name()),
            );
        }
        self.flows.deallocate_flow(port);
    }

    fn with_enrollee<F>(&self, port: PortId, f: F) -> Result<(), EnrollmentError>
    where
        F: FnOnce(&mut Enrollee, &EnrollmentServices) -> Result<(), EnrollmentError>,
    {
        let mut machines = self.machines.lock().expect("machines lock poisoned");
        match machines.get_mut(&port.value()) {
            Some(Machine::Enrollee(m)) => f(m, &self.svc),
            _ => Err(EnrollmentError::UnknownMachine),
        }
    }

    fn with_enroller<F>(&self, port: PortId, f: F) -> Result<(), EnrollmentError>
    where
        F: FnOnce(&mut Enroller, &EnrollmentServices) -> Result<(), EnrollmentError>,
    {
        let mut machines = self.machines.lock().expect("machines lock poisoned");
        match machines.get_mut(&port.value()) {
            Some(Machine::Enroller(m)) => f(m, &self.svc),
            _ => Err(EnrollmentError::UnknownMachine),
        }
    }

    // ------------------------------------------------------------------ //
    // Failure and liveness handling
    // ------------------------------------------------------------------ //

    /// Abort whatever machine lives on `port`: remove it, optionally
    /// release the flow, and tell the IPC manager.
    pub fn enrollment_failed(&self, port: PortId, reason: &str, release_flow: bool) {
        let machine = self
            .machines
            .lock()
            .expect("machines lock poisoned")
            .remove(&port.value());
        let Some(mut machine) = machine else {
            return;
        };
        machine.cancel_timeout();
        tracing::warn!(
            peer = %machine.peer_name(),
            port = %port,
            reason,
            "enrollment failed"
        );
        if release_flow {
            self.flows.deallocate_flow(port);
        }
        let _ = self.svc.events.send(EnrollmentEvent::Failed {
            peer: machine.peer_name().to_string(),
            port,
            reason: reason.to_string(),
        });
    }

    /// Drain timeout events queued from the timer context.
    pub fn process_internal_events(&self) {
        for event in self.internal_rx.try_iter().collect::<Vec<_>>() {
            match event {
                InternalEvent::EnrollmentTimeout { port, reason } => {
                    self.enrollment_failed(port, &format!("timeout waiting for {reason}"), true);
                }
            }
        }
    }

    fn note_heard_from(&self, peer: &str) {
        if peer.is_empty() {
            return;
        }
        let mut rib = self.svc.rib.lock().expect("rib lock poisoned");
        if let Some(neighbor) = rib.neighbor_mut(peer) {
            neighbor.last_heard_from_ms = unix_now_ms();
        }
    }

    /// One watchdog period: probe quiet neighbors, declare dead ones.
    ///
    /// The neighbor set is snapshotted before the watchdog lock is taken;
    /// probe replies take the locks in the opposite order.
    pub fn watchdog_tick(&self, now_ms: u64) {
        let snapshot: Vec<Neighbor> = {
            let rib = self.svc.rib.lock().expect("rib lock poisoned");
            rib.neighbors().cloned().collect()
        };
        let actions = self
            .watchdog
            .lock()
            .expect("watchdog lock poisoned")
            .tick(snapshot.iter(), now_ms);
        for action in actions {
            match action {
                WatchdogAction::SendRead { name, port } => {
                    let msg = CdapMessage::request(
                        CdapOp::Read,
                        0,
                        obj::ADDRESS_CLASS,
                        obj::ADDRESS_NAME,
                        ObjValue::None,
                    )
                    .between(&self.svc.local_name, &name);
                    if let Err(e) = self.svc.cdap.send_cdap(port, msg) {
                        tracing::warn!(neighbor = %name, error = %e, "watchdog probe failed");
                    }
                }
                WatchdogAction::DeclareDead { name } => self.neighbor_declared_dead(&name),
            }
        }
    }

    /// A watchdog probe was answered.
    pub fn watchdog_read_response(&self, peer: &str, now_ms: u64) {
        let rtt = self
            .watchdog
            .lock()
            .expect("watchdog lock poisoned")
            .on_read_response(peer, now_ms);
        if let Some(rtt) = rtt {
            let mut rib = self.svc.rib.lock().expect("rib lock poisoned");
            if let Some(neighbor) = rib.neighbor_mut(peer) {
                neighbor.average_rtt_ms = rtt;
                neighbor.last_heard_from_ms = now_ms;
            }
        }
    }

    /// A neighbor stopped answering: release its supporting flow and tell
    /// the IPC manager.
    pub fn neighbor_declared_dead(&self, name: &str) {
        let port = {
            let mut rib = self.svc.rib.lock().expect("rib lock poisoned");
            rib.neighbor_mut(name).map(|n| {
                n.enrolled = false;
                n.underlying_port_id
            })
        };
        if let Some(port) = port {
            self.flows.deallocate_flow(port);
            if let Some(mut machine) = self
                .machines
                .lock()
                .expect("machines lock poisoned")
                .remove(&port.value())
            {
                machine.cancel_timeout();
            }
        }
        let _ = self.svc.events.send(EnrollmentEvent::NeighborDeclaredDead {
            name: name.to_string(),
        });
    }

    /// One pass of the neighbor enroller: retry unenrolled neighbors with
    /// remaining attempts, drop the rest from the RIB.
    pub fn neighbor_enroller_pass(&self) {
        let candidates: Vec<(String, String, u32)> = {
            let rib = self.svc.rib.lock().expect("rib lock poisoned");
            rib.neighbors()
                .map(|n| {
                    (
                        n.name.clone(),
                        n.supporting_difs.first().cloned().unwrap_or_default(),
                        n.enrollment_attempts,
                    )
                })
                .collect()
        };

        for (name, supporting_dif, attempts) in candidates {
            if self.is_enrolled_to(&name) {
                continue;
            }
            if attempts < self.config.max_enrollment_attempts {
                {
                    let mut rib = self.svc.rib.lock().expect("rib lock poisoned");
                    if let Some(neighbor) = rib.neighbor_mut(&name) {
                        neighbor.enrollment_attempts += 1;
                    }
                }
                if let Err(e) = self.enroll_to_dif(&name, &supporting_dif) {
                    tracing::warn!(neighbor = %name, error = %e, "re-enrollment attempt failed");
                }
            } else {
                tracing::info!(
                    neighbor = %name,
                    attempts,
                    "giving up on neighbor, removing from rib"
                );
                self.svc
                    .rib
                    .lock()
                    .expect("rib lock poisoned")
                    .remove_neighbor(&name);
            }
        }
    }

    // ------------------------------------------------------------------ //
    // Background tasks
    // ------------------------------------------------------------------ //

    /// Start the watchdog, neighbor-enroller, and internal-event pump on
    /// timers. Stopped by [`EnrollmentTask::stop_background_tasks`].
    pub fn start_background_tasks(self: &Arc<Self>) {
        let mut background = self.background.lock().expect("background lock poisoned");

        let task = Arc::downgrade(self);
        background.push(timer::schedule_periodic(
            Duration::from_millis(self.config.watchdog_period_ms),
            move || match task.upgrade() {
                Some(task) => {
                    task.watchdog_tick(unix_now_ms());
                    true
                }
                None => false,
            },
        ));

        let task = Arc::downgrade(self);
        background.push(timer::schedule_periodic(
            Duration::from_millis(self.config.neighbor_enroller_period_ms),
            move || match task.upgrade() {
                Some(task) => {
                    task.neighbor_enroller_pass();
                    true
                }
                None => false,
            },
        ));

        let task = Arc::downgrade(self);
        background.push(timer::schedule_periodic(
            Duration::from_millis(INTERNAL_PUMP_MS),
            move || match task.upgrade() {
                Some(task) => {
                    task.process_internal_events();
                    true
                }
                None => false,
            },
        ));
    }

    /// Cancel every background task.
    pub fn stop_background_tasks(&self) {
        for task in self
            .background
            .lock()
            .expect("background lock poisoned")
            .drain(..)
        {
            task.cancel();
        }
    }
}

impl Drop for EnrollmentTask {
    fn drop(&mut self) {
        self.stop_background_tasks();
    }
}
