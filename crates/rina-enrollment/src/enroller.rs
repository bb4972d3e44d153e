//! The enroller state machine: a DIF member admitting a new peer.

use std::time::Duration;

use rina_core::PortId;
use rina_efcp::timer::{self, TaskHandle};

use crate::cdap::{obj, CdapMessage, CdapOp, EnrollmentInformation, NeighborDescriptor, ObjValue};
use crate::error::EnrollmentError;
use crate::neighbor::Neighbor;
use crate::task::{EnrollmentEvent, EnrollmentServices, InternalEvent, NamespaceManager};

pub(crate) const START_ENROLLMENT_TIMEOUT: &str = "start enrollment request";
pub(crate) const STOP_RESPONSE_TIMEOUT: &str = "stop enrollment response";

/// Enroller lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollerState {
    Null,
    WaitStartEnrollment,
    WaitStopEnrollmentResponse,
    Enrolled,
}

impl EnrollerState {
    pub fn name(self) -> &'static str {
        match self {
            EnrollerState::Null => "NULL",
            EnrollerState::WaitStartEnrollment => "WAIT_START_ENROLLMENT",
            EnrollerState::WaitStopEnrollmentResponse => "WAIT_STOP_ENROLLMENT_RESPONSE",
            EnrollerState::Enrolled => "ENROLLED",
        }
    }
}

/// State machine for the admitting side of an enrollment.
#[derive(Debug)]
pub struct Enroller {
    state: EnrollerState,
    peer_name: String,
    port_id: PortId,
    timeout: Duration,
    last_scheduled_task: Option<TaskHandle>,
    next_invoke_id: u32,
    peer_address: u32,
    peer_supporting_difs: Vec<String>,
}

impl Enroller {
    pub fn new(peer_name: &str, port_id: PortId, timeout: Duration) -> Self {
        Self {
            state: EnrollerState::Null,
            peer_name: peer_name.to_string(),
            port_id,
            timeout,
            last_scheduled_task: None,
            next_invoke_id: 0,
            peer_address: 0,
            peer_supporting_difs: Vec::new(),
        }
    }

    pub fn state(&self) -> EnrollerState {
        self.state
    }

    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    pub fn port_id(&self) -> PortId {
        self.port_id
    }

    pub fn cancel_timeout(&mut self) {
        if let Some(task) = self.last_scheduled_task.take() {
            task.cancel();
        }
    }

    fn take_invoke_id(&mut self) -> u32 {
        self.next_invoke_id += 1;
        self.next_invoke_id
    }

    fn arm_timeout(&mut self, svc: &EnrollmentServices, reason: &'static str) {
        self.cancel_timeout();
        let internal = svc.internal.clone();
        let port = self.port_id;
        self.last_scheduled_task = Some(timer::schedule_once(self.timeout, move || {
            let _ = internal.send(InternalEvent::EnrollmentTimeout { port, reason });
        }));
    }

    fn expect_state(&self, expected: EnrollerState) -> Result<(), EnrollmentError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(EnrollmentError::WrongState {
                expected: expected.name(),
                actual: self.state.name(),
            })
        }
    }

    fn send(&self, svc: &EnrollmentServices, msg: CdapMessage) -> Result<(), EnrollmentError> {
        svc.cdap
            .send_cdap(self.port_id, msg.between(&svc.local_name, &self.peer_name))
    }

    // ------------------------------------------------------------------ //
    // Protocol steps
    // ------------------------------------------------------------------ //

    /// M_CONNECT received: authenticate, answer, and wait for the start
    /// request.
    pub fn connect(
        &mut self,
        svc: &EnrollmentServices,
        allowed_to_join: bool,
        invoke_id: u32,
    ) -> Result<(), EnrollmentError> {
        self.expect_state(EnrollerState::Null)?;

        if !allowed_to_join {
            tracing::warn!(peer = %self.peer_name, "enrollment rejected by security policy");
            self.send(
                svc,
                CdapMessage::response(
                    CdapOp::ConnectR,
                    invoke_id,
                    -1,
                    "enrollment rejected by security manager",
                    ObjValue::None,
                ),
            )?;
            return Err(EnrollmentError::Rejected(
                "enrollment rejected by security manager".to_string(),
            ));
        }

        self.send(
            svc,
            CdapMessage::response(CdapOp::ConnectR, invoke_id, 0, "", ObjValue::None),
        )?;
        self.arm_timeout(svc, START_ENROLLMENT_TIMEOUT);
        self.state = EnrollerState::WaitStartEnrollment;
        tracing::debug!(peer = %self.peer_name, port = %self.port_id, "sent M_CONNECT_R");
        Ok(())
    }

    /// M_START received: validate or assign an address, push the DIF state,
    /// and send the stop request.
    pub fn start(
        &mut self,
        svc: &EnrollmentServices,
        nsm: &dyn NamespaceManager,
        info: Option<EnrollmentInformation>,
        invoke_id: u32,
    ) -> Result<(), EnrollmentError> {
        self.expect_state(EnrollerState::WaitStartEnrollment)?;
        self.cancel_timeout();

        let mut info = info.unwrap_or_default();
        self.peer_supporting_difs = info.supporting_difs.clone();

        let requires_initialization = match info.address {
            None | Some(0) => true,
            Some(address) => !nsm.is_valid_address(address, &self.peer_name),
        };
        if requires_initialization {
            let Some(address) = nsm.allocate_address(&self.peer_name) else {
                self.send(
                    svc,
                    CdapMessage::response(
                        CdapOp::StartR,
                        invoke_id,
                        -1,
                        "could not assign a valid address",
                        ObjValue::None,
                    ),
                )?;
                return Err(EnrollmentError::AddressAllocation);
            };
            tracing::debug!(peer = %self.peer_name, address, "assigned address to enrollee");
            info.address = Some(address);
        }
        self.peer_address = info.address.unwrap_or(0);

        let response_value = if requires_initialization {
            ObjValue::EnrollmentInfo(info.clone())
        } else {
            ObjValue::None
        };
        self.send(
            svc,
            CdapMessage::response(CdapOp::StartR, invoke_id, 0, "", response_value),
        )?;

        if requires_initialization {
            self.send_dif_static_information(svc)?;
        }
        self.send_dif_dynamic_information(svc)?;

        info.allowed_to_start_early = true;
        let stop_invoke = self.take_invoke_id();
        self.send(
            svc,
            CdapMessage::request(
                CdapOp::Stop,
                stop_invoke,
                obj::ENROLLMENT_INFO_CLASS,
                obj::ENROLLMENT_INFO_NAME,
                ObjValue::EnrollmentInfo(info),
            ),
        )?;
        self.arm_timeout(svc, STOP_RESPONSE_TIMEOUT);
        self.state = EnrollerState::WaitStopEnrollmentResponse;
        tracing::debug!(peer = %self.peer_name, "sent M_STOP, waiting for response");
        Ok(())
    }

    /// M_STOP_R received: bring the enrollee operational and finish.
    pub fn stop_response(
        &mut self,
        svc: &EnrollmentServices,
        result: i32,
        reason: &str,
    ) -> Result<(), EnrollmentError> {
        self.expect_state(EnrollerState::WaitStopEnrollmentResponse)?;
        self.cancel_timeout();
        if result != 0 {
            self.state = EnrollerState::Null;
            return Err(EnrollmentError::Rejected(reason.to_string()));
        }

        let invoke_id = self.take_invoke_id();
        self.send(
            svc,
            CdapMessage::request(
                CdapOp::Start,
                invoke_id,
                obj::OPERATIONAL_STATUS_CLASS,
                obj::OPERATIONAL_STATUS_NAME,
                ObjValue::None,
            ),
        )?;

        self.enrollment_completed(svc)
    }

    // ------------------------------------------------------------------ //
    // Internals
    // ------------------------------------------------------------------ //

    /// Static DIF data: whatevercast names, data-transfer constants, and
    /// QoS cubes.
    fn send_dif_static_information(
        &mut self,
        svc: &EnrollmentServices,
    ) -> Result<(), EnrollmentError> {
        let (names, constants, cubes) = {
            let rib = svc.rib.lock().expect("rib lock poisoned");
            (
                rib.whatevercast_names.clone(),
                rib.constants.clone(),
                rib.qos_cubes.clone(),
            )
        };

        if !names.is_empty() {
            let invoke_id = self.take_invoke_id();
            self.send(
                svc,
                CdapMessage::request(
                    CdapOp::Create,
                    invoke_id,
                    obj::WHATEVERCAST_NAME_SET_CLASS,
                    obj::WHATEVERCAST_NAME_SET_NAME,
                    ObjValue::WhatevercastNames(names),
                ),
            )?;
        }
        if let Some(constants) = constants {
            let invoke_id = self.take_invoke_id();
            self.send(
                svc,
                CdapMessage::request(
                    CdapOp::Create,
                    invoke_id,
                    obj::DATA_TRANSFER_CONSTANTS_CLASS,
                    obj::DATA_TRANSFER_CONSTANTS_NAME,
                    ObjValue::Constants(constants),
                ),
            )?;
        }
        if !cubes.is_empty() {
            let invoke_id = self.take_invoke_id();
            self.send(
                svc,
                CdapMessage::request(
                    CdapOp::Create,
                    invoke_id,
                    obj::QOS_CUBE_SET_CLASS,
                    obj::QOS_CUBE_SET_NAME,
                    ObjValue::QosCubes(cubes),
                ),
            )?;
        }
        Ok(())
    }

    /// Dynamic DIF state: the neighbor set (including this process) and the
    /// directory-forwarding entries.
    fn send_dif_dynamic_information(
        &mut self,
        svc: &EnrollmentServices,
    ) -> Result<(), EnrollmentError> {
        let (mut neighbors, dft_entries, own) = {
            let rib = svc.rib.lock().expect("rib lock poisoned");
            (
                rib.neighbor_descriptors(),
                rib.dft_entries.clone(),
                NeighborDescriptor {
                    name: svc.local_name.clone(),
                    address: rib.address,
                    supporting_difs: Vec::new(),
                },
            )
        };
        neighbors.retain(|n| n.name != self.peer_name);
        neighbors.push(own);

        let invoke_id = self.take_invoke_id();
        self.send(
            svc,
            CdapMessage::request(
                CdapOp::Create,
                invoke_id,
                obj::NEIGHBOR_SET_CLASS,
                obj::NEIGHBOR_SET_NAME,
                ObjValue::Neighbors(neighbors),
            ),
        )?;

        if !dft_entries.is_empty() {
            let invoke_id = self.take_invoke_id();
            self.send(
                svc,
                CdapMessage::request(
                    CdapOp::Create,
                    invoke_id,
                    obj::DFT_ENTRY_SET_CLASS,
                    obj::DFT_ENTRY_SET_NAME,
                    ObjValue::DftEntries(dft_entries),
                ),
            )?;
        }
        Ok(())
    }

    fn enrollment_completed(&mut self, svc: &EnrollmentServices) -> Result<(), EnrollmentError> {
        self.cancel_timeout();
        self.state = EnrollerState::Enrolled;

        let dif_name = {
            let mut rib = svc.rib.lock().expect("rib lock poisoned");
            let mut neighbor = rib
                .remove_neighbor(&self.peer_name)
                .unwrap_or_else(|| Neighbor::new(&self.peer_name));
            neighbor.enrolled = true;
            neighbor.address = self.peer_address;
            neighbor.underlying_port_id = self.port_id;
            neighbor.supporting_difs = self.peer_supporting_difs.clone();
            neighbor.enrollment_attempts = 0;
            rib.upsert_neighbor(neighbor);
            rib.dif_name.clone()
        };

        tracing::info!(peer = %self.peer_name, address = self.peer_address, "remote ipc process enrolled");
        let _ = svc.events.send(EnrollmentEvent::Completed {
            peer: self.peer_name.clone(),
            port: self.port_id,
            enrollee: false,
            address: self.peer_address,
            dif_name,
        });
        Ok(())
    }
}
