//! The enrollee state machine: this IPC process joining a DIF through a
//! peer that is already a member.

use std::time::Duration;

use rina_core::PortId;
use rina_efcp::timer::{self, TaskHandle};

use crate::cdap::{obj, CdapMessage, CdapOp, EnrollmentInformation, ObjValue};
use crate::error::EnrollmentError;
use crate::neighbor::Neighbor;
use crate::rib::OperationalStatus;
use crate::task::{EnrollmentEvent, EnrollmentServices, InternalEvent};

pub(crate) const CONNECT_RESPONSE_TIMEOUT: &str = "connect response";
pub(crate) const START_RESPONSE_TIMEOUT: &str = "start enrollment response";
pub(crate) const STOP_ENROLLMENT_TIMEOUT: &str = "stop enrollment request";
pub(crate) const READ_RESPONSE_TIMEOUT: &str = "read response";
pub(crate) const START_TIMEOUT: &str = "operational start";

/// Enrollee lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrolleeState {
    Null,
    WaitConnectResponse,
    WaitStartEnrollmentResponse,
    WaitStopEnrollmentResponse,
    WaitReadResponse,
    WaitStart,
    Enrolled,
}

impl EnrolleeState {
    pub fn name(self) -> &'static str {
        match self {
            EnrolleeState::Null => "NULL",
            EnrolleeState::WaitConnectResponse => "WAIT_CONNECT_RESPONSE",
            EnrolleeState::WaitStartEnrollmentResponse => "WAIT_START_ENROLLMENT_RESPONSE",
            EnrolleeState::WaitStopEnrollmentResponse => "WAIT_STOP_ENROLLMENT_RESPONSE",
            EnrolleeState::WaitReadResponse => "WAIT_READ_RESPONSE",
            EnrolleeState::WaitStart => "WAIT_START",
            EnrolleeState::Enrolled => "ENROLLED",
        }
    }
}

/// State machine for the joining side of an enrollment.
#[derive(Debug)]
pub struct Enrollee {
    state: EnrolleeState,
    peer_name: String,
    port_id: PortId,
    timeout: Duration,
    last_scheduled_task: Option<TaskHandle>,
    next_invoke_id: u32,
    our_supporting_difs: Vec<String>,
    was_dif_member_before: bool,
    allowed_to_start_early: bool,
    stop_invoke_id: u32,
}

impl Enrollee {
    pub fn new(
        peer_name: &str,
        port_id: PortId,
        timeout: Duration,
        our_supporting_difs: Vec<String>,
    ) -> Self {
        Self {
            state: EnrolleeState::Null,
            peer_name: peer_name.to_string(),
            port_id,
            timeout,
            last_scheduled_task: None,
            next_invoke_id: 0,
            our_supporting_difs,
            was_dif_member_before: false,
            allowed_to_start_early: false,
            stop_invoke_id: 0,
        }
    }

    pub fn state(&self) -> EnrolleeState {
        self.state
    }

    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    pub fn port_id(&self) -> PortId {
        self.port_id
    }

    /// Drop the machine back to NULL and cancel any armed timeout.
    pub fn reset(&mut self) {
        self.cancel_timeout();
        self.state = EnrolleeState::Null;
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

    fn expect_state(&self, expected: EnrolleeState) -> Result<(), EnrollmentError> {
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

    /// Open the application connection: send M_CONNECT and wait.
    pub fn initiate(&mut self, svc: &EnrollmentServices) -> Result<(), EnrollmentError> {
        self.expect_state(EnrolleeState::Null)?;
        let invoke_id = self.take_invoke_id();
        self.send(
            svc,
            CdapMessage::request(CdapOp::Connect, invoke_id, "", "", ObjValue::None),
        )?;
        self.arm_timeout(svc, CONNECT_RESPONSE_TIMEOUT);
        self.state = EnrolleeState::WaitConnectResponse;
        tracing::debug!(peer = %self.peer_name, port = %self.port_id, "sent M_CONNECT");
        Ok(())
    }

    /// M_CONNECT_R received: send M_START with our enrollment information.
    pub fn connect_response(
        &mut self,
        svc: &EnrollmentServices,
        result: i32,
        reason: &str,
    ) -> Result<(), EnrollmentError> {
        self.expect_state(EnrolleeState::WaitConnectResponse)?;
        self.cancel_timeout();
        if result != 0 {
            self.state = EnrolleeState::Null;
            return Err(EnrollmentError::Rejected(reason.to_string()));
        }

        let info = {
            let rib = svc.rib.lock().expect("rib lock poisoned");
            let address = if rib.address != 0 {
                self.was_dif_member_before = true;
                Some(rib.address)
            } else {
                None
            };
            EnrollmentInformation {
                address,
                allowed_to_start_early: false,
                supporting_difs: self.our_supporting_difs.clone(),
            }
        };

        let invoke_id = self.take_invoke_id();
        self.send(
            svc,
            CdapMessage::request(
                CdapOp::Start,
                invoke_id,
                obj::ENROLLMENT_INFO_CLASS,
                obj::ENROLLMENT_INFO_NAME,
                ObjValue::EnrollmentInfo(info),
            ),
        )?;
        self.arm_timeout(svc, START_RESPONSE_TIMEOUT);
        self.state = EnrolleeState::WaitStartEnrollmentResponse;
        tracing::debug!(peer = %self.peer_name, "sent M_START with enrollment information");
        Ok(())
    }

    /// M_START_R received: adopt the assigned address and wait for the
    /// enroller to push the DIF state and stop us.
    pub fn start_response(
        &mut self,
        svc: &EnrollmentServices,
        result: i32,
        reason: &str,
        value: &ObjValue,
    ) -> Result<(), EnrollmentError> {
        self.expect_state(EnrolleeState::WaitStartEnrollmentResponse)?;
        self.cancel_timeout();
        if result != 0 {
            self.state = EnrolleeState::Null;
            return Err(EnrollmentError::Rejected(reason.to_string()));
        }

        if let ObjValue::EnrollmentInfo(info) = value {
            if let Some(address) = info.address {
                svc.rib
                    .lock()
                    .expect("rib lock poisoned")
                    .set_address(address);
            }
        }

        self.arm_timeout(svc, STOP_ENROLLMENT_TIMEOUT);
        self.state = EnrolleeState::WaitStopEnrollmentResponse;
        Ok(())
    }

    /// M_STOP received: either request the objects we still lack or commit.
    pub fn stop(
        &mut self,
        svc: &EnrollmentServices,
        info: &EnrollmentInformation,
        invoke_id: u32,
    ) -> Result<(), EnrollmentError> {
        self.expect_state(EnrolleeState::WaitStopEnrollmentResponse)?;
        self.cancel_timeout();
        if !info.allowed_to_start_early {
            return Err(EnrollmentError::Rejected(
                "stop without start-early permission".to_string(),
            ));
        }
        self.allowed_to_start_early = true;
        self.stop_invoke_id = invoke_id;

        // A member re-enrolling shares its directory entries back.
        let dft = {
            let rib = svc.rib.lock().expect("rib lock poisoned");
            (rib.operational == OperationalStatus::AssignedToDif && !rib.dft_entries.is_empty())
                .then(|| rib.dft_entries.clone())
        };
        if let Some(entries) = dft {
            let invoke_id = self.take_invoke_id();
            self.send(
                svc,
                CdapMessage::request(
                    CdapOp::Create,
                    invoke_id,
                    obj::DFT_ENTRY_SET_CLASS,
                    obj::DFT_ENTRY_SET_NAME,
                    ObjValue::DftEntries(entries),
                ),
            )?;
        }

        self.request_more_information_or_start(svc)
    }

    /// M_READ_R received: install the object and continue.
    pub fn read_response(
        &mut self,
        svc: &EnrollmentServices,
        result: i32,
        reason: &str,
        value: ObjValue,
    ) -> Result<(), EnrollmentError> {
        self.expect_state(EnrolleeState::WaitReadResponse)?;
        self.cancel_timeout();
        if result != 0 || value == ObjValue::None {
            return Err(EnrollmentError::Rejected(if reason.is_empty() {
                "unsuccessful read response".to_string()
            } else {
                reason.to_string()
            }));
        }

        {
            let mut rib = svc.rib.lock().expect("rib lock poisoned");
            match value {
                ObjValue::Constants(constants) => rib.create_constants(constants),
                ObjValue::QosCubes(cubes) => rib.merge_qos_cubes(cubes),
                ObjValue::Neighbors(neighbors) => rib.merge_neighbor_descriptors(neighbors),
                ObjValue::WhatevercastNames(names) => rib.merge_whatevercast_names(names),
                ObjValue::DftEntries(entries) => rib.merge_dft_entries(entries),
                other => {
                    tracing::warn!(?other, "read response with an object enrollment does not need");
                }
            }
        }

        self.request_more_information_or_start(svc)
    }

    /// Final M_START (operational status) received: commit and finish.
    pub fn start(&mut self, svc: &EnrollmentServices, result: i32) -> Result<(), EnrollmentError> {
        if self.state == EnrolleeState::Enrolled {
            return Ok(());
        }
        self.expect_state(EnrolleeState::WaitStart)?;
        self.cancel_timeout();
        if result != 0 {
            return Err(EnrollmentError::Rejected(
                "unsuccessful operational start".to_string(),
            ));
        }
        self.commit(svc);
        self.enrollment_completed(svc)
    }

    // ------------------------------------------------------------------ //
    // Internals
    // ------------------------------------------------------------------ //

    fn request_more_information_or_start(
        &mut self,
        svc: &EnrollmentServices,
    ) -> Result<(), EnrollmentError> {
        let missing = svc
            .rib
            .lock()
            .expect("rib lock poisoned")
            .next_missing_object();

        if let Some((obj_class, obj_name)) = missing {
            let invoke_id = self.take_invoke_id();
            self.send(
                svc,
                CdapMessage::request(CdapOp::Read, invoke_id, obj_class, obj_name, ObjValue::None),
            )?;
            self.arm_timeout(svc, READ_RESPONSE_TIMEOUT);
            self.state = EnrolleeState::WaitReadResponse;
            tracing::debug!(obj_class, "requesting missing object");
            return Ok(());
        }

        if self.allowed_to_start_early {
            self.commit(svc);
            self.send(
                svc,
                CdapMessage::response(CdapOp::StopR, self.stop_invoke_id, 0, "", ObjValue::None),
            )?;
            return self.enrollment_completed(svc);
        }

        self.send(
            svc,
            CdapMessage::response(CdapOp::StopR, self.stop_invoke_id, 0, "", ObjValue::None),
        )?;
        self.arm_timeout(svc, START_TIMEOUT);
        self.state = EnrolleeState::WaitStart;
        Ok(())
    }

    fn commit(&self, svc: &EnrollmentServices) {
        let mut rib = svc.rib.lock().expect("rib lock poisoned");
        rib.operational = OperationalStatus::AssignedToDif;
    }

    fn enrollment_completed(&mut self, svc: &EnrollmentServices) -> Result<(), EnrollmentError> {
        self.cancel_timeout();
        self.state = EnrolleeState::Enrolled;

        let (address, dif_name) = {
            let mut rib = svc.rib.lock().expect("rib lock poisoned");
            let mut neighbor = rib
                .remove_neighbor(&self.peer_name)
                .unwrap_or_else(|| Neighbor::new(&self.peer_name));
            neighbor.enrolled = true;
            neighbor.underlying_port_id = self.port_id;
            neighbor.enrollment_attempts = 0;
            rib.upsert_neighbor(neighbor);
            (rib.address, rib.dif_name.clone())
        };

        tracing::info!(
            peer = %self.peer_name,
            address,
            rejoined = self.was_dif_member_before,
            "enrolled into dif"
        );
        let _ = svc.events.send(EnrollmentEvent::Completed {
            peer: self.peer_name.clone(),
            port: self.port_id,
            enrollee: true,
            address,
            dif_name,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names() {
        assert_eq!(EnrolleeState::Null.name(), "NULL");
        assert_eq!(EnrolleeState::Enrolled.name(), "ENROLLED");
        assert_eq!(
            EnrolleeState::WaitStopEnrollmentResponse.name(),
            "WAIT_STOP_ENROLLMENT_RESPONSE"
        );
    }
}
