//! Assembly of a stack instance from configuration.
//!
//! An `IpcProcess` carries the resolved configuration and the policy
//! registry, and acts as the single entry point that wires connections and
//! the enrollment task together. Tests construct isolated instances instead
//! of sharing module-level state.

use std::sync::{Arc, Mutex};

use crossbeam_channel::Receiver;

use rina_core::{Address, CepId, QosId};
use rina_efcp::{
    Connection, Dt, DtBuilder, DtcpConfig, EfcpError, PolicyRegistry, RmtSender,
    DEFAULT_POLICY_SET,
};
use rina_enrollment::task::{
    CdapSender, EnrollmentEvent, EnrollmentTask, FlowAllocator, NamespaceManager, SecurityPolicy,
};
use rina_enrollment::{EnrollmentConfig, Rib};

use crate::config::StackConfig;

/// One IPC process: its name, configuration, and policy registry.
pub struct IpcProcess {
    name: String,
    dtcp_config: DtcpConfig,
    enrollment_config: EnrollmentConfig,
    policies: PolicyRegistry,
    policy_set: String,
}

impl IpcProcess {
    /// Build from a parsed configuration, with the default policy set
    /// selected.
    pub fn from_config(name: &str, config: &StackConfig) -> Self {
        Self {
            name: name.to_string(),
            dtcp_config: (&config.efcp).into(),
            enrollment_config: (&config.enrollment).into(),
            policies: PolicyRegistry::new(),
            policy_set: DEFAULT_POLICY_SET.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dtcp_config(&self) -> &DtcpConfig {
        &self.dtcp_config
    }

    pub fn enrollment_config(&self) -> &EnrollmentConfig {
        &self.enrollment_config
    }

    /// The registry new policy sets are installed into.
    pub fn policy_registry(&self) -> &PolicyRegistry {
        &self.policies
    }

    /// Select the policy set used for subsequently created connections.
    pub fn select_policy_set(&mut self, name: &str) -> Result<(), EfcpError> {
        if self.policies.get(name).is_none() {
            return Err(EfcpError::BadArgument("unknown policy set"));
        }
        self.policy_set = name.to_string();
        Ok(())
    }

    /// Create a connection's DT pair over the given relay and start its
    /// scheduled tasks.
    pub fn create_connection(
        &self,
        src_cep: CepId,
        dst_cep: CepId,
        src_addr: Address,
        dst_addr: Address,
        qos_id: QosId,
        rmt: Arc<dyn RmtSender>,
    ) -> Result<Dt, EfcpError> {
        let conn = Connection::new(src_cep, dst_cep, src_addr, dst_addr, qos_id, self.dtcp_config);
        let dt = DtBuilder::new(conn, rmt)
            .with_registered_policies(&self.policies, &self.policy_set)?
            .build()?;
        dt.start_timers();
        Ok(dt)
    }

    /// Create the enrollment task over the process's RIB and management
    /// collaborators. The returned receiver carries events for the IPC
    /// manager.
    pub fn create_enrollment(
        &self,
        rib: Arc<Mutex<Rib>>,
        cdap: Arc<dyn CdapSender>,
        flows: Arc<dyn FlowAllocator>,
        nsm: Arc<dyn NamespaceManager>,
        security: Arc<dyn SecurityPolicy>,
    ) -> (Arc<EnrollmentTask>, Receiver<EnrollmentEvent>) {
        EnrollmentTask::new(
            self.enrollment_config,
            &self.name,
            rib,
            cdap,
            flows,
            nsm,
            security,
        )
    }
}
