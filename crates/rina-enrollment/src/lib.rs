//! Enrollment for the RINA data-transfer stack.
//!
//! This crate implements the CDAP-driven handshake by which a new IPC
//! process joins a DIF: the paired enrollee/enroller state machines, the
//! enrollment-relevant RIB slice, neighbor liveness (watchdog), and the
//! background neighbor-enroller loop.

pub mod cdap;
pub mod enrollee;
pub mod enroller;
pub mod error;
pub mod neighbor;
pub mod rib;
pub mod task;
pub mod watchdog;

pub use cdap::{CdapMessage, CdapOp, EnrollmentInformation, ObjValue};
pub use enrollee::{Enrollee, EnrolleeState};
pub use enroller::{Enroller, EnrollerState};
pub use error::EnrollmentError;
pub use neighbor::Neighbor;
pub use rib::{OperationalStatus, Rib};
pub use task::{
    AllowAll, CdapSender, EnrollmentConfig, EnrollmentEvent, EnrollmentTask, FlowAllocator,
    NamespaceManager, SecurityPolicy,
};
pub use watchdog::{Watchdog, WatchdogAction};
