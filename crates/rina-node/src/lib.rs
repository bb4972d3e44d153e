//! Configuration and runtime glue for the RINA data-transfer stack.
//!
//! This crate provides TOML configuration covering the DTCP
//! policy-parameter bundle and the enrollment knobs, plus tracing
//! subscriber setup.

pub mod config;
pub mod error;
pub mod logging;
pub mod stack;

pub use config::{EfcpSection, EnrollmentSection, LoggingSection, StackConfig};
pub use error::NodeError;
pub use stack::IpcProcess;
