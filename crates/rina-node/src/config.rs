//! TOML-based configuration for stack processes.
//!
//! Every policy-parameter and enrollment knob is exposed with its protocol
//! default, so a config file only needs the values it changes.

use std::path::Path;

use serde::Deserialize;

use rina_efcp::DtcpConfig;
use rina_enrollment::EnrollmentConfig;

use crate::error::NodeError;

/// Top-level stack configuration loaded from a TOML file.
#[derive(Debug, Default, Deserialize)]
pub struct StackConfig {
    #[serde(default)]
    pub efcp: EfcpSection,
    #[serde(default)]
    pub enrollment: EnrollmentSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl StackConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, NodeError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| NodeError::Config(format!("failed to read config file: {e}")))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, NodeError> {
        toml::from_str(s).map_err(|e| NodeError::Config(format!("failed to parse config: {e}")))
    }
}

/// The `[efcp]` section: the DTCP policy-parameter bundle.
#[derive(Debug, Deserialize)]
pub struct EfcpSection {
    #[serde(default = "default_flow_control")]
    pub flow_control: bool,
    #[serde(default = "default_window_based")]
    pub window_based: bool,
    #[serde(default)]
    pub rate_based: bool,
    #[serde(default = "default_rtx_control")]
    pub rtx_control: bool,
    #[serde(default = "default_initial_credit")]
    pub initial_credit: u32,
    #[serde(default = "default_data_retransmit_max")]
    pub data_retransmit_max: u32,
    #[serde(default = "default_time_unit_ms")]
    pub time_unit_ms: u64,
    /// PDUs per time unit; zero means unlimited.
    #[serde(default)]
    pub sender_rate: u32,
    /// Delayed-ACK interval; zero disables delayed ACK.
    #[serde(default)]
    pub a_timer_ms: u64,
}

fn default_flow_control() -> bool {
    true
}

fn default_window_based() -> bool {
    true
}

fn default_rtx_control() -> bool {
    true
}

fn default_initial_credit() -> u32 {
    10
}

fn default_data_retransmit_max() -> u32 {
    5
}

fn default_time_unit_ms() -> u64 {
    1000
}

impl Default for EfcpSection {
    fn default() -> Self {
        Self {
            flow_control: default_flow_control(),
            window_based: default_window_based(),
            rate_based: false,
            rtx_control: default_rtx_control(),
            initial_credit: default_initial_credit(),
            data_retransmit_max: default_data_retransmit_max(),
            time_unit_ms: default_time_unit_ms(),
            sender_rate: 0,
            a_timer_ms: 0,
        }
    }
}

impl From<&EfcpSection> for DtcpConfig {
    fn from(s: &EfcpSection) -> Self {
        Self {
            flow_control: s.flow_control,
            window_based: s.window_based,
            rate_based: s.rate_based,
            rtx_control: s.rtx_control,
            initial_credit: s.initial_credit,
            data_retransmit_max: s.data_retransmit_max,
            time_unit_ms: s.time_unit_ms,
            sender_rate: s.sender_rate,
            a_timer_ms: s.a_timer_ms,
        }
    }
}

/// The `[enrollment]` section.
#[derive(Debug, Deserialize)]
pub struct EnrollmentSection {
    #[serde(default = "default_enrollment_timeout_ms")]
    pub enrollment_timeout_ms: u64,
    #[serde(default = "default_watchdog_period_ms")]
    pub watchdog_period_ms: u64,
    #[serde(default = "default_declared_dead_interval_ms")]
    pub declared_dead_interval_ms: u64,
    #[serde(default = "default_neighbor_enroller_period_ms")]
    pub neighbor_enroller_period_ms: u64,
    #[serde(default = "default_max_enrollment_attempts")]
    pub max_enrollment_attempts: u32,
}

fn default_enrollment_timeout_ms() -> u64 {
    10_000
}

fn default_watchdog_period_ms() -> u64 {
    30_000
}

fn default_declared_dead_interval_ms() -> u64 {
    120_000
}

fn default_neighbor_enroller_period_ms() -> u64 {
    10_000
}

fn default_max_enrollment_attempts() -> u32 {
    3
}

impl Default for EnrollmentSection {
    fn default() -> Self {
        Self {
            enrollment_timeout_ms: default_enrollment_timeout_ms(),
            watchdog_period_ms: default_watchdog_period_ms(),
            declared_dead_interval_ms: default_declared_dead_interval_ms(),
            neighbor_enroller_period_ms: default_neighbor_enroller_period_ms(),
            max_enrollment_attempts: default_max_enrollment_attempts(),
        }
    }
}

impl From<&EnrollmentSection> for EnrollmentConfig {
    fn from(s: &EnrollmentSection) -> Self {
        Self {
            enrollment_timeout_ms: s.enrollment_timeout_ms,
            watchdog_period_ms: s.watchdog_period_ms,
            declared_dead_interval_ms: s.declared_dead_interval_ms,
            neighbor_enroller_period_ms: s.neighbor_enroller_period_ms,
            max_enrollment_attempts: s.max_enrollment_attempts,
        }
    }
}

/// The `[logging]` section.
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}
