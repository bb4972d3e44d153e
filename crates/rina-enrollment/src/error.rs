//! Enrollment error types.
//!
//! Enrollment failures never tear down the process: they clear the machine
//! state, deallocate the supporting N-1 flow, and surface to the IPC
//! manager when the request came from it.

#[derive(Debug, thiserror::Error)]
pub enum EnrollmentError {
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("message received in state {actual}, expected {expected}")]
    WrongState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("enrollment rejected: {0}")]
    Rejected(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("flow allocation failed: {0}")]
    FlowAllocation(String),

    #[error("no enrollment state machine for this flow")]
    UnknownMachine,

    #[error("already enrolled to {0}")]
    AlreadyEnrolled(String),

    #[error("could not assign a valid address")]
    AddressAllocation,

    #[error("could not send cdap message: {0}")]
    SendFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_all_variants() {
        let variants: Vec<EnrollmentError> = vec![
            EnrollmentError::Timeout("connect response"),
            EnrollmentError::WrongState {
                expected: "WAIT_START",
                actual: "NULL",
            },
            EnrollmentError::Rejected("not allowed to join".into()),
            EnrollmentError::Codec("truncated msgpack".into()),
            EnrollmentError::FlowAllocation("no route".into()),
            EnrollmentError::UnknownMachine,
            EnrollmentError::AlreadyEnrolled("peer-b".into()),
            EnrollmentError::AddressAllocation,
            EnrollmentError::SendFailed("port closed".into()),
        ];
        for v in &variants {
            assert!(!v.to_string().is_empty(), "{v:?} should have non-empty Display");
        }
    }
}
