//! Node-level error types.

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_config_variant() {
        let e = NodeError::Config("missing [efcp] section".into());
        assert!(e.to_string().contains("missing [efcp] section"));
    }
}
