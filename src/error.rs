use std::fmt;
use std::io;

/// Errors raised while bootstrapping or wiring the cluster.
///
/// Protocol-level failures never show up here: they travel as message types
/// (`PAGE_NOT_FOUND`) or as processor timeouts.
#[derive(Debug)]
pub enum DsmError {
    /// Configuration rejected by validation.
    Config(String),
    /// Failed to read a configuration file.
    Io(io::Error),
    /// JSON encoding or decoding failed.
    Serialization(serde_json::Error),
}

impl fmt::Display for DsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DsmError::Config(reason) => write!(f, "invalid configuration: {}", reason),
            DsmError::Io(e) => write!(f, "io error: {}", e),
            DsmError::Serialization(e) => write!(f, "serialization error: {}", e),
        }
    }
}

impl std::error::Error for DsmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DsmError::Io(e) => Some(e),
            DsmError::Serialization(e) => Some(e),
            DsmError::Config(_) => None,
        }
    }
}

impl From<io::Error> for DsmError {
    fn from(e: io::Error) -> Self {
        DsmError::Io(e)
    }
}

impl From<serde_json::Error> for DsmError {
    fn from(e: serde_json::Error) -> Self {
        DsmError::Serialization(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_explains_the_config_problem() {
        let err = DsmError::Config("at least one page is needed".to_string());
        assert_eq!(err.to_string(), "invalid configuration: at least one page is needed");
    }

    #[test]
    fn json_errors_keep_their_source() {
        let json_err = serde_json::from_str::<u32>("not json").unwrap_err();
        let err = DsmError::from(json_err);
        assert!(std::error::Error::source(&err).is_some());
    }
}
