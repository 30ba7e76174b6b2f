//! Error taxonomy shared by the session store, the connection driver and the
//! control API.
//!
//! Registration errors are returned synchronously to the caller. Runtime
//! driver errors never leave the worker: they are recorded on the session and
//! drive it back to `NG`.

use thiserror::Error;

/// Errors returned synchronously by `SessionStore::create` and
/// `SessionStore::update`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("stream '{0}' already exists")]
    DuplicateStream(String),

    #[error("app '{0}' not found")]
    UnknownApp(String),

    #[error("invalid settings: {0}")]
    InvalidSettings(#[from] SettingsError),

    #[error("maximum number of streams ({0}) reached")]
    CapacityExceeded(usize),

    #[error("failed to start worker for stream '{stream_id}': {reason}")]
    Spawn { stream_id: String, reason: String },

    #[error(transparent)]
    Lookup(#[from] LookupError),
}

impl RegistrationError {
    /// Stable taxonomy name relayed in control API metadata.
    pub fn code(&self) -> &'static str {
        match self {
            RegistrationError::InvalidRequest(_) => "InvalidRequest",
            RegistrationError::DuplicateStream(_) => "DuplicateStream",
            RegistrationError::UnknownApp(_) => "UnknownApp",
            RegistrationError::InvalidSettings(_) => "InvalidSettings",
            RegistrationError::CapacityExceeded(_) => "CapacityExceeded",
            RegistrationError::Spawn { .. } => "Spawn",
            RegistrationError::Lookup(err) => err.code(),
        }
    }
}

/// Lookup failures for status queries and removal.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("stream '{0}' not found")]
    NotFound(String),
}

impl LookupError {
    pub fn code(&self) -> &'static str {
        match self {
            LookupError::NotFound(_) => "NotFound",
        }
    }
}

/// Settings document rejected at registration time.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SettingsError {
    #[error("settings are not a valid JSON object: {0}")]
    Malformed(String),

    #[error("{field} must be between {min} and {max} (got {value})")]
    OutOfRange {
        field: &'static str,
        min: String,
        max: String,
        value: String,
    },
}

/// Runtime failures observed by a connection driver worker.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("dial failed: {0}")]
    Dial(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("stream closed: {0}")]
    StreamClosed(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl DriverError {
    /// Configuration errors cannot be fixed by retrying.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DriverError::Config(_))
    }

    /// Errors a connected worker retries in place without dropping the stream.
    pub fn is_retryable_in_place(&self) -> bool {
        matches!(self, DriverError::Decode(_) | DriverError::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_codes_match_taxonomy() {
        assert_eq!(
            RegistrationError::DuplicateStream("cam1".into()).code(),
            "DuplicateStream"
        );
        assert_eq!(RegistrationError::UnknownApp("x".into()).code(), "UnknownApp");
        let settings = RegistrationError::from(SettingsError::Malformed("eof".into()));
        assert_eq!(settings.code(), "InvalidSettings");
        assert!(settings.to_string().starts_with("invalid settings"));
        let missing = RegistrationError::from(LookupError::NotFound("cam9".into()));
        assert_eq!(missing.code(), "NotFound");
        assert_eq!(missing.to_string(), "stream 'cam9' not found");
    }

    #[test]
    fn only_config_errors_are_terminal() {
        assert!(DriverError::Config("bad scheme".into()).is_terminal());
        assert!(!DriverError::Dial("refused".into()).is_terminal());
        assert!(DriverError::Timeout("frame".into()).is_retryable_in_place());
        assert!(!DriverError::StreamClosed("eos".into()).is_retryable_in_place());
    }
}
