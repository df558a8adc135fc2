//! Error types for mastercoord

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Coordination Service Errors ===
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Read failed: {0}")]
    Read(String),

    #[error("Write failed: {0}")]
    Write(String),

    #[error("Write timed out: {0}")]
    WriteTimeout(String),

    #[error("Lease not found: {0:x}")]
    LeaseNotFound(i64),

    #[error("Watch failed: {0}")]
    Watch(String),

    // === Lock Errors ===
    #[error("Lock acquisition failed on {path}: {reason}")]
    LockAcquisition { path: String, reason: String },

    #[error("Lost lock {path} and could not re-acquire it: {reason}")]
    LockLost { path: String, reason: String },

    #[error("No longer owns lock {0}")]
    OwnershipLost(String),

    // === Worker Errors ===
    #[error("Worker registration failed: {0}")]
    Registration(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a transient store error worth retrying by the caller?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::WriteTimeout(_)
                | Error::Connection(_)
                | Error::Read(_)
                | Error::Write(_)
                | Error::Registration(_)
        )
    }

    /// The process should stop serving: some other master may be authoritative.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::LockLost { .. } | Error::OwnershipLost(_))
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let lost = Error::LockLost {
            path: "/master/lock".into(),
            reason: "timed out".into(),
        };
        assert!(lost.is_fatal());
        assert!(!lost.is_retryable());
        assert!(Error::OwnershipLost("/master/lock".into()).is_fatal());

        for transient in [
            Error::WriteTimeout("put /trainer/x".into()),
            Error::Write("txn /master/state".into()),
            Error::Read("txn /master/state".into()),
        ] {
            assert!(transient.is_retryable());
            assert!(!transient.is_fatal());
        }
        assert!(!Error::LeaseNotFound(7).is_retryable());
    }

    #[test]
    fn test_display() {
        let err = Error::LockAcquisition {
            path: "/master/lock".into(),
            reason: "deadline exceeded".into(),
        };
        assert_eq!(
            err.to_string(),
            "Lock acquisition failed on /master/lock: deadline exceeded"
        );
        assert_eq!(Error::LeaseNotFound(255).to_string(), "Lease not found: ff");
    }
}
