// ============================================================================
// ERROR HANDLING FRAMEWORK
// ============================================================================
// One error enum per subsystem, all convertible into `ArchstatsError`.
// Nothing in the reconciliation core is fatal: these types exist so that
// failures can be logged with a category and retried on the next pass.
// ============================================================================

use std::path::PathBuf;

use thiserror::Error;

// ----------------------------------------------------------------------------
// Umbrella Error
// ----------------------------------------------------------------------------

/// The main error type for the bridge.
#[derive(Error, Debug)]
pub enum ArchstatsError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Reconciliation pass panicked: {message}")]
    PassPanicked { message: String },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl ArchstatsError {
    /// Check if retrying later can succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            ArchstatsError::Config(_) => false,
            ArchstatsError::Fetch(e) => e.is_recoverable(),
            ArchstatsError::Persistence(e) => e.is_recoverable(),
            ArchstatsError::Channel(_) => true,
            ArchstatsError::Io(_) => true,
            ArchstatsError::PassPanicked { .. } => true,
            ArchstatsError::Internal(_) => false,
            ArchstatsError::ShuttingDown => false,
        }
    }

    /// Error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            ArchstatsError::Config(_) => "config",
            ArchstatsError::Fetch(_) => "fetch",
            ArchstatsError::Persistence(_) => "persistence",
            ArchstatsError::Channel(_) => "channel",
            ArchstatsError::Io(_) => "io",
            ArchstatsError::PassPanicked { .. } => "pass",
            ArchstatsError::Internal(_) => "internal",
            ArchstatsError::ShuttingDown => "shutdown",
        }
    }
}

// ----------------------------------------------------------------------------
// Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Unknown database backend '{backend}'")]
    UnknownBackend { backend: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        ConfigError::ParseError {
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Fetch Errors
// ----------------------------------------------------------------------------

/// Failure to obtain or decode one source's payload.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("Request to '{url}' failed: {message}")]
    Transport { url: String, message: String },

    #[error("'{url}' returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("Malformed payload from '{url}': {message}")]
    Payload { url: String, message: String },

    #[error("Timeout waiting for '{url}' (waited {timeout_ms}ms)")]
    Timeout { url: String, timeout_ms: u64 },
}

impl FetchError {
    pub fn is_recoverable(&self) -> bool {
        // Every fetch failure is retried on the next pass
        true
    }

    pub fn transport(url: impl Into<String>, message: impl Into<String>) -> Self {
        FetchError::Transport {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn status(url: impl Into<String>, status: u16) -> Self {
        FetchError::Status {
            url: url.into(),
            status,
        }
    }

    pub fn payload(url: impl Into<String>, message: impl Into<String>) -> Self {
        FetchError::Payload {
            url: url.into(),
            message: message.into(),
        }
    }

    /// The URL the failure belongs to
    pub fn url(&self) -> &str {
        match self {
            FetchError::Transport { url, .. }
            | FetchError::Status { url, .. }
            | FetchError::Payload { url, .. }
            | FetchError::Timeout { url, .. } => url,
        }
    }
}

// ----------------------------------------------------------------------------
// Channel Errors
// ----------------------------------------------------------------------------

/// Errors raised by the channel host when writing a slot.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChannelError {
    #[error("Unknown channel handle {handle}")]
    UnknownHandle { handle: usize },

    #[error("Channel '{channel}' is {expected} and cannot hold {got}")]
    TypeMismatch {
        channel: String,
        expected: &'static str,
        got: String,
    },

    #[error("Channel '{channel}' is already registered")]
    AlreadyRegistered { channel: String },
}

// ----------------------------------------------------------------------------
// Persistence Errors
// ----------------------------------------------------------------------------

/// Errors from the document store or the persistence gateway.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Document store unreachable at '{url}': {message}")]
    Unreachable { url: String, message: String },

    #[error("Document store rejected '{operation}' with status {status}: {message}")]
    Rejected {
        operation: String,
        status: u16,
        message: String,
    },

    #[error("Malformed document: {message}")]
    Malformed { message: String },

    #[error("Timeout waiting for '{operation}' (waited {timeout_ms}ms)")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Nothing to store for group '{group}'")]
    EmptyDocument { group: String },

    #[error("Persistence gateway for '{group}' is closed")]
    Closed { group: String },

    #[error("Storage IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PersistenceError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, PersistenceError::Closed { .. })
    }

    pub fn unreachable(url: impl Into<String>, message: impl Into<String>) -> Self {
        PersistenceError::Unreachable {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn rejected(operation: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        PersistenceError::Rejected {
            operation: operation.into(),
            status,
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        PersistenceError::Malformed {
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        PersistenceError::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }
}

// ----------------------------------------------------------------------------
// Result Type Aliases
// ----------------------------------------------------------------------------

/// Standard result type for bridge operations
pub type ArchstatsResult<T> = Result<T, ArchstatsError>;

/// Result type for source fetches
pub type FetchResult<T> = Result<T, FetchError>;

/// Result type for store and restore
pub type PersistenceResult<T> = Result<T, PersistenceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_errors_convert_and_stay_recoverable() {
        let err: ArchstatsError = FetchError::status("http://appliance/x", 500).into();
        assert_eq!(err.category(), "fetch");
        assert!(err.is_recoverable());
        assert_eq!(err.to_string(), "Fetch error: 'http://appliance/x' returned HTTP 500");
    }

    #[test]
    fn test_closed_gateway_is_not_recoverable() {
        let err: ArchstatsError = PersistenceError::Closed { group: "g".into() }.into();
        assert!(!err.is_recoverable());
        assert_eq!(err.category(), "persistence");
    }

    #[test]
    fn test_fetch_error_url() {
        let err = FetchError::payload("http://a/b", "expected array");
        assert_eq!(err.url(), "http://a/b");
    }
}
