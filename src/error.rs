//! Error types for ferrocomm

use thiserror::Error;

/// Result type for communicator operations
pub type Result<T> = std::result::Result<T, Error>;

/// Broad category of an [`Error`].
///
/// Callers that install their own error policy usually only care about the
/// class: resource exhaustion and threading failures are fatal for the
/// requesting operation, configuration errors point at the environment, and
/// consistency errors mean the ranks of a communicator disagreed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Memory, context ids, handles or threads could not be obtained
    Resource,
    /// Malformed or contradictory configuration
    Config,
    /// Ranks of a communicator disagree (e.g. non-local hint values)
    Consistency,
    /// Operation not valid in the current object state
    State,
    /// Background thread creation, binding or join failure
    Thread,
    /// Invalid argument supplied by the caller
    Argument,
    /// Collaborator or internal failure
    Internal,
}

/// Error types for communicator operations
#[derive(Error, Debug)]
pub enum Error {
    /// The runtime backing a communicator has been finalized
    #[error("runtime has not been initialized or was already finalized")]
    NotInitialized,

    /// Invalid rank specified
    #[error("Invalid rank: {0}")]
    InvalidRank(i32),

    /// Invalid or already deleted communicator
    #[error("Invalid communicator")]
    InvalidCommunicator,

    /// Group does not fit the communicator it is used with
    #[error("Invalid group: {0}")]
    InvalidGroup(String),

    /// Operation on a revoked communicator
    #[error("communicator has been revoked")]
    Revoked,

    /// Context ids, handles or other finite resources exhausted
    #[error("out of resources: {0}")]
    OutOfResources(String),

    /// Malformed configuration value
    #[error("configuration error: {0}")]
    Config(String),

    /// Progress thread affinity string cannot be honored
    #[error("invalid progress thread affinity: {0}")]
    InvalidAffinity(String),

    /// A non-local hint has differing values across the communicator
    #[error("hint '{hint}' differs across the communicator (values {values:?})")]
    HintMismatch {
        /// Name of the offending hint
        hint: String,
        /// Distinct values observed, ascending
        values: Vec<i32>,
    },

    /// Hint value rejected by its parser or validator
    #[error("invalid hint: {0}")]
    InvalidHint(String),

    /// Hint table registration conflict or overflow
    #[error("hint registration failed: {0}")]
    HintRegistration(String),

    /// Operation not supported (e.g., split of an intercommunicator)
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// Background thread failure
    #[error("thread error: {0}")]
    Thread(String),

    /// Failure reported by the device/transport collaborator
    #[error("device error (code {code}): {message}")]
    Device {
        /// Device-specific status code
        code: i32,
        /// Human readable description
        message: String,
    },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Category of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::OutOfResources(_) => ErrorClass::Resource,
            Error::Config(_) | Error::InvalidAffinity(_) => ErrorClass::Config,
            Error::HintMismatch { .. } => ErrorClass::Consistency,
            Error::NotInitialized | Error::Revoked | Error::InvalidCommunicator => {
                ErrorClass::State
            }
            Error::Thread(_) => ErrorClass::Thread,
            Error::InvalidRank(_)
            | Error::InvalidGroup(_)
            | Error::InvalidHint(_)
            | Error::HintRegistration(_)
            | Error::NotSupported(_) => ErrorClass::Argument,
            Error::Device { .. } | Error::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Status code for callers that propagate plain integers.
    ///
    /// `0` is reserved for success and never returned here.
    pub fn code(&self) -> i32 {
        match self.class() {
            ErrorClass::Argument => 1,
            ErrorClass::State => 2,
            ErrorClass::Resource => 3,
            ErrorClass::Config => 4,
            ErrorClass::Consistency => 5,
            ErrorClass::Thread => 6,
            ErrorClass::Internal => 7,
        }
    }

    /// Build a device error from a non-zero collaborator status code.
    pub fn device(code: i32, message: impl Into<String>) -> Self {
        Error::Device {
            code,
            message: message.into(),
        }
    }
}

/// Convert an operation outcome to a status code (`0` on success).
pub fn status_code<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.code(),
    }
}
