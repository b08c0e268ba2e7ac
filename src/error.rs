use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tokio_modbus::{Address, ExceptionCode, SlaveId};

/// Why a single client request was rejected.
///
/// These never escape the request they belong to: the transport turns them
/// into a Modbus exception response and the process carries on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("request for unit {requested} but this device is unit {expected}")]
    IdentityMismatch { requested: SlaveId, expected: SlaveId },

    #[error("range {addr}+{quantity} exceeds table length {len}")]
    AddressOutOfRange {
        addr: Address,
        quantity: usize,
        len: usize,
    },
}

impl RequestError {
    pub fn exception_code(&self) -> ExceptionCode {
        match self {
            RequestError::IdentityMismatch { .. } => ExceptionCode::IllegalFunction,
            RequestError::AddressOutOfRange { .. } => ExceptionCode::IllegalDataAddress,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("transport failed to start after {attempts} attempt(s): {source}")]
    StartFailed {
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("startup cancelled")]
    Cancelled,

    #[error("background tasks still running after {0:?} shutdown deadline")]
    ShutdownTimeout(Duration),
}
