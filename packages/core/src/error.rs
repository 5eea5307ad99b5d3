//! Closed error taxonomies for resources and devices, and their wire encoding.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Flat error code shared by resource modifiers and the registry.
///
/// Mirrors the wire `errorcode` integer sent back to the originating channel
/// in a `<command>:failed` reply. `0` is reserved for the (never serialized)
/// success case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum ErrorCode {
    NoError = 0,
    PermissionDenied = -1,
    UnknownType = -2,
    InvalidToken = -3,
    AlreadyExists = -4,
    InvalidDescriptor = -5,
    InvalidData = -6,
    UnknownItem = -7,
    InvalidParameters = -8,
    StorageError = -9,
    UnknownError = -10,
}

/// Error taxonomy returned by resource and session operations.
#[derive(Debug, Error, Clone)]
pub enum HubError {
    #[error("permission denied")]
    PermissionDenied,
    #[error("unknown resource type")]
    UnknownType,
    #[error("invalid or expired token")]
    InvalidToken,
    #[error("resource already exists")]
    AlreadyExists,
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("unknown item")]
    UnknownItem,
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("storage error: {0}")]
    StorageError(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl HubError {
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::PermissionDenied => ErrorCode::PermissionDenied,
            Self::UnknownType => ErrorCode::UnknownType,
            Self::InvalidToken => ErrorCode::InvalidToken,
            Self::AlreadyExists => ErrorCode::AlreadyExists,
            Self::InvalidDescriptor(_) => ErrorCode::InvalidDescriptor,
            Self::InvalidData(_) => ErrorCode::InvalidData,
            Self::UnknownItem => ErrorCode::UnknownItem,
            Self::InvalidParameters(_) => ErrorCode::InvalidParameters,
            Self::StorageError(_) => ErrorCode::StorageError,
            Self::Internal(_) => ErrorCode::UnknownError,
        }
    }
}

impl From<anyhow::Error> for HubError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

/// Error taxonomy returned by device-twin operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorCode {
    NoError = 0,
    FunctionNotExist = -1,
    DeviceNotAvailable = -2,
    PropertyNotExists = -3,
    PermissionDenied = -4,
}

#[derive(Debug, Error, Clone)]
pub enum DeviceError {
    #[error("function does not exist: {0}")]
    FunctionNotExist(String),
    #[error("device is not available")]
    DeviceNotAvailable,
    #[error("property does not exist: {0}")]
    PropertyNotExists(String),
    #[error("permission denied")]
    PermissionDenied,
}

impl DeviceError {
    #[must_use]
    pub fn code(&self) -> DeviceErrorCode {
        match self {
            Self::FunctionNotExist(_) => DeviceErrorCode::FunctionNotExist,
            Self::DeviceNotAvailable => DeviceErrorCode::DeviceNotAvailable,
            Self::PropertyNotExists(_) => DeviceErrorCode::PropertyNotExists,
            Self::PermissionDenied => DeviceErrorCode::PermissionDenied,
        }
    }
}

/// The `{errorcode, errorstring}` pair sent back to a client on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub errorcode: i32,
    pub errorstring: String,
}

/// Converts a domain error into its wire representation.
pub trait ToWire {
    fn to_wire(&self) -> WireError;
}

impl ToWire for HubError {
    fn to_wire(&self) -> WireError {
        WireError {
            errorcode: self.code() as i32,
            errorstring: self.to_string(),
        }
    }
}

impl ToWire for DeviceError {
    fn to_wire(&self) -> WireError {
        WireError {
            errorcode: self.code() as i32,
            errorstring: self.to_string(),
        }
    }
}
