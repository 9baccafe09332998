//! Errors returned by the inbound activation API

use thiserror::Error;

/// Why `activate()` refused a request
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActivationError {
    #[error("connection is already activating on this device")]
    AlreadyActivating,
    #[error("connection is not compatible with the device: {0}")]
    InvalidConnection(String),
    #[error("device is not managed")]
    Unmanaged,
    #[error("device is not available")]
    Unavailable,
    #[error("unknown device")]
    UnknownDevice,
    #[error("unknown connection")]
    UnknownConnection,
}

/// Why `deactivate()` refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeactivationError {
    #[error("device has no active connection")]
    NotActive,
    #[error("unknown device")]
    UnknownDevice,
}
