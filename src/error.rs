// Copyright the device gateway fleet contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use crate::device_id::DeviceId;

/// The error taxonomy of §7: every kind a caller of the core can observe, plus the two
/// kinds (`HandlerFailed`, and swallowed `RemoteUnavailable`) that never escape the core.
#[derive(Clone, Debug, thiserror::Error)]
pub enum SessionError {
    #[error("load of device session {device_id} did not complete within the configured timeout")]
    LoadTimeout { device_id: DeviceId },

    #[error("load of device session {device_id} failed: {message}")]
    LoadFailed { device_id: DeviceId, message: String },

    /// Never returned to a caller: an event handler panicked or returned an error. Logged by
    /// the event bus and swallowed so that other handlers still run.
    #[error("event handler failed: {message}")]
    HandlerFailed { message: String },

    #[error("write-through to the device operator for {device_id} failed: {message}")]
    OperatorFailed { device_id: DeviceId, message: String },

    #[error("cluster contract call for {device_id} failed: {message}")]
    RemoteUnavailable { device_id: DeviceId, message: String },
}

impl SessionError {
    pub fn device_id(&self) -> Option<&DeviceId> {
        match self {
            SessionError::LoadTimeout { device_id }
            | SessionError::LoadFailed { device_id, .. }
            | SessionError::OperatorFailed { device_id, .. }
            | SessionError::RemoteUnavailable { device_id, .. } => Some(device_id),
            SessionError::HandlerFailed { .. } => None,
        }
    }
}
