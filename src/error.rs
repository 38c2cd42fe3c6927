use std::fmt;

use thiserror::Error;

use crate::device::{FilesystemState, TrustLevel};
use crate::lifecycle::LifecycleStep;

pub type Result<T> = std::result::Result<T, VaultError>;

/// What kind of record a `NotFound`/`AlreadyExists` error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Vault,
    Item,
    Password,
    Drive,
    Backup,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordKind::Vault => "vault",
            RecordKind::Item => "item",
            RecordKind::Password => "stored password",
            RecordKind::Drive => "drive",
            RecordKind::Backup => "backup",
        };
        f.write_str(name)
    }
}

/// Coarse error classes callers act on: re-prompt, retry later, re-inspect
/// the drive, or give up on the restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    AuthenticationFailed,
    NotFound,
    ResourceBusy,
    Device,
    Integrity,
    Timeout,
    Cancelled,
    Internal,
}

/// Errors returned by every coldvault operation.
///
/// Messages carry ids and step names only. Passwords, derived keys, recovery
/// phrases and plaintext never end up in here.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid password or corrupted data")]
    AuthenticationFailed,

    #[error("{kind} '{id}' not found")]
    NotFound { kind: RecordKind, id: String },

    #[error("{kind} '{id}' already exists")]
    AlreadyExists { kind: RecordKind, id: String },

    #[error("drive '{drive_id}' is busy with another operation")]
    ResourceBusy { drive_id: String },

    #[error("drive '{drive_id}' is {state}; cannot {operation}")]
    InvalidState {
        drive_id: String,
        state: FilesystemState,
        operation: &'static str,
    },

    #[error("drive '{drive_id}' is trusted {actual}; {required} trust is required")]
    TrustRequired {
        drive_id: String,
        required: TrustLevel,
        actual: TrustLevel,
    },

    #[error("drive '{drive_id}' failed at step '{step}': {reason}")]
    Device {
        drive_id: String,
        step: LifecycleStep,
        reason: String,
    },

    #[error("drive '{drive_id}' timed out at step '{step}'")]
    Timeout {
        drive_id: String,
        step: LifecycleStep,
    },

    #[error("backup '{backup_id}' failed integrity check at item '{item_id}' ({} item(s) validated)", validated.len())]
    IntegrityViolation {
        backup_id: String,
        item_id: String,
        validated: Vec<String>,
    },

    #[error("recovery phrase does not match backup '{backup_id}'")]
    RecoveryPhraseMismatch { backup_id: String },

    #[error("operation cancelled after {completed} of {total} item(s)")]
    Cancelled { completed: usize, total: usize },

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("serialization failure: {0}")]
    Serialization(String),
}

impl VaultError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VaultError::Validation(_)
            | VaultError::AlreadyExists { .. }
            | VaultError::InvalidState { .. }
            | VaultError::TrustRequired { .. } => ErrorKind::Validation,
            VaultError::AuthenticationFailed => ErrorKind::AuthenticationFailed,
            VaultError::NotFound { .. } => ErrorKind::NotFound,
            VaultError::ResourceBusy { .. } => ErrorKind::ResourceBusy,
            VaultError::Device { .. } => ErrorKind::Device,
            VaultError::IntegrityViolation { .. } | VaultError::RecoveryPhraseMismatch { .. } => {
                ErrorKind::Integrity
            }
            VaultError::Timeout { .. } => ErrorKind::Timeout,
            VaultError::Cancelled { .. } => ErrorKind::Cancelled,
            VaultError::Storage(_) | VaultError::Serialization(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        VaultError::Validation(msg.into())
    }

    pub(crate) fn not_found(kind: RecordKind, id: impl Into<String>) -> Self {
        VaultError::NotFound {
            kind,
            id: id.into(),
        }
    }
}

impl From<std::io::Error> for VaultError {
    fn from(err: std::io::Error) -> Self {
        VaultError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(err: serde_json::Error) -> Self {
        VaultError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authentication_failure_message_is_uniform() {
        assert_eq!(
            VaultError::AuthenticationFailed.to_string(),
            "invalid password or corrupted data"
        );
    }

    #[test]
    fn device_errors_name_the_step() {
        let err = VaultError::Device {
            drive_id: "drv-01".into(),
            step: LifecycleStep::Wipe,
            reason: "wipefs exited with 1".into(),
        };
        assert!(err.to_string().contains("'wipe'"));
        assert_eq!(err.kind(), ErrorKind::Device);
    }

    #[test]
    fn state_and_trust_errors_are_validation_class() {
        let state = VaultError::InvalidState {
            drive_id: "d".into(),
            state: FilesystemState::Unformatted,
            operation: "unlock",
        };
        let trust = VaultError::TrustRequired {
            drive_id: "d".into(),
            required: TrustLevel::Full,
            actual: TrustLevel::Untrusted,
        };
        assert_eq!(state.kind(), ErrorKind::Validation);
        assert_eq!(trust.kind(), ErrorKind::Validation);
    }
}
