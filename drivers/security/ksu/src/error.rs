//! KSU manager error type

use core::fmt;

use crate::gateway::SeError;
use crate::lock::LockError;

/// Result type for KSU manager operations.
pub type KsuResult<T> = core::result::Result<T, KsuError>;

/// KSU manager errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KsuError {
    /// Missing or malformed argument (empty key, non-KSU descriptor,
    /// slot id out of range, layout larger than the table).
    InvalidParameter,
    /// The owner reference is already mapped to a slot.
    AlreadyExists,
    /// No available slot in the user range.
    Full,
    /// No slot is mapped to the owner reference.
    NotFound,
    /// The slot is reserved for system use.
    PermissionDenied,
    /// The slot was already free. Benign, callers may ignore it.
    AlreadyDeleted,
    /// The manager lock could not be taken or released.
    Lock(LockError),
    /// Status returned by the secure element, passed through unchanged.
    Se(SeError),
}

impl KsuError {
    /// True for outcomes that signal "nothing left to do" rather than failure.
    pub fn is_benign(&self) -> bool {
        matches!(self, KsuError::AlreadyDeleted)
    }
}

impl fmt::Display for KsuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KsuError::InvalidParameter => write!(f, "Invalid parameter"),
            KsuError::AlreadyExists => write!(f, "Owner already mapped to a key slot"),
            KsuError::Full => write!(f, "No free key slot"),
            KsuError::NotFound => write!(f, "No key slot mapped to owner"),
            KsuError::PermissionDenied => write!(f, "Key slot is reserved"),
            KsuError::AlreadyDeleted => write!(f, "Key slot already deleted"),
            KsuError::Lock(err) => write!(f, "KSU lock error: {}", err),
            KsuError::Se(err) => write!(f, "Secure element error: {}", err),
        }
    }
}

impl From<LockError> for KsuError {
    fn from(err: LockError) -> Self {
        KsuError::Lock(err)
    }
}

impl From<SeError> for KsuError {
    fn from(err: SeError) -> Self {
        KsuError::Se(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::ToString;

    #[test]
    fn test_only_already_deleted_is_benign() {
        assert!(KsuError::AlreadyDeleted.is_benign());
        assert!(!KsuError::Full.is_benign());
        assert!(!KsuError::Se(SeError::Aborted).is_benign());
    }

    #[test]
    fn test_display_wraps_inner_errors() {
        let msg = KsuError::Lock(LockError::Timeout).to_string();
        assert!(msg.starts_with("KSU lock error"));

        let msg = KsuError::from(SeError::CommandFailed(0x42)).to_string();
        assert!(msg.contains("0x42"));
    }
}
