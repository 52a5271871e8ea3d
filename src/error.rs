//! Error kinds returned by every fallible operation in this crate.
//!
//! All error conditions are returned as typed `Err` values, never via
//! panics or unwinding; transient CAS contention is retried internally
//! and never reaches this type.

use core::fmt;

/// Every contract or resource failure a list, hash table, or hazard
/// pointer registry can report.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A required argument was missing (e.g. an empty key where one is
    /// mandatory).
    #[error("required argument was null/empty")]
    NullArgument,
    /// A sequence-number-related argument was mismatched with how the
    /// list/table was configured (see [`crate::config`]).
    #[error("sequence-number argument mismatched with configuration")]
    MisconfigError,
    /// Memory allocation failed; no state was mutated.
    #[error("memory allocation failed")]
    AllocError,
    /// The requested key is not present.
    #[error("key not found")]
    NotFound,
    /// The key is already present.
    #[error("key already exists")]
    KeyAlreadyExists,
    /// An enumeration operation (`get_count`/`get_all`) was attempted
    /// without an active write barrier.
    #[error("enumeration requires an active write barrier")]
    NotLocked,
    /// A caller-supplied buffer does not match the current item count.
    #[error("buffer size does not match current item count")]
    WrongSize,
    /// The calling thread's hazard-pointer record has no free slots.
    #[error("hazard pointer slots exhausted for this thread")]
    SlotExhausted,
    /// The supplied thread handle is not registered with this registry.
    #[error("thread handle is not registered with this registry")]
    NotRegistered,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    /// True for conditions that indicate caller misuse of the API
    /// contract rather than a runtime/resource condition.
    pub const fn is_contract_error(&self) -> bool {
        matches!(
            self,
            Error::NullArgument | Error::MisconfigError | Error::NotLocked | Error::WrongSize
        )
    }
}

impl fmt::Display for ErrorKindLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A human-readable, `'static` label for an [`Error`] variant, useful
/// when surfacing error kinds to metrics/log fields without allocating.
pub struct ErrorKindLabel(&'static str);

impl Error {
    /// Returns a stable, `'static` label for this error's kind.
    pub const fn label(&self) -> ErrorKindLabel {
        ErrorKindLabel(match self {
            Error::NullArgument => "null_argument",
            Error::MisconfigError => "misconfig",
            Error::AllocError => "alloc",
            Error::NotFound => "not_found",
            Error::KeyAlreadyExists => "key_already_exists",
            Error::NotLocked => "not_locked",
            Error::WrongSize => "wrong_size",
            Error::SlotExhausted => "slot_exhausted",
            Error::NotRegistered => "not_registered",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contract_errors_are_flagged() {
        assert!(Error::NullArgument.is_contract_error());
        assert!(Error::NotLocked.is_contract_error());
        assert!(!Error::AllocError.is_contract_error());
        assert!(!Error::KeyAlreadyExists.is_contract_error());
    }

    #[test]
    fn labels_are_stable() {
        assert_eq!(Error::NotFound.label().0, "not_found");
        assert_eq!(Error::SlotExhausted.label().0, "slot_exhausted");
    }
}
