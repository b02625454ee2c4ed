//! Crypto library errors

use thiserror::Error;

/// Errors raised by the crypto library
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptError {
    /// The algorithm identifier is outside the 3-bit range
    #[error("unknown algorithm identifier {0}")]
    UnknownAlgorithm(u8),

    /// An input buffer has the wrong size
    #[error("invalid {what} length: expected {expected}, got {actual}")]
    InvalidLength {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// MAC-S carried in AUTS did not verify
    #[error("AUTS MAC-S verification failed")]
    MacSMismatch,
}
