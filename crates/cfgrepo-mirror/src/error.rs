//! Error types for the mirroring subsystem.

use std::fmt;

use cfgrepo_meta::MetaError;
use thiserror::Error;

/// Which mirror quota was exceeded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuotaKind {
    /// Number of files.
    Files,
    /// Total bytes.
    Bytes,
}

impl fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaKind::Files => f.write_str("files"),
            QuotaKind::Bytes => f.write_str("bytes"),
        }
    }
}

/// Errors that can occur while mirroring.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum MirrorError {
    /// The transfer is larger than allowed. Nothing was transferred.
    #[error("mirror quota exceeded: {actual} {kind} (limit {limit})")]
    QuotaExceeded {
        /// The exceeded quota.
        kind: QuotaKind,
        /// Configured maximum.
        limit: u64,
        /// Size of the attempted transfer.
        actual: u64,
    },

    /// A credential is missing, malformed, or rejected by the remote.
    #[error("credential error: {0}")]
    Credential(String),

    /// The remote could not be reached or refused the operation.
    #[error("git transport error: {0}")]
    Transport(String),

    /// A mirror or plugin configuration is invalid.
    #[error("invalid mirror configuration: {0}")]
    InvalidConfig(String),

    /// The pass was cancelled.
    #[error("mirroring cancelled")]
    Cancelled,

    /// A repository operation failed.
    #[error(transparent)]
    Meta(#[from] MetaError),
}

impl MirrorError {
    /// Returns true if a later pass may succeed without a configuration change.
    pub fn is_retriable(&self) -> bool {
        match self {
            MirrorError::Credential(_) | MirrorError::Transport(_) => true,
            MirrorError::Meta(e) => e.is_retriable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfgrepo_meta::Revision;

    #[test]
    fn test_retriable_classification() {
        assert!(MirrorError::Credential("missing".into()).is_retriable());
        assert!(MirrorError::Transport("refused".into()).is_retriable());
        assert!(MirrorError::Meta(MetaError::Conflict {
            head: Revision::new(3)
        })
        .is_retriable());
        assert!(!MirrorError::InvalidConfig("bad uri".into()).is_retriable());
        assert!(!MirrorError::QuotaExceeded {
            kind: QuotaKind::Files,
            limit: 1,
            actual: 2
        }
        .is_retriable());
    }

    #[test]
    fn test_quota_message_names_the_limit() {
        let err = MirrorError::QuotaExceeded {
            kind: QuotaKind::Bytes,
            limit: 10,
            actual: 42,
        };
        assert_eq!(err.to_string(), "mirror quota exceeded: 42 bytes (limit 10)");
    }
}
