//! Error types for the cfgrepo metadata subsystem.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{NodeId, Revision};

/// Errors returned by repositories, projects, the command executor and the
/// replication layer.
///
/// `Conflict`, `RedundantChange` and `NotLeader` are expected under normal
/// concurrent operation; callers match on them to decide whether to retry.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetaError {
    /// The request is structurally invalid and must not be retried as-is.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The base revision of a push is no longer the repository head.
    #[error("conflict: base revision is stale, current head is {head}")]
    Conflict {
        /// The head revision at the time the push was applied.
        head: Revision,
    },

    /// The change set produces no content change against the head revision.
    #[error("redundant change: content is unchanged at the head revision")]
    RedundantChange,

    /// This node cannot order commands right now.
    #[error("not the Raft leader")]
    NotLeader {
        /// The leader this node currently knows of, if any.
        leader_hint: Option<NodeId>,
    },

    /// A project could not be bootstrapped and has been rolled back.
    #[error("failed to initialize project {project}: {reason}")]
    FatalInitialization {
        /// Project name.
        project: String,
        /// Human-readable cause.
        reason: String,
    },

    /// No project with this name exists.
    #[error("project not found: {0}")]
    ProjectNotFound(String),

    /// A project with this name already exists.
    #[error("project already exists: {0}")]
    ProjectExists(String),

    /// No repository with this name exists in the project.
    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    /// A repository with this name already exists in the project.
    #[error("repository already exists: {0}")]
    RepositoryExists(String),

    /// The path has no entry at the requested revision.
    #[error("entry not found: {path} at revision {revision}")]
    EntryNotFound {
        /// Requested path.
        path: String,
        /// Absolute revision that was read.
        revision: Revision,
    },

    /// The revision does not exist in the repository.
    #[error("revision {revision} not found (head is {head})")]
    RevisionNotFound {
        /// Requested revision.
        revision: Revision,
        /// Head revision at the time of the request.
        head: Revision,
    },

    /// The operation did not complete within its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The component is shutting down or has been closed.
    #[error("shutting down")]
    Shutdown,

    /// Key-value store failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Encoding or decoding of a persisted record failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error from the file-backed store.
    #[error("I/O error: {0}")]
    Io(String),
}

impl MetaError {
    /// Returns true if retrying the same request later may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            MetaError::Conflict { .. } | MetaError::NotLeader { .. } | MetaError::Timeout(_)
        )
    }
}

impl From<std::io::Error> for MetaError {
    fn from(e: std::io::Error) -> Self {
        MetaError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for MetaError {
    fn from(e: serde_json::Error) -> Self {
        MetaError::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for MetaError {
    fn from(e: bincode::Error) -> Self {
        MetaError::Serialization(e.to_string())
    }
}
