#![warn(missing_docs)]

//! cfgrepo mirroring: scheduled synchronisation between local repositories and remote Git repositories

pub mod config;
pub mod credential;
pub mod error;
pub mod git;
pub mod libgit2;
pub mod mirror;
pub mod scheduler;

pub use config::MirroringServicePluginConfig;
pub use credential::{Credential, CredentialStore, MetaRepoCredentialStore};
pub use error::{MirrorError, QuotaKind};
pub use git::{GitCommit, GitTransport, MemoryGitTransport, PushRequest, RemoteSnapshot};
pub use libgit2::Libgit2Transport;
pub use mirror::{MirrorConfig, MirrorDirection, RemoteSpec};
pub use scheduler::{MirrorReport, MirrorStatus, MirrorSummary, MirroringScheduler, PassSkipped};
