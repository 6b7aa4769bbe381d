#![warn(missing_docs)]

//! cfgrepo core: versioned repositories, watches, projects, and replicated command execution

pub mod cache;
pub mod command;
pub mod consensus;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod kvstore;
pub mod metadata;
pub mod network;
pub mod node;
pub mod project;
pub mod raft_log;
pub mod repository;
pub mod tcp;
pub mod types;
pub mod wal_store;
pub mod watch;

pub use cache::{CacheConfig, CacheStats, CachingRepository, RepositoryCache};
pub use command::{Command, CommandOutcome, CommandResult, ReplicatedCommand};
pub use consensus::{RaftConfig, RaftNode};
pub use coordinator::{CoordinatorStatus, ReplicationCoordinator, StateMachine};
pub use error::MetaError;
pub use executor::{CommandApplier, CommandExecutor};
pub use kvstore::{BatchOp, KvStore, MemoryKvStore};
pub use metadata::{Member, ProjectMetadata, ProjectRole, RepositoryMetadata, UserAndTimestamp};
pub use network::{Envelope, Inbox, LocalNetwork, PeerMessage, Transport};
pub use node::{Node, NodeConfig};
pub use project::{Project, ProjectContext, ProjectManager, RepositoryManager};
pub use repository::{CommitListener, CommitOutcome, RepositoryInfo, VersionedRepository};
pub use tcp::{TcpNetwork, TcpNetworkConfig};
pub use types::{
    Author, Change, Commit, CommitResult, Entry, EntryContent, LogIndex, NodeId, PathPattern,
    Query, RaftState, RepositoryId, Revision, Term,
};
pub use wal_store::FileKvStore;
pub use watch::{
    Subscription, SubscriptionEvent, WatchEvent, WatchHandle, WatchOutcome, WatchRegistry,
    WatchTarget,
};
