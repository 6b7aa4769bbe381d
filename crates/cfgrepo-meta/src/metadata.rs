//! Project metadata document and its cached snapshot.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::types::{Author, Revision};

/// Who did something, and when.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAndTimestamp {
    /// Login or email of the user
    pub user: String,
    /// When it happened
    pub timestamp: DateTime<Utc>,
}

impl UserAndTimestamp {
    /// Builds a record from an author and a millisecond timestamp.
    pub fn new(author: &Author, timestamp_millis: i64) -> Self {
        Self {
            user: author.email.clone(),
            timestamp: Utc
                .timestamp_millis_opt(timestamp_millis)
                .single()
                .unwrap_or_default(),
        }
    }
}

/// Role of a member within a project.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectRole {
    /// Full control
    Owner,
    /// Read and write
    Member,
    /// Read only
    Guest,
}

/// A project member.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Login or email
    pub login: String,
    /// Role in the project
    pub role: ProjectRole,
    /// When the member was added
    pub creation: UserAndTimestamp,
}

/// Metadata of one repository within a project.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryMetadata {
    /// Repository name
    pub name: String,
    /// Creation record
    pub creation: UserAndTimestamp,
}

/// Contents of `/metadata.json` in a project's internal repository.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectMetadata {
    /// Project name
    pub name: String,
    /// User-facing repositories
    #[serde(default)]
    pub repos: BTreeMap<String, RepositoryMetadata>,
    /// Members keyed by login
    #[serde(default)]
    pub members: BTreeMap<String, Member>,
    /// Creation record
    pub creation: UserAndTimestamp,
    /// Set when the project has been removed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removal: Option<UserAndTimestamp>,
}

impl ProjectMetadata {
    /// Initial metadata of a new project, with its creator as the owner.
    pub fn new(name: &str, author: &Author, timestamp_millis: i64) -> Self {
        let creation = UserAndTimestamp::new(author, timestamp_millis);
        let mut members = BTreeMap::new();
        members.insert(
            author.email.clone(),
            Member {
                login: author.email.clone(),
                role: ProjectRole::Owner,
                creation: creation.clone(),
            },
        );
        Self {
            name: name.to_string(),
            repos: BTreeMap::new(),
            members,
            creation,
            removal: None,
        }
    }
}

/// Cached metadata snapshot paired with the revision it was read at.
///
/// Updates are accepted only with a strictly newer revision, so notifications
/// delivered out of order can never roll the snapshot back.
#[derive(Default)]
pub struct MetadataCell {
    inner: RwLock<Option<(Revision, Arc<ProjectMetadata>)>>,
}

impl MetadataCell {
    /// Creates an empty cell.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the snapshot if `revision` is newer than the cached one.
    /// Returns true if the snapshot was replaced.
    pub fn update(&self, revision: Revision, metadata: ProjectMetadata) -> bool {
        let mut inner = self.inner.write();
        if let Some((current, _)) = inner.as_ref() {
            if revision <= *current {
                return false;
            }
        }
        *inner = Some((revision, Arc::new(metadata)));
        true
    }

    /// The cached snapshot.
    pub fn get(&self) -> Option<Arc<ProjectMetadata>> {
        self.inner.read().as_ref().map(|(_, m)| m.clone())
    }

    /// Revision of the cached snapshot.
    pub fn revision(&self) -> Option<Revision> {
        self.inner.read().as_ref().map(|(r, _)| *r)
    }
}
