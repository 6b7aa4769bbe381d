use std::fmt;
use std::str::FromStr;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::MetaError;

/// Returns the current wall-clock time in milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Represents a unique identifier for a replica node in the cluster
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u64);

impl NodeId {
    /// Creates a new NodeId from a raw u64 value
    pub fn new(id: u64) -> Self {
        NodeId(id)
    }

    /// Returns the raw u64 value of this node ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Represents a Raft term number for leader election
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Term(u64);

impl Term {
    /// Creates a new Term from a raw u64 value
    pub fn new(term: u64) -> Self {
        Term(term)
    }

    /// Returns the raw u64 value of this term
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Represents a position in the replicated command log
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogIndex(u64);

impl LogIndex {
    /// The zero log index, used before any entry exists
    pub const ZERO: LogIndex = LogIndex(0);

    /// Creates a new LogIndex from a raw u64 value
    pub fn new(index: u64) -> Self {
        LogIndex(index)
    }

    /// Returns the raw u64 value of this log index
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Payload of a replicated log entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LogOp {
    /// Entry appended by a new leader to commit entries from earlier terms
    Noop,
    /// Encoded `ReplicatedCommand`
    Command(Vec<u8>),
}

/// A single entry in the Raft log
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Log index
    pub index: LogIndex,
    /// Term when entry was created
    pub term: Term,
    /// Operation to apply
    pub op: LogOp,
}

/// Candidate's request for a vote
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoteRequest {
    /// Candidate's term
    pub term: Term,
    /// Candidate node ID
    pub candidate_id: NodeId,
    /// Index of candidate's last log entry
    pub last_log_index: LogIndex,
    /// Term of candidate's last log entry
    pub last_log_term: Term,
}

/// Response to a vote request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoteResponse {
    /// Responder's term
    pub term: Term,
    /// Whether vote was granted
    pub vote_granted: bool,
}

/// Log replication request from leader to follower
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendRequest {
    /// Leader's term
    pub term: Term,
    /// Leader node ID
    pub leader_id: NodeId,
    /// Index of log entry preceding new entries
    pub prev_log_index: LogIndex,
    /// Term of prev_log_index entry
    pub prev_log_term: Term,
    /// Log entries to append
    pub entries: Vec<LogEntry>,
    /// Leader's commit index
    pub leader_commit: LogIndex,
}

/// Response to a log replication request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendResponse {
    /// Follower's term
    pub term: Term,
    /// Whether append succeeded
    pub success: bool,
    /// Match index for leader
    pub match_index: LogIndex,
}

/// Messages exchanged between Raft peers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RaftMessage {
    /// Request for vote from candidate
    RequestVote(VoteRequest),
    /// Response to RequestVote
    RequestVoteResponse(VoteResponse),
    /// Append entries from leader to follower
    AppendEntries(AppendRequest),
    /// Response to AppendEntries
    AppendEntriesResponse(AppendResponse),
}

/// Current state of a Raft node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftState {
    /// Following a leader
    Follower,
    /// Campaigning for leadership
    Candidate,
    /// Leading the cluster
    Leader,
}

/// A point in a repository's history.
///
/// Positive values are absolute revisions starting at 1. Negative values
/// are relative to the head: `-1` is the head itself, `-2` the revision
/// before it, and so on. Zero never names a revision.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(i64);

impl Revision {
    /// Sentinel for the latest revision at call time
    pub const HEAD: Revision = Revision(-1);
    /// Revision recorded when a repository is created
    pub const INIT: Revision = Revision(1);

    /// Creates a revision from a raw value
    pub const fn new(rev: i64) -> Self {
        Revision(rev)
    }

    /// Returns the raw value
    pub fn as_i64(&self) -> i64 {
        self.0
    }

    /// Returns true for head-relative revisions
    pub fn is_relative(&self) -> bool {
        self.0 < 0
    }

    /// Returns the revision immediately after this absolute revision
    pub fn next(&self) -> Revision {
        Revision(self.0 + 1)
    }

    /// Resolves this revision to an absolute one against `head`.
    pub fn resolve(&self, head: Revision) -> Result<Revision, MetaError> {
        let abs = if self.0 < 0 { head.0 + self.0 + 1 } else { self.0 };
        if abs < 1 || abs > head.0 {
            return Err(MetaError::RevisionNotFound {
                revision: *self,
                head,
            });
        }
        Ok(Revision(abs))
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

const SYSTEM_AUTHOR_NAME: &str = "System";
const SYSTEM_AUTHOR_EMAIL: &str = "system@localhost.localdomain";
const MIRROR_AUTHOR_NAME: &str = "Mirror";
const MIRROR_AUTHOR_EMAIL: &str = "mirror@localhost.localdomain";

/// Identity recorded on commits
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Author {
    /// Display name
    pub name: String,
    /// Email address
    pub email: String,
}

impl Author {
    /// Creates an author from a name and email
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }

    /// The author used for commits made by the system itself
    pub fn system() -> Self {
        Self::new(SYSTEM_AUTHOR_NAME, SYSTEM_AUTHOR_EMAIL)
    }

    /// The fallback identity for mirror-generated commits
    pub fn mirror() -> Self {
        Self::new(MIRROR_AUTHOR_NAME, MIRROR_AUTHOR_EMAIL)
    }
}

impl fmt::Display for Author {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Author[\"{}\" <{}>]", self.name, self.email)
    }
}

/// Identifies a repository within a project
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepositoryId {
    /// Owning project name
    pub project: String,
    /// Repository name
    pub repository: String,
}

impl RepositoryId {
    /// Creates a repository ID
    pub fn new(project: impl Into<String>, repository: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            repository: repository.into(),
        }
    }
}

impl fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project, self.repository)
    }
}

/// Content stored at a path
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryContent {
    /// Structured JSON document
    Json(serde_json::Value),
    /// Plain text, always newline-terminated when non-empty
    Text(String),
}

impl EntryContent {
    /// Returns the JSON value if this is a JSON entry
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            EntryContent::Json(v) => Some(v),
            EntryContent::Text(_) => None,
        }
    }

    /// Size of the content in bytes as it would be written out
    pub fn byte_len(&self) -> usize {
        match self {
            EntryContent::Json(v) => serde_json::to_vec(v).map(|b| b.len()).unwrap_or(0),
            EntryContent::Text(t) => t.len(),
        }
    }
}

pub(crate) fn normalize_text(text: &str) -> String {
    if text.is_empty() || text.ends_with('\n') {
        text.to_string()
    } else {
        format!("{}\n", text)
    }
}

/// A single path-level modification in a push
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Change {
    /// Add or replace a JSON file
    UpsertJson {
        /// Target path
        path: String,
        /// New content
        content: serde_json::Value,
    },
    /// Add or replace a text file
    UpsertText {
        /// Target path
        path: String,
        /// New content
        content: String,
    },
    /// Remove a file
    Remove {
        /// Target path
        path: String,
    },
    /// Move a file to a new path
    Rename {
        /// Source path
        path: String,
        /// Destination path
        #[serde(rename = "newPath")]
        new_path: String,
    },
}

impl Change {
    /// Creates a JSON upsert
    pub fn upsert_json(path: impl Into<String>, content: serde_json::Value) -> Self {
        Change::UpsertJson {
            path: path.into(),
            content,
        }
    }

    /// Creates a text upsert
    pub fn upsert_text(path: impl Into<String>, content: impl Into<String>) -> Self {
        Change::UpsertText {
            path: path.into(),
            content: content.into(),
        }
    }

    /// Creates a removal
    pub fn remove(path: impl Into<String>) -> Self {
        Change::Remove { path: path.into() }
    }

    /// Creates a rename
    pub fn rename(path: impl Into<String>, new_path: impl Into<String>) -> Self {
        Change::Rename {
            path: path.into(),
            new_path: new_path.into(),
        }
    }

    /// The primary path this change applies to
    pub fn path(&self) -> &str {
        match self {
            Change::UpsertJson { path, .. }
            | Change::UpsertText { path, .. }
            | Change::Remove { path }
            | Change::Rename { path, .. } => path,
        }
    }

    /// Content written by this change, if any
    pub fn content(&self) -> Option<EntryContent> {
        match self {
            Change::UpsertJson { content, .. } => Some(EntryContent::Json(content.clone())),
            Change::UpsertText { content, .. } => Some(EntryContent::Text(content.clone())),
            Change::Remove { .. } | Change::Rename { .. } => None,
        }
    }

    /// Checks path syntax and content type constraints
    pub fn validate(&self) -> Result<(), MetaError> {
        match self {
            Change::UpsertJson { path, .. } => {
                validate_file_path(path)?;
                if !is_json_path(path) {
                    return Err(MetaError::Validation(format!(
                        "JSON content requires a .json path: {}",
                        path
                    )));
                }
            }
            Change::UpsertText { path, .. } => {
                validate_file_path(path)?;
                if is_json_path(path) {
                    return Err(MetaError::Validation(format!(
                        "text content cannot be stored at a JSON path: {}",
                        path
                    )));
                }
            }
            Change::Remove { path } => validate_file_path(path)?,
            Change::Rename { path, new_path } => {
                validate_file_path(path)?;
                validate_file_path(new_path)?;
                if path == new_path {
                    return Err(MetaError::Validation(format!(
                        "rename source and destination are the same: {}",
                        path
                    )));
                }
                if is_json_path(path) != is_json_path(new_path) {
                    return Err(MetaError::Validation(format!(
                        "rename cannot change the entry type: {} -> {}",
                        path, new_path
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Content of a path at a specific revision
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Absolute revision the entry was read at
    pub revision: Revision,
    /// File path
    pub path: String,
    /// File content, after query evaluation
    pub content: EntryContent,
}

/// Immutable record of one revision
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    /// Revision created by this commit
    pub revision: Revision,
    /// Commit author
    pub author: Author,
    /// Logical timestamp in milliseconds
    #[serde(rename = "timestamp")]
    pub timestamp_millis: i64,
    /// One-line summary
    pub summary: String,
    /// Long description
    pub detail: String,
    /// Effective changes, ordered by path
    pub changes: Vec<Change>,
}

impl Commit {
    /// Paths touched by this commit
    pub fn changed_paths(&self) -> impl Iterator<Item = &str> {
        self.changes.iter().map(|c| c.path())
    }

    /// Returns true if any changed path matches the pattern
    pub fn touches(&self, pattern: &PathPattern) -> bool {
        self.changed_paths().any(|p| pattern.matches(p))
    }
}

/// Result of a successfully applied commit
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitResult {
    /// Newly allocated revision
    pub revision: Revision,
    /// Timestamp recorded on the commit
    pub timestamp_millis: i64,
}

/// Selects what to read from a file
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Query {
    /// The whole file, any content type
    Identity {
        /// File path
        path: String,
    },
    /// The whole file, which must be JSON
    Json {
        /// File path
        path: String,
    },
    /// A node inside a JSON file addressed by an RFC 6901 pointer
    JsonPointer {
        /// File path
        path: String,
        /// JSON pointer, e.g. `/a/b`
        pointer: String,
    },
}

impl Query {
    /// Identity query for a path
    pub fn identity(path: impl Into<String>) -> Self {
        Query::Identity { path: path.into() }
    }

    /// JSON query for a path
    pub fn json(path: impl Into<String>) -> Self {
        Query::Json { path: path.into() }
    }

    /// JSON pointer query
    pub fn json_pointer(path: impl Into<String>, pointer: impl Into<String>) -> Self {
        Query::JsonPointer {
            path: path.into(),
            pointer: pointer.into(),
        }
    }

    /// The file path this query reads
    pub fn path(&self) -> &str {
        match self {
            Query::Identity { path } | Query::Json { path } | Query::JsonPointer { path, .. } => {
                path
            }
        }
    }

    /// Evaluates the query against file content.
    ///
    /// Returns `Ok(None)` when a pointer does not resolve to a node.
    pub fn apply(&self, content: &EntryContent) -> Result<Option<EntryContent>, MetaError> {
        match self {
            Query::Identity { .. } => Ok(Some(content.clone())),
            Query::Json { path } => match content {
                EntryContent::Json(_) => Ok(Some(content.clone())),
                EntryContent::Text(_) => Err(MetaError::Validation(format!(
                    "JSON query on a non-JSON entry: {}",
                    path
                ))),
            },
            Query::JsonPointer { path, pointer } => match content {
                EntryContent::Json(v) => Ok(v.pointer(pointer).cloned().map(EntryContent::Json)),
                EntryContent::Text(_) => Err(MetaError::Validation(format!(
                    "JSON pointer query on a non-JSON entry: {}",
                    path
                ))),
            },
        }
    }
}

/// A comma-separated list of glob patterns over absolute paths.
///
/// A pattern without a leading `/` matches at any depth, so `*.json`
/// behaves like `/**/*.json`.
#[derive(Clone, Debug)]
pub struct PathPattern {
    source: String,
    matcher: Option<GlobSet>,
}

impl PathPattern {
    /// A pattern matching every path
    pub fn all() -> Self {
        Self {
            source: "/**".to_string(),
            matcher: None,
        }
    }

    /// Parses a comma-separated pattern list
    pub fn parse(source: &str) -> Result<Self, MetaError> {
        let parts: Vec<&str> = source
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
        if parts.is_empty() {
            return Err(MetaError::Validation(format!(
                "empty path pattern: {:?}",
                source
            )));
        }
        if parts.iter().any(|p| *p == "/**" || *p == "**") {
            return Ok(Self {
                source: parts.join(","),
                matcher: None,
            });
        }

        let mut builder = GlobSetBuilder::new();
        for part in &parts {
            let normalized = if part.starts_with('/') {
                (*part).to_string()
            } else {
                format!("/**/{}", part)
            };
            let glob = GlobBuilder::new(&normalized)
                .literal_separator(true)
                .build()
                .map_err(|e| MetaError::Validation(format!("bad path pattern {}: {}", part, e)))?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|e| MetaError::Validation(format!("bad path pattern {}: {}", source, e)))?;
        Ok(Self {
            source: parts.join(","),
            matcher: Some(set),
        })
    }

    /// Returns true if the path matches any pattern in the list
    pub fn matches(&self, path: &str) -> bool {
        match &self.matcher {
            None => true,
            Some(set) => set.is_match(path),
        }
    }

    /// Returns true if this pattern matches every path
    pub fn is_all(&self) -> bool {
        self.matcher.is_none()
    }

    /// The normalized source text
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl PartialEq for PathPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for PathPattern {}

impl std::hash::Hash for PathPattern {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.source.hash(state);
    }
}

impl FromStr for PathPattern {
    type Err = MetaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Serialize for PathPattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for PathPattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PathPattern::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Returns true if the path names a JSON file
pub fn is_json_path(path: &str) -> bool {
    path.to_ascii_lowercase().ends_with(".json")
}

/// Checks that a file path is absolute and well-formed
pub fn validate_file_path(path: &str) -> Result<(), MetaError> {
    let invalid = |why: &str| MetaError::Validation(format!("invalid path {:?}: {}", path, why));
    if !path.starts_with('/') {
        return Err(invalid("must be absolute"));
    }
    if path.len() == 1 || path.ends_with('/') {
        return Err(invalid("must name a file"));
    }
    if path.contains('\0') {
        return Err(invalid("contains a NUL byte"));
    }
    if path[1..]
        .split('/')
        .any(|seg| seg.is_empty() || seg == "." || seg == "..")
    {
        return Err(invalid("contains an empty or relative segment"));
    }
    Ok(())
}

/// Checks a project or repository name.
///
/// Names start and end with an ASCII alphanumeric and may contain
/// `-`, `+`, `_` and `.` in between.
pub fn validate_name(kind: &str, name: &str) -> Result<(), MetaError> {
    let bytes = name.as_bytes();
    let edge_ok = |b: u8| b.is_ascii_alphanumeric();
    let inner_ok = |b: u8| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'+' | b'_' | b'.');
    let valid = match bytes {
        [] => false,
        [only] => edge_ok(*only),
        [first, middle @ .., last] => {
            edge_ok(*first) && edge_ok(*last) && middle.iter().all(|b| inner_ok(*b))
        }
    };
    if valid {
        Ok(())
    } else {
        Err(MetaError::Validation(format!(
            "invalid {} name: {:?}",
            kind, name
        )))
    }
}
