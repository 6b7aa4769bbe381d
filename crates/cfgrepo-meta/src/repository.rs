//! Versioned repository: an append-only, densely numbered revision history.
//!
//! Records live in the shared KV store under `repo/<project>/<repo>/`:
//!
//! - `head` holds the latest revision
//! - `c<rev>` holds the commit record
//! - `p<path>\0<rev>` holds the content of a path as of that revision
//!   (`null` for a removal)
//!
//! Revisions are big-endian so a range scan over one path yields its
//! versions in order. A commit writes all its records and the new head in
//! one batch, then publishes the head to readers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::MetaError;
use crate::kvstore::{BatchOp, KvStore};
use crate::types::{
    normalize_text, Author, Change, Commit, CommitResult, Entry, EntryContent, PathPattern, Query,
    Revision, RepositoryId,
};

const INIT_SUMMARY: &str = "Create a new repository";

static NEXT_INCARNATION: AtomicU64 = AtomicU64::new(1);

/// Receives every commit as it lands, in revision order per repository.
///
/// Called while the repository's commit lock is held: implementations must
/// not call back into the committing repository's `commit`.
pub trait CommitListener: Send + Sync {
    /// Called after the commit is durable and visible to readers.
    fn on_commit(&self, repo: &RepositoryId, commit: &Commit);
}

/// A listener that ignores all commits.
pub struct NoopListener;

impl CommitListener for NoopListener {
    fn on_commit(&self, _repo: &RepositoryId, _commit: &Commit) {}
}

/// Outcome of a commit attempt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CommitOutcome {
    /// A new revision was recorded.
    Applied(CommitResult),
    /// The change set produces no content change; no revision was allocated.
    Redundant,
    /// The base revision was not the head.
    Conflict {
        /// Head revision at the time of the attempt.
        head: Revision,
    },
}

impl CommitOutcome {
    /// Converts expected non-success outcomes into their typed errors.
    pub fn into_result(self) -> Result<CommitResult, MetaError> {
        match self {
            CommitOutcome::Applied(result) => Ok(result),
            CommitOutcome::Redundant => Err(MetaError::RedundantChange),
            CommitOutcome::Conflict { head } => Err(MetaError::Conflict { head }),
        }
    }

    /// The new revision, if one was recorded.
    pub fn revision(&self) -> Option<Revision> {
        match self {
            CommitOutcome::Applied(result) => Some(result.revision),
            _ => None,
        }
    }
}

/// Creation record of a repository.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryInfo {
    /// Who created the repository
    pub author: Author,
    /// Creation time in milliseconds
    pub created_at_millis: i64,
}

fn index_prefix(project: &str) -> Vec<u8> {
    format!("idx/{}/", project).into_bytes()
}

fn index_key(id: &RepositoryId) -> Vec<u8> {
    let mut key = index_prefix(&id.project);
    key.extend_from_slice(id.repository.as_bytes());
    key
}

fn data_prefix(id: &RepositoryId) -> Vec<u8> {
    format!("repo/{}/{}/", id.project, id.repository).into_bytes()
}

/// Names of all repositories persisted for a project.
pub fn list_repository_names(kv: &dyn KvStore, project: &str) -> Result<Vec<String>, MetaError> {
    let prefix = index_prefix(project);
    kv.scan_prefix(&prefix)?
        .into_iter()
        .map(|(k, _)| {
            String::from_utf8(k[prefix.len()..].to_vec())
                .map_err(|e| MetaError::Storage(format!("bad repository index key: {}", e)))
        })
        .collect()
}

/// One repository's revision history.
pub struct VersionedRepository {
    id: RepositoryId,
    kv: Arc<dyn KvStore>,
    prefix: Vec<u8>,
    head: AtomicI64,
    commit_lock: Mutex<()>,
    listener: Arc<dyn CommitListener>,
    info: RepositoryInfo,
    incarnation: u64,
}

impl VersionedRepository {
    /// Creates a repository and records its initial, empty revision.
    pub fn create(
        id: RepositoryId,
        kv: Arc<dyn KvStore>,
        author: Author,
        timestamp_millis: i64,
        listener: Arc<dyn CommitListener>,
    ) -> Result<Self, MetaError> {
        let idx = index_key(&id);
        if kv.contains_key(&idx)? {
            return Err(MetaError::RepositoryExists(id.to_string()));
        }
        let info = RepositoryInfo {
            author: author.clone(),
            created_at_millis: timestamp_millis,
        };
        let init = Commit {
            revision: Revision::INIT,
            author,
            timestamp_millis,
            summary: INIT_SUMMARY.to_string(),
            detail: String::new(),
            changes: Vec::new(),
        };

        let repo = Self {
            prefix: data_prefix(&id),
            id,
            kv,
            head: AtomicI64::new(0),
            commit_lock: Mutex::new(()),
            listener,
            info,
            incarnation: NEXT_INCARNATION.fetch_add(1, Ordering::Relaxed),
        };
        repo.kv.write_batch(vec![
            BatchOp::Put {
                key: idx,
                value: serde_json::to_vec(&repo.info)?,
            },
            BatchOp::Put {
                key: repo.commit_key(Revision::INIT),
                value: serde_json::to_vec(&init)?,
            },
            BatchOp::Put {
                key: repo.head_key(),
                value: Revision::INIT.as_i64().to_be_bytes().to_vec(),
            },
        ])?;
        repo.head.store(Revision::INIT.as_i64(), Ordering::Release);

        tracing::info!(repo = %repo.id, "created repository");
        Ok(repo)
    }

    /// Opens a repository previously created in this KV store.
    pub fn open(
        id: RepositoryId,
        kv: Arc<dyn KvStore>,
        listener: Arc<dyn CommitListener>,
    ) -> Result<Self, MetaError> {
        let info: RepositoryInfo = match kv.get(&index_key(&id))? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => return Err(MetaError::RepositoryNotFound(id.to_string())),
        };
        let repo = Self {
            prefix: data_prefix(&id),
            id,
            kv,
            head: AtomicI64::new(0),
            commit_lock: Mutex::new(()),
            listener,
            info,
            incarnation: NEXT_INCARNATION.fetch_add(1, Ordering::Relaxed),
        };
        let head = match repo.kv.get(&repo.head_key())? {
            Some(bytes) if bytes.len() == 8 => {
                let mut arr = [0u8; 8];
                arr.copy_from_slice(&bytes);
                i64::from_be_bytes(arr)
            }
            _ => {
                return Err(MetaError::Storage(format!(
                    "repository {} has no valid head record",
                    repo.id
                )))
            }
        };
        repo.head.store(head, Ordering::Release);
        tracing::debug!(repo = %repo.id, head, "opened repository");
        Ok(repo)
    }

    /// Repository identifier.
    pub fn id(&self) -> &RepositoryId {
        &self.id
    }

    /// Creation record.
    pub fn info(&self) -> &RepositoryInfo {
        &self.info
    }

    /// Distinguishes this handle from any other handle ever opened in the
    /// process, including one for a removed repository of the same name.
    pub fn incarnation(&self) -> u64 {
        self.incarnation
    }

    /// The latest revision.
    pub fn head(&self) -> Revision {
        Revision::new(self.head.load(Ordering::Acquire))
    }

    /// Resolves `HEAD` and relative revisions to an absolute revision.
    pub fn normalize(&self, revision: Revision) -> Result<Revision, MetaError> {
        revision.resolve(self.head())
    }

    /// Records a new revision if `base` is the head and the change set
    /// changes content.
    pub fn commit(
        &self,
        base: Revision,
        timestamp_millis: i64,
        author: Author,
        summary: impl Into<String>,
        detail: impl Into<String>,
        changes: Vec<Change>,
    ) -> Result<CommitOutcome, MetaError> {
        for change in &changes {
            change.validate()?;
        }

        let _guard = self.commit_lock.lock();
        let head = self.head();
        if head.as_i64() == 0 {
            return Err(MetaError::RepositoryNotFound(self.id.to_string()));
        }
        let base = base.resolve(head)?;
        if base != head {
            tracing::debug!(repo = %self.id, base = %base, head = %head, "rejecting stale base revision");
            return Ok(CommitOutcome::Conflict { head });
        }

        let effective = self.effective_changes(head, changes)?;
        if effective.is_empty() {
            tracing::debug!(repo = %self.id, head = %head, "redundant change set");
            return Ok(CommitOutcome::Redundant);
        }

        let revision = head.next();
        let commit = Commit {
            revision,
            author,
            timestamp_millis,
            summary: summary.into(),
            detail: detail.into(),
            changes: effective,
        };

        let mut ops = Vec::with_capacity(commit.changes.len() + 2);
        for change in &commit.changes {
            ops.push(BatchOp::Put {
                key: self.path_key(change.path(), revision),
                value: serde_json::to_vec(&change.content())?,
            });
        }
        ops.push(BatchOp::Put {
            key: self.commit_key(revision),
            value: serde_json::to_vec(&commit)?,
        });
        ops.push(BatchOp::Put {
            key: self.head_key(),
            value: revision.as_i64().to_be_bytes().to_vec(),
        });
        self.kv.write_batch(ops)?;
        self.head.store(revision.as_i64(), Ordering::Release);

        tracing::debug!(
            repo = %self.id,
            revision = %revision,
            changes = commit.changes.len(),
            "committed revision"
        );

        self.listener.on_commit(&self.id, &commit);
        Ok(CommitOutcome::Applied(CommitResult {
            revision,
            timestamp_millis,
        }))
    }

    /// Reads a query at a revision, failing if the path does not exist.
    pub fn get(&self, revision: Revision, query: &Query) -> Result<Entry, MetaError> {
        let revision = self.normalize(revision)?;
        self.get_at(revision, query)?
            .ok_or_else(|| MetaError::EntryNotFound {
                path: query.path().to_string(),
                revision,
            })
    }

    /// Reads a query at a revision, returning `None` if the path does not exist.
    pub fn get_or_none(&self, revision: Revision, query: &Query) -> Result<Option<Entry>, MetaError> {
        let revision = self.normalize(revision)?;
        self.get_at(revision, query)
    }

    fn get_at(&self, revision: Revision, query: &Query) -> Result<Option<Entry>, MetaError> {
        let Some(content) = self.read_path(query.path(), revision)? else {
            return Ok(None);
        };
        Ok(query.apply(&content)?.map(|content| Entry {
            revision,
            path: query.path().to_string(),
            content,
        }))
    }

    /// All entries matching a pattern at a revision, ordered by path.
    pub fn find(&self, revision: Revision, pattern: &PathPattern) -> Result<Vec<Entry>, MetaError> {
        let revision = self.normalize(revision)?;
        Ok(self
            .snapshot(revision)?
            .into_iter()
            .filter(|(path, _)| pattern.matches(path))
            .map(|(path, content)| Entry {
                revision,
                path,
                content,
            })
            .collect())
    }

    /// Changes that turn the content at `from` into the content at `to`,
    /// restricted to matching paths and ordered by path.
    pub fn diff(
        &self,
        from: Revision,
        to: Revision,
        pattern: &PathPattern,
    ) -> Result<Vec<Change>, MetaError> {
        let head = self.head();
        let from = from.resolve(head)?;
        let to = to.resolve(head)?;
        if from == to {
            return Ok(Vec::new());
        }
        let (lo, hi) = if from < to { (from, to) } else { (to, from) };
        let old = self.snapshot(lo)?;
        let mut new = self.snapshot(hi)?;

        let mut changes = BTreeMap::new();
        for (path, old_content) in old {
            if !pattern.matches(&path) {
                continue;
            }
            match new.remove(&path) {
                Some(new_content) if new_content == old_content => {}
                Some(new_content) => {
                    changes.insert(path.clone(), upsert(path, new_content));
                }
                None => {
                    changes.insert(path.clone(), Change::Remove { path });
                }
            }
        }
        for (path, content) in new {
            if pattern.matches(&path) {
                changes.insert(path.clone(), upsert(path, content));
            }
        }
        Ok(changes.into_values().collect())
    }

    /// Commits between two revisions (inclusive, ascending) that touch a
    /// matching path. The match-all pattern includes every commit.
    pub fn history(
        &self,
        pattern: &PathPattern,
        from: Revision,
        to: Revision,
    ) -> Result<Vec<Commit>, MetaError> {
        let head = self.head();
        let from = from.resolve(head)?;
        let to = to.resolve(head)?;
        let (lo, hi) = if from <= to { (from, to) } else { (to, from) };

        let mut commits = Vec::new();
        for rev in lo.as_i64()..=hi.as_i64() {
            let commit = self.read_commit(Revision::new(rev))?;
            if pattern.is_all() || commit.touches(pattern) {
                commits.push(commit);
            }
        }
        Ok(commits)
    }

    /// The commit record of one revision.
    pub fn commit_at(&self, revision: Revision) -> Result<Commit, MetaError> {
        let revision = self.normalize(revision)?;
        self.read_commit(revision)
    }

    /// Deletes every record of this repository.
    pub(crate) fn purge(&self) -> Result<(), MetaError> {
        let _guard = self.commit_lock.lock();
        let mut ops: Vec<BatchOp> = self
            .kv
            .scan_prefix(&self.prefix)?
            .into_iter()
            .map(|(key, _)| BatchOp::Delete { key })
            .collect();
        ops.push(BatchOp::Delete {
            key: index_key(&self.id),
        });
        self.kv.write_batch(ops)?;
        self.head.store(0, Ordering::Release);
        tracing::info!(repo = %self.id, "purged repository");
        Ok(())
    }

    fn effective_changes(
        &self,
        head: Revision,
        changes: Vec<Change>,
    ) -> Result<Vec<Change>, MetaError> {
        let mut overlay: BTreeMap<String, Option<EntryContent>> = BTreeMap::new();
        for change in changes {
            match change {
                Change::UpsertJson { path, content } => {
                    overlay.insert(path, Some(EntryContent::Json(content)));
                }
                Change::UpsertText { path, content } => {
                    overlay.insert(path, Some(EntryContent::Text(normalize_text(&content))));
                }
                Change::Remove { path } => {
                    if self.current(&overlay, &path, head)?.is_none() {
                        return Err(MetaError::Validation(format!(
                            "cannot remove a missing path: {}",
                            path
                        )));
                    }
                    overlay.insert(path, None);
                }
                Change::Rename { path, new_path } => {
                    let Some(content) = self.current(&overlay, &path, head)? else {
                        return Err(MetaError::Validation(format!(
                            "cannot rename a missing path: {}",
                            path
                        )));
                    };
                    if self.current(&overlay, &new_path, head)?.is_some() {
                        return Err(MetaError::Validation(format!(
                            "rename target already exists: {}",
                            new_path
                        )));
                    }
                    overlay.insert(path, None);
                    overlay.insert(new_path, Some(content));
                }
            }
        }

        let mut effective = Vec::new();
        for (path, content) in overlay {
            if self.read_path(&path, head)? == content {
                continue;
            }
            effective.push(match content {
                Some(content) => upsert(path, content),
                None => Change::Remove { path },
            });
        }
        Ok(effective)
    }

    fn current(
        &self,
        overlay: &BTreeMap<String, Option<EntryContent>>,
        path: &str,
        head: Revision,
    ) -> Result<Option<EntryContent>, MetaError> {
        match overlay.get(path) {
            Some(content) => Ok(content.clone()),
            None => self.read_path(path, head),
        }
    }

    fn read_path(&self, path: &str, revision: Revision) -> Result<Option<EntryContent>, MetaError> {
        let start = self.path_key(path, Revision::new(0));
        let end = self.path_key(path, revision.next());
        match self.kv.scan_range(&start, &end)?.pop() {
            Some((_, value)) => Ok(serde_json::from_slice(&value)?),
            None => Ok(None),
        }
    }

    fn snapshot(&self, revision: Revision) -> Result<BTreeMap<String, EntryContent>, MetaError> {
        let mut prefix = self.prefix.clone();
        prefix.push(b'p');

        let mut latest: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        for (key, value) in self.kv.scan_prefix(&prefix)? {
            let rest = &key[prefix.len()..];
            if rest.len() < 9 {
                continue;
            }
            let (path_bytes, rev_bytes) = rest.split_at(rest.len() - 8);
            let mut arr = [0u8; 8];
            arr.copy_from_slice(rev_bytes);
            if u64::from_be_bytes(arr) > revision.as_i64() as u64 {
                continue;
            }
            let path = std::str::from_utf8(&path_bytes[..path_bytes.len() - 1])
                .map_err(|e| MetaError::Storage(format!("bad path key: {}", e)))?;
            latest.insert(path.to_string(), value);
        }

        let mut tree = BTreeMap::new();
        for (path, value) in latest {
            if let Some(content) = serde_json::from_slice::<Option<EntryContent>>(&value)? {
                tree.insert(path, content);
            }
        }
        Ok(tree)
    }

    fn read_commit(&self, revision: Revision) -> Result<Commit, MetaError> {
        match self.kv.get(&self.commit_key(revision))? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Err(MetaError::RevisionNotFound {
                revision,
                head: self.head(),
            }),
        }
    }

    fn head_key(&self) -> Vec<u8> {
        let mut key = self.prefix.clone();
        key.extend_from_slice(b"head");
        key
    }

    fn commit_key(&self, revision: Revision) -> Vec<u8> {
        let mut key = self.prefix.clone();
        key.push(b'c');
        key.extend_from_slice(&(revision.as_i64() as u64).to_be_bytes());
        key
    }

    fn path_key(&self, path: &str, revision: Revision) -> Vec<u8> {
        let mut key = self.prefix.clone();
        key.push(b'p');
        key.extend_from_slice(path.as_bytes());
        key.push(0);
        key.extend_from_slice(&(revision.as_i64() as u64).to_be_bytes());
        key
    }
}

fn upsert(path: String, content: EntryContent) -> Change {
    match content {
        EntryContent::Json(content) => Change::UpsertJson { path, content },
        EntryContent::Text(content) => Change::UpsertText { path, content },
    }
}
