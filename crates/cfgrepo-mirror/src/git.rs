//! Git transport seam.
//!
//! The scheduler sees a remote as a flat map of files under the mirror's
//! remote directory. [`crate::libgit2::Libgit2Transport`] talks to real
//! remotes; [`MemoryGitTransport`] keeps branches in memory with a
//! commit history so tests can inspect author and committer identities.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use cfgrepo_meta::Author;
use parking_lot::Mutex;

use crate::credential::Credential;
use crate::error::MirrorError;
use crate::mirror::RemoteSpec;

/// File contents keyed by path relative to the mirror root (`/a.json`).
pub type FileTree = BTreeMap<String, Vec<u8>>;

/// Content of a remote directory at a commit.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RemoteSnapshot {
    /// Head commit of the branch, `None` for an empty branch.
    pub commit_id: Option<String>,
    /// Files under the remote directory.
    pub files: FileTree,
}

/// A commit to create on the remote.
#[derive(Clone, Debug)]
pub struct PushRequest {
    /// Replacement content of the remote directory.
    pub files: FileTree,
    /// Commit author.
    pub author: Author,
    /// Commit committer.
    pub committer: Author,
    /// Commit message.
    pub message: String,
    /// Commit time.
    pub timestamp_millis: i64,
}

/// Talks to remote Git repositories.
#[async_trait]
pub trait GitTransport: Send + Sync + 'static {
    /// Reads the remote directory at the head of the branch.
    async fn fetch(&self, remote: &RemoteSpec, credential: &Credential) -> Result<RemoteSnapshot, MirrorError>;

    /// Replaces the remote directory with `request.files` in a new commit.
    /// Returns the new commit ID, or `None` if the content was unchanged.
    async fn push(
        &self,
        remote: &RemoteSpec,
        credential: &Credential,
        request: PushRequest,
    ) -> Result<Option<String>, MirrorError>;
}

/// A commit held by [`MemoryGitTransport`].
#[derive(Clone, Debug, PartialEq)]
pub struct GitCommit {
    /// Content hash of the commit.
    pub id: String,
    /// Previous head.
    pub parent: Option<String>,
    /// Author identity.
    pub author: Author,
    /// Committer identity.
    pub committer: Author,
    /// Commit message.
    pub message: String,
    /// Commit time.
    pub timestamp_millis: i64,
    /// Whole tree of the branch after the commit.
    pub tree: FileTree,
}

fn commit_id(parent: Option<&str>, author: &Author, message: &str, timestamp_millis: i64, tree: &FileTree) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(parent.unwrap_or("").as_bytes());
    hasher.update(author.to_string().as_bytes());
    hasher.update(message.as_bytes());
    hasher.update(&timestamp_millis.to_be_bytes());
    for (path, content) in tree {
        hasher.update(path.as_bytes());
        hasher.update(&(content.len() as u64).to_be_bytes());
        hasher.update(content);
    }
    hasher.finalize().to_hex().to_string()
}

type BranchKey = (String, String);

#[derive(Default)]
struct MemoryState {
    branches: HashMap<BranchKey, Vec<GitCommit>>,
    required: HashMap<String, Credential>,
    unreachable: Vec<String>,
    fetches: usize,
    pushes: usize,
}

/// In-process remote repositories.
#[derive(Default)]
pub struct MemoryGitTransport {
    state: Mutex<MemoryState>,
    latency: Mutex<Option<Duration>>,
}

impl MemoryGitTransport {
    /// Creates a transport with no repositories.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires `credential` for every operation on `repo_uri`.
    pub fn require_credential(&self, repo_uri: &str, credential: Credential) {
        self.state.lock().required.insert(repo_uri.to_string(), credential);
    }

    /// Makes every operation on `repo_uri` fail with a transport error.
    pub fn set_unreachable(&self, repo_uri: &str) {
        self.state.lock().unreachable.push(repo_uri.to_string());
    }

    /// Delays every operation, for overlapping-pass tests.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    /// Commits `files` (absolute remote paths) directly to a branch.
    pub fn seed(&self, remote: &RemoteSpec, files: FileTree, author: &Author, message: &str) -> String {
        let mut state = self.state.lock();
        let history = state
            .branches
            .entry((remote.repo_uri.clone(), remote.branch.clone()))
            .or_default();
        let parent = history.last().map(|c| c.id.clone());
        let id = commit_id(parent.as_deref(), author, message, 0, &files);
        history.push(GitCommit {
            id: id.clone(),
            parent,
            author: author.clone(),
            committer: author.clone(),
            message: message.to_string(),
            timestamp_millis: 0,
            tree: files,
        });
        id
    }

    /// History of a branch, oldest first.
    pub fn commits(&self, remote: &RemoteSpec) -> Vec<GitCommit> {
        self.state
            .lock()
            .branches
            .get(&(remote.repo_uri.clone(), remote.branch.clone()))
            .cloned()
            .unwrap_or_default()
    }

    /// Head commit of a branch.
    pub fn head(&self, remote: &RemoteSpec) -> Option<GitCommit> {
        self.commits(remote).pop()
    }

    /// Number of fetch and push calls that reached a repository.
    pub fn operation_counts(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.fetches, state.pushes)
    }

    async fn delay(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn authorize(state: &MemoryState, remote: &RemoteSpec, credential: &Credential) -> Result<(), MirrorError> {
        if state.unreachable.contains(&remote.repo_uri) {
            return Err(MirrorError::Transport(format!("{} is unreachable", remote.repo_uri)));
        }
        match state.required.get(&remote.repo_uri) {
            Some(required) if required != credential => Err(MirrorError::Credential(format!(
                "authentication failed for {}",
                remote.repo_uri
            ))),
            _ => Ok(()),
        }
    }
}

fn subtree(tree: &FileTree, dir: &str) -> FileTree {
    tree.iter()
        .filter_map(|(path, content)| {
            path.strip_prefix(dir)
                .map(|rest| (format!("/{}", rest), content.clone()))
        })
        .collect()
}

#[async_trait]
impl GitTransport for MemoryGitTransport {
    async fn fetch(&self, remote: &RemoteSpec, credential: &Credential) -> Result<RemoteSnapshot, MirrorError> {
        self.delay().await;
        let mut state = self.state.lock();
        Self::authorize(&state, remote, credential)?;
        state.fetches += 1;
        let snapshot = match state
            .branches
            .get(&(remote.repo_uri.clone(), remote.branch.clone()))
            .and_then(|history| history.last())
        {
            Some(head) => RemoteSnapshot {
                commit_id: Some(head.id.clone()),
                files: subtree(&head.tree, &remote.path),
            },
            None => RemoteSnapshot::default(),
        };
        Ok(snapshot)
    }

    async fn push(
        &self,
        remote: &RemoteSpec,
        credential: &Credential,
        request: PushRequest,
    ) -> Result<Option<String>, MirrorError> {
        self.delay().await;
        let mut state = self.state.lock();
        Self::authorize(&state, remote, credential)?;
        state.pushes += 1;

        let history = state
            .branches
            .entry((remote.repo_uri.clone(), remote.branch.clone()))
            .or_default();
        let parent = history.last();
        let mut tree: FileTree = parent
            .map(|c| {
                c.tree
                    .iter()
                    .filter(|(path, _)| !path.starts_with(&remote.path))
                    .map(|(p, v)| (p.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default();
        for (path, content) in request.files {
            let relative = path.trim_start_matches('/');
            tree.insert(format!("{}{}", remote.path, relative), content);
        }
        if parent.map(|c| &c.tree) == Some(&tree) {
            return Ok(None);
        }

        let parent = parent.map(|c| c.id.clone());
        let id = commit_id(
            parent.as_deref(),
            &request.author,
            &request.message,
            request.timestamp_millis,
            &tree,
        );
        history.push(GitCommit {
            id: id.clone(),
            parent,
            author: request.author,
            committer: request.committer,
            message: request.message,
            timestamp_millis: request.timestamp_millis,
            tree,
        });
        Ok(Some(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(uri: &str) -> RemoteSpec {
        RemoteSpec::parse(uri).unwrap()
    }

    fn files(entries: &[(&str, &str)]) -> FileTree {
        entries
            .iter()
            .map(|(p, c)| (p.to_string(), c.as_bytes().to_vec()))
            .collect()
    }

    fn request(tree: FileTree) -> PushRequest {
        PushRequest {
            files: tree,
            author: Author::mirror(),
            committer: Author::mirror(),
            message: "sync".to_string(),
            timestamp_millis: 1,
        }
    }

    #[tokio::test]
    async fn test_push_replaces_only_the_mirrored_directory() {
        let git = MemoryGitTransport::new();
        let root = remote("git+file:///r/.git");
        git.seed(&root, files(&[("/keep.txt", "k"), ("/sub/old.txt", "o")]), &Author::system(), "init");

        let sub = remote("git+file:///r/.git/sub");
        let id = git
            .push(&sub, &Credential::anonymous(), request(files(&[("/new.txt", "n")])))
            .await
            .unwrap();
        assert!(id.is_some());

        let head = git.head(&root).unwrap();
        assert_eq!(head.tree, files(&[("/keep.txt", "k"), ("/sub/new.txt", "n")]));
        let fetched = git.fetch(&sub, &Credential::anonymous()).await.unwrap();
        assert_eq!(fetched.files, files(&[("/new.txt", "n")]));
        assert_eq!(fetched.commit_id, id);
    }

    #[tokio::test]
    async fn test_unchanged_push_creates_no_commit() {
        let git = MemoryGitTransport::new();
        let root = remote("git+file:///r/.git");
        let tree = files(&[("/a.txt", "a")]);
        git.push(&root, &Credential::anonymous(), request(tree.clone()))
            .await
            .unwrap();
        let again = git
            .push(&root, &Credential::anonymous(), request(tree))
            .await
            .unwrap();
        assert_eq!(again, None);
        assert_eq!(git.commits(&root).len(), 1);
    }

    #[tokio::test]
    async fn test_credential_and_reachability_checks() {
        let git = MemoryGitTransport::new();
        let root = remote("git+https://example.com/r.git");
        git.require_credential(
            &root.repo_uri,
            Credential::AccessToken {
                name: "t".into(),
                access_token: "secret".into(),
            },
        );
        assert!(matches!(
            git.fetch(&root, &Credential::anonymous()).await,
            Err(MirrorError::Credential(_))
        ));

        git.set_unreachable(&root.repo_uri);
        assert!(matches!(
            git.fetch(&root, &Credential::anonymous()).await,
            Err(MirrorError::Transport(_))
        ));
        assert_eq!(git.operation_counts(), (0, 0));
    }
}
