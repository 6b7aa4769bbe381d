//! Git transport backed by libgit2.
//!
//! Each remote repository gets a bare cache repository under the cache
//! directory, named after a hash of its URI. Every operation refetches the
//! mirrored branch into the cache first, so reads and commits always start
//! from the remote's current head. Operations on the same remote are
//! serialised; libgit2 calls run on the blocking pool.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use git2::{
    Commit, Cred, CredentialType, ErrorCode, FetchOptions, ObjectType, Oid, PushOptions, RemoteCallbacks, Repository,
    Signature, Time, Tree, TreeWalkMode, TreeWalkResult,
};
use parking_lot::Mutex;
use tracing::debug;

use crate::credential::Credential;
use crate::error::MirrorError;
use crate::git::{FileTree, GitTransport, PushRequest, RemoteSnapshot};
use crate::mirror::RemoteSpec;

const FILE_MODE: i32 = 0o100_644;
const DIR_MODE: i32 = 0o040_000;
const GITLINK_MODE: i32 = 0o160_000;

fn transport(e: git2::Error) -> MirrorError {
    MirrorError::Transport(e.message().to_string())
}

fn branch_ref(remote: &RemoteSpec) -> String {
    format!("refs/heads/{}", remote.branch)
}

/// Directory of `remote.path` inside a Git tree, `""` for the root.
fn tree_prefix(remote: &RemoteSpec) -> &str {
    remote.path.trim_start_matches('/')
}

/// Remote Git access through libgit2.
pub struct Libgit2Transport {
    cache_dir: PathBuf,
    locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl Libgit2Transport {
    /// Creates a transport keeping its cache repositories under `cache_dir`.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Result<Self, MirrorError> {
        let cache_dir = cache_dir.into();
        std::fs::create_dir_all(&cache_dir)
            .map_err(|e| MirrorError::Transport(format!("git cache {}: {}", cache_dir.display(), e)))?;
        Ok(Self {
            cache_dir,
            locks: DashMap::new(),
        })
    }

    /// Cache repository of a remote.
    pub fn cache_path(&self, remote: &RemoteSpec) -> PathBuf {
        let digest = blake3::hash(remote.repo_uri.as_bytes()).to_hex();
        self.cache_dir.join(&digest[..16])
    }

    async fn run<T, F>(&self, remote: &RemoteSpec, op: F) -> Result<T, MirrorError>
    where
        T: Send + 'static,
        F: FnOnce(&Repository) -> Result<T, MirrorError> + Send + 'static,
    {
        let path = self.cache_path(remote);
        let lock = self.locks.entry(path.clone()).or_default().clone();
        tokio::task::spawn_blocking(move || {
            let _guard = lock.lock();
            let repo = open_cache(&path)?;
            op(&repo)
        })
        .await
        .map_err(|e| MirrorError::Transport(format!("git task failed: {}", e)))?
    }
}

fn open_cache(path: &Path) -> Result<Repository, MirrorError> {
    let repo = if path.exists() {
        Repository::open_bare(path)
    } else {
        Repository::init_bare(path)
    };
    repo.map_err(transport)
}

/// Authentication for one remote operation.
struct Auth<'a> {
    credential: &'a Credential,
    rejected: Cell<bool>,
}

impl<'a> Auth<'a> {
    fn new(credential: &'a Credential) -> Self {
        Self {
            credential,
            rejected: Cell::new(false),
        }
    }

    /// Answers the remote's first credential request. A second request
    /// means the first answer was refused.
    fn callbacks(&self) -> RemoteCallbacks<'_> {
        let mut callbacks = RemoteCallbacks::new();
        let mut asked = false;
        callbacks.credentials(move |_url, url_user, allowed| {
            if asked {
                self.rejected.set(true);
                return Err(git2::Error::from_str("credentials rejected"));
            }
            asked = true;
            match self.credential {
                Credential::Password { username, password, .. } => Cred::userpass_plaintext(username, password),
                Credential::AccessToken { access_token, .. } if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) => {
                    Cred::userpass_plaintext(url_user.unwrap_or("token"), access_token)
                }
                _ if allowed.contains(CredentialType::SSH_KEY) => Cred::ssh_key_from_agent(url_user.unwrap_or("git")),
                _ if allowed.contains(CredentialType::DEFAULT) => Cred::default(),
                _ => {
                    self.rejected.set(true);
                    Err(git2::Error::from_str("remote requires credentials"))
                }
            }
        });
        callbacks
    }

    fn headers(&self) -> Vec<String> {
        match self.credential {
            Credential::AccessToken { access_token, .. } => vec![format!("Authorization: Bearer {}", access_token)],
            _ => Vec::new(),
        }
    }

    fn error(&self, remote: &RemoteSpec, e: git2::Error) -> MirrorError {
        if self.rejected.get() || e.code() == ErrorCode::Auth {
            MirrorError::Credential(format!("authentication failed for {}: {}", remote.repo_uri, e.message()))
        } else {
            MirrorError::Transport(format!("{}: {}", remote.repo_uri, e.message()))
        }
    }
}

/// Refetches the mirrored branch into the cache and returns its head.
fn fetch_head(repo: &Repository, remote: &RemoteSpec, credential: &Credential) -> Result<Option<Oid>, MirrorError> {
    let refname = branch_ref(remote);
    if let Ok(mut stale) = repo.find_reference(&refname) {
        stale.delete().map_err(transport)?;
    }

    let auth = Auth::new(credential);
    let headers = auth.headers();
    let header_refs: Vec<&str> = headers.iter().map(String::as_str).collect();
    let mut options = FetchOptions::new();
    options.remote_callbacks(auth.callbacks()).custom_headers(&header_refs);

    let refspec = format!("+{0}:{0}", refname);
    let mut origin = repo.remote_anonymous(&remote.repo_uri).map_err(transport)?;
    origin
        .fetch(&[refspec.as_str()], Some(&mut options), None)
        .map_err(|e| auth.error(remote, e))?;

    match repo.refname_to_id(&refname) {
        Ok(oid) => Ok(Some(oid)),
        Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
        Err(e) => Err(transport(e)),
    }
}

fn push_head(repo: &Repository, remote: &RemoteSpec, credential: &Credential) -> Result<(), MirrorError> {
    let refname = branch_ref(remote);
    let auth = Auth::new(credential);
    let headers = auth.headers();
    let header_refs: Vec<&str> = headers.iter().map(String::as_str).collect();
    let rejection = RefCell::new(None);

    let mut callbacks = auth.callbacks();
    callbacks.push_update_reference(|name, status| {
        if let Some(status) = status {
            *rejection.borrow_mut() = Some(format!("{} rejected: {}", name, status));
        }
        Ok(())
    });
    let mut options = PushOptions::new();
    options.remote_callbacks(callbacks).custom_headers(&header_refs);

    let refspec = format!("{0}:{0}", refname);
    let mut origin = repo.remote_anonymous(&remote.repo_uri).map_err(transport)?;
    origin
        .push(&[refspec.as_str()], Some(&mut options))
        .map_err(|e| auth.error(remote, e))?;

    match rejection.take() {
        Some(reason) => Err(MirrorError::Transport(format!("{}: {}", remote.repo_uri, reason))),
        None => Ok(()),
    }
}

/// Non-directory entries of a tree by full path.
fn tree_entries(tree: &Tree<'_>) -> Result<BTreeMap<String, (Oid, i32)>, MirrorError> {
    let mut entries = BTreeMap::new();
    tree.walk(TreeWalkMode::PreOrder, |root, entry| {
        if entry.kind() != Some(ObjectType::Tree) {
            if let Some(name) = entry.name() {
                entries.insert(format!("{}{}", root, name), (entry.id(), entry.filemode()));
            }
        }
        TreeWalkResult::Ok
    })
    .map_err(transport)?;
    Ok(entries)
}

enum TreeNode {
    Leaf(Oid, i32),
    Dir(BTreeMap<String, TreeNode>),
}

fn write_tree(repo: &Repository, entries: &BTreeMap<String, (Oid, i32)>) -> Result<Oid, MirrorError> {
    let mut root = BTreeMap::new();
    for (path, (oid, mode)) in entries {
        let mut dir = &mut root;
        let mut parts = path.split('/').filter(|p| !p.is_empty()).peekable();
        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                dir.insert(part.to_string(), TreeNode::Leaf(*oid, *mode));
                break;
            }
            let node = dir
                .entry(part.to_string())
                .or_insert_with(|| TreeNode::Dir(BTreeMap::new()));
            dir = match node {
                TreeNode::Dir(children) => children,
                TreeNode::Leaf(..) => {
                    return Err(MirrorError::Transport(format!("{} is both a file and a directory", path)));
                }
            };
        }
    }
    write_dir(repo, &root)
}

fn write_dir(repo: &Repository, dir: &BTreeMap<String, TreeNode>) -> Result<Oid, MirrorError> {
    let mut builder = repo.treebuilder(None).map_err(transport)?;
    for (name, node) in dir {
        let (oid, mode) = match node {
            TreeNode::Leaf(oid, mode) => (*oid, *mode),
            TreeNode::Dir(children) => (write_dir(repo, children)?, DIR_MODE),
        };
        builder.insert(name, oid, mode).map_err(transport)?;
    }
    builder.write().map_err(transport)
}

fn signature(author: &cfgrepo_meta::Author, timestamp_millis: i64) -> Result<Signature<'static>, MirrorError> {
    let when = Time::new(timestamp_millis.div_euclid(1000), 0);
    Signature::new(&author.name, &author.email, &when).map_err(transport)
}

fn fetch_blocking(repo: &Repository, remote: &RemoteSpec, credential: &Credential) -> Result<RemoteSnapshot, MirrorError> {
    let Some(head) = fetch_head(repo, remote, credential)? else {
        return Ok(RemoteSnapshot::default());
    };
    let commit = repo.find_commit(head).map_err(transport)?;
    let tree = commit.tree().map_err(transport)?;
    let prefix = tree_prefix(remote);

    let mut files = FileTree::new();
    for (path, (oid, mode)) in tree_entries(&tree)? {
        let Some(relative) = path.strip_prefix(prefix) else {
            continue;
        };
        if mode == GITLINK_MODE {
            continue;
        }
        let blob = repo.find_blob(oid).map_err(transport)?;
        files.insert(format!("/{}", relative), blob.content().to_vec());
    }
    Ok(RemoteSnapshot {
        commit_id: Some(head.to_string()),
        files,
    })
}

fn push_blocking(
    repo: &Repository,
    remote: &RemoteSpec,
    credential: &Credential,
    request: &PushRequest,
) -> Result<Option<String>, MirrorError> {
    let parent: Option<Commit<'_>> = match fetch_head(repo, remote, credential)? {
        Some(head) => Some(repo.find_commit(head).map_err(transport)?),
        None => None,
    };
    let prefix = tree_prefix(remote);

    let mut entries = match &parent {
        Some(commit) => tree_entries(&commit.tree().map_err(transport)?)?,
        None => BTreeMap::new(),
    };
    entries.retain(|path, _| !path.starts_with(prefix));
    for (path, content) in &request.files {
        let oid = repo.blob(content).map_err(transport)?;
        entries.insert(format!("{}{}", prefix, path.trim_start_matches('/')), (oid, FILE_MODE));
    }

    let tree_id = write_tree(repo, &entries)?;
    if parent.as_ref().is_some_and(|commit| commit.tree_id() == tree_id) {
        return Ok(None);
    }
    let tree = repo.find_tree(tree_id).map_err(transport)?;
    let author = signature(&request.author, request.timestamp_millis)?;
    let committer = signature(&request.committer, request.timestamp_millis)?;
    let parents: Vec<&Commit<'_>> = parent.iter().collect();
    let commit_id = repo
        .commit(None, &author, &committer, &request.message, &tree, &parents)
        .map_err(transport)?;
    repo.reference(&branch_ref(remote), commit_id, true, "mirror")
        .map_err(transport)?;

    push_head(repo, remote, credential)?;
    debug!(remote = %remote, commit = %commit_id, "pushed mirror commit");
    Ok(Some(commit_id.to_string()))
}

#[async_trait]
impl GitTransport for Libgit2Transport {
    async fn fetch(&self, remote: &RemoteSpec, credential: &Credential) -> Result<RemoteSnapshot, MirrorError> {
        let spec = remote.clone();
        let credential = credential.clone();
        self.run(remote, move |repo| fetch_blocking(repo, &spec, &credential))
            .await
    }

    async fn push(
        &self,
        remote: &RemoteSpec,
        credential: &Credential,
        request: PushRequest,
    ) -> Result<Option<String>, MirrorError> {
        let spec = remote.clone();
        let credential = credential.clone();
        self.run(remote, move |repo| push_blocking(repo, &spec, &credential, &request))
            .await
    }
}
