//! Read cache in front of versioned repositories.
//!
//! Every key carries absolute revisions: `HEAD` and relative revisions are
//! resolved before the lookup, so a cached value is always the answer for a
//! fixed point in history and never goes stale on a new commit. Shards are
//! per repository incarnation: a reader still holding a removed repository
//! fills its own shard and can never answer for a re-created one. All shards
//! of a name are dropped when it is removed or re-created.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;

use crate::error::MetaError;
use crate::repository::VersionedRepository;
use crate::types::{Change, Commit, Entry, PathPattern, Query, RepositoryId, Revision};

/// Cache sizing.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of cached results per repository.
    pub capacity_per_repository: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            capacity_per_repository: 1024,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum CacheKey {
    Get(Revision, Query),
    Find(Revision, String),
    Diff(Revision, Revision, String),
    History(Revision, Revision, String),
}

#[derive(Clone)]
enum CacheValue {
    Entry(Option<Entry>),
    Entries(Arc<Vec<Entry>>),
    Changes(Arc<Vec<Change>>),
    Commits(Arc<Vec<Commit>>),
}

/// Hit/miss counters across all repositories.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from the cache
    pub hits: u64,
    /// Lookups that went to the repository
    pub misses: u64,
    /// Entries pushed out by capacity
    pub evictions: u64,
    /// Entries currently cached
    pub size: usize,
}

type Shard = Arc<Mutex<LruCache<CacheKey, CacheValue>>>;
type ShardKey = (RepositoryId, u64);

/// Per-node repository cache, shared by every repository on the node.
pub struct RepositoryCache {
    shards: DashMap<ShardKey, Shard>,
    capacity: NonZeroUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl RepositoryCache {
    /// Creates an empty cache.
    pub fn new(config: CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity_per_repository).unwrap_or(NonZeroUsize::MIN);
        Self {
            shards: DashMap::new(),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn shard(&self, repo: &VersionedRepository) -> Shard {
        let capacity = self.capacity;
        Arc::clone(
            &*self
                .shards
                .entry((repo.id().clone(), repo.incarnation()))
                .or_insert_with(|| Arc::new(Mutex::new(LruCache::new(capacity)))),
        )
    }

    fn lookup(&self, repo: &VersionedRepository, key: &CacheKey) -> Option<CacheValue> {
        let hit = self.shard(repo).lock().get(key).cloned();
        match hit {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        hit
    }

    fn insert(&self, repo: &VersionedRepository, key: CacheKey, value: CacheValue) {
        let shard = self.shard(repo);
        let evicted = shard.lock().push(key.clone(), value);
        if matches!(evicted, Some((old, _)) if old != key) {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drops every cached result of every incarnation of a repository.
    pub fn invalidate_repository(&self, repo: &RepositoryId) {
        let before = self.shards.len();
        self.shards.retain(|(id, _), _| id != repo);
        if self.shards.len() < before {
            tracing::debug!(repo = %repo, "invalidated repository cache");
        }
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            size: self.shards.iter().map(|s| s.value().lock().len()).sum(),
        }
    }
}

/// A repository whose reads go through the cache.
#[derive(Clone)]
pub struct CachingRepository {
    repo: Arc<VersionedRepository>,
    cache: Arc<RepositoryCache>,
}

impl CachingRepository {
    /// Wraps a repository.
    pub fn new(repo: Arc<VersionedRepository>, cache: Arc<RepositoryCache>) -> Self {
        Self { repo, cache }
    }

    /// The underlying repository.
    pub fn inner(&self) -> &Arc<VersionedRepository> {
        &self.repo
    }

    /// Latest revision.
    pub fn head(&self) -> Revision {
        self.repo.head()
    }

    /// Cached [`VersionedRepository::get`].
    pub fn get(&self, revision: Revision, query: &Query) -> Result<Entry, MetaError> {
        let revision = self.repo.normalize(revision)?;
        self.get_or_none(revision, query)?
            .ok_or_else(|| MetaError::EntryNotFound {
                path: query.path().to_string(),
                revision,
            })
    }

    /// Cached [`VersionedRepository::get_or_none`].
    pub fn get_or_none(&self, revision: Revision, query: &Query) -> Result<Option<Entry>, MetaError> {
        let revision = self.repo.normalize(revision)?;
        let key = CacheKey::Get(revision, query.clone());
        if let Some(CacheValue::Entry(entry)) = self.cache.lookup(&self.repo, &key) {
            return Ok(entry);
        }
        let entry = self.repo.get_or_none(revision, query)?;
        self.cache
            .insert(&self.repo, key, CacheValue::Entry(entry.clone()));
        Ok(entry)
    }

    /// Cached [`VersionedRepository::find`].
    pub fn find(&self, revision: Revision, pattern: &PathPattern) -> Result<Arc<Vec<Entry>>, MetaError> {
        let revision = self.repo.normalize(revision)?;
        let key = CacheKey::Find(revision, pattern.as_str().to_string());
        if let Some(CacheValue::Entries(entries)) = self.cache.lookup(&self.repo, &key) {
            return Ok(entries);
        }
        let entries = Arc::new(self.repo.find(revision, pattern)?);
        self.cache
            .insert(&self.repo, key, CacheValue::Entries(entries.clone()));
        Ok(entries)
    }

    /// Cached [`VersionedRepository::diff`].
    pub fn diff(
        &self,
        from: Revision,
        to: Revision,
        pattern: &PathPattern,
    ) -> Result<Arc<Vec<Change>>, MetaError> {
        let head = self.repo.head();
        let from = from.resolve(head)?;
        let to = to.resolve(head)?;
        let key = CacheKey::Diff(from, to, pattern.as_str().to_string());
        if let Some(CacheValue::Changes(changes)) = self.cache.lookup(&self.repo, &key) {
            return Ok(changes);
        }
        let changes = Arc::new(self.repo.diff(from, to, pattern)?);
        self.cache
            .insert(&self.repo, key, CacheValue::Changes(changes.clone()));
        Ok(changes)
    }

    /// Cached [`VersionedRepository::history`].
    pub fn history(
        &self,
        pattern: &PathPattern,
        from: Revision,
        to: Revision,
    ) -> Result<Arc<Vec<Commit>>, MetaError> {
        let head = self.repo.head();
        let from = from.resolve(head)?;
        let to = to.resolve(head)?;
        let key = CacheKey::History(from, to, pattern.as_str().to_string());
        if let Some(CacheValue::Commits(commits)) = self.cache.lookup(&self.repo, &key) {
            return Ok(commits);
        }
        let commits = Arc::new(self.repo.history(pattern, from, to)?);
        self.cache
            .insert(&self.repo, key, CacheValue::Commits(commits.clone()));
        Ok(commits)
    }
}
