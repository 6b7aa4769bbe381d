//! Projects, their repositories and the node-wide project manager.
//!
//! Every project carries two reserved repositories that never show up in
//! user-facing listings: `internal` holds `/metadata.json`, and `meta` holds
//! mirror and credential documents. Once the system project records a
//! migration job, newly opened projects keep their mirror documents in
//! `internal` instead, after probing for the per-project migration marker.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::cache::{CachingRepository, RepositoryCache};
use crate::error::MetaError;
use crate::kvstore::KvStore;
use crate::metadata::{MetadataCell, ProjectMetadata, RepositoryMetadata, UserAndTimestamp};
use crate::repository::{list_repository_names, CommitOutcome, VersionedRepository};
use crate::types::{
    validate_name, Author, Change, EntryContent, PathPattern, Query, RepositoryId, Revision,
};
use crate::watch::{WatchOutcome, WatchRegistry, WatchTarget};

/// Reserved repository holding project metadata.
pub const REPO_INTERNAL: &str = "internal";
/// Reserved repository holding mirror and credential documents.
pub const REPO_META: &str = "meta";
/// All reserved repository names.
pub const RESERVED_REPOS: [&str; 2] = [REPO_INTERNAL, REPO_META];
/// The system project, created on every node at startup.
pub const SYSTEM_PROJECT: &str = "@system";
/// Project metadata document in the internal repository.
pub const METADATA_PATH: &str = "/metadata.json";
/// Marker in the system project announcing the meta repository migration.
pub const MIGRATION_JOB_PATH: &str = "/migration_job.json";
/// Per-project marker written once its meta documents have been migrated.
pub const META_MIGRATED_PATH: &str = "/meta_migrated.json";
/// Bound on waiting for the per-project migration marker.
pub const META_MARKER_TIMEOUT: Duration = Duration::from_secs(10);

const PROJECT_INDEX_PREFIX: &str = "proj/";

/// Returns true for repository names reserved for system use.
pub fn is_reserved_repository(name: &str) -> bool {
    RESERVED_REPOS.contains(&name)
}

/// Node-scoped services shared by every project.
#[derive(Clone)]
pub struct ProjectContext {
    /// Backing store for all repositories
    pub kv: Arc<dyn KvStore>,
    /// Watch registry notified of every commit
    pub registry: Arc<WatchRegistry>,
    /// Read cache
    pub cache: Arc<RepositoryCache>,
}

/// Repositories of one project.
pub struct RepositoryManager {
    project: String,
    ctx: ProjectContext,
    repos: RwLock<BTreeMap<String, Arc<VersionedRepository>>>,
    closed: AtomicBool,
}

impl RepositoryManager {
    fn new(project: &str, ctx: ProjectContext) -> Self {
        Self {
            project: project.to_string(),
            ctx,
            repos: RwLock::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), MetaError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MetaError::Shutdown);
        }
        Ok(())
    }

    fn load_existing(&self) -> Result<(), MetaError> {
        let names = list_repository_names(self.ctx.kv.as_ref(), &self.project)?;
        let mut repos = self.repos.write();
        for name in names {
            if repos.contains_key(&name) {
                continue;
            }
            let repo = VersionedRepository::open(
                RepositoryId::new(&self.project, &name),
                self.ctx.kv.clone(),
                self.ctx.registry.clone(),
            )?;
            repos.insert(name, Arc::new(repo));
        }
        Ok(())
    }

    /// Creates a repository and records its initial revision.
    pub fn create(
        &self,
        name: &str,
        timestamp_millis: i64,
        author: &Author,
    ) -> Result<Arc<VersionedRepository>, MetaError> {
        self.ensure_open()?;
        let mut repos = self.repos.write();
        if repos.contains_key(name) {
            return Err(MetaError::RepositoryExists(format!("{}/{}", self.project, name)));
        }
        let id = RepositoryId::new(&self.project, name);
        self.ctx.cache.invalidate_repository(&id);
        let repo = Arc::new(VersionedRepository::create(
            id,
            self.ctx.kv.clone(),
            author.clone(),
            timestamp_millis,
            self.ctx.registry.clone(),
        )?);
        repos.insert(name.to_string(), repo.clone());
        Ok(repo)
    }

    /// Looks up a repository.
    pub fn get(&self, name: &str) -> Result<Arc<VersionedRepository>, MetaError> {
        self.ensure_open()?;
        self.repos
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| MetaError::RepositoryNotFound(format!("{}/{}", self.project, name)))
    }

    /// Returns true if the repository exists.
    pub fn exists(&self, name: &str) -> bool {
        self.repos.read().contains_key(name)
    }

    /// Removes a repository, its records, its watches and its cached reads.
    pub fn remove(&self, name: &str) -> Result<(), MetaError> {
        self.ensure_open()?;
        let repo = self
            .repos
            .write()
            .remove(name)
            .ok_or_else(|| MetaError::RepositoryNotFound(format!("{}/{}", self.project, name)))?;
        repo.purge()?;
        self.release(repo.id());
        Ok(())
    }

    /// User-facing repository names, reserved repositories excluded.
    pub fn list(&self) -> Vec<String> {
        self.repos
            .read()
            .keys()
            .filter(|name| !is_reserved_repository(name))
            .cloned()
            .collect()
    }

    /// All repository names, reserved repositories included.
    pub fn list_all(&self) -> Vec<String> {
        self.repos.read().keys().cloned().collect()
    }

    /// Releases every repository without deleting records.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let repos = std::mem::take(&mut *self.repos.write());
        for repo in repos.values() {
            self.release(repo.id());
        }
    }

    fn purge_all(&self) -> Result<(), MetaError> {
        self.closed.store(true, Ordering::Release);
        let repos = std::mem::take(&mut *self.repos.write());
        for repo in repos.values() {
            repo.purge()?;
            self.release(repo.id());
        }
        Ok(())
    }

    fn release(&self, id: &RepositoryId) {
        self.ctx.registry.remove_repository(id);
        self.ctx.cache.invalidate_repository(id);
    }
}

/// A named container of repositories with cached metadata.
pub struct Project {
    name: String,
    repos: RepositoryManager,
    metadata: MetadataCell,
    use_internal_as_meta: bool,
    resolved_meta: RwLock<Option<String>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    registry: Arc<WatchRegistry>,
}

impl Project {
    fn new(name: &str, ctx: ProjectContext, use_internal_as_meta: bool) -> Self {
        Self {
            name: name.to_string(),
            registry: ctx.registry.clone(),
            repos: RepositoryManager::new(name, ctx),
            metadata: MetadataCell::new(),
            use_internal_as_meta,
            resolved_meta: RwLock::new(None),
            listener: Mutex::new(None),
        }
    }

    /// Creates a new project: reserved repositories first, then metadata.
    /// Any failure purges what was created.
    pub(crate) fn create(
        name: &str,
        ctx: ProjectContext,
        timestamp_millis: i64,
        author: &Author,
        use_internal_as_meta: bool,
    ) -> Result<Arc<Self>, MetaError> {
        let project = Self::new(name, ctx, use_internal_as_meta);
        if let Err(e) = project.bootstrap(timestamp_millis, author) {
            tracing::error!(project = %name, error = %e, "project creation failed, rolling back");
            if let Err(purge_err) = project.repos.purge_all() {
                tracing::error!(project = %name, error = %purge_err, "rollback could not purge repositories");
            }
            return Err(MetaError::FatalInitialization {
                project: name.to_string(),
                reason: e.to_string(),
            });
        }
        let project = Arc::new(project);
        project.start_metadata_listener();
        tracing::info!(project = %name, "created project");
        Ok(project)
    }

    /// Opens a project persisted in the KV store.
    pub(crate) fn open(
        name: &str,
        ctx: ProjectContext,
        use_internal_as_meta: bool,
    ) -> Result<Arc<Self>, MetaError> {
        let project = Self::new(name, ctx, use_internal_as_meta);
        let opened = project.repos.load_existing().and_then(|()| {
            let (author, created) = match project.repos.get(REPO_INTERNAL) {
                Ok(internal) => (internal.info().author.clone(), internal.info().created_at_millis),
                Err(_) => (Author::system(), 0),
            };
            project.bootstrap(created, &author)
        });
        if let Err(e) = opened {
            tracing::error!(project = %name, error = %e, "failed to open project");
            project.repos.close();
            return Err(MetaError::FatalInitialization {
                project: name.to_string(),
                reason: e.to_string(),
            });
        }
        let project = Arc::new(project);
        project.start_metadata_listener();
        tracing::debug!(project = %name, "opened project");
        Ok(project)
    }

    fn bootstrap(&self, timestamp_millis: i64, author: &Author) -> Result<(), MetaError> {
        self.repos.load_existing()?;
        // A project without a legacy meta repository has nothing to migrate.
        let migrated = self.use_internal_as_meta && !self.repos.exists(REPO_META);
        for name in RESERVED_REPOS {
            if migrated && name == REPO_META {
                continue;
            }
            match self.repos.create(name, timestamp_millis, author) {
                Ok(_) | Err(MetaError::RepositoryExists(_)) => {}
                Err(e) => return Err(e),
            }
        }

        if self.name == SYSTEM_PROJECT {
            return Ok(());
        }
        let internal = self.repos.get(REPO_INTERNAL)?;
        if internal
            .get_or_none(Revision::HEAD, &Query::identity(METADATA_PATH))?
            .is_none()
        {
            let metadata = ProjectMetadata::new(&self.name, author, timestamp_millis);
            internal
                .commit(
                    Revision::HEAD,
                    timestamp_millis,
                    Author::system(),
                    "Add the metadata file",
                    "",
                    vec![Change::upsert_json(METADATA_PATH, serde_json::to_value(&metadata)?)],
                )?
                .into_result()?;
        }
        if migrated {
            self.mark_meta_migrated(&internal, timestamp_millis)?;
        }
        self.refresh_metadata()
    }

    fn mark_meta_migrated(
        &self,
        internal: &VersionedRepository,
        timestamp_millis: i64,
    ) -> Result<(), MetaError> {
        if internal
            .get_or_none(Revision::HEAD, &Query::identity(META_MIGRATED_PATH))?
            .is_none()
        {
            internal
                .commit(
                    Revision::HEAD,
                    timestamp_millis,
                    Author::system(),
                    "Use the internal repository for mirror documents",
                    "",
                    vec![Change::upsert_json(
                        META_MIGRATED_PATH,
                        serde_json::json!({ "timestamp": timestamp_millis }),
                    )],
                )?
                .into_result()?;
        }
        *self.resolved_meta.write() = Some(REPO_INTERNAL.to_string());
        Ok(())
    }

    /// Project name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Repositories of this project.
    pub fn repos(&self) -> &RepositoryManager {
        &self.repos
    }

    /// The cached metadata snapshot.
    pub fn metadata(&self) -> Option<Arc<ProjectMetadata>> {
        self.metadata.get()
    }

    /// Revision of the internal repository the cached metadata was read at.
    pub fn last_metadata_revision(&self) -> Option<Revision> {
        self.metadata.revision()
    }

    /// Applies a metadata payload observed at `revision`.
    ///
    /// Returns false if the payload is malformed or not newer than the
    /// cached snapshot; neither is an error.
    pub fn apply_metadata_update(&self, revision: Revision, content: &EntryContent) -> bool {
        let parsed = content
            .as_json()
            .ok_or_else(|| "metadata is not JSON".to_string())
            .and_then(|v| {
                serde_json::from_value::<ProjectMetadata>(v.clone()).map_err(|e| e.to_string())
            });
        match parsed {
            Ok(metadata) => {
                let updated = self.metadata.update(revision, metadata);
                if !updated {
                    tracing::debug!(project = %self.name, revision = %revision, "ignoring stale metadata update");
                }
                updated
            }
            Err(e) => {
                tracing::warn!(
                    project = %self.name,
                    revision = %revision,
                    error = %e,
                    "ignoring malformed project metadata"
                );
                false
            }
        }
    }

    /// Re-reads the metadata document at head, failing if it is missing or
    /// malformed.
    pub fn refresh_metadata(&self) -> Result<(), MetaError> {
        let internal = self.repos.get(REPO_INTERNAL)?;
        let entry = internal.get(Revision::HEAD, &Query::json(METADATA_PATH))?;
        let metadata: ProjectMetadata = match &entry.content {
            EntryContent::Json(v) => serde_json::from_value(v.clone())?,
            EntryContent::Text(_) => {
                return Err(MetaError::Validation("metadata is not JSON".to_string()))
            }
        };
        self.metadata.update(entry.revision, metadata);
        Ok(())
    }

    fn start_metadata_listener(self: &Arc<Self>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(project = %self.name, "no runtime, metadata listener not started");
            return;
        };
        let pattern = match PathPattern::parse(METADATA_PATH) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(project = %self.name, error = %e, "cannot watch metadata");
                return;
            }
        };
        let mut subscription = self
            .registry
            .subscribe(&RepositoryId::new(&self.name, REPO_INTERNAL), pattern);
        let weak = Arc::downgrade(self);
        let task = runtime.spawn(async move {
            while let Some(event) = subscription.recv().await {
                let Some(project) = weak.upgrade() else {
                    break;
                };
                for change in &event.changes {
                    match change.content() {
                        Some(content) => {
                            project.apply_metadata_update(event.revision, &content);
                        }
                        None => tracing::warn!(
                            project = %project.name,
                            revision = %event.revision,
                            "metadata file removed, keeping cached snapshot"
                        ),
                    }
                }
            }
        });
        *self.listener.lock() = Some(task);
    }

    /// Records a new user repository in the metadata document.
    fn record_repository(&self, name: &str, timestamp_millis: i64, author: &Author) -> Result<(), MetaError> {
        self.update_metadata(timestamp_millis, author, &format!("Add repository {}", name), |md| {
            md.repos.insert(
                name.to_string(),
                RepositoryMetadata {
                    name: name.to_string(),
                    creation: UserAndTimestamp::new(author, timestamp_millis),
                },
            );
        })
    }

    fn forget_repository(&self, name: &str, timestamp_millis: i64, author: &Author) -> Result<(), MetaError> {
        self.update_metadata(timestamp_millis, author, &format!("Remove repository {}", name), |md| {
            md.repos.remove(name);
        })
    }

    fn update_metadata(
        &self,
        timestamp_millis: i64,
        author: &Author,
        summary: &str,
        edit: impl FnOnce(&mut ProjectMetadata),
    ) -> Result<(), MetaError> {
        if self.name == SYSTEM_PROJECT {
            return Ok(());
        }
        self.refresh_metadata()?;
        let Some(current) = self.metadata.get() else {
            return Err(MetaError::Validation(format!(
                "project {} has no metadata",
                self.name
            )));
        };
        let mut metadata = (*current).clone();
        edit(&mut metadata);
        let internal = self.repos.get(REPO_INTERNAL)?;
        let outcome = internal.commit(
            Revision::HEAD,
            timestamp_millis,
            author.clone(),
            summary,
            "",
            vec![Change::upsert_json(METADATA_PATH, serde_json::to_value(&metadata)?)],
        )?;
        match outcome {
            CommitOutcome::Applied(_) | CommitOutcome::Redundant => self.refresh_metadata(),
            CommitOutcome::Conflict { head } => Err(MetaError::Conflict { head }),
        }
    }

    /// True if this project keeps mirror documents in the internal repository.
    pub fn uses_internal_meta_repository(&self) -> bool {
        self.use_internal_as_meta
    }

    /// The repository holding mirror and credential documents, if already
    /// known without probing.
    pub fn meta_repository(&self) -> Result<Arc<VersionedRepository>, MetaError> {
        if !self.use_internal_as_meta {
            return self.repos.get(REPO_META);
        }
        match self.resolved_meta.read().clone() {
            Some(name) => self.repos.get(&name),
            None => Err(MetaError::FatalInitialization {
                project: self.name.clone(),
                reason: "meta repository migration marker has not been resolved".to_string(),
            }),
        }
    }

    /// Resolves the repository holding mirror and credential documents,
    /// waiting up to `timeout` for the migration marker when a migration is
    /// in effect. A missing marker after the timeout is fatal.
    pub async fn resolve_meta_repository(
        &self,
        timeout: Duration,
    ) -> Result<Arc<VersionedRepository>, MetaError> {
        if !self.use_internal_as_meta || self.resolved_meta.read().is_some() {
            return self.meta_repository();
        }

        let internal = self.repos.get(REPO_INTERNAL)?;
        let query = Query::identity(META_MIGRATED_PATH);
        let head = internal.head();
        if internal.get_or_none(head, &query)?.is_none() {
            tracing::info!(project = %self.name, ?timeout, "waiting for meta migration marker");
            let handle = self.registry.watch(
                &internal,
                WatchTarget::File(query),
                head,
                Some(timeout),
            )?;
            match handle.wait().await {
                WatchOutcome::Fulfilled(event) if event.entry.is_some() => {}
                WatchOutcome::Fulfilled(_) | WatchOutcome::TimedOut => {
                    return Err(MetaError::FatalInitialization {
                        project: self.name.clone(),
                        reason: format!(
                            "migration marker {} not found within {:?}",
                            META_MIGRATED_PATH, timeout
                        ),
                    })
                }
                WatchOutcome::Cancelled => return Err(MetaError::Shutdown),
            }
        }

        *self.resolved_meta.write() = Some(REPO_INTERNAL.to_string());
        tracing::info!(project = %self.name, "using internal repository for mirror documents");
        Ok(internal)
    }

    fn stop_listener(&self) {
        if let Some(task) = self.listener.lock().take() {
            task.abort();
        }
    }

    /// Stops the metadata listener and releases every repository.
    pub fn close(&self) {
        self.stop_listener();
        self.repos.close();
    }

    fn purge(&self) -> Result<(), MetaError> {
        self.stop_listener();
        self.repos.purge_all()
    }
}

impl Drop for Project {
    fn drop(&mut self) {
        self.stop_listener();
    }
}

/// All projects on a node.
pub struct ProjectManager {
    ctx: ProjectContext,
    projects: RwLock<BTreeMap<String, Arc<Project>>>,
    closed: AtomicBool,
}

fn project_index_key(name: &str) -> Vec<u8> {
    format!("{}{}", PROJECT_INDEX_PREFIX, name).into_bytes()
}

impl ProjectManager {
    /// Creates a manager with no projects loaded.
    pub fn new(ctx: ProjectContext) -> Self {
        Self {
            ctx,
            projects: RwLock::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Shared services.
    pub fn context(&self) -> &ProjectContext {
        &self.ctx
    }

    fn ensure_open(&self) -> Result<(), MetaError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MetaError::Shutdown);
        }
        Ok(())
    }

    /// Creates the system project if needed and opens every persisted
    /// project. A project that fails to open is logged and skipped.
    pub fn open_existing(&self) -> Result<(), MetaError> {
        self.ensure_open()?;
        if !self.ctx.kv.contains_key(&project_index_key(SYSTEM_PROJECT))? {
            self.create_unchecked(SYSTEM_PROJECT, 0, &Author::system())?;
        }

        let prefix = PROJECT_INDEX_PREFIX.as_bytes();
        let mut names = Vec::new();
        for (key, _) in self.ctx.kv.scan_prefix(prefix)? {
            names.push(
                String::from_utf8(key[prefix.len()..].to_vec())
                    .map_err(|e| MetaError::Storage(format!("bad project index key: {}", e)))?,
            );
        }
        names.sort_by_key(|n| n != SYSTEM_PROJECT);

        let mut opened = 0;
        for name in names {
            if self.projects.read().contains_key(&name) {
                continue;
            }
            let use_internal = name != SYSTEM_PROJECT && self.migration_enabled();
            match Project::open(&name, self.ctx.clone(), use_internal) {
                Ok(project) => {
                    self.projects.write().insert(name, project);
                    opened += 1;
                }
                Err(e) => {
                    tracing::error!(project = %name, error = %e, "project unavailable");
                }
            }
        }
        tracing::info!(opened, "opened existing projects");
        Ok(())
    }

    fn migration_enabled(&self) -> bool {
        self.projects
            .read()
            .get(SYSTEM_PROJECT)
            .and_then(|p| p.repos.get(REPO_INTERNAL).ok())
            .and_then(|r| {
                r.get_or_none(Revision::HEAD, &Query::identity(MIGRATION_JOB_PATH))
                    .ok()
                    .flatten()
            })
            .is_some()
    }

    /// Creates a project.
    pub fn create(
        &self,
        name: &str,
        timestamp_millis: i64,
        author: &Author,
    ) -> Result<Arc<Project>, MetaError> {
        self.ensure_open()?;
        validate_name("project", name)?;
        self.create_unchecked(name, timestamp_millis, author)
    }

    fn create_unchecked(
        &self,
        name: &str,
        timestamp_millis: i64,
        author: &Author,
    ) -> Result<Arc<Project>, MetaError> {
        let use_internal = name != SYSTEM_PROJECT && self.migration_enabled();
        let mut projects = self.projects.write();
        let key = project_index_key(name);
        if projects.contains_key(name) || self.ctx.kv.contains_key(&key)? {
            return Err(MetaError::ProjectExists(name.to_string()));
        }
        self.ctx.kv.put(
            key.clone(),
            serde_json::to_vec(&UserAndTimestamp::new(author, timestamp_millis))?,
        )?;
        match Project::create(name, self.ctx.clone(), timestamp_millis, author, use_internal) {
            Ok(project) => {
                projects.insert(name.to_string(), project.clone());
                Ok(project)
            }
            Err(e) => {
                self.ctx.kv.delete(&key)?;
                Err(e)
            }
        }
    }

    /// Looks up a project.
    pub fn get(&self, name: &str) -> Result<Arc<Project>, MetaError> {
        self.ensure_open()?;
        self.projects
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| MetaError::ProjectNotFound(name.to_string()))
    }

    /// Returns true if the project exists.
    pub fn exists(&self, name: &str) -> bool {
        self.projects.read().contains_key(name)
    }

    /// User-facing project names, the system project excluded.
    pub fn list(&self) -> Vec<String> {
        self.projects
            .read()
            .keys()
            .filter(|n| n.as_str() != SYSTEM_PROJECT)
            .cloned()
            .collect()
    }

    /// Removes a project and all of its repositories.
    pub fn remove(&self, name: &str) -> Result<(), MetaError> {
        self.ensure_open()?;
        if name == SYSTEM_PROJECT {
            return Err(MetaError::Validation("the system project cannot be removed".to_string()));
        }
        let project = self
            .projects
            .write()
            .remove(name)
            .ok_or_else(|| MetaError::ProjectNotFound(name.to_string()))?;
        project.purge()?;
        self.ctx.kv.delete(&project_index_key(name))?;
        tracing::info!(project = %name, "removed project");
        Ok(())
    }

    /// Creates a user repository and records it in the project metadata.
    pub fn create_repository(
        &self,
        project: &str,
        repository: &str,
        timestamp_millis: i64,
        author: &Author,
    ) -> Result<Revision, MetaError> {
        validate_name("repository", repository)?;
        if is_reserved_repository(repository) {
            return Err(MetaError::Validation(format!(
                "repository name is reserved: {}",
                repository
            )));
        }
        let project = self.get(project)?;
        if project.name != SYSTEM_PROJECT {
            project.refresh_metadata()?;
        }
        let repo = project.repos.create(repository, timestamp_millis, author)?;
        if let Err(e) = project.record_repository(repository, timestamp_millis, author) {
            tracing::error!(
                project = %project.name,
                repository = %repository,
                error = %e,
                "failed to record repository in metadata, removing it"
            );
            if let Err(purge_err) = project.repos.remove(repository) {
                tracing::error!(
                    project = %project.name,
                    repository = %repository,
                    error = %purge_err,
                    "rollback could not remove repository"
                );
            }
            return Err(e);
        }
        Ok(repo.head())
    }

    /// Removes a user repository and drops it from the project metadata.
    pub fn remove_repository(
        &self,
        project: &str,
        repository: &str,
        timestamp_millis: i64,
        author: &Author,
    ) -> Result<(), MetaError> {
        if is_reserved_repository(repository) {
            return Err(MetaError::Validation(format!(
                "reserved repository cannot be removed: {}",
                repository
            )));
        }
        let project = self.get(project)?;
        project.repos.get(repository)?;
        let recorded = project
            .metadata()
            .and_then(|md| md.repos.get(repository).cloned());
        project.forget_repository(repository, timestamp_millis, author)?;
        if let Err(e) = project.repos.remove(repository) {
            tracing::error!(
                project = %project.name,
                repository = %repository,
                error = %e,
                "failed to remove repository, restoring its metadata entry"
            );
            if let Some(entry) = recorded {
                let restored = project.update_metadata(
                    timestamp_millis,
                    author,
                    &format!("Restore repository {}", repository),
                    |md| {
                        md.repos.insert(repository.to_string(), entry);
                    },
                );
                if let Err(restore_err) = restored {
                    tracing::error!(
                        project = %project.name,
                        repository = %repository,
                        error = %restore_err,
                        "could not restore repository metadata"
                    );
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Commits a change set to a repository.
    #[allow(clippy::too_many_arguments)]
    pub fn push(
        &self,
        project: &str,
        repository: &str,
        base: Revision,
        timestamp_millis: i64,
        author: &Author,
        summary: &str,
        detail: &str,
        changes: Vec<Change>,
    ) -> Result<CommitOutcome, MetaError> {
        let repo = self.get(project)?.repos.get(repository)?;
        repo.commit(base, timestamp_millis, author.clone(), summary, detail, changes)
    }

    /// A cached read view of a repository.
    pub fn repository(&self, project: &str, repository: &str) -> Result<CachingRepository, MetaError> {
        let repo = self.get(project)?.repos.get(repository)?;
        Ok(CachingRepository::new(repo, self.ctx.cache.clone()))
    }

    /// Closes every project.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let projects = std::mem::take(&mut *self.projects.write());
        for project in projects.values() {
            project.close();
        }
        tracing::info!(closed = projects.len(), "closed all projects");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::kvstore::MemoryKvStore;
    use crate::metadata::ProjectRole;
    use serde_json::json;

    fn context(kv: Arc<dyn KvStore>) -> ProjectContext {
        ProjectContext {
            kv,
            registry: Arc::new(WatchRegistry::new()),
            cache: Arc::new(RepositoryCache::new(CacheConfig::default())),
        }
    }

    fn manager() -> ProjectManager {
        let pm = ProjectManager::new(context(Arc::new(MemoryKvStore::new())));
        pm.open_existing().unwrap();
        pm
    }

    fn alice() -> Author {
        Author::new("Alice", "alice@example.com")
    }

    async fn wait_for_metadata_revision(project: &Project, rev: Revision) {
        for _ in 0..100 {
            if project.last_metadata_revision() == Some(rev) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("metadata never reached revision {}", rev);
    }

    #[tokio::test]
    async fn test_create_project_initializes_reserved_repos_and_metadata() {
        let pm = manager();
        let project = pm.create("foo", 1000, &alice()).unwrap();

        assert_eq!(project.repos().list_all(), vec!["internal", "meta"]);
        assert!(project.repos().list().is_empty());
        let md = project.metadata().unwrap();
        assert_eq!(md.name, "foo");
        assert_eq!(md.members["alice@example.com"].role, ProjectRole::Owner);
        assert_eq!(project.last_metadata_revision(), Some(Revision::new(2)));

        let internal = project.repos().get(REPO_INTERNAL).unwrap();
        let commit = internal.commit_at(Revision::HEAD).unwrap();
        assert_eq!(commit.author, Author::system());

        assert_eq!(pm.list(), vec!["foo"]);
        assert!(matches!(
            pm.create("foo", 0, &alice()),
            Err(MetaError::ProjectExists(_))
        ));
    }

    #[tokio::test]
    async fn test_repository_lifecycle_updates_metadata() {
        let pm = manager();
        pm.create("foo", 0, &alice()).unwrap();
        assert_eq!(
            pm.create_repository("foo", "bar", 10, &alice()).unwrap(),
            Revision::INIT
        );
        let project = pm.get("foo").unwrap();
        assert_eq!(project.repos().list(), vec!["bar"]);
        assert!(project.metadata().unwrap().repos.contains_key("bar"));

        assert!(matches!(
            pm.create_repository("foo", "meta", 10, &alice()),
            Err(MetaError::Validation(_))
        ));
        assert!(matches!(
            pm.create_repository("foo", "bar", 10, &alice()),
            Err(MetaError::RepositoryExists(_))
        ));

        pm.remove_repository("foo", "bar", 20, &alice()).unwrap();
        assert!(!project.repos().exists("bar"));
        assert!(project.metadata().unwrap().repos.is_empty());
    }

    #[tokio::test]
    async fn test_metadata_listener_follows_commits_and_ignores_garbage() {
        let pm = manager();
        let project = pm.create("foo", 0, &alice()).unwrap();
        let internal = project.repos().get(REPO_INTERNAL).unwrap();

        let mut md = (*project.metadata().unwrap()).clone();
        md.members.clear();
        let rev = internal
            .commit(
                Revision::HEAD,
                0,
                Author::system(),
                "drop members",
                "",
                vec![Change::upsert_json(METADATA_PATH, serde_json::to_value(&md).unwrap())],
            )
            .unwrap()
            .revision()
            .unwrap();
        wait_for_metadata_revision(&project, rev).await;
        assert!(project.metadata().unwrap().members.is_empty());

        internal
            .commit(
                Revision::HEAD,
                0,
                Author::system(),
                "garbage",
                "",
                vec![Change::upsert_json(METADATA_PATH, json!({"bogus": true}))],
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(project.last_metadata_revision(), Some(rev));
    }

    #[tokio::test]
    async fn test_stale_metadata_update_is_discarded() {
        let pm = manager();
        let project = pm.create("foo", 0, &alice()).unwrap();
        let current = project.last_metadata_revision().unwrap();
        let mut md = (*project.metadata().unwrap()).clone();
        md.name = "stale".to_string();
        let content = EntryContent::Json(serde_json::to_value(&md).unwrap());

        assert!(!project.apply_metadata_update(current, &content));
        assert!(!project.apply_metadata_update(Revision::new(1), &content));
        assert_eq!(project.metadata().unwrap().name, "foo");
        assert!(project.apply_metadata_update(current.next(), &content));
        assert_eq!(project.metadata().unwrap().name, "stale");
    }

    #[tokio::test]
    async fn test_failed_bootstrap_rolls_back() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let pm = ProjectManager::new(context(kv.clone()));
        pm.open_existing().unwrap();

        let leftover = VersionedRepository::create(
            RepositoryId::new("broken", REPO_INTERNAL),
            kv.clone(),
            Author::system(),
            0,
            Arc::new(crate::repository::NoopListener),
        )
        .unwrap();
        leftover
            .commit(
                Revision::HEAD,
                0,
                Author::system(),
                "bad",
                "",
                vec![Change::upsert_json(METADATA_PATH, json!("not an object"))],
            )
            .unwrap();
        drop(leftover);

        let err = pm.create("broken", 0, &alice()).err().unwrap();
        assert!(matches!(err, MetaError::FatalInitialization { ref project, .. } if project == "broken"));
        assert!(!pm.exists("broken"));
        assert!(list_repository_names(kv.as_ref(), "broken").unwrap().is_empty());
        assert!(!kv.contains_key(&project_index_key("broken")).unwrap());
    }

    #[tokio::test]
    async fn test_reopen_from_store() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        {
            let pm = ProjectManager::new(context(kv.clone()));
            pm.open_existing().unwrap();
            pm.create("foo", 0, &alice()).unwrap();
            pm.create_repository("foo", "bar", 0, &alice()).unwrap();
            pm.close();
        }
        let pm = ProjectManager::new(context(kv));
        pm.open_existing().unwrap();
        assert_eq!(pm.list(), vec!["foo"]);
        let project = pm.get("foo").unwrap();
        assert_eq!(project.repos().list(), vec!["bar"]);
        assert!(project.metadata().unwrap().repos.contains_key("bar"));
    }

    #[tokio::test]
    async fn test_remove_project_purges_records() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let pm = ProjectManager::new(context(kv.clone()));
        pm.open_existing().unwrap();
        pm.create("foo", 0, &alice()).unwrap();
        pm.remove("foo").unwrap();
        assert!(!pm.exists("foo"));
        assert!(list_repository_names(kv.as_ref(), "foo").unwrap().is_empty());
        assert!(matches!(pm.remove(SYSTEM_PROJECT), Err(MetaError::Validation(_))));
    }

    fn corrupt_metadata(pm: &ProjectManager, project: &str) {
        pm.push(
            project,
            REPO_INTERNAL,
            Revision::HEAD,
            0,
            &Author::system(),
            "corrupt",
            "",
            vec![Change::upsert_json(METADATA_PATH, json!({"bogus": 1}))],
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_create_repository_with_unreadable_metadata_leaves_nothing_behind() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let pm = ProjectManager::new(context(kv.clone()));
        pm.open_existing().unwrap();
        let project = pm.create("foo", 0, &alice()).unwrap();
        corrupt_metadata(&pm, "foo");

        let err = pm.create_repository("foo", "bar", 10, &alice()).unwrap_err();
        assert!(matches!(err, MetaError::Serialization(_)), "{:?}", err);
        assert!(!project.repos().exists("bar"));
        assert!(!list_repository_names(kv.as_ref(), "foo")
            .unwrap()
            .contains(&"bar".to_string()));

        // Once the metadata is readable again the same request succeeds.
        let md = ProjectMetadata::new("foo", &alice(), 0);
        pm.push(
            "foo",
            REPO_INTERNAL,
            Revision::HEAD,
            0,
            &Author::system(),
            "repair",
            "",
            vec![Change::upsert_json(METADATA_PATH, serde_json::to_value(&md).unwrap())],
        )
        .unwrap();
        assert_eq!(
            pm.create_repository("foo", "bar", 10, &alice()).unwrap(),
            Revision::INIT
        );
        assert!(project.metadata().unwrap().repos.contains_key("bar"));
    }

    #[tokio::test]
    async fn test_remove_repository_with_unreadable_metadata_keeps_repository() {
        let pm = manager();
        let project = pm.create("foo", 0, &alice()).unwrap();
        pm.create_repository("foo", "bar", 10, &alice()).unwrap();
        corrupt_metadata(&pm, "foo");

        assert!(pm.remove_repository("foo", "bar", 20, &alice()).is_err());
        assert!(project.repos().exists("bar"));
        assert_eq!(pm.repository("foo", "bar").unwrap().head(), Revision::INIT);
        assert!(matches!(
            pm.remove_repository("foo", "missing", 20, &alice()),
            Err(MetaError::RepositoryNotFound(_))
        ));
    }

    fn start_migration(pm: &ProjectManager) {
        pm.push(
            SYSTEM_PROJECT,
            REPO_INTERNAL,
            Revision::HEAD,
            0,
            &Author::system(),
            "start migration",
            "",
            vec![Change::upsert_json(MIGRATION_JOB_PATH, json!({"started": true}))],
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_project_created_after_migration_uses_internal_repository() {
        let pm = manager();
        let plain = pm.create("plain", 0, &alice()).unwrap();
        assert!(!plain.uses_internal_meta_repository());
        assert_eq!(plain.meta_repository().unwrap().id().repository, REPO_META);

        start_migration(&pm);
        let migrated = pm.create("migrated", 0, &alice()).unwrap();
        assert!(migrated.uses_internal_meta_repository());
        assert_eq!(migrated.repos().list_all(), vec![REPO_INTERNAL]);
        assert_eq!(migrated.meta_repository().unwrap().id().repository, REPO_INTERNAL);
        let resolved = migrated
            .resolve_meta_repository(Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(resolved.id().repository, REPO_INTERNAL);
        assert!(resolved
            .get_or_none(Revision::HEAD, &Query::identity(META_MIGRATED_PATH))
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_legacy_project_waits_for_migration_marker() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        {
            let pm = ProjectManager::new(context(kv.clone()));
            pm.open_existing().unwrap();
            pm.create("legacy", 0, &alice()).unwrap();
            start_migration(&pm);
            pm.close();
        }
        let pm = ProjectManager::new(context(kv));
        pm.open_existing().unwrap();
        let legacy = pm.get("legacy").unwrap();
        assert!(legacy.uses_internal_meta_repository());
        assert!(legacy.repos().exists(REPO_META));
        assert!(matches!(
            legacy.meta_repository(),
            Err(MetaError::FatalInitialization { .. })
        ));
        assert!(matches!(
            legacy.resolve_meta_repository(Duration::from_millis(30)).await,
            Err(MetaError::FatalInitialization { .. })
        ));

        let waiter = {
            let legacy = legacy.clone();
            tokio::spawn(async move {
                legacy
                    .resolve_meta_repository(Duration::from_secs(5))
                    .await
                    .map(|r| r.id().repository.clone())
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pm.push(
            "legacy",
            REPO_INTERNAL,
            Revision::HEAD,
            0,
            &Author::system(),
            "mark migrated",
            "",
            vec![Change::upsert_json(META_MIGRATED_PATH, json!({}))],
        )
        .unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), REPO_INTERNAL);
        assert_eq!(legacy.meta_repository().unwrap().id().repository, REPO_INTERNAL);
    }
}
