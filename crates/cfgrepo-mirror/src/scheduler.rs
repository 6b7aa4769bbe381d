//! Mirroring scheduler.
//!
//! One pass visits every enabled mirror of every project. Scheduled passes
//! only start mirrors whose cron `schedule` has fired since their last run;
//! a manual pass starts all of them. Each mirror runs
//! in its own task, bounded by `numMirroringThreads`. A mirror still
//! running from an earlier pass is skipped, never queued a second time.
//! Failures stay with the mirror that caused them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cfgrepo_meta::project::META_MARKER_TIMEOUT;
use cfgrepo_meta::types::now_millis;
use cfgrepo_meta::{
    Change, Command, CommandOutcome, CommandResult, EntryContent, MetaError, Node, PathPattern,
    Revision,
};
use chrono::{DateTime, Utc};
use cron::Schedule;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::MirroringServicePluginConfig;
use crate::credential::{Credential, CredentialStore};
use crate::error::{MirrorError, QuotaKind};
use crate::git::{FileTree, GitTransport, PushRequest};
use crate::mirror::{load_mirrors, IgnoreRules, MirrorConfig, MirrorDirection, RemoteSpec};

/// Why a whole pass did nothing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassSkipped {
    /// Mirroring is disabled.
    Disabled,
    /// Another node leads and mirrors are not zone pinned.
    NotLeader,
}

/// What happened to one mirror in a pass.
#[derive(Clone, Debug, PartialEq)]
pub enum MirrorStatus {
    /// The mirror ran. `None` means that direction had nothing to transfer.
    Synced {
        /// Commit created on the remote.
        pushed: Option<String>,
        /// Revision created locally.
        pulled: Option<Revision>,
    },
    /// The mirror is still running from an earlier pass.
    SkippedInFlight,
    /// The mirror's schedule has not fired since its last run.
    SkippedNotDue,
    /// The mirror is pinned to another zone.
    SkippedOtherZone,
    /// The mirror failed. Nothing was transferred in the failing direction.
    Failed(MirrorError),
}

/// Outcome of one mirror.
#[derive(Clone, Debug, PartialEq)]
pub struct MirrorReport {
    /// Owning project.
    pub project: String,
    /// Mirror ID.
    pub mirror_id: String,
    /// Configured direction.
    pub direction: MirrorDirection,
    /// Result.
    pub status: MirrorStatus,
}

/// Outcome of a pass.
#[derive(Clone, Debug)]
pub struct MirrorSummary {
    /// Pass start.
    pub started_at: DateTime<Utc>,
    /// Pass end.
    pub finished_at: DateTime<Utc>,
    /// Set when the pass did not look at any mirror.
    pub skipped: Option<PassSkipped>,
    /// One report per enabled mirror.
    pub reports: Vec<MirrorReport>,
    /// Projects or mirror documents that could not be read, keyed by
    /// `project` or `project:path`.
    pub errors: Vec<(String, MirrorError)>,
}

impl MirrorSummary {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            skipped: None,
            reports: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// The report of one mirror.
    pub fn report(&self, project: &str, mirror_id: &str) -> Option<&MirrorReport> {
        self.reports
            .iter()
            .find(|r| r.project == project && r.mirror_id == mirror_id)
    }

    /// Number of mirrors that ran successfully.
    pub fn succeeded(&self) -> usize {
        self.count(|s| matches!(s, MirrorStatus::Synced { .. }))
    }

    /// Number of mirrors that failed.
    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, MirrorStatus::Failed(_)))
    }

    /// Number of mirrors skipped.
    pub fn skipped_mirrors(&self) -> usize {
        self.count(|s| {
            matches!(
                s,
                MirrorStatus::SkippedInFlight
                    | MirrorStatus::SkippedNotDue
                    | MirrorStatus::SkippedOtherZone
            )
        })
    }

    fn count(&self, f: impl Fn(&MirrorStatus) -> bool) -> usize {
        self.reports.iter().filter(|r| f(&r.status)).count()
    }
}

type MirrorKey = (String, String);

struct Inner {
    node: Arc<Node>,
    config: MirroringServicePluginConfig,
    zone: Option<String>,
    transport: Arc<dyn GitTransport>,
    credentials: Arc<dyn CredentialStore>,
    in_flight: DashMap<MirrorKey, ()>,
    last_runs: DashMap<MirrorKey, DateTime<Utc>>,
    started_at: DateTime<Utc>,
    permits: Arc<Semaphore>,
    marker_timeout: Duration,
}

/// Releases a mirror's in-flight slot when its task ends.
struct InFlightGuard {
    inner: Arc<Inner>,
    key: MirrorKey,
}

impl InFlightGuard {
    fn try_acquire(inner: &Arc<Inner>, key: MirrorKey) -> Option<Self> {
        match inner.in_flight.entry(key.clone()) {
            MapEntry::Occupied(_) => None,
            MapEntry::Vacant(slot) => {
                slot.insert(());
                Some(Self {
                    inner: inner.clone(),
                    key,
                })
            }
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight.remove(&self.key);
    }
}

/// Runs mirror passes for one node.
#[derive(Clone)]
pub struct MirroringScheduler {
    inner: Arc<Inner>,
}

impl MirroringScheduler {
    /// Creates a scheduler. `zone` is the zone this node belongs to.
    pub fn new(
        node: Arc<Node>,
        config: MirroringServicePluginConfig,
        zone: Option<String>,
        transport: Arc<dyn GitTransport>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Result<Self, MirrorError> {
        config.validate()?;
        let permits = Arc::new(Semaphore::new(config.num_mirroring_threads));
        Ok(Self {
            inner: Arc::new(Inner {
                node,
                config,
                zone,
                transport,
                credentials,
                in_flight: DashMap::new(),
                last_runs: DashMap::new(),
                started_at: Utc::now(),
                permits,
                marker_timeout: META_MARKER_TIMEOUT,
            }),
        })
    }

    /// Overrides how long to wait for a pending meta repository migration.
    pub fn with_marker_timeout(self, timeout: Duration) -> Self {
        let mut inner = match Arc::try_unwrap(self.inner) {
            Ok(inner) => inner,
            Err(shared) => return Self { inner: shared },
        };
        inner.marker_timeout = timeout;
        Self {
            inner: Arc::new(inner),
        }
    }

    /// The plugin configuration.
    pub fn config(&self) -> &MirroringServicePluginConfig {
        &self.inner.config
    }

    /// Number of mirrors currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// Runs one pass over every enabled mirror, due or not.
    pub async fn mirror(&self) -> MirrorSummary {
        self.mirror_with_cancel(CancellationToken::new()).await
    }

    /// Runs one pass over every enabled mirror. Cancelling `token` fails
    /// the mirrors still running with [`MirrorError::Cancelled`].
    pub async fn mirror_with_cancel(&self, token: CancellationToken) -> MirrorSummary {
        self.pass(token, false).await
    }

    /// Runs one pass over the mirrors whose schedule fired since they last
    /// ran, or since the scheduler was created.
    pub async fn mirror_due(&self, token: CancellationToken) -> MirrorSummary {
        self.pass(token, true).await
    }

    async fn pass(&self, token: CancellationToken, due_only: bool) -> MirrorSummary {
        let inner = &self.inner;
        let mut summary = MirrorSummary::new();
        if !inner.config.enabled {
            summary.skipped = Some(PassSkipped::Disabled);
            return summary;
        }
        if !inner.config.zone_pinned && !inner.node.is_leader() {
            tracing::debug!(node_id = %inner.node.node_id(), "not the leader, skipping mirror pass");
            summary.skipped = Some(PassSkipped::NotLeader);
            return summary;
        }

        tracing::info!(node_id = %inner.node.node_id(), "mirror pass started");
        let mut tasks = JoinSet::new();
        for project in inner.node.projects().list() {
            let mirrors = match self.project_mirrors(&project, &mut summary).await {
                Ok(mirrors) => mirrors,
                Err(e) => {
                    tracing::warn!(project = %project, error = %e, "cannot read mirrors");
                    summary.errors.push((project, e));
                    continue;
                }
            };

            for mirror in mirrors {
                let mut report = MirrorReport {
                    project: project.clone(),
                    mirror_id: mirror.id.clone(),
                    direction: mirror.direction,
                    status: MirrorStatus::SkippedOtherZone,
                };
                if !inner.runs_here(&mirror) {
                    summary.reports.push(report);
                    continue;
                }
                let key = (project.clone(), mirror.id.clone());
                let now = Utc::now();
                if due_only && !inner.is_due(&key, &mirror, now) {
                    report.status = MirrorStatus::SkippedNotDue;
                    summary.reports.push(report);
                    continue;
                }
                let Some(guard) = InFlightGuard::try_acquire(inner, key.clone()) else {
                    tracing::info!(project = %project, mirror = %mirror.id, "mirror still running, skipped");
                    report.status = MirrorStatus::SkippedInFlight;
                    summary.reports.push(report);
                    continue;
                };
                inner.last_runs.insert(key, now);

                let inner = inner.clone();
                let token = token.clone();
                tasks.spawn(async move {
                    let _guard = guard;
                    report.status = inner.run_mirror(&report.project, &mirror, &token).await;
                    report
                });
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => summary.reports.push(report),
                Err(e) => tracing::error!(error = %e, "mirror task aborted"),
            }
        }
        summary
            .reports
            .sort_by(|a, b| (&a.project, &a.mirror_id).cmp(&(&b.project, &b.mirror_id)));
        summary.finished_at = Utc::now();
        tracing::info!(
            succeeded = summary.succeeded(),
            failed = summary.failed(),
            skipped = summary.skipped_mirrors(),
            elapsed_ms = (summary.finished_at - summary.started_at).num_milliseconds(),
            "mirror pass finished"
        );
        summary
    }

    async fn project_mirrors(
        &self,
        project: &str,
        summary: &mut MirrorSummary,
    ) -> Result<Vec<MirrorConfig>, MirrorError> {
        let meta = self
            .inner
            .node
            .projects()
            .get(project)?
            .resolve_meta_repository(self.inner.marker_timeout)
            .await?;
        let loaded = load_mirrors(&meta)?;
        for (path, e) in loaded.invalid {
            tracing::warn!(project = %project, path = %path, error = %e, "ignoring invalid mirror document");
            summary.errors.push((format!("{}:{}", project, path), e));
        }
        Ok(loaded.mirrors.into_iter().filter(|m| m.enabled).collect())
    }

    /// Runs a pass of due mirrors every `interval` until `token` is
    /// cancelled. Passes may overlap; a mirror still running is skipped by
    /// the next pass.
    pub async fn run(&self, interval: Duration, token: CancellationToken) {
        tracing::info!(config = %self.inner.config, ?interval, "mirroring scheduler started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let scheduler = self.clone();
                    let pass_token = token.child_token();
                    tokio::spawn(async move {
                        scheduler.mirror_due(pass_token).await;
                    });
                }
            }
        }
        tracing::info!("mirroring scheduler stopped");
    }
}

impl Inner {
    fn is_due(&self, key: &MirrorKey, mirror: &MirrorConfig, now: DateTime<Utc>) -> bool {
        // Documents are validated on load; an unparsable schedule never gets here.
        let Ok(Some(schedule)) = mirror.cron_schedule() else {
            return true;
        };
        let last = self
            .last_runs
            .get(key)
            .map(|t| *t)
            .unwrap_or(self.started_at);
        fired_since(&schedule, last, now)
    }

    fn runs_here(&self, mirror: &MirrorConfig) -> bool {
        if !self.config.zone_pinned {
            return true;
        }
        match &mirror.zone {
            Some(zone) => self.zone.as_deref() == Some(zone.as_str()),
            None => self.node.is_leader(),
        }
    }

    async fn run_mirror(&self, project: &str, mirror: &MirrorConfig, token: &CancellationToken) -> MirrorStatus {
        let _permit = tokio::select! {
            _ = token.cancelled() => return MirrorStatus::Failed(MirrorError::Cancelled),
            permit = self.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return MirrorStatus::Failed(MirrorError::Cancelled),
            },
        };

        let started = Instant::now();
        let result = tokio::select! {
            _ = token.cancelled() => Err(MirrorError::Cancelled),
            result = self.sync(project, mirror) => result,
        };
        match result {
            Ok((pushed, pulled)) => {
                tracing::info!(
                    project = %project,
                    mirror = %mirror.id,
                    direction = %mirror.direction,
                    pushed = ?pushed,
                    pulled = ?pulled,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "mirror finished"
                );
                MirrorStatus::Synced { pushed, pulled }
            }
            Err(e) => {
                tracing::warn!(
                    project = %project,
                    mirror = %mirror.id,
                    retriable = e.is_retriable(),
                    error = %e,
                    "mirror failed"
                );
                MirrorStatus::Failed(e)
            }
        }
    }

    async fn sync(
        &self,
        project: &str,
        mirror: &MirrorConfig,
    ) -> Result<(Option<String>, Option<Revision>), MirrorError> {
        let remote = mirror.remote()?;
        let local_dir = mirror.local_dir()?;
        let ignore = mirror.ignore_rules()?;
        let credential = match &mirror.credential_name {
            Some(name) => self.credentials.credential(project, name).await?,
            None => Credential::anonymous(),
        };
        let job = MirrorJob {
            project,
            mirror,
            remote: &remote,
            local_dir: &local_dir,
            ignore: &ignore,
            credential: &credential,
        };

        let pushed = match mirror.direction {
            MirrorDirection::LocalToRemote | MirrorDirection::Both => self.local_to_remote(&job).await?,
            MirrorDirection::RemoteToLocal => None,
        };
        let pulled = match mirror.direction {
            MirrorDirection::RemoteToLocal | MirrorDirection::Both => self.remote_to_local(&job).await?,
            MirrorDirection::LocalToRemote => None,
        };
        Ok((pushed, pulled))
    }

    fn check_quota(&self, files: &FileTree) -> Result<(), MirrorError> {
        check_quota(&self.config, files)
    }

    async fn local_to_remote(&self, job: &MirrorJob<'_>) -> Result<Option<String>, MirrorError> {
        let repo = self.node.repository(job.project, &job.mirror.local_repo)?;
        let head = repo.head();
        let mut files = FileTree::new();
        for (relative, content) in local_files(&repo.find(head, &dir_pattern(job.local_dir)?)?, job) {
            files.insert(relative, content_bytes(&content)?);
        }
        self.check_quota(&files)?;

        let author = job.mirror.resolve_author(&self.config);
        let message = format!(
            "Mirror '{}/{}' at revision {} to '{}'",
            job.project, job.mirror.local_repo, head, job.remote
        );
        let request = PushRequest {
            files,
            committer: author.clone(),
            author,
            message,
            timestamp_millis: now_millis(),
        };
        Ok(self
            .transport
            .push(job.remote, job.credential, request)
            .await?)
    }

    async fn remote_to_local(&self, job: &MirrorJob<'_>) -> Result<Option<Revision>, MirrorError> {
        let snapshot = self.transport.fetch(job.remote, job.credential).await?;
        let remote_files: FileTree = snapshot
            .files
            .into_iter()
            .filter(|(path, _)| !job.ignore.is_ignored(path))
            .collect();
        self.check_quota(&remote_files)?;

        let repo = self.node.repository(job.project, &job.mirror.local_repo)?;
        let head = repo.head();
        let local: BTreeMap<String, EntryContent> =
            local_files(&repo.find(head, &dir_pattern(job.local_dir)?)?, job)
                .into_iter()
                .collect();

        let mut changes = Vec::new();
        for (relative, bytes) in &remote_files {
            let content = parse_content(relative, bytes)?;
            if local.get(relative) != Some(&content) {
                let path = format!("{}{}", job.local_dir, &relative[1..]);
                changes.push(match content {
                    EntryContent::Json(value) => Change::upsert_json(path, value),
                    EntryContent::Text(text) => Change::upsert_text(path, text),
                });
            }
        }
        for relative in local.keys() {
            if !remote_files.contains_key(relative) {
                changes.push(Change::remove(format!("{}{}", job.local_dir, &relative[1..])));
            }
        }
        if changes.is_empty() {
            return Ok(None);
        }

        let summary = format!(
            "Mirror {} of '{}' to the repository '{}'",
            snapshot.commit_id.as_deref().map_or("(empty)", |id| &id[..id.len().min(12)]),
            job.remote,
            job.mirror.local_repo
        );
        let command = Command::push(
            job.mirror.resolve_author(&self.config),
            job.project,
            job.mirror.local_repo.clone(),
            head,
            summary,
            changes,
        );
        match self.node.executor().execute(command).await? {
            CommandOutcome::Applied(CommandResult::Pushed(result)) => Ok(Some(result.revision)),
            CommandOutcome::Applied(_) | CommandOutcome::Redundant => Ok(None),
            CommandOutcome::Conflict { head } => Err(MetaError::Conflict { head }.into()),
        }
    }
}

/// True if `schedule` has a fire time in `(last, now]`.
fn fired_since(schedule: &Schedule, last: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    schedule.after(&last).next().is_some_and(|next| next <= now)
}

struct MirrorJob<'a> {
    project: &'a str,
    mirror: &'a MirrorConfig,
    remote: &'a RemoteSpec,
    local_dir: &'a str,
    ignore: &'a IgnoreRules,
    credential: &'a Credential,
}

fn dir_pattern(dir: &str) -> Result<PathPattern, MirrorError> {
    Ok(PathPattern::parse(&format!("{}**", dir))?)
}

/// Local entries under the mirror directory that are not ignored, keyed by
/// path relative to the directory.
fn local_files(entries: &[cfgrepo_meta::Entry], job: &MirrorJob<'_>) -> Vec<(String, EntryContent)> {
    entries
        .iter()
        .filter_map(|entry| {
            let relative = format!("/{}", entry.path.strip_prefix(job.local_dir)?);
            if job.ignore.is_ignored(&relative) {
                return None;
            }
            Some((relative, entry.content.clone()))
        })
        .collect()
}

fn check_quota(config: &MirroringServicePluginConfig, files: &FileTree) -> Result<(), MirrorError> {
    if files.len() > config.max_num_files_per_mirror {
        return Err(MirrorError::QuotaExceeded {
            kind: QuotaKind::Files,
            limit: config.max_num_files_per_mirror as u64,
            actual: files.len() as u64,
        });
    }
    let bytes: u64 = files.values().map(|c| c.len() as u64).sum();
    if bytes > config.max_num_bytes_per_mirror {
        return Err(MirrorError::QuotaExceeded {
            kind: QuotaKind::Bytes,
            limit: config.max_num_bytes_per_mirror,
            actual: bytes,
        });
    }
    Ok(())
}

fn content_bytes(content: &EntryContent) -> Result<Vec<u8>, MirrorError> {
    match content {
        EntryContent::Json(value) => {
            let mut bytes = serde_json::to_vec_pretty(value).map_err(MetaError::from)?;
            bytes.push(b'\n');
            Ok(bytes)
        }
        EntryContent::Text(text) => Ok(text.as_bytes().to_vec()),
    }
}

fn parse_content(path: &str, bytes: &[u8]) -> Result<EntryContent, MirrorError> {
    if cfgrepo_meta::types::is_json_path(path) {
        let value = serde_json::from_slice(bytes)
            .map_err(|e| MirrorError::Transport(format!("remote file {} is not valid JSON: {}", path, e)))?;
        return Ok(EntryContent::Json(value));
    }
    let mut text = String::from_utf8(bytes.to_vec())
        .map_err(|_| MirrorError::Transport(format!("remote file {} is not UTF-8 text", path)))?;
    if !text.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
    Ok(EntryContent::Text(text))
}
