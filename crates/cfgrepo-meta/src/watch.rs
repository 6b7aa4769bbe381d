//! Watch registry: long-poll watches and persistent commit subscriptions.
//!
//! Watches are kept per repository behind their own mutex, so traffic on
//! one repository never contends with another. A watch moves from pending
//! to exactly one terminal state: fulfilled by the earliest qualifying
//! commit after its `since` revision, timed out, or cancelled.
//!
//! Lock order is repository commit lock, then the per-repository watch
//! mutex, then the KV store. Registration never takes the commit lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::error::MetaError;
use crate::repository::{CommitListener, VersionedRepository};
use crate::types::{Change, Commit, Entry, EntryContent, PathPattern, Query, RepositoryId, Revision};

/// What a watch is interested in.
#[derive(Clone, Debug, PartialEq)]
pub enum WatchTarget {
    /// Any commit touching a matching path.
    Pattern(PathPattern),
    /// A change in the result of a query on one file.
    File(Query),
}

/// Delivered when a watch is fulfilled.
#[derive(Clone, Debug, PartialEq)]
pub struct WatchEvent {
    /// Revision of the qualifying commit.
    pub revision: Revision,
    /// New query result for file watches; `None` for pattern watches or
    /// when the file was removed.
    pub entry: Option<Entry>,
}

/// Terminal state of a watch.
#[derive(Clone, Debug, PartialEq)]
pub enum WatchOutcome {
    /// A qualifying commit landed.
    Fulfilled(WatchEvent),
    /// No qualifying commit before the deadline. Not an error.
    TimedOut,
    /// The watch was cancelled or its repository went away.
    Cancelled,
}

/// Delivered to subscribers for every commit touching their pattern.
#[derive(Clone, Debug, PartialEq)]
pub struct SubscriptionEvent {
    /// Revision of the commit.
    pub revision: Revision,
    /// The commit's changes restricted to the subscribed pattern.
    pub changes: Vec<Change>,
}

struct PendingWatch {
    target: WatchTarget,
    since: Revision,
    baseline: Option<EntryContent>,
    tx: oneshot::Sender<WatchEvent>,
}

struct Subscriber {
    pattern: PathPattern,
    tx: mpsc::UnboundedSender<SubscriptionEvent>,
}

#[derive(Default)]
struct RepoWatches {
    pending: HashMap<u64, PendingWatch>,
    subscribers: HashMap<u64, Subscriber>,
}

/// Per-node registry of watches, one instance shared by every repository.
#[derive(Default)]
pub struct WatchRegistry {
    repos: DashMap<RepositoryId, Arc<Mutex<RepoWatches>>>,
    next_id: AtomicU64,
}

impl WatchRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, repo: &RepositoryId) -> Arc<Mutex<RepoWatches>> {
        Arc::clone(&*self.repos.entry(repo.clone()).or_default())
    }

    fn existing_slot(&self, repo: &RepositoryId) -> Option<Arc<Mutex<RepoWatches>>> {
        self.repos.get(repo).map(|slot| Arc::clone(slot.value()))
    }

    /// Registers a watch for changes after `since`.
    ///
    /// If a qualifying commit already exists in `(since, head]`, the
    /// returned handle is fulfilled immediately with the earliest one.
    pub fn watch(
        self: &Arc<Self>,
        repo: &VersionedRepository,
        target: WatchTarget,
        since: Revision,
        timeout: Option<Duration>,
    ) -> Result<WatchHandle, MetaError> {
        let since = repo.normalize(since)?;
        let baseline = match &target {
            WatchTarget::File(query) => repo.get_or_none(since, query)?.map(|e| e.content),
            WatchTarget::Pattern(_) => None,
        };

        let slot = self.slot(repo.id());
        let mut watches = slot.lock();
        let head = repo.head();
        for rev in since.as_i64() + 1..=head.as_i64() {
            let commit = repo.commit_at(Revision::new(rev))?;
            if let Some(event) = evaluate(repo.id(), &target, baseline.as_ref(), &commit) {
                tracing::debug!(
                    repo = %repo.id(),
                    since = %since,
                    revision = %event.revision,
                    "watch already satisfied at registration"
                );
                return Ok(WatchHandle {
                    id: 0,
                    repo: repo.id().clone(),
                    registry: Weak::new(),
                    state: HandleState::Ready(event),
                    timeout,
                });
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        watches.pending.insert(
            id,
            PendingWatch {
                target,
                since,
                baseline,
                tx,
            },
        );
        tracing::debug!(repo = %repo.id(), watch_id = id, since = %since, "registered watch");

        Ok(WatchHandle {
            id,
            repo: repo.id().clone(),
            registry: Arc::downgrade(self),
            state: HandleState::Waiting(rx),
            timeout,
        })
    }

    /// Subscribes to every commit touching `pattern` until the returned
    /// handle is dropped.
    pub fn subscribe(self: &Arc<Self>, repo: &RepositoryId, pattern: PathPattern) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.slot(repo)
            .lock()
            .subscribers
            .insert(id, Subscriber { pattern, tx });
        Subscription {
            id,
            repo: repo.clone(),
            registry: Arc::downgrade(self),
            rx,
        }
    }

    /// Number of pending watches on a repository.
    pub fn pending_count(&self, repo: &RepositoryId) -> usize {
        self.existing_slot(repo)
            .map(|slot| slot.lock().pending.len())
            .unwrap_or(0)
    }

    /// Number of live subscriptions on a repository.
    pub fn subscriber_count(&self, repo: &RepositoryId) -> usize {
        self.existing_slot(repo)
            .map(|slot| slot.lock().subscribers.len())
            .unwrap_or(0)
    }

    /// Cancels every watch and subscription of a removed repository.
    pub fn remove_repository(&self, repo: &RepositoryId) {
        if let Some((_, slot)) = self.repos.remove(repo) {
            let mut watches = slot.lock();
            let cancelled = watches.pending.len();
            watches.pending.clear();
            watches.subscribers.clear();
            tracing::debug!(repo = %repo, cancelled, "dropped watches of removed repository");
        }
    }

    fn unregister(&self, repo: &RepositoryId, id: u64) -> bool {
        self.existing_slot(repo)
            .map(|slot| slot.lock().pending.remove(&id).is_some())
            .unwrap_or(false)
    }

    fn unsubscribe(&self, repo: &RepositoryId, id: u64) {
        if let Some(slot) = self.existing_slot(repo) {
            slot.lock().subscribers.remove(&id);
        }
    }
}

impl CommitListener for WatchRegistry {
    fn on_commit(&self, repo: &RepositoryId, commit: &Commit) {
        let Some(slot) = self.existing_slot(repo) else {
            return;
        };
        let mut watches = slot.lock();

        let ready: Vec<(u64, WatchEvent)> = watches
            .pending
            .iter()
            .filter(|(_, w)| w.since < commit.revision)
            .filter_map(|(id, w)| {
                evaluate(repo, &w.target, w.baseline.as_ref(), commit).map(|e| (*id, e))
            })
            .collect();
        let fulfilled = ready.len();
        for (id, event) in ready {
            if let Some(watch) = watches.pending.remove(&id) {
                let _ = watch.tx.send(event);
            }
        }

        watches.subscribers.retain(|_, sub| {
            let changes: Vec<Change> = commit
                .changes
                .iter()
                .filter(|c| sub.pattern.matches(c.path()))
                .cloned()
                .collect();
            if changes.is_empty() {
                return !sub.tx.is_closed();
            }
            sub.tx
                .send(SubscriptionEvent {
                    revision: commit.revision,
                    changes,
                })
                .is_ok()
        });

        if fulfilled > 0 {
            tracing::debug!(repo = %repo, revision = %commit.revision, fulfilled, "fulfilled watches");
        }
    }
}

/// The event `commit` produces for a watch, if any.
///
/// A file query that fails on the new content (a JSON query on text, say)
/// produces no event: the watch keeps waiting for queryable content.
fn evaluate(
    repo: &RepositoryId,
    target: &WatchTarget,
    baseline: Option<&EntryContent>,
    commit: &Commit,
) -> Option<WatchEvent> {
    match target {
        WatchTarget::Pattern(pattern) => commit.touches(pattern).then(|| WatchEvent {
            revision: commit.revision,
            entry: None,
        }),
        WatchTarget::File(query) => {
            let change = commit.changes.iter().find(|c| c.path() == query.path())?;
            let result = match change.content().map(|content| query.apply(&content)) {
                None => None,
                Some(Ok(result)) => result,
                Some(Err(e)) => {
                    tracing::warn!(
                        repo = %repo,
                        path = %query.path(),
                        revision = %commit.revision,
                        error = %e,
                        "watch query failed on committed content"
                    );
                    return None;
                }
            };
            if result.as_ref() == baseline {
                return None;
            }
            Some(WatchEvent {
                revision: commit.revision,
                entry: result.map(|content| Entry {
                    revision: commit.revision,
                    path: query.path().to_string(),
                    content,
                }),
            })
        }
    }
}

enum HandleState {
    Ready(WatchEvent),
    Waiting(oneshot::Receiver<WatchEvent>),
    Done,
}

/// Owner's handle on a watch. Dropping it cancels the watch.
pub struct WatchHandle {
    id: u64,
    repo: RepositoryId,
    registry: Weak<WatchRegistry>,
    state: HandleState,
    timeout: Option<Duration>,
}

impl WatchHandle {
    /// Returns true if the watch was fulfilled at registration.
    pub fn is_ready(&self) -> bool {
        matches!(self.state, HandleState::Ready(_))
    }

    /// A handle that can cancel this watch from another task.
    pub fn canceller(&self) -> WatchCanceller {
        WatchCanceller {
            id: self.id,
            repo: self.repo.clone(),
            registry: self.registry.clone(),
        }
    }

    /// Waits for the watch to reach a terminal state.
    pub async fn wait(mut self) -> WatchOutcome {
        let mut rx = match std::mem::replace(&mut self.state, HandleState::Done) {
            HandleState::Ready(event) => return WatchOutcome::Fulfilled(event),
            HandleState::Waiting(rx) => rx,
            HandleState::Done => return WatchOutcome::Cancelled,
        };

        let received = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, &mut rx).await.ok(),
            None => Some((&mut rx).await),
        };
        match received {
            Some(Ok(event)) => WatchOutcome::Fulfilled(event),
            Some(Err(_)) => WatchOutcome::Cancelled,
            None => {
                if self.unregister() {
                    WatchOutcome::TimedOut
                } else {
                    // Fulfilled between the deadline and the unregister.
                    match rx.try_recv() {
                        Ok(event) => WatchOutcome::Fulfilled(event),
                        Err(_) => WatchOutcome::Cancelled,
                    }
                }
            }
        }
    }

    /// Cancels the watch. Returns false if it had already been fulfilled.
    pub fn cancel(mut self) -> bool {
        match std::mem::replace(&mut self.state, HandleState::Done) {
            HandleState::Waiting(_) => self.unregister(),
            HandleState::Ready(_) | HandleState::Done => false,
        }
    }

    fn unregister(&self) -> bool {
        self.registry
            .upgrade()
            .map(|registry| registry.unregister(&self.repo, self.id))
            .unwrap_or(false)
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if let HandleState::Waiting(_) = self.state {
            self.unregister();
        }
    }
}

/// Cancels a watch from outside the task waiting on it.
#[derive(Clone)]
pub struct WatchCanceller {
    id: u64,
    repo: RepositoryId,
    registry: Weak<WatchRegistry>,
}

impl WatchCanceller {
    /// Cancels the watch. Returns false if it was no longer pending.
    pub fn cancel(&self) -> bool {
        self.registry
            .upgrade()
            .map(|registry| registry.unregister(&self.repo, self.id))
            .unwrap_or(false)
    }
}

/// A persistent, channel-based commit subscription.
pub struct Subscription {
    id: u64,
    repo: RepositoryId,
    registry: Weak<WatchRegistry>,
    rx: mpsc::UnboundedReceiver<SubscriptionEvent>,
}

impl Subscription {
    /// Receives the next matching commit, or `None` once the repository
    /// has been removed.
    pub async fn recv(&mut self) -> Option<SubscriptionEvent> {
        self.rx.recv().await
    }

    /// Returns a buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<SubscriptionEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(&self.repo, self.id);
        }
    }
}
