use bytes::Bytes;
use futures::TryStreamExt;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

use crate::changelog::{ChangeLog, FileChangeLog, MemoryChangeLog};
use crate::changes::{now_millis, ChangeSet};
use crate::config::HistoryConfig;
use crate::contentstore::{ContentStore, MemoryContentStore, SimpleFilesystemContentStore};
use crate::feed::{Command, FeedEvent, FeedTranslator, GroupingPolicy, TrackingPolicy};
use crate::gateway::FileSystemGateway;
use crate::index::RedbIndex;
use crate::labels::{self, Label, LabelKind, Summary};
use crate::path::{Path, PathBuf};
use crate::revert::{Revert, RevertReport, RevertScope};
use crate::revision::{self, Revision, RevisionCache};
use crate::tree::{Entry, EntryId, EntryTree};
use crate::Error;

/// File names inside a history directory.
const CHANGE_LOG_FILE: &str = "changes.log";
const INDEX_FILE: &str = "index.redb";

struct Inner {
    config: HistoryConfig,
    log: Arc<dyn ChangeLog>,
    store: Arc<dyn ContentStore>,
    index: RedbIndex,
    policy: Arc<dyn TrackingPolicy>,
    cache: RevisionCache,
    /// The latest published revision. Only ever swapped by the writer.
    current: RwLock<Arc<Revision>>,
}

impl Inner {
    fn current(&self) -> Arc<Revision> {
        self.current.read().clone()
    }
}

type Reply<T> = oneshot::Sender<Result<T, Error>>;

enum Job {
    Command {
        command: Command,
        grouping: GroupingPolicy,
        /// Whether a command without records still produces a change set.
        allow_empty: bool,
        reply: Option<Reply<Option<u64>>>,
    },
    Flush(Reply<()>),
}

/// The local history of one workspace.
///
/// All change sets are produced by a single writer task, which translates
/// submitted commands, appends the result to the change log and then publishes
/// the new revision. Queries work on [Revision] snapshots and never wait for
/// the writer.
pub struct LocalHistory {
    inner: Arc<Inner>,
    jobs: mpsc::UnboundedSender<Job>,
    writer: JoinHandle<()>,
}

impl LocalHistory {
    /// Opens (or creates) a history persisted in `dir`.
    pub async fn open(dir: impl AsRef<std::path::Path>, config: HistoryConfig) -> Result<Self, Error> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let store = SimpleFilesystemContentStore::new(dir.to_path_buf()).await?;

        Self::open_with_store(dir, config, Arc::new(store)).await
    }

    /// Like [LocalHistory::open], with the payloads kept in `store`.
    pub async fn open_with_store(
        dir: impl AsRef<std::path::Path>,
        config: HistoryConfig,
        store: Arc<dyn ContentStore>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;

        let log = FileChangeLog::open(dir.join(CHANGE_LOG_FILE)).await?;
        let index = RedbIndex::new(dir.join(INDEX_FILE)).await?;
        let policy = Arc::new(config.tracking_policy()?);

        let history = Self::from_parts(config, Arc::new(log), store, index, policy).await?;
        info!(dir = %dir.display(), version = history.current_version(), "opened history");
        Ok(history)
    }

    /// A history that only lives in memory.
    pub async fn new_temporary(config: HistoryConfig) -> Result<Self, Error> {
        config.validate()?;
        let policy = Arc::new(config.tracking_policy()?);

        Self::from_parts(
            config,
            Arc::new(MemoryChangeLog::default()),
            Arc::new(MemoryContentStore::default()),
            RedbIndex::new_temporary()?,
            policy,
        )
        .await
    }

    /// Assembles a history from its parts, bringing the index up to date
    /// with the log, and starts the writer.
    pub async fn from_parts(
        config: HistoryConfig,
        log: Arc<dyn ChangeLog>,
        store: Arc<dyn ContentStore>,
        index: RedbIndex,
        policy: Arc<dyn TrackingPolicy>,
    ) -> Result<Self, Error> {
        config.validate()?;

        let version = log.current_version();
        index.truncate_above(version).await?;
        let current = recover(&*log, &index, version).await?;

        let cache = RevisionCache::new(config.revision_cache_size, config.checkpoint_interval);
        let current = Arc::new(current);
        cache.insert(current.clone());

        let inner = Arc::new(Inner {
            config,
            log,
            store,
            index,
            policy,
            cache,
            current: RwLock::new(current),
        });

        let (jobs, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(
            Writer {
                inner: inner.clone(),
                first_error: None,
            }
            .run(rx),
        );

        Ok(Self {
            inner,
            jobs,
            writer,
        })
    }

    pub fn config(&self) -> &HistoryConfig {
        &self.inner.config
    }

    /// The content store payloads are kept in.
    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.inner.store
    }

    /// A snapshot of the latest published revision.
    pub fn current(&self) -> Arc<Revision> {
        self.inner.current()
    }

    pub fn current_version(&self) -> u64 {
        self.inner.current.read().version
    }

    fn send(&self, job: Job) -> Result<(), Error> {
        self.jobs
            .send(job)
            .map_err(|_| Error::StorageError("the writer has stopped".into()))
    }

    /// Enqueues a command and returns right away. Errors show up on the next
    /// [LocalHistory::flush].
    pub fn submit(&self, command: Command) -> Result<(), Error> {
        self.send(Job::Command {
            command,
            grouping: self.inner.config.grouping,
            allow_empty: false,
            reply: None,
        })
    }

    /// Waits until everything submitted so far is published, and returns the
    /// first error any of it produced.
    pub async fn flush(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.send(Job::Flush(tx))?;
        rx.await
            .map_err(|_| Error::StorageError("the writer has stopped".into()))?
    }

    async fn run_command(
        &self,
        command: Command,
        grouping: GroupingPolicy,
        allow_empty: bool,
    ) -> Result<Option<u64>, Error> {
        let (tx, rx) = oneshot::channel();
        self.send(Job::Command {
            command,
            grouping,
            allow_empty,
            reply: Some(tx),
        })?;
        rx.await
            .map_err(|_| Error::StorageError("the writer has stopped".into()))?
    }

    /// Submits a command and waits for it to be published. Returns the
    /// version of the last resulting change set, None if nothing changed.
    pub async fn apply(&self, command: Command) -> Result<Option<u64>, Error> {
        self.run_command(command, self.inner.config.grouping, false)
            .await
    }

    /// Commits an empty, named change set. Its label shows up for every path.
    pub async fn put_label(&self, name: impl Into<String>) -> Result<u64, Error> {
        self.run_command(
            Command::named(Vec::new(), name),
            GroupingPolicy::PerCommand,
            true,
        )
        .await?
        .ok_or_else(|| Error::StorageError("the label was not recorded".into()))
    }

    /// Attaches an explicit label to an existing version.
    #[instrument(skip(self), err)]
    pub async fn label_change_set(&self, version: u64, name: Option<String>) -> Result<Label, Error> {
        if version == 0 || version > self.current_version() {
            return Err(Error::NotFound(format!("version {}", version)));
        }

        let label = Label {
            version,
            name,
            timestamp: now_millis(),
            kind: LabelKind::Explicit,
        };
        self.inner.index.put_label(label.clone()).await?;
        Ok(label)
    }

    /// Labels of all change sets that touched `path` or one of its
    /// ancestors, newest first.
    pub async fn labels_for(&self, path: &Path) -> Result<Vec<Label>, Error> {
        self.labels(Some(path.to_owned())).await
    }

    /// Labels of all change sets, newest first.
    pub async fn log(&self) -> Result<Vec<Label>, Error> {
        self.labels(None).await
    }

    async fn labels(&self, path: Option<PathBuf>) -> Result<Vec<Label>, Error> {
        let up_to = self.current_version();
        let summaries = self.inner.index.summaries(up_to, path).await?;
        let explicit = self.inner.index.explicit_labels().await?;
        Ok(labels::merge(summaries, &explicit))
    }

    /// The tree as of `version`. None above the current version.
    #[instrument(skip(self), err)]
    pub async fn revision_at(&self, version: u64) -> Result<Option<Arc<Revision>>, Error> {
        let current = self.current();
        if version > current.version {
            return Ok(None);
        }
        if version == current.version {
            return Ok(Some(current));
        }
        if let Some(revision) = self.inner.cache.get(version) {
            return Ok(Some(revision));
        }

        let mut base = self
            .inner
            .cache
            .nearest_at_or_below(version)
            .map(|r| Revision::clone(&r));
        match self.inner.index.checkpoint_at_or_below(version).await {
            Ok(Some((checkpoint, tree))) if base.as_ref().map_or(true, |b| b.version < checkpoint) => {
                base = Some(Revision::new(checkpoint, tree));
            }
            Ok(_) => {}
            Err(e) => warn!(err = %e, "ignoring unreadable checkpoint"),
        }
        let base = base.unwrap_or_else(|| Revision::new(0, EntryTree::new()));
        trace!(from = base.version, to = version, "replaying");

        let revision = Arc::new(replay(&*self.inner.log, base, version, |_, _| {}).await?);
        self.inner.cache.insert(revision.clone());
        Ok(Some(revision))
    }

    pub fn has_entry(&self, path: &Path) -> bool {
        self.current().has_entry(path)
    }

    pub fn find_entry(&self, path: &Path) -> Option<Entry> {
        self.current().find_entry(path)
    }

    pub fn list_directory(&self, path: &Path) -> Option<Vec<Entry>> {
        self.current().list_directory(path)
    }

    pub fn path_of(&self, id: EntryId) -> Option<PathBuf> {
        self.current().path_of(id)
    }

    /// The payload of a file entry, None for a directory.
    pub async fn content(&self, entry: &Entry) -> Result<Option<Bytes>, Error> {
        revision::content(entry, &*self.inner.store).await
    }

    /// Plans a revert of the live tree to `version`.
    pub async fn start_revert(&self, version: u64, scope: RevertScope) -> Result<Revert, Error> {
        let current = self.current();
        let target = self
            .revision_at(version)
            .await?
            .ok_or_else(|| Error::NotFound(format!("version {}", version)))?;

        Revert::plan(&current, &target, &scope)
    }

    /// Runs (or resumes) a planned revert, then records whatever it applied as
    /// one change set so history follows the live tree.
    pub async fn run_revert<G>(&self, revert: &mut Revert, gateway: &G) -> Result<RevertReport, Error>
    where
        G: FileSystemGateway + ?Sized,
    {
        let state = revert
            .apply(gateway, &*self.inner.store, self.inner.config.gateway_timeout)
            .await;

        let events: Vec<FeedEvent> = revert.take_events();
        let recorded = if events.is_empty() {
            None
        } else {
            let name = format!("Revert to version {}", revert.target_version());
            self.run_command(Command::named(events, name), GroupingPolicy::PerCommand, false)
                .await?
        };

        let report = revert.report(recorded);
        info!(
            target = report.target_version,
            ?state,
            applied = report.applied,
            total = report.total,
            warnings = report.warnings.len(),
            recorded = ?recorded,
            "reverted"
        );
        Ok(report)
    }

    /// Reverts the live tree within `scope` to `version`.
    pub async fn revert<G>(
        &self,
        version: u64,
        scope: RevertScope,
        gateway: &G,
    ) -> Result<RevertReport, Error>
    where
        G: FileSystemGateway + ?Sized,
    {
        let mut revert = self.start_revert(version, scope).await?;
        self.run_revert(&mut revert, gateway).await
    }

    /// Processes everything submitted so far and stops the writer.
    pub async fn close(self) -> Result<(), Error> {
        let flushed = self.flush().await;

        let Self { jobs, writer, .. } = self;
        drop(jobs);
        writer.await?;

        info!("closed history");
        flushed
    }
}

/// Rebuilds the tree of `version` from the newest usable checkpoint, and
/// recomputes the summaries the index is missing on the way.
async fn recover(log: &dyn ChangeLog, index: &RedbIndex, version: u64) -> Result<Revision, Error> {
    // Replay has to start at or below the first gap in the summaries.
    let summarized = index.summarized_up_to(version).await?;
    let base = match index.checkpoint_at_or_below(summarized).await {
        Ok(Some((v, tree))) => Revision::new(v, tree),
        Ok(None) => Revision::new(0, EntryTree::new()),
        Err(e) => {
            warn!(err = %e, "ignoring unreadable checkpoint");
            Revision::new(0, EntryTree::new())
        }
    };
    debug!(from = base.version, to = version, summarized, "recovering");

    let mut missing = Vec::new();
    let current = replay(log, base, version, |change_set, touched| {
        if change_set.version > summarized {
            missing.push(Summary {
                version: change_set.version,
                timestamp: change_set.timestamp,
                name: change_set.name.clone(),
                touched,
            });
        }
    })
    .await?;

    if !missing.is_empty() {
        info!(count = missing.len(), "recomputed summaries");
        index.put_summaries(missing).await?;
    }
    Ok(current)
}

/// Applies the logged change sets after `base` up to and including `up_to`.
/// A change set that doesn't apply means the log is corrupt.
async fn replay(
    log: &dyn ChangeLog,
    base: Revision,
    up_to: u64,
    mut visit: impl FnMut(&ChangeSet, Vec<PathBuf>) + Send,
) -> Result<Revision, Error> {
    let Revision {
        version: mut at,
        mut tree,
    } = base;
    if at >= up_to {
        return Ok(Revision::new(at, tree));
    }

    let mut change_sets = log.read_from(at + 1);
    while let Some(change_set) = change_sets.try_next().await? {
        if change_set.version > up_to {
            break;
        }
        if change_set.version != at + 1 {
            return Err(Error::Corruption(format!(
                "expected version {} in the log, got {}",
                at + 1,
                change_set.version
            )));
        }

        let (next, touched) = tree.apply_tracked(&change_set).map_err(|e| {
            Error::Corruption(format!("logged change set doesn't apply: {}", e))
        })?;
        visit(&change_set, touched);
        tree = next;
        at = change_set.version;
    }

    if at != up_to {
        return Err(Error::Corruption(format!(
            "log ends at version {}, expected {}",
            at, up_to
        )));
    }
    Ok(Revision::new(at, tree))
}

/// Owns all writes: translation, appending, indexing and publishing.
struct Writer {
    inner: Arc<Inner>,
    /// The first error since the last flush.
    first_error: Option<Error>,
}

impl Writer {
    async fn run(mut self, mut jobs: mpsc::UnboundedReceiver<Job>) {
        while let Some(job) = jobs.recv().await {
            match job {
                Job::Command {
                    command,
                    grouping,
                    allow_empty,
                    reply,
                } => {
                    let result = self.process(command, grouping, allow_empty).await;
                    match reply {
                        Some(reply) => {
                            let _ = reply.send(result);
                        }
                        None => {
                            if let Err(e) = result {
                                warn!(err = %e, "rejected submitted command");
                                self.first_error.get_or_insert(e);
                            }
                        }
                    }
                }
                Job::Flush(reply) => {
                    let _ = reply.send(self.first_error.take().map_or(Ok(()), Err));
                }
            }
        }
        debug!("writer stopped");
    }

    async fn process(
        &mut self,
        command: Command,
        grouping: GroupingPolicy,
        allow_empty: bool,
    ) -> Result<Option<u64>, Error> {
        let Command { events, name } = command;
        let groups = match grouping {
            GroupingPolicy::PerEvent if !events.is_empty() => {
                events.into_iter().map(|e| vec![e]).collect()
            }
            _ => vec![events],
        };

        let mut last = None;
        for events in groups {
            if let Some(version) = self.commit_events(events, name.clone(), allow_empty).await? {
                last = Some(version);
            }
        }
        Ok(last)
    }

    async fn commit_events(
        &mut self,
        events: Vec<FeedEvent>,
        name: Option<String>,
        allow_empty: bool,
    ) -> Result<Option<u64>, Error> {
        let current = self.inner.current();
        let timestamp = now_millis();

        let mut translator = FeedTranslator::new(
            &current.tree,
            &*self.inner.policy,
            &*self.inner.store,
            self.inner.config.inline_threshold,
            timestamp,
        );
        for event in events {
            translator.translate(event).await?;
        }
        let records = translator.finish();

        if records.is_empty() && !allow_empty {
            trace!("nothing changed");
            return Ok(None);
        }

        let change_set = ChangeSet {
            version: current.version + 1,
            timestamp,
            name,
            records,
        };
        self.commit(&current, change_set).await.map(Some)
    }

    #[instrument(skip_all, err, fields(change_set.version = change_set.version))]
    async fn commit(&mut self, current: &Revision, change_set: ChangeSet) -> Result<u64, Error> {
        let version = change_set.version;
        let (tree, touched) = current.tree.apply_tracked(&change_set)?;

        self.inner.log.append(&change_set).await?;

        // Durable from here on. Summaries and checkpoints are derived data
        // and get rebuilt on open if writing them fails.
        let summary = Summary {
            version,
            timestamp: change_set.timestamp,
            name: change_set.name.clone(),
            touched,
        };
        if let Err(e) = self.inner.index.put_summary(summary).await {
            warn!(err = %e, version, "failed to index change set");
            self.first_error.get_or_insert(e);
        }

        let revision = Arc::new(Revision::new(version, tree));
        self.inner.cache.insert(revision.clone());
        *self.inner.current.write() = revision.clone();
        debug!(version, records = change_set.records.len(), "published");

        if version % self.inner.config.checkpoint_interval == 0 {
            if let Err(e) = self.inner.index.put_checkpoint(version, &revision.tree).await {
                warn!(err = %e, version, "failed to write checkpoint");
                self.first_error.get_or_insert(e);
            }
        }

        Ok(version)
    }
}
