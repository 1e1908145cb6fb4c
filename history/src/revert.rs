//! Bringing the live file tree back to an earlier version.
//!
//! A [Revert] diffs the current and the target tree by entry id and plans an
//! ordered list of [RevertOp]s against a simulated working tree, so that no
//! operation ever runs into an occupied destination. The plan is then applied
//! through a [FileSystemGateway], one bounded call at a time.
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::io;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::content::Content;
use crate::contentstore::ContentStore;
use crate::feed::{temp_name, EventPayload, FeedEvent};
use crate::gateway::FileSystemGateway;
use crate::path::{Path, PathBuf, PathComponent};
use crate::revision::Revision;
use crate::tree::{EntryId, EntryTree, ROOT_ID};
use crate::Error;

/// The model id of whatever the scope hangs off. For [RevertScope::Everything]
/// that's the root itself, otherwise the parent of the scope path.
const ANCHOR: EntryId = ROOT_ID;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RevertScope {
    Everything,
    /// A single file, or a directory with everything below it.
    Path(PathBuf),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RevertState {
    /// Diffed and planned against the snapshots only. Nothing has been sent
    /// to the live tree yet.
    Diffing,
    /// Steps are being sent, or were interrupted before finishing.
    Applying,
    Done,
    Failed,
}

/// A single step against the live tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RevertOp {
    CreateDir {
        path: PathBuf,
    },
    /// `expected` is the content history has for the entry right now, None
    /// when the file is (re)created.
    WriteFile {
        path: PathBuf,
        content: Content,
        expected: Option<Content>,
    },
    Delete {
        path: PathBuf,
        expected: Option<Content>,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
    },
}

impl RevertOp {
    pub fn path(&self) -> &Path {
        match self {
            RevertOp::CreateDir { path }
            | RevertOp::WriteFile { path, .. }
            | RevertOp::Delete { path, .. } => path,
            RevertOp::Rename { from, .. } => from,
        }
    }
}

/// The outcome of (a run of) a revert.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RevertReport {
    pub target_version: u64,
    pub state: RevertState,
    /// Number of operations applied so far, over all runs.
    pub applied: usize,
    pub total: usize,
    pub warnings: Vec<String>,
    pub failure: Option<Error>,
    /// The version of the change set recording this run, if anything was
    /// recorded.
    pub recorded_version: Option<u64>,
}

/// A planned revert and its progress.
#[derive(Debug)]
pub struct Revert {
    target_version: u64,
    state: RevertState,
    ops: Vec<RevertOp>,
    next: usize,
    warnings: Vec<String>,
    failure: Option<Error>,
    /// Applied but not yet recorded steps.
    events: Vec<FeedEvent>,
}

impl Revert {
    /// Diffs `current` against `target` within `scope` and plans the
    /// operations that turn one into the other.
    #[instrument(skip_all, fields(current = current.version, target = target.version), err)]
    pub fn plan(current: &Revision, target: &Revision, scope: &RevertScope) -> Result<Self, Error> {
        let scope = match scope {
            RevertScope::Path(p) if p.is_root() => &RevertScope::Everything,
            scope => scope,
        };

        let mut planner = Planner::new(&current.tree, &target.tree, scope);
        planner.create_scope_parents(scope)?;
        planner.park_survivors()?;
        planner.delete_removed();
        planner.place_target()?;

        debug!(ops = planner.ops.len(), "planned revert");
        Ok(Self {
            target_version: target.version,
            state: RevertState::Diffing,
            ops: planner.ops,
            next: 0,
            warnings: Vec::new(),
            failure: None,
            events: Vec::new(),
        })
    }

    pub fn target_version(&self) -> u64 {
        self.target_version
    }

    pub fn state(&self) -> RevertState {
        self.state
    }

    pub fn ops(&self) -> &[RevertOp] {
        &self.ops
    }

    pub fn applied(&self) -> usize {
        self.next
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn failure(&self) -> Option<&Error> {
        self.failure.as_ref()
    }

    /// Drains the events describing the steps applied since the last call.
    pub fn take_events(&mut self) -> Vec<FeedEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn report(&self, recorded_version: Option<u64>) -> RevertReport {
        RevertReport {
            target_version: self.target_version,
            state: self.state,
            applied: self.next,
            total: self.ops.len(),
            warnings: self.warnings.clone(),
            failure: self.failure.clone(),
            recorded_version,
        }
    }

    /// Runs the remaining operations, starting at the failed one if a
    /// previous run failed. Stops at the first failure.
    pub async fn apply<G, CS>(&mut self, gateway: &G, store: &CS, timeout: Duration) -> RevertState
    where
        G: FileSystemGateway + ?Sized,
        CS: ContentStore + ?Sized,
    {
        if self.state == RevertState::Done {
            return self.state;
        }
        self.state = RevertState::Applying;
        self.failure = None;

        while let Some(op) = self.ops.get(self.next).cloned() {
            match apply_op(&op, gateway, store, timeout).await {
                Ok((warning, event)) => {
                    if let Some(warning) = warning {
                        warn!(step = self.next, %warning, "live tree diverged");
                        self.warnings.push(warning);
                    }
                    self.events.push(event);
                    self.next += 1;
                }
                Err(e) => {
                    warn!(step = self.next, err = %e, "revert step failed");
                    self.failure = Some(e);
                    self.state = RevertState::Failed;
                    return self.state;
                }
            }
        }

        self.state = RevertState::Done;
        self.state
    }
}

enum Outcome<T> {
    Done(T),
    Diverged(String),
}

async fn bounded<T>(
    timeout: Duration,
    path: &Path,
    call: impl Future<Output = io::Result<T>>,
) -> Result<Outcome<T>, Error> {
    match tokio::time::timeout(timeout, call).await {
        Err(_) => Err(Error::Gateway {
            path: path.to_string(),
            message: format!("timed out after {:?}", timeout),
        }),
        Ok(Ok(v)) => Ok(Outcome::Done(v)),
        Ok(Err(e)) if e.kind() == io::ErrorKind::NotFound => {
            Ok(Outcome::Diverged(format!("{}: {}", path, e)))
        }
        Ok(Err(e)) => Err(Error::Gateway {
            path: path.to_string(),
            message: e.to_string(),
        }),
    }
}

/// Compares the live file against what history knows about it.
async fn check_live<G: FileSystemGateway + ?Sized>(
    gateway: &G,
    timeout: Duration,
    path: &Path,
    expected: &Content,
    target: Option<&Content>,
) -> Result<Option<String>, Error> {
    Ok(match bounded(timeout, path, gateway.read(path)).await? {
        Outcome::Done(Some(live)) => {
            if expected.matches(&live) || target.is_some_and(|t| t.matches(&live)) {
                None
            } else {
                Some(format!("{} was changed outside of history", path))
            }
        }
        Outcome::Done(None) => Some(format!("{} is missing", path)),
        Outcome::Diverged(warning) => Some(warning),
    })
}

/// Applies one step. Returns a divergence warning, if any, and the event that
/// records the step.
async fn apply_op<G, CS>(
    op: &RevertOp,
    gateway: &G,
    store: &CS,
    timeout: Duration,
) -> Result<(Option<String>, FeedEvent), Error>
where
    G: FileSystemGateway + ?Sized,
    CS: ContentStore + ?Sized,
{
    debug!(?op, "applying");

    match op {
        RevertOp::CreateDir { path } => {
            let warning = match bounded(timeout, path, gateway.create_dir(path)).await? {
                Outcome::Done(()) => None,
                Outcome::Diverged(w) => Some(w),
            };
            Ok((
                warning,
                FeedEvent::Created {
                    path: path.clone(),
                    payload: EventPayload::Directory,
                },
            ))
        }
        RevertOp::WriteFile {
            path,
            content,
            expected,
        } => {
            let data: Bytes = content.load(store).await?;

            let mut warning = match expected {
                Some(expected) => {
                    check_live(gateway, timeout, path, expected, Some(content)).await?
                }
                None => None,
            };
            if let Outcome::Diverged(w) =
                bounded(timeout, path, gateway.write(path, data.clone())).await?
            {
                warning.get_or_insert(w);
            }

            Ok((
                warning,
                FeedEvent::Created {
                    path: path.clone(),
                    payload: EventPayload::File(data),
                },
            ))
        }
        RevertOp::Delete { path, expected } => {
            let mut warning = match expected {
                Some(expected) => check_live(gateway, timeout, path, expected, None).await?,
                None => None,
            };
            if let Outcome::Diverged(w) = bounded(timeout, path, gateway.delete(path)).await? {
                warning = Some(w);
            }
            Ok((warning, FeedEvent::Deleted { path: path.clone() }))
        }
        RevertOp::Rename { from, to } => {
            let warning = match bounded(timeout, from, gateway.rename(from, to)).await? {
                Outcome::Done(()) => None,
                Outcome::Diverged(w) => Some(w),
            };
            Ok((
                warning,
                FeedEvent::Moved {
                    from: from.clone(),
                    to: to.clone(),
                    payload: None,
                },
            ))
        }
    }
}

/// One side of the diff, restricted to the scope. Entries directly at the
/// top of the scope have [ANCHOR] as their parent.
struct Scoped<'a> {
    tree: &'a EntryTree,
    /// Parents before children.
    order: Vec<EntryId>,
    location: HashMap<EntryId, (EntryId, PathComponent)>,
}

impl<'a> Scoped<'a> {
    fn new(tree: &'a EntryTree, scope: &RevertScope) -> Self {
        let (top, order) = match scope {
            RevertScope::Everything => {
                let mut order = tree.descendants(ROOT_ID);
                order.retain(|id| *id != ROOT_ID);
                (None, order)
            }
            RevertScope::Path(p) => match tree.resolve(p) {
                Some(entry) => (Some(entry.id), tree.descendants(entry.id)),
                None => (None, Vec::new()),
            },
        };

        let location = order
            .iter()
            .filter_map(|id| {
                let entry = tree.get(*id)?;
                let parent = if Some(*id) == top {
                    ANCHOR
                } else {
                    entry.parent?
                };
                Some((*id, (parent, entry.name.clone()?)))
            })
            .collect();

        Self {
            tree,
            order,
            location,
        }
    }

    fn contains(&self, id: EntryId) -> bool {
        self.location.contains_key(&id)
    }

    fn content(&self, id: EntryId) -> Option<Content> {
        self.tree.get(id).and_then(|e| e.content().cloned())
    }
}

/// The live tree as it will look after the operations planned so far.
struct Working {
    anchor_path: PathBuf,
    location: HashMap<EntryId, (EntryId, PathComponent)>,
    children: HashMap<EntryId, BTreeMap<PathComponent, EntryId>>,
}

impl Working {
    fn insert(&mut self, id: EntryId, parent: EntryId, name: PathComponent) {
        self.children
            .entry(parent)
            .or_default()
            .insert(name.clone(), id);
        self.location.insert(id, (parent, name));
    }

    fn detach(&mut self, id: EntryId) {
        if let Some((parent, name)) = self.location.remove(&id) {
            if let Some(siblings) = self.children.get_mut(&parent) {
                siblings.remove(&name);
            }
        }
    }

    fn relocate(&mut self, id: EntryId, parent: EntryId, name: PathComponent) {
        self.detach(id);
        self.insert(id, parent, name);
    }

    fn remove_subtree(&mut self, id: EntryId) {
        self.detach(id);
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            if let Some(children) = self.children.remove(&id) {
                for child in children.into_values() {
                    self.location.remove(&child);
                    stack.push(child);
                }
            }
        }
    }

    fn child(&self, parent: EntryId, name: &PathComponent) -> Option<EntryId> {
        self.children.get(&parent)?.get(name).copied()
    }

    fn is_taken(&self, parent: EntryId, name: &PathComponent) -> bool {
        self.child(parent, name).is_some()
    }

    fn path(&self, id: EntryId) -> PathBuf {
        let mut names = Vec::new();
        let mut current = id;
        while let Some((parent, name)) = self.location.get(&current) {
            names.push(name);
            current = *parent;
        }

        let mut path = self.anchor_path.clone();
        for name in names.into_iter().rev() {
            path.push(name);
        }
        path
    }

    fn path_in(&self, parent: EntryId, name: &PathComponent) -> PathBuf {
        self.path(parent).join(name)
    }
}

struct Planner<'a> {
    current: Scoped<'a>,
    target: Scoped<'a>,
    working: Working,
    ops: Vec<RevertOp>,
}

impl<'a> Planner<'a> {
    fn new(current: &'a EntryTree, target: &'a EntryTree, scope: &RevertScope) -> Self {
        let anchor_path = match scope {
            RevertScope::Everything => PathBuf::new(),
            RevertScope::Path(p) => p.parent().map(ToOwned::to_owned).unwrap_or_default(),
        };

        let current = Scoped::new(current, scope);
        let target = Scoped::new(target, scope);

        let mut working = Working {
            anchor_path,
            location: HashMap::new(),
            children: HashMap::new(),
        };
        for id in &current.order {
            if let Some((parent, name)) = current.location.get(id) {
                working.insert(*id, *parent, name.clone());
            }
        }

        Self {
            current,
            target,
            working,
            ops: Vec::new(),
        }
    }

    /// A scoped revert may restore a path whose parent directories are gone.
    fn create_scope_parents(&mut self, scope: &RevertScope) -> Result<(), Error> {
        let RevertScope::Path(path) = scope else {
            return Ok(());
        };
        if self.target.order.is_empty() {
            return Ok(());
        }

        let mut prefix = PathBuf::new();
        for name in self.working.anchor_path.components() {
            prefix.push(&name);
            match self.current.tree.resolve(&prefix) {
                Some(entry) if entry.is_directory() => {}
                Some(_) => {
                    return Err(Error::Conflict(format!(
                        "can't restore {}: {} is a file",
                        path, prefix
                    )))
                }
                None => self.ops.push(RevertOp::CreateDir {
                    path: prefix.clone(),
                }),
            }
        }
        Ok(())
    }

    /// Moves entries that survive in the target out of subtrees that are
    /// about to be deleted.
    fn park_survivors(&mut self) -> Result<(), Error> {
        let deleted = self.deleted();
        for id in self.current.order.clone() {
            if !self.target.contains(id) {
                continue;
            }
            let Some((parent, name)) = self.current.location.get(&id).cloned() else {
                continue;
            };
            if deleted.contains(&parent) {
                self.park(id, ANCHOR, &name)?;
            }
        }
        Ok(())
    }

    fn deleted(&self) -> HashSet<EntryId> {
        self.current
            .order
            .iter()
            .copied()
            .filter(|id| !self.target.contains(*id))
            .collect()
    }

    /// Deletes the top-most entries missing from the target.
    fn delete_removed(&mut self) {
        let deleted = self.deleted();
        for id in self.current.order.clone() {
            if !deleted.contains(&id) {
                continue;
            }
            let parent_deleted = self
                .current
                .location
                .get(&id)
                .is_some_and(|(parent, _)| deleted.contains(parent));
            if parent_deleted {
                continue;
            }

            self.ops.push(RevertOp::Delete {
                path: self.working.path(id),
                expected: self.current.content(id),
            });
            self.working.remove_subtree(id);
        }
    }

    /// Creates and moves target entries into place, parents first.
    fn place_target(&mut self) -> Result<(), Error> {
        for id in self.target.order.clone() {
            let Some((parent, name)) = self.target.location.get(&id).cloned() else {
                continue;
            };
            let target_content = self.target.content(id);

            if self.working.location.contains_key(&id) {
                if self.working.location.get(&id) != Some(&(parent, name.clone())) {
                    self.vacate(parent, &name, id)?;
                    self.ops.push(RevertOp::Rename {
                        from: self.working.path(id),
                        to: self.working.path_in(parent, &name),
                    });
                    self.working.relocate(id, parent, name);
                }

                let current_content = self.current.content(id);
                if let Some(content) = target_content {
                    if current_content.as_ref() != Some(&content) {
                        self.ops.push(RevertOp::WriteFile {
                            path: self.working.path(id),
                            content,
                            expected: current_content,
                        });
                    }
                }
            } else {
                self.vacate(parent, &name, id)?;
                let path = self.working.path_in(parent, &name);
                self.ops.push(match target_content {
                    Some(content) => RevertOp::WriteFile {
                        path,
                        content,
                        expected: None,
                    },
                    None => RevertOp::CreateDir { path },
                });
                self.working.insert(id, parent, name);
            }
        }
        Ok(())
    }

    /// Parks whatever other entry occupies `name` in `parent`.
    fn vacate(&mut self, parent: EntryId, name: &PathComponent, id: EntryId) -> Result<(), Error> {
        match self.working.child(parent, name) {
            Some(occupant) if occupant != id => self.park(occupant, parent, name),
            _ => Ok(()),
        }
    }

    fn park(&mut self, id: EntryId, parent: EntryId, name: &PathComponent) -> Result<(), Error> {
        let temp = temp_name(name, id, |c| self.working.is_taken(parent, c))?;
        self.ops.push(RevertOp::Rename {
            from: self.working.path(id),
            to: self.working.path_in(parent, &temp),
        });
        self.working.relocate(id, parent, temp);
        Ok(())
    }
}
