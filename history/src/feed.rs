//! Translating host file system notifications into change records.
use bytes::Bytes;
use std::collections::BTreeSet;
use tracing::{debug, trace};

use crate::changes::{ChangeRecord, CreateKind};
use crate::content::Content;
use crate::contentstore::ContentStore;
use crate::path::{Path, PathBuf, PathComponent};
use crate::tree::{EntryId, EntryTree, ROOT_ID};
use crate::Error;

/// What a created (or moved in) entry looks like.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventPayload {
    Directory,
    File(Bytes),
}

impl EventPayload {
    pub fn is_directory(&self) -> bool {
        matches!(self, EventPayload::Directory)
    }
}

/// A raw notification from the host file system watcher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeedEvent {
    Created {
        path: PathBuf,
        payload: EventPayload,
    },
    Deleted {
        path: PathBuf,
    },
    /// `payload` describes the entry at its destination, for when the source
    /// was never recorded.
    Moved {
        from: PathBuf,
        to: PathBuf,
        payload: Option<EventPayload>,
    },
    ContentChanged {
        path: PathBuf,
        contents: Bytes,
    },
}

/// A batch of events, as submitted to the engine.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Command {
    pub events: Vec<FeedEvent>,
    /// Becomes the name of the resulting change set(s).
    pub name: Option<String>,
}

impl Command {
    pub fn new(events: Vec<FeedEvent>) -> Self {
        Self { events, name: None }
    }

    pub fn named(events: Vec<FeedEvent>, name: impl Into<String>) -> Self {
        Self {
            events,
            name: Some(name.into()),
        }
    }
}

/// How submitted events are grouped into change sets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GroupingPolicy {
    /// One change set per [Command].
    #[default]
    PerCommand,
    /// One change set per [FeedEvent].
    PerEvent,
}

/// Decides which paths are recorded at all.
pub trait TrackingPolicy: Send + Sync {
    fn is_tracked(&self, path: &Path, is_dir: bool) -> bool;
}

/// Tracks everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct TrackAll;

impl TrackingPolicy for TrackAll {
    fn is_tracked(&self, _path: &Path, _is_dir: bool) -> bool {
        true
    }
}

/// Excludes paths by glob patterns.
///
/// Each pattern is matched against every component of the path and against
/// the path itself and all of its ancestors. A pattern with a trailing `/`
/// only excludes directories.
#[derive(Clone, Debug)]
pub struct GlobTrackingPolicy {
    excludes: Vec<(glob::Pattern, bool)>,
}

impl GlobTrackingPolicy {
    pub fn new<S: AsRef<str>>(excludes: &[S]) -> Result<Self, Error> {
        let excludes = excludes
            .iter()
            .map(|pattern| {
                let pattern = pattern.as_ref();
                let (pattern, dir_only) = match pattern.strip_suffix('/') {
                    Some(p) => (p, true),
                    None => (pattern, false),
                };
                glob::Pattern::new(pattern)
                    .map(|p| (p, dir_only))
                    .map_err(|e| {
                        Error::InvalidRequest(format!("invalid exclude pattern {}: {}", pattern, e))
                    })
            })
            .collect::<Result<_, _>>()?;

        Ok(Self { excludes })
    }

    fn excluded(&self, candidate: &str, is_dir: bool) -> bool {
        self.excludes
            .iter()
            .any(|(pattern, dir_only)| (is_dir || !dir_only) && pattern.matches(candidate))
    }
}

impl TrackingPolicy for GlobTrackingPolicy {
    fn is_tracked(&self, path: &Path, is_dir: bool) -> bool {
        use bstr::ByteSlice;

        let depth = path.depth();
        let mut prefix = PathBuf::new();

        for (i, component) in path.components().enumerate() {
            // everything but the last component is a directory
            let component_is_dir = is_dir || i + 1 < depth;
            prefix.push(&component);

            if self.excluded(&component.as_bytes().to_str_lossy(), component_is_dir)
                || self.excluded(&prefix.as_bytes().to_str_lossy(), component_is_dir)
            {
                return false;
            }
        }

        true
    }
}

/// Turns feed events into records against a working copy of the latest tree.
///
/// Every record is applied to the working copy as soon as it is produced, so
/// later events of the same batch see the effect of earlier ones, and invalid
/// structural changes are caught right away.
pub struct FeedTranslator<'a> {
    tree: EntryTree,
    policy: &'a dyn TrackingPolicy,
    store: &'a dyn ContentStore,
    inline_threshold: usize,
    timestamp: u64,
    records: Vec<ChangeRecord>,
}

impl<'a> FeedTranslator<'a> {
    pub fn new(
        tree: &EntryTree,
        policy: &'a dyn TrackingPolicy,
        store: &'a dyn ContentStore,
        inline_threshold: usize,
        timestamp: u64,
    ) -> Self {
        Self {
            tree: tree.clone(),
            policy,
            store,
            inline_threshold,
            timestamp,
            records: Vec::new(),
        }
    }

    /// The records produced so far.
    pub fn finish(self) -> Vec<ChangeRecord> {
        self.records
    }

    pub async fn translate(&mut self, event: FeedEvent) -> Result<(), Error> {
        trace!(?event, "translating");

        match event {
            FeedEvent::Created { path, payload } => self.created(&path, payload).await,
            FeedEvent::Deleted { path } => {
                match self.tree.resolve(&path).map(|e| e.id) {
                    Some(ROOT_ID) => Err(Error::InvalidRequest("the root can't be deleted".into())),
                    Some(id) => self.emit(ChangeRecord::Delete { id }),
                    None => {
                        debug!(%path, "ignoring deletion of unknown path");
                        Ok(())
                    }
                }
            }
            FeedEvent::Moved { from, to, payload } => self.moved(&from, &to, payload).await,
            FeedEvent::ContentChanged { path, contents } => {
                let existing = self
                    .tree
                    .resolve(&path)
                    .map(|e| (e.id, e.content().cloned()));
                match existing {
                    Some((_, None)) => Err(Error::Conflict(format!(
                        "{} is a directory, it has no content",
                        path
                    ))),
                    Some((id, Some(content))) => self.set_content(id, &content, contents).await,
                    None => {
                        self.created(&path, EventPayload::File(contents))
                            .await
                    }
                }
            }
        }
    }

    fn emit(&mut self, record: ChangeRecord) -> Result<(), Error> {
        self.tree
            .apply_record(&record, self.timestamp, &mut BTreeSet::new())?;
        self.records.push(record);
        Ok(())
    }

    async fn content(&self, data: Bytes) -> Result<Content, Error> {
        Content::from_bytes(data, self.inline_threshold, self.store).await
    }

    async fn set_content(
        &mut self,
        id: EntryId,
        current: &Content,
        data: Bytes,
    ) -> Result<(), Error> {
        if current.matches(&data) {
            trace!(id, "content unchanged");
            return Ok(());
        }
        let content = self.content(data).await?;
        self.emit(ChangeRecord::SetContent { id, content })
    }

    /// Resolves a directory, creating whatever is missing on the way.
    fn ensure_directory(&mut self, path: &Path) -> Result<EntryId, Error> {
        let mut current = ROOT_ID;
        for name in path.components() {
            let child = self
                .tree
                .get(current)
                .and_then(|dir| dir.child(name.as_bytes()));
            current = match child {
                Some(id) => id,
                None => {
                    let id = self.tree.next_id();
                    self.emit(ChangeRecord::Create {
                        id,
                        parent: current,
                        name,
                        kind: CreateKind::Directory,
                    })?;
                    id
                }
            };
        }
        Ok(current)
    }

    async fn create(
        &mut self,
        parent: EntryId,
        name: PathComponent,
        payload: EventPayload,
    ) -> Result<(), Error> {
        let kind = match payload {
            EventPayload::Directory => CreateKind::Directory,
            EventPayload::File(data) => CreateKind::File(self.content(data).await?),
        };
        let id = self.tree.next_id();
        self.emit(ChangeRecord::Create {
            id,
            parent,
            name,
            kind,
        })
    }

    async fn created(&mut self, path: &Path, payload: EventPayload) -> Result<(), Error> {
        let (Some(parent_path), Some(name)) = (path.parent(), path.file_name()) else {
            return Err(Error::InvalidRequest("the root can't be created".into()));
        };

        if !self.policy.is_tracked(path, payload.is_directory()) {
            trace!(%path, "not tracked");
            return Ok(());
        }

        let existing = self
            .tree
            .resolve(path)
            .map(|e| (e.id, e.content().cloned()));

        match (existing, payload) {
            (None, payload) => {
                let parent = self.ensure_directory(parent_path)?;
                self.create(parent, name, payload).await
            }
            (Some((_, None)), EventPayload::Directory) => Ok(()),
            (Some((id, Some(content))), EventPayload::File(data)) => {
                self.set_content(id, &content, data).await
            }
            // the kind changed, replace the entry
            (Some((id, _)), payload) => {
                self.emit(ChangeRecord::Delete { id })?;
                let parent = self.ensure_directory(parent_path)?;
                self.create(parent, name, payload).await
            }
        }
    }

    async fn moved(
        &mut self,
        from: &Path,
        to: &Path,
        payload: Option<EventPayload>,
    ) -> Result<(), Error> {
        let (Some(to_parent), Some(to_name)) = (to.parent(), to.file_name()) else {
            return Err(Error::InvalidRequest("can't move onto the root".into()));
        };

        let source = self
            .tree
            .resolve(from)
            .map(|e| (e.id, e.is_directory(), e.content().cloned()));

        let is_dir = match (&source, &payload) {
            (Some((_, is_dir, _)), _) => *is_dir,
            (None, Some(payload)) => payload.is_directory(),
            (None, None) => false,
        };

        if !self.policy.is_tracked(to, is_dir) {
            // moved out of sight
            if let Some((id, _, _)) = source {
                if id != ROOT_ID {
                    self.emit(ChangeRecord::Delete { id })?;
                }
            }
            return Ok(());
        }

        let Some((id, _, content)) = source else {
            return match payload {
                Some(payload) => self.created(to, payload).await,
                None => {
                    debug!(%from, %to, "ignoring move of unknown path without payload");
                    Ok(())
                }
            };
        };

        if id == ROOT_ID {
            return Err(Error::InvalidRequest("the root can't be moved".into()));
        }
        if from == to {
            return Ok(());
        }

        // whatever else is at the destination gets replaced
        if let Some(occupant) = self.tree.resolve(to).map(|e| e.id) {
            if occupant != id {
                if self.tree.is_ancestor_or_self(occupant, id) {
                    return Err(Error::Conflict(format!(
                        "can't move {} onto its own ancestor {}",
                        from, to
                    )));
                }
                self.emit(ChangeRecord::Delete { id: occupant })?;
            }
        }

        let new_parent = self.ensure_directory(to_parent)?;
        self.relocate(id, new_parent, to_name)?;

        if let (Some(content), Some(EventPayload::File(data))) = (content, payload) {
            self.set_content(id, &content, data).await?;
        }

        Ok(())
    }

    /// Emits the Move and/or Rename records putting `id` at `new_parent/new_name`.
    fn relocate(
        &mut self,
        id: EntryId,
        new_parent: EntryId,
        new_name: PathComponent,
    ) -> Result<(), Error> {
        let (old_parent, old_name) = match self.tree.get(id) {
            Some(entry) => match (entry.parent, entry.name.clone()) {
                (Some(parent), Some(name)) => (parent, name),
                _ => return Err(Error::InvalidRequest("the root can't be moved".into())),
            },
            None => return Err(Error::NotFound(format!("entry {}", id))),
        };

        let has_child = |tree: &EntryTree, dir: EntryId, name: &PathComponent| {
            tree.get(dir)
                .and_then(|d| d.child(name.as_bytes()))
                .is_some()
        };

        if old_parent == new_parent {
            if old_name != new_name {
                self.emit(ChangeRecord::Rename {
                    parent: old_parent,
                    old_name,
                    new_name,
                })?;
            }
            return Ok(());
        }

        if old_name == new_name {
            return self.emit(ChangeRecord::Move { id, new_parent });
        }

        if !has_child(&self.tree, new_parent, &old_name) {
            // move first, then rename in the new parent
            self.emit(ChangeRecord::Move { id, new_parent })?;
            return self.emit(ChangeRecord::Rename {
                parent: new_parent,
                old_name,
                new_name,
            });
        }

        if !has_child(&self.tree, old_parent, &new_name) {
            // rename in the old parent, then move
            self.emit(ChangeRecord::Rename {
                parent: old_parent,
                old_name,
                new_name,
            })?;
            return self.emit(ChangeRecord::Move { id, new_parent });
        }

        // both orders collide, go through a name that's free in both parents
        let temp = temp_name(&new_name, id, |candidate| {
            has_child(&self.tree, old_parent, candidate)
                || has_child(&self.tree, new_parent, candidate)
        })?;
        self.emit(ChangeRecord::Rename {
            parent: old_parent,
            old_name,
            new_name: temp.clone(),
        })?;
        self.emit(ChangeRecord::Move { id, new_parent })?;
        self.emit(ChangeRecord::Rename {
            parent: new_parent,
            old_name: temp,
            new_name,
        })
    }
}

/// `<name>.lochist-<id>`, disambiguated further with a counter while `taken`.
pub(crate) fn temp_name(
    name: &PathComponent,
    id: EntryId,
    taken: impl Fn(&PathComponent) -> bool,
) -> Result<PathComponent, Error> {
    let mut counter = 0u32;
    loop {
        let mut candidate = name.as_bytes().to_vec();
        candidate.extend_from_slice(format!(".lochist-{}", id).as_bytes());
        if counter > 0 {
            candidate.extend_from_slice(format!("-{}", counter).as_bytes());
        }

        let candidate = PathComponent::try_from(Bytes::from(candidate))?;
        if !taken(&candidate) {
            return Ok(candidate);
        }
        counter += 1;
    }
}
