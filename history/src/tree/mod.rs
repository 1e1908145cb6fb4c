//! Immutable, structurally shared snapshots of the tracked namespace.
use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::trace;

use crate::changes::{ChangeRecord, ChangeSet, CreateKind};
use crate::path::{Path, PathBuf, PathComponent};
use crate::Error;

mod arena;
mod entry;

pub use arena::Arena;
pub use entry::{Entry, EntryId, EntryKind, ROOT_ID};

/// A snapshot of all entries at one version.
///
/// Trees are never mutated once handed out; applying a change set produces a
/// new tree which shares every untouched entry with its predecessor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryTree {
    entries: Arena<Entry>,
    next_id: EntryId,
}

impl Default for EntryTree {
    fn default() -> Self {
        let mut entries = Arena::new();
        entries.insert(ROOT_ID, Arc::new(Entry::root()));

        Self {
            entries,
            next_id: ROOT_ID + 1,
        }
    }
}

impl EntryTree {
    /// The empty tree of version 0, holding only the root directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reassembles a tree from its entries, checking that they are linked up
    /// consistently.
    pub(crate) fn from_entries(
        entries: impl IntoIterator<Item = Entry>,
        next_id: EntryId,
    ) -> Result<Self, Error> {
        let mut arena = Arena::new();
        for entry in entries {
            if entry.id >= next_id && entry.id != ROOT_ID {
                return Err(Error::Corruption(format!(
                    "entry {} at or above next id {}",
                    entry.id, next_id
                )));
            }
            let id = entry.id;
            if arena.insert(id, Arc::new(entry)).is_some() {
                return Err(Error::Corruption(format!("duplicate entry {}", id)));
            }
        }

        let tree = Self {
            entries: arena,
            next_id,
        };

        match tree.get(ROOT_ID) {
            Some(root) if root.is_directory() && root.parent.is_none() => {}
            _ => return Err(Error::Corruption("missing root directory".into())),
        }

        for entry in tree.entries() {
            if entry.id == ROOT_ID {
                continue;
            }
            let linked = match (entry.parent, &entry.name) {
                (Some(parent), Some(name)) => tree
                    .get(parent)
                    .and_then(|p| p.child(name.as_bytes()))
                    .is_some_and(|child| child == entry.id),
                _ => false,
            };
            if !linked {
                return Err(Error::Corruption(format!(
                    "entry {} is not linked from its parent",
                    entry.id
                )));
            }
        }

        // every listed child must exist, otherwise resolving would dangle
        for entry in tree.entries() {
            for child in entry.children().into_iter().flat_map(|c| c.values()) {
                if !tree.entries.contains_key(*child) {
                    return Err(Error::Corruption(format!(
                        "directory {} lists missing child {}",
                        entry.id, child
                    )));
                }
            }
        }

        // every entry hangs off the root, exactly once
        let mut reachable = BTreeSet::from([ROOT_ID]);
        let mut stack = vec![ROOT_ID];
        while let Some(id) = stack.pop() {
            let children = tree.get(id).and_then(Entry::children);
            for child in children.into_iter().flat_map(|c| c.values()) {
                if !reachable.insert(*child) {
                    return Err(Error::Corruption(format!(
                        "entry {} is listed more than once",
                        child
                    )));
                }
                stack.push(*child);
            }
        }
        if reachable.len() != tree.len() {
            return Err(Error::Corruption(format!(
                "{} entries are not reachable from the root",
                tree.len() - reachable.len()
            )));
        }

        Ok(tree)
    }

    /// The id the next created entry has to use (at least).
    pub fn next_id(&self) -> EntryId {
        self.next_id
    }

    /// Number of entries, including the root.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    pub fn get(&self, id: EntryId) -> Option<&Entry> {
        self.entries.get(id).map(AsRef::as_ref)
    }

    /// Whether both trees hold the very same allocation for an entry.
    pub fn shares_entry(&self, other: &EntryTree, id: EntryId) -> bool {
        match (self.entries.get(id), other.entries.get(id)) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// All entries in id order.
    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter().map(|(_, e)| e.as_ref())
    }

    /// Walks names from the root.
    pub fn resolve(&self, path: &Path) -> Option<&Entry> {
        let mut current = self.get(ROOT_ID)?;
        for name in path.components_bytes() {
            current = self.get(current.child(name)?)?;
        }
        Some(current)
    }

    pub fn path_of(&self, id: EntryId) -> Option<PathBuf> {
        let mut names = Vec::new();
        let mut current = self.get(id)?;
        while let Some(parent) = current.parent {
            names.push(current.name.as_ref()?);
            current = self.get(parent)?;
        }

        let mut path = PathBuf::new();
        for name in names.into_iter().rev() {
            path.push(name);
        }
        Some(path)
    }

    /// The children of a directory, ordered by name.
    pub fn list(&self, id: EntryId) -> Option<Vec<&Entry>> {
        let children = self.get(id)?.children()?;
        Some(children.values().filter_map(|c| self.get(*c)).collect())
    }

    /// The entry and everything below it, parents before children.
    pub fn descendants(&self, id: EntryId) -> Vec<EntryId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            let Some(entry) = self.get(id) else {
                continue;
            };
            out.push(id);
            if let Some(children) = entry.children() {
                stack.extend(children.values().rev());
            }
        }
        out
    }

    /// Whether `ancestor` is `id` itself or one of its ancestors.
    pub fn is_ancestor_or_self(&self, ancestor: EntryId, id: EntryId) -> bool {
        let mut current = Some(id);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.get(id).and_then(|e| e.parent);
        }
        false
    }

    /// Applies all records of a change set, producing the next tree.
    /// Any failing record rejects the whole change set.
    pub fn apply_change_set(&self, change_set: &ChangeSet) -> Result<EntryTree, Error> {
        Ok(self.apply_tracked(change_set)?.0)
    }

    /// Like [EntryTree::apply_change_set], but also returns the paths the
    /// change set touched. An empty change set touches the root.
    pub fn apply_tracked(&self, change_set: &ChangeSet) -> Result<(EntryTree, Vec<PathBuf>), Error> {
        let mut tree = self.clone();
        let mut touched = BTreeSet::new();

        if change_set.records.is_empty() {
            touched.insert(PathBuf::new());
        }

        for record in &change_set.records {
            tree.apply_record(record, change_set.timestamp, &mut touched)
                .map_err(|e| match e {
                    Error::Conflict(msg) => {
                        Error::Conflict(format!("version {}: {}", change_set.version, msg))
                    }
                    Error::NotFound(msg) => {
                        Error::NotFound(format!("version {}: {}", change_set.version, msg))
                    }
                    e => e,
                })?;
        }

        Ok((tree, touched.into_iter().collect()))
    }

    /// Applies a single record in place. Only ever called on a private clone,
    /// the copy-on-write arena keeps earlier trees intact.
    pub(crate) fn apply_record(
        &mut self,
        record: &ChangeRecord,
        timestamp: u64,
        touched: &mut BTreeSet<PathBuf>,
    ) -> Result<(), Error> {
        trace!(?record, "applying record");

        match record {
            ChangeRecord::Create {
                id,
                parent,
                name,
                kind,
            } => {
                let dir = self
                    .get(*parent)
                    .ok_or_else(|| Error::NotFound(format!("parent {} of {}", parent, name)))?;
                let Some(children) = dir.children() else {
                    return Err(Error::Conflict(format!(
                        "can't create {} below file {}",
                        name, parent
                    )));
                };
                if children.contains_key(name.as_bytes()) {
                    return Err(Error::Conflict(format!(
                        "{} already exists in {}",
                        name, parent
                    )));
                }
                if *id < self.next_id || self.entries.contains_key(*id) {
                    return Err(Error::Conflict(format!("id {} was already allocated", id)));
                }

                let path = self.existing_path(*parent)?.join(name);

                self.entries.insert(
                    *id,
                    Arc::new(Entry {
                        id: *id,
                        parent: Some(*parent),
                        name: Some(name.clone()),
                        timestamp,
                        kind: match kind {
                            CreateKind::Directory => EntryKind::Directory {
                                children: Default::default(),
                            },
                            CreateKind::File(content) => EntryKind::File {
                                content: content.clone(),
                            },
                        },
                    }),
                );
                self.link(*parent, name.clone(), *id, timestamp)?;
                self.next_id = id + 1;

                touched.insert(path);
            }

            ChangeRecord::Delete { id } => {
                if *id == ROOT_ID {
                    return Err(Error::InvalidRequest("the root can't be deleted".into()));
                }

                let entry = self
                    .entries
                    .get(*id)
                    .cloned()
                    .ok_or_else(|| Error::NotFound(format!("entry {}", id)))?;
                let path = self.existing_path(*id)?;
                let (parent, name) = parent_and_name(&entry)?;

                for id in self.descendants(*id) {
                    self.entries.remove(id);
                }
                self.unlink(parent, name, timestamp)?;

                touched.insert(path);
            }

            ChangeRecord::Rename {
                parent,
                old_name,
                new_name,
            } => {
                let dir = self
                    .get(*parent)
                    .ok_or_else(|| Error::NotFound(format!("directory {}", parent)))?;
                let id = dir.child(old_name.as_bytes()).ok_or_else(|| {
                    Error::NotFound(format!("{} in directory {}", old_name, parent))
                })?;
                if dir.child(new_name.as_bytes()).is_some() {
                    return Err(Error::Conflict(format!(
                        "{} already exists in {}",
                        new_name, parent
                    )));
                }

                let old_path = self.existing_path(id)?;

                self.unlink(*parent, old_name, timestamp)?;
                self.link(*parent, new_name.clone(), id, timestamp)?;
                if let Some(entry) = self.entries.get_mut(id) {
                    entry.name = Some(new_name.clone());
                    entry.timestamp = timestamp;
                }

                touched.insert(self.existing_path(id)?);
                touched.insert(old_path);
            }

            ChangeRecord::Move { id, new_parent } => {
                let entry = self
                    .entries
                    .get(*id)
                    .cloned()
                    .ok_or_else(|| Error::NotFound(format!("entry {}", id)))?;
                let target = self
                    .get(*new_parent)
                    .ok_or_else(|| Error::NotFound(format!("directory {}", new_parent)))?;
                if !target.is_directory() {
                    return Err(Error::Conflict(format!(
                        "can't move {} below file {}",
                        id, new_parent
                    )));
                }
                if self.is_ancestor_or_self(*id, *new_parent) {
                    return Err(Error::Conflict(format!(
                        "moving {} below {} would make it its own ancestor",
                        id, new_parent
                    )));
                }

                let (old_parent, name) = parent_and_name(&entry)?;
                let old_path = self.existing_path(*id)?;

                if old_parent == *new_parent {
                    touched.insert(old_path);
                    return Ok(());
                }
                if target.child(name.as_bytes()).is_some() {
                    return Err(Error::Conflict(format!(
                        "{} already exists in {}",
                        name, new_parent
                    )));
                }

                self.unlink(old_parent, name, timestamp)?;
                self.link(*new_parent, name.clone(), *id, timestamp)?;
                if let Some(entry) = self.entries.get_mut(*id) {
                    entry.parent = Some(*new_parent);
                    entry.timestamp = timestamp;
                }

                touched.insert(self.existing_path(*id)?);
                touched.insert(old_path);
            }

            ChangeRecord::SetContent { id, content } => {
                let path = self
                    .path_of(*id)
                    .ok_or_else(|| Error::NotFound(format!("entry {}", id)))?;
                let entry = self
                    .entries
                    .get_mut(*id)
                    .ok_or_else(|| Error::NotFound(format!("entry {}", id)))?;

                match &mut entry.kind {
                    EntryKind::File { content: c } => *c = content.clone(),
                    EntryKind::Directory { .. } => {
                        return Err(Error::Conflict(format!("{} is a directory", path)))
                    }
                }
                entry.timestamp = timestamp;

                touched.insert(path);
            }
        }

        Ok(())
    }

    fn existing_path(&self, id: EntryId) -> Result<PathBuf, Error> {
        self.path_of(id)
            .ok_or_else(|| Error::NotFound(format!("entry {}", id)))
    }

    fn link(
        &mut self,
        parent: EntryId,
        name: PathComponent,
        id: EntryId,
        timestamp: u64,
    ) -> Result<(), Error> {
        let dir = self
            .entries
            .get_mut(parent)
            .ok_or_else(|| Error::NotFound(format!("directory {}", parent)))?;
        match &mut dir.kind {
            EntryKind::Directory { children } => {
                Arc::make_mut(children).insert(name, id);
            }
            EntryKind::File { .. } => {
                return Err(Error::Conflict(format!("{} is not a directory", parent)))
            }
        }
        dir.timestamp = timestamp;
        Ok(())
    }

    fn unlink(&mut self, parent: EntryId, name: &PathComponent, timestamp: u64) -> Result<(), Error> {
        let dir = self
            .entries
            .get_mut(parent)
            .ok_or_else(|| Error::NotFound(format!("directory {}", parent)))?;
        match &mut dir.kind {
            EntryKind::Directory { children } => {
                Arc::make_mut(children).remove(name.as_bytes());
            }
            EntryKind::File { .. } => {
                return Err(Error::Conflict(format!("{} is not a directory", parent)))
            }
        }
        dir.timestamp = timestamp;
        Ok(())
    }
}

fn parent_and_name(entry: &Entry) -> Result<(EntryId, &PathComponent), Error> {
    match (entry.parent, &entry.name) {
        (Some(parent), Some(name)) => Ok((parent, name)),
        _ => Err(Error::InvalidRequest(format!(
            "entry {} is the root",
            entry.id
        ))),
    }
}
