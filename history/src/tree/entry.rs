use std::{collections::BTreeMap, sync::Arc};

use crate::{content::Content, path::PathComponent};

/// Identifies an entry for its whole lifetime, across renames and moves.
/// Ids are allocated once and never reused.
pub type EntryId = u64;

/// The id of the root directory, which always exists.
pub const ROOT_ID: EntryId = 0;

/// A node in an [super::EntryTree].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub id: EntryId,
    /// None only for the root.
    pub parent: Option<EntryId>,
    /// None only for the root.
    pub name: Option<PathComponent>,
    /// Last modification, in milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub kind: EntryKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Directory {
        children: Arc<BTreeMap<PathComponent, EntryId>>,
    },
    File {
        content: Content,
    },
}

impl Entry {
    pub(crate) fn root() -> Self {
        Self {
            id: ROOT_ID,
            parent: None,
            name: None,
            timestamp: 0,
            kind: EntryKind::Directory {
                children: Default::default(),
            },
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, EntryKind::Directory { .. })
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, EntryKind::File { .. })
    }

    /// The content reference, for files.
    pub fn content(&self) -> Option<&Content> {
        match &self.kind {
            EntryKind::File { content } => Some(content),
            EntryKind::Directory { .. } => None,
        }
    }

    /// The child map, for directories.
    pub fn children(&self) -> Option<&BTreeMap<PathComponent, EntryId>> {
        match &self.kind {
            EntryKind::Directory { children } => Some(children),
            EntryKind::File { .. } => None,
        }
    }

    pub fn child(&self, name: &[u8]) -> Option<EntryId> {
        self.children()?.get(name).copied()
    }
}
