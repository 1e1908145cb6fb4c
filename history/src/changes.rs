//! Change records and change sets, the unit of the change log.
use crate::{content::Content, path::PathComponent, tree::EntryId};

/// What a [ChangeRecord::Create] brings into existence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CreateKind {
    Directory,
    File(Content),
}

/// One atomic mutation of an entry tree.
///
/// Records refer to entries by id. The id of a created entry is part of the
/// record, so replaying a log never depends on allocation order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeRecord {
    Create {
        id: EntryId,
        parent: EntryId,
        name: PathComponent,
        kind: CreateKind,
    },
    /// Removes the entry and everything below it.
    Delete { id: EntryId },
    Rename {
        parent: EntryId,
        old_name: PathComponent,
        new_name: PathComponent,
    },
    Move { id: EntryId, new_parent: EntryId },
    SetContent { id: EntryId, content: Content },
}

/// An ordered list of records applied atomically, and the unit labels point to.
///
/// Versions start at 1 and have no gaps; version 0 is the empty tree.
/// A change set without records but with a name is a checkpoint label.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeSet {
    pub version: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub name: Option<String>,
    pub records: Vec<ChangeRecord>,
}

impl ChangeSet {
    pub fn is_checkpoint_label(&self) -> bool {
        self.records.is_empty() && self.name.is_some()
    }
}

/// Milliseconds since the Unix epoch, as used for change set timestamps.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
