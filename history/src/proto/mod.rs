//! Persisted message formats.
//!
//! Change sets (in the change log), checkpointed trees, change set summaries
//! and explicit labels (in the index) are encoded with protobuf. Decoding goes
//! through the `TryFrom` conversions below, which validate everything and
//! report anything unexpected as [Error::Corruption].
use std::collections::BTreeMap;
use std::sync::Arc;

use prost::bytes::Bytes;

use crate::changes::{self, CreateKind};
use crate::path::{PathBuf, PathComponent};
use crate::tree::{self, EntryKind, EntryTree, ROOT_ID};
use crate::{B3Digest, Error};

#[derive(Clone, PartialEq, prost::Message)]
pub struct ChangeSet {
    #[prost(uint64, tag = "1")]
    pub version: u64,
    #[prost(uint64, tag = "2")]
    pub timestamp: u64,
    #[prost(string, optional, tag = "3")]
    pub name: Option<String>,
    #[prost(message, repeated, tag = "4")]
    pub records: Vec<ChangeRecord>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ChangeRecord {
    #[prost(oneof = "change_record::Record", tags = "1, 2, 3, 4, 5")]
    pub record: Option<change_record::Record>,
}

pub mod change_record {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Record {
        #[prost(message, tag = "1")]
        Create(super::Create),
        #[prost(message, tag = "2")]
        Delete(super::Delete),
        #[prost(message, tag = "3")]
        Rename(super::Rename),
        #[prost(message, tag = "4")]
        Move(super::Move),
        #[prost(message, tag = "5")]
        SetContent(super::SetContent),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Create {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(uint64, tag = "2")]
    pub parent: u64,
    #[prost(bytes = "bytes", tag = "3")]
    pub name: Bytes,
    #[prost(bool, tag = "4")]
    pub directory: bool,
    /// Set for files only.
    #[prost(message, optional, tag = "5")]
    pub content: Option<Content>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Delete {
    #[prost(uint64, tag = "1")]
    pub id: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Rename {
    #[prost(uint64, tag = "1")]
    pub parent: u64,
    #[prost(bytes = "bytes", tag = "2")]
    pub old_name: Bytes,
    #[prost(bytes = "bytes", tag = "3")]
    pub new_name: Bytes,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Move {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(uint64, tag = "2")]
    pub new_parent: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SetContent {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(message, optional, tag = "2")]
    pub content: Option<Content>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Content {
    #[prost(oneof = "content::Payload", tags = "1, 2")]
    pub payload: Option<content::Payload>,
    #[prost(uint64, tag = "3")]
    pub size: u64,
}

pub mod content {
    use prost::bytes::Bytes;

    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Payload {
        #[prost(bytes = "bytes", tag = "1")]
        Inline(Bytes),
        /// blake3 digest of a payload in the content store.
        #[prost(bytes = "bytes", tag = "2")]
        Digest(Bytes),
    }
}

/// A checkpointed [EntryTree]. Child lists are implied by the parent links.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Tree {
    #[prost(uint64, tag = "1")]
    pub next_id: u64,
    #[prost(message, repeated, tag = "2")]
    pub entries: Vec<Entry>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Entry {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(uint64, optional, tag = "2")]
    pub parent: Option<u64>,
    #[prost(bytes = "bytes", tag = "3")]
    pub name: Bytes,
    #[prost(uint64, tag = "4")]
    pub timestamp: u64,
    #[prost(bool, tag = "5")]
    pub directory: bool,
    #[prost(message, optional, tag = "6")]
    pub content: Option<Content>,
}

/// What the index remembers about a change set.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Summary {
    #[prost(uint64, tag = "1")]
    pub timestamp: u64,
    #[prost(string, optional, tag = "2")]
    pub name: Option<String>,
    #[prost(bytes = "bytes", repeated, tag = "3")]
    pub touched: Vec<Bytes>,
}

/// An explicit label.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Label {
    #[prost(uint64, tag = "1")]
    pub version: u64,
    #[prost(string, optional, tag = "2")]
    pub name: Option<String>,
    #[prost(uint64, tag = "3")]
    pub timestamp: u64,
}

fn component(name: Bytes) -> Result<PathComponent, Error> {
    PathComponent::try_from(name).map_err(|e| Error::Corruption(e.to_string()))
}

impl From<&crate::content::Content> for Content {
    fn from(value: &crate::content::Content) -> Self {
        match value {
            crate::content::Content::Inline(data) => Content {
                payload: Some(content::Payload::Inline(data.clone())),
                size: data.len() as u64,
            },
            crate::content::Content::Stored { digest, size } => Content {
                payload: Some(content::Payload::Digest(digest.clone().into())),
                size: *size,
            },
        }
    }
}

impl TryFrom<Content> for crate::content::Content {
    type Error = Error;

    fn try_from(value: Content) -> Result<Self, Self::Error> {
        match value.payload {
            Some(content::Payload::Inline(data)) => {
                if data.len() as u64 != value.size {
                    return Err(Error::Corruption(format!(
                        "inline content of {} bytes claims size {}",
                        data.len(),
                        value.size
                    )));
                }
                Ok(Self::Inline(data))
            }
            Some(content::Payload::Digest(digest)) => Ok(Self::Stored {
                digest: B3Digest::try_from(digest)?,
                size: value.size,
            }),
            None => Err(Error::Corruption("content without payload".into())),
        }
    }
}

fn required_content(content: Option<Content>) -> Result<crate::content::Content, Error> {
    content
        .ok_or_else(|| Error::Corruption("missing content".into()))?
        .try_into()
}

impl From<&changes::ChangeRecord> for ChangeRecord {
    fn from(value: &changes::ChangeRecord) -> Self {
        use change_record::Record;

        let record = match value {
            changes::ChangeRecord::Create {
                id,
                parent,
                name,
                kind,
            } => Record::Create(Create {
                id: *id,
                parent: *parent,
                name: name.clone().into(),
                directory: matches!(kind, CreateKind::Directory),
                content: match kind {
                    CreateKind::Directory => None,
                    CreateKind::File(content) => Some(content.into()),
                },
            }),
            changes::ChangeRecord::Delete { id } => Record::Delete(Delete { id: *id }),
            changes::ChangeRecord::Rename {
                parent,
                old_name,
                new_name,
            } => Record::Rename(Rename {
                parent: *parent,
                old_name: old_name.clone().into(),
                new_name: new_name.clone().into(),
            }),
            changes::ChangeRecord::Move { id, new_parent } => Record::Move(Move {
                id: *id,
                new_parent: *new_parent,
            }),
            changes::ChangeRecord::SetContent { id, content } => Record::SetContent(SetContent {
                id: *id,
                content: Some(content.into()),
            }),
        };

        ChangeRecord {
            record: Some(record),
        }
    }
}

impl TryFrom<ChangeRecord> for changes::ChangeRecord {
    type Error = Error;

    fn try_from(value: ChangeRecord) -> Result<Self, Self::Error> {
        use change_record::Record;

        Ok(
            match value
                .record
                .ok_or_else(|| Error::Corruption("empty change record".into()))?
            {
                Record::Create(c) => Self::Create {
                    id: c.id,
                    parent: c.parent,
                    name: component(c.name)?,
                    kind: if c.directory {
                        if c.content.is_some() {
                            return Err(Error::Corruption(format!(
                                "directory {} carries content",
                                c.id
                            )));
                        }
                        CreateKind::Directory
                    } else {
                        CreateKind::File(required_content(c.content)?)
                    },
                },
                Record::Delete(d) => Self::Delete { id: d.id },
                Record::Rename(r) => Self::Rename {
                    parent: r.parent,
                    old_name: component(r.old_name)?,
                    new_name: component(r.new_name)?,
                },
                Record::Move(m) => Self::Move {
                    id: m.id,
                    new_parent: m.new_parent,
                },
                Record::SetContent(s) => Self::SetContent {
                    id: s.id,
                    content: required_content(s.content)?,
                },
            },
        )
    }
}

impl From<&changes::ChangeSet> for ChangeSet {
    fn from(value: &changes::ChangeSet) -> Self {
        ChangeSet {
            version: value.version,
            timestamp: value.timestamp,
            name: value.name.clone(),
            records: value.records.iter().map(Into::into).collect(),
        }
    }
}

impl TryFrom<ChangeSet> for changes::ChangeSet {
    type Error = Error;

    fn try_from(value: ChangeSet) -> Result<Self, Self::Error> {
        if value.version == 0 {
            return Err(Error::Corruption("change set with version 0".into()));
        }

        Ok(Self {
            version: value.version,
            timestamp: value.timestamp,
            name: value.name,
            records: value
                .records
                .into_iter()
                .map(TryInto::try_into)
                .collect::<Result<_, _>>()?,
        })
    }
}

impl From<&EntryTree> for Tree {
    fn from(value: &EntryTree) -> Self {
        Tree {
            next_id: value.next_id(),
            entries: value
                .entries()
                .map(|e| Entry {
                    id: e.id,
                    parent: e.parent,
                    name: e.name.clone().map(Into::into).unwrap_or_default(),
                    timestamp: e.timestamp,
                    directory: e.is_directory(),
                    content: e.content().map(Into::into),
                })
                .collect(),
        }
    }
}

impl TryFrom<Tree> for EntryTree {
    type Error = Error;

    fn try_from(value: Tree) -> Result<Self, Self::Error> {
        // Child lists are rebuilt from the parent links.
        let mut children: BTreeMap<u64, BTreeMap<PathComponent, u64>> = BTreeMap::new();
        let mut decoded = Vec::with_capacity(value.entries.len());

        for e in value.entries {
            let name = match (e.id, e.parent) {
                (ROOT_ID, None) => None,
                (id, Some(parent)) if id != ROOT_ID => {
                    let name = component(e.name)?;
                    if children
                        .entry(parent)
                        .or_default()
                        .insert(name.clone(), id)
                        .is_some()
                    {
                        return Err(Error::Corruption(format!(
                            "duplicate name {} below {}",
                            name, parent
                        )));
                    }
                    Some(name)
                }
                (id, _) => {
                    return Err(Error::Corruption(format!(
                        "entry {} has an invalid parent link",
                        id
                    )))
                }
            };

            let kind = if e.directory {
                EntryKind::Directory {
                    children: Default::default(),
                }
            } else {
                EntryKind::File {
                    content: required_content(e.content)?,
                }
            };

            decoded.push(tree::Entry {
                id: e.id,
                parent: e.parent,
                name,
                timestamp: e.timestamp,
                kind,
            });
        }

        for entry in decoded.iter_mut() {
            if let Some(list) = children.remove(&entry.id) {
                match &mut entry.kind {
                    EntryKind::Directory { children } => *children = Arc::new(list),
                    EntryKind::File { .. } => {
                        return Err(Error::Corruption(format!(
                            "file {} has children",
                            entry.id
                        )))
                    }
                }
            }
        }

        if let Some(parent) = children.keys().next() {
            return Err(Error::Corruption(format!(
                "entries below missing parent {}",
                parent
            )));
        }

        EntryTree::from_entries(decoded, value.next_id)
    }
}

/// Decodes the touched paths of a [Summary].
pub fn decode_touched(touched: &[Bytes]) -> Result<Vec<PathBuf>, Error> {
    touched
        .iter()
        .map(|p| PathBuf::try_from(p.as_ref()).map_err(|e| Error::Corruption(e.to_string())))
        .collect()
}
