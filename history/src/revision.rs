use bytes::Bytes;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::trace;

use crate::contentstore::ContentStore;
use crate::path::{Path, PathBuf};
use crate::tree::{Entry, EntryId, EntryTree};
use crate::Error;

/// An [EntryTree] materialized for one version.
///
/// Revisions are handed out as `Arc<Revision>` snapshots. Holding one never
/// blocks the writer, and a snapshot never changes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Revision {
    pub version: u64,
    pub tree: EntryTree,
}

impl Revision {
    pub fn new(version: u64, tree: EntryTree) -> Self {
        Self { version, tree }
    }

    pub fn has_entry(&self, path: &Path) -> bool {
        self.tree.resolve(path).is_some()
    }

    pub fn find_entry(&self, path: &Path) -> Option<Entry> {
        self.tree.resolve(path).cloned()
    }

    /// The children of the directory at `path`, ordered by name.
    /// None if there is no such directory.
    pub fn list_directory(&self, path: &Path) -> Option<Vec<Entry>> {
        let dir = self.tree.resolve(path)?;
        Some(self.tree.list(dir.id)?.into_iter().cloned().collect())
    }

    pub fn path_of(&self, id: EntryId) -> Option<PathBuf> {
        self.tree.path_of(id)
    }
}

/// The payload of a file entry, None for directories.
pub async fn content<CS: ContentStore + ?Sized>(
    entry: &Entry,
    store: &CS,
) -> Result<Option<Bytes>, Error> {
    match entry.content() {
        Some(content) => Ok(Some(content.load(store).await?)),
        None => Ok(None),
    }
}

/// Keeps recently materialized revisions, plus one anchor revision every
/// `anchor_interval` versions to replay from.
pub struct RevisionCache {
    lru: Mutex<LruCache<u64, Arc<Revision>>>,
    anchors: RwLock<BTreeMap<u64, Arc<Revision>>>,
    anchor_interval: u64,
}

impl RevisionCache {
    pub fn new(capacity: NonZeroUsize, anchor_interval: u64) -> Self {
        Self {
            lru: Mutex::new(LruCache::new(capacity)),
            anchors: RwLock::new(BTreeMap::new()),
            anchor_interval: anchor_interval.max(1),
        }
    }

    pub fn get(&self, version: u64) -> Option<Arc<Revision>> {
        if let Some(revision) = self.lru.lock().get(&version) {
            return Some(revision.clone());
        }
        self.anchors.read().get(&version).cloned()
    }

    pub fn insert(&self, revision: Arc<Revision>) {
        if revision.version % self.anchor_interval == 0 {
            self.anchors
                .write()
                .insert(revision.version, revision.clone());
        }
        self.lru.lock().put(revision.version, revision);
    }

    /// The newest cached revision at or below `version`.
    pub fn nearest_at_or_below(&self, version: u64) -> Option<Arc<Revision>> {
        let from_lru = self
            .lru
            .lock()
            .iter()
            .filter(|(v, _)| **v <= version)
            .max_by_key(|(v, _)| **v)
            .map(|(_, r)| r.clone());

        let from_anchors = self
            .anchors
            .read()
            .range(..=version)
            .next_back()
            .map(|(_, r)| r.clone());

        let nearest = match (from_lru, from_anchors) {
            (Some(a), Some(b)) => Some(if a.version >= b.version { a } else { b }),
            (a, b) => a.or(b),
        };
        trace!(version, found = ?nearest.as_ref().map(|r| r.version), "nearest cached revision");
        nearest
    }
}
