//! Labels, and which change sets they apply to.
use std::collections::BTreeMap;

use crate::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LabelKind {
    /// Every change set has one, carrying the change set's own name.
    Implicit,
    /// Created later on, pointing at an existing version.
    Explicit,
}

/// A named or anonymous bookmark to a version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Label {
    pub version: u64,
    pub name: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub kind: LabelKind,
}

/// What the index keeps per change set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Summary {
    pub version: u64,
    pub timestamp: u64,
    pub name: Option<String>,
    /// Sorted and free of duplicates.
    pub touched: Vec<PathBuf>,
}

impl Summary {
    /// Whether the change set touched `path` itself or one of its ancestors.
    pub fn touches(&self, path: &Path) -> bool {
        self.touched.iter().any(|t| path.starts_with(t))
    }

    pub fn implicit_label(&self) -> Label {
        Label {
            version: self.version,
            name: self.name.clone(),
            timestamp: self.timestamp,
            kind: LabelKind::Implicit,
        }
    }
}

/// Interleaves explicit labels with the implicit labels of the given
/// summaries, which have to be ordered newest first.
///
/// Explicit labels are expected in creation order per version. For each
/// version they are emitted newest first, ahead of the implicit label.
pub(crate) fn merge(
    summaries: impl IntoIterator<Item = Summary>,
    explicit: &BTreeMap<u64, Vec<Label>>,
) -> Vec<Label> {
    let mut labels = Vec::new();
    for summary in summaries {
        if let Some(explicit) = explicit.get(&summary.version) {
            labels.extend(explicit.iter().rev().cloned());
        }
        labels.push(summary.implicit_label());
    }
    labels
}
