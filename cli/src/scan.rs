//! Compares a directory on disk with a recorded revision.
use std::collections::BTreeMap;

use lochist_history::feed::{EventPayload, FeedEvent, TrackingPolicy};
use lochist_history::path::{Path, PathBuf};
use lochist_history::revision::Revision;
use lochist_history::tree::Entry;
use tracing::{debug, instrument, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;
use walkdir::WalkDir;

use crate::Error;

/// Walks `root` and returns the events turning `revision` into what is on
/// disk.
///
/// Deletions come first, and only for the top-most removed entry. Creations
/// follow with parents ahead of their children. Symlinks and other special
/// files are not tracked.
#[instrument(skip_all, fields(root = %root.display(), indicatif.pb_show = 1), err)]
pub async fn scan(
    root: &std::path::Path,
    revision: &Revision,
    policy: &dyn TrackingPolicy,
) -> Result<Vec<FeedEvent>, Error> {
    let span = Span::current();
    span.pb_set_style(&lochist_tracing::PB_SPINNER_STYLE);
    span.pb_set_message("Scanning");
    span.pb_start();

    let live = walk(root, policy)?;

    let mut recorded = BTreeMap::new();
    collect_recorded(revision, Path::ROOT, &mut recorded);

    let mut events = Vec::new();

    let mut deleted: Vec<&PathBuf> = Vec::new();
    for (path, entry) in &recorded {
        let gone = match live.get(path) {
            None => true,
            Some(is_dir) => *is_dir != entry.is_directory(),
        };
        if gone && !deleted.iter().any(|d| path.starts_with(d)) {
            events.push(FeedEvent::Deleted { path: path.clone() });
            deleted.push(path);
        }
    }

    span.pb_set_style(&lochist_tracing::PB_PROGRESS_STYLE);
    span.pb_set_length(live.len() as u64);
    span.pb_set_message("Comparing");

    for (path, is_dir) in &live {
        span.pb_inc(1);

        let known = recorded
            .get(path)
            .filter(|entry| entry.is_directory() == *is_dir);

        if *is_dir {
            if known.is_none() {
                events.push(FeedEvent::Created {
                    path: path.clone(),
                    payload: EventPayload::Directory,
                });
            }
            continue;
        }

        let host_path = path.to_host_path(root);
        let data = tokio::fs::read(&host_path)
            .await
            .map_err(|e| Error::UnableToRead(host_path, e))?;

        match known.and_then(Entry::content) {
            None => events.push(FeedEvent::Created {
                path: path.clone(),
                payload: EventPayload::File(data.into()),
            }),
            Some(content) if !content.matches(&data) => events.push(FeedEvent::ContentChanged {
                path: path.clone(),
                contents: data.into(),
            }),
            Some(_) => {}
        }
    }

    debug!(events = events.len(), "scanned");
    Ok(events)
}

/// The tracked directories and regular files below `root`, mapped to whether
/// they are directories.
fn walk(root: &std::path::Path, policy: &dyn TrackingPolicy) -> Result<BTreeMap<PathBuf, bool>, Error> {
    let mut live = BTreeMap::new();

    let mut it = WalkDir::new(root)
        .follow_links(false)
        .follow_root_links(false)
        .min_depth(1)
        .into_iter();

    while let Some(entry) = it.next() {
        let entry = entry.map_err(|e| Error::UnableToWalk(root.to_path_buf(), e))?;
        let file_type = entry.file_type();
        if !file_type.is_dir() && !file_type.is_file() {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| Error::OutsideRoot(entry.path().to_path_buf()))?;
        let path = PathBuf::from_host_path(relative, false)?;

        if !policy.is_tracked(&path, file_type.is_dir()) {
            if file_type.is_dir() {
                it.skip_current_dir();
            }
            continue;
        }

        live.insert(path, file_type.is_dir());
    }

    Ok(live)
}

fn collect_recorded(revision: &Revision, dir: &Path, out: &mut BTreeMap<PathBuf, Entry>) {
    for entry in revision.list_directory(dir).unwrap_or_default() {
        let Some(name) = entry.name.clone() else {
            continue;
        };
        let path = dir.join(&name);
        if entry.is_directory() {
            collect_recorded(revision, &path, out);
        }
        out.insert(path, entry);
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use lochist_history::feed::{Command, EventPayload, FeedEvent, TrackAll};
    use lochist_history::path::PathBuf;
    use lochist_history::{HistoryConfig, LocalHistory};
    use tempfile::TempDir;

    use super::scan;

    fn p(s: &str) -> PathBuf {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn scan_empty_history() {
        let root = TempDir::new().unwrap();
        fs::create_dir(root.path().join("src")).unwrap();
        fs::write(root.path().join("src/main.rs"), b"fn main() {}").unwrap();

        let history = LocalHistory::new_temporary(HistoryConfig::default())
            .await
            .unwrap();
        let events = scan(root.path(), &history.current(), &TrackAll)
            .await
            .unwrap();

        assert_eq!(
            vec![
                FeedEvent::Created {
                    path: p("src"),
                    payload: EventPayload::Directory,
                },
                FeedEvent::Created {
                    path: p("src/main.rs"),
                    payload: EventPayload::File(b"fn main() {}".as_slice().into()),
                },
            ],
            events
        );
    }

    #[tokio::test]
    async fn scan_against_recorded() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("gone/deeper")).unwrap();
        fs::write(root.path().join("kept"), b"same").unwrap();
        fs::write(root.path().join("edited"), b"before").unwrap();
        fs::write(root.path().join("gone/deeper/f"), b"x").unwrap();

        let history = LocalHistory::new_temporary(HistoryConfig::default())
            .await
            .unwrap();
        let events = scan(root.path(), &history.current(), &TrackAll)
            .await
            .unwrap();
        history.apply(Command::new(events)).await.unwrap();

        fs::remove_dir_all(root.path().join("gone")).unwrap();
        fs::write(root.path().join("edited"), b"after").unwrap();

        let events = scan(root.path(), &history.current(), &TrackAll)
            .await
            .unwrap();
        assert_eq!(
            vec![
                FeedEvent::Deleted { path: p("gone") },
                FeedEvent::ContentChanged {
                    path: p("edited"),
                    contents: b"after".as_slice().into(),
                },
            ],
            events
        );

        // applying them leaves nothing to record
        history.apply(Command::new(events)).await.unwrap();
        assert!(scan(root.path(), &history.current(), &TrackAll)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn scan_skips_excluded() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join(".lochist")).unwrap();
        fs::write(root.path().join(".lochist/changes.log"), b"LHCL").unwrap();
        fs::write(root.path().join("f"), b"f").unwrap();

        let config = HistoryConfig::default();
        let policy = config.tracking_policy().unwrap();
        let history = LocalHistory::new_temporary(config).await.unwrap();

        let events = scan(root.path(), &history.current(), &policy)
            .await
            .unwrap();
        assert_eq!(1, events.len());
    }
}
