//! Scenarios exercising a whole [crate::LocalHistory].
use bytes::Bytes;
use tempfile::TempDir;

use crate::feed::{EventPayload, FeedEvent};
use crate::path::PathBuf;
use crate::{HistoryConfig, LocalHistory};

mod engine;
mod persistence;
mod revert;

pub(crate) fn p(s: &str) -> PathBuf {
    s.parse().unwrap()
}

pub(crate) fn created(path: &str, data: impl Into<Bytes>) -> FeedEvent {
    FeedEvent::Created {
        path: p(path),
        payload: EventPayload::File(data.into()),
    }
}

pub(crate) fn changed(path: &str, data: impl Into<Bytes>) -> FeedEvent {
    FeedEvent::ContentChanged {
        path: p(path),
        contents: data.into(),
    }
}

pub(crate) fn moved(from: &str, to: &str) -> FeedEvent {
    FeedEvent::Moved {
        from: p(from),
        to: p(to),
        payload: None,
    }
}

pub(crate) async fn temporary() -> (LocalHistory, Option<TempDir>) {
    let history = LocalHistory::new_temporary(HistoryConfig::default())
        .await
        .expect("must open");
    (history, None)
}

pub(crate) async fn persistent() -> (LocalHistory, Option<TempDir>) {
    let tmpdir = TempDir::new().unwrap();
    let history = LocalHistory::open(tmpdir.path(), HistoryConfig::default())
        .await
        .expect("must open");
    (history, Some(tmpdir))
}

/// The content of the file at `path` in the current tree.
pub(crate) async fn current_content(history: &LocalHistory, path: &str) -> Option<Bytes> {
    let entry = history.find_entry(&p(path))?;
    history.content(&entry).await.expect("must load")
}
