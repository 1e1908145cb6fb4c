//! Scenarios every [ChangeLog] implementation has to pass.
use futures::TryStreamExt;
use rstest::*;
use rstest_reuse::{self, *};
use std::sync::Arc;

use super::{ChangeLog, FileChangeLog, MemoryChangeLog};
use crate::changes::{ChangeRecord, ChangeSet};
use crate::Error;

fn change_set(version: u64) -> ChangeSet {
    ChangeSet {
        version,
        timestamp: 1000 + version,
        name: (version % 2 == 0).then(|| format!("even {}", version)),
        records: vec![ChangeRecord::Delete { id: version }],
    }
}

async fn memory() -> (Arc<dyn ChangeLog>, Option<tempfile::TempDir>) {
    (Arc::new(MemoryChangeLog::default()), None)
}

async fn file() -> (Arc<dyn ChangeLog>, Option<tempfile::TempDir>) {
    let tmpdir = tempfile::TempDir::new().unwrap();
    let log = FileChangeLog::open(tmpdir.path().join("changes.log"))
        .await
        .unwrap();
    (Arc::new(log), Some(tmpdir))
}

#[template]
#[rstest]
#[case::memory(memory().await)]
#[case::file(file().await)]
pub fn change_logs(#[case] log: (Arc<dyn ChangeLog>, Option<tempfile::TempDir>)) {}

#[apply(change_logs)]
#[tokio::test]
async fn empty(log: (Arc<dyn ChangeLog>, Option<tempfile::TempDir>)) {
    let (log, _tmpdir) = log;

    assert_eq!(0, log.current_version());
    let all: Vec<ChangeSet> = log.read_from(0).try_collect().await.unwrap();
    assert!(all.is_empty());
}

#[apply(change_logs)]
#[tokio::test]
async fn append_read(log: (Arc<dyn ChangeLog>, Option<tempfile::TempDir>)) {
    let (log, _tmpdir) = log;

    for v in 1..=5 {
        log.append(&change_set(v)).await.expect("must append");
    }
    assert_eq!(5, log.current_version());

    let all: Vec<ChangeSet> = log.read_from(1).try_collect().await.unwrap();
    assert_eq!((1..=5).map(change_set).collect::<Vec<_>>(), all);

    // version 0 reads everything, too
    let all: Vec<ChangeSet> = log.read_from(0).try_collect().await.unwrap();
    assert_eq!(5, all.len());

    let tail: Vec<ChangeSet> = log.read_from(4).try_collect().await.unwrap();
    assert_eq!(vec![change_set(4), change_set(5)], tail);

    let beyond: Vec<ChangeSet> = log.read_from(6).try_collect().await.unwrap();
    assert!(beyond.is_empty());
}

#[apply(change_logs)]
#[tokio::test]
async fn rejects_gaps(log: (Arc<dyn ChangeLog>, Option<tempfile::TempDir>)) {
    let (log, _tmpdir) = log;

    assert!(matches!(
        log.append(&change_set(2)).await,
        Err(Error::Conflict(_))
    ));

    log.append(&change_set(1)).await.unwrap();
    assert!(matches!(
        log.append(&change_set(1)).await,
        Err(Error::Conflict(_))
    ));
    assert_eq!(1, log.current_version());
}

/// A stream covers what was there when it was created.
#[apply(change_logs)]
#[tokio::test]
async fn stream_is_a_snapshot(log: (Arc<dyn ChangeLog>, Option<tempfile::TempDir>)) {
    let (log, _tmpdir) = log;

    log.append(&change_set(1)).await.unwrap();
    let stream = log.read_from(1);
    log.append(&change_set(2)).await.unwrap();

    let read: Vec<ChangeSet> = stream.try_collect().await.unwrap();
    assert_eq!(vec![change_set(1)], read);
}
