use bytes::Bytes;
use futures::TryStreamExt;
use std::num::NonZeroUsize;
use tempfile::TempDir;

use super::{changed, created, current_content, p};
use crate::changelog::{ChangeLog, FileChangeLog};
use crate::changes::ChangeSet;
use crate::feed::Command;
use crate::index::SUMMARIES_TABLE;
use crate::tree::EntryTree;
use crate::{Error, HistoryConfig, LocalHistory};

async fn write_versions(history: &LocalHistory, n: u8) {
    history
        .apply(Command::new(vec![created("f", vec![0u8])]))
        .await
        .unwrap();
    write_versions_from(history, 1, n).await;
}

/// Changes `f` and adds a file per version, for `from..n`.
async fn write_versions_from(history: &LocalHistory, from: u8, n: u8) {
    for i in from..n {
        history
            .apply(Command::new(vec![
                changed("f", vec![i]),
                created(&format!("dir/{}", i), vec![i; 8]),
            ]))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn survives_restart() {
    let tmpdir = TempDir::new().unwrap();

    let history = LocalHistory::open(tmpdir.path(), HistoryConfig::default())
        .await
        .unwrap();
    write_versions(&history, 3).await;
    history.put_label("before restart").await.unwrap();
    history
        .label_change_set(2, Some("important".into()))
        .await
        .unwrap();

    let log_before = history.log().await.unwrap();
    let tree_before = history.current();
    history.close().await.unwrap();

    let history = LocalHistory::open(tmpdir.path(), HistoryConfig::default())
        .await
        .unwrap();
    assert_eq!(4, history.current_version());
    assert_eq!(log_before, history.log().await.unwrap());
    assert_eq!(tree_before.tree, history.current().tree);
    assert_eq!(
        Some(Bytes::from(vec![2u8])),
        current_content(&history, "f").await
    );

    // and history carries on
    assert_eq!(
        Some(5),
        history
            .apply(Command::new(vec![changed("f", vec![9u8])]))
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn cold_replay_equals_checkpoint() {
    let tmpdir = TempDir::new().unwrap();
    let config = HistoryConfig {
        checkpoint_interval: 2,
        revision_cache_size: NonZeroUsize::new(1).unwrap(),
        ..Default::default()
    };

    let history = LocalHistory::open(tmpdir.path(), config.clone())
        .await
        .unwrap();
    write_versions(&history, 7).await;
    history.close().await.unwrap();

    // replay the log from scratch
    let log = FileChangeLog::open(tmpdir.path().join("changes.log"))
        .await
        .unwrap();
    let change_sets: Vec<ChangeSet> = log.read_from(1).try_collect().await.unwrap();
    drop(log);
    let mut cold = vec![EntryTree::new()];
    for change_set in &change_sets {
        let next = cold.last().unwrap().apply_change_set(change_set).unwrap();
        cold.push(next);
    }

    let history = LocalHistory::open(tmpdir.path(), config).await.unwrap();
    for version in [5, 3, 2, 1, 6, 0] {
        let revision = history.revision_at(version).await.unwrap().unwrap();
        assert_eq!(version, revision.version);
        assert_eq!(cold[version as usize], revision.tree, "version {}", version);
    }
}

#[tokio::test]
async fn truncated_log_is_recovered() {
    let tmpdir = TempDir::new().unwrap();
    let log_path = tmpdir.path().join("changes.log");

    let history = LocalHistory::open(tmpdir.path(), HistoryConfig::default())
        .await
        .unwrap();
    write_versions(&history, 3).await;
    history.close().await.unwrap();

    // a crash in the middle of writing the last frame
    let len = std::fs::metadata(&log_path).unwrap().len();
    let f = std::fs::OpenOptions::new().write(true).open(&log_path).unwrap();
    f.set_len(len - 3).unwrap();
    drop(f);

    let history = LocalHistory::open(tmpdir.path(), HistoryConfig::default())
        .await
        .unwrap();
    assert_eq!(2, history.current_version());
    assert_eq!(
        Some(Bytes::from(vec![1u8])),
        current_content(&history, "f").await
    );
    // the summary of the lost version is gone too
    assert_eq!(2, history.log().await.unwrap().len());
    assert!(!history.has_entry(&p("dir/2")));

    assert_eq!(
        Some(3),
        history
            .apply(Command::new(vec![changed("f", vec![7u8])]))
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn corrupted_log_is_reported() {
    let tmpdir = TempDir::new().unwrap();
    let log_path = tmpdir.path().join("changes.log");

    let history = LocalHistory::open(tmpdir.path(), HistoryConfig::default())
        .await
        .unwrap();
    write_versions(&history, 3).await;
    history.close().await.unwrap();

    // flip a payload byte of the first frame, past the file and frame headers
    let mut data = std::fs::read(&log_path).unwrap();
    data[8 + 8 + 2] ^= 0xff;
    std::fs::write(&log_path, &data).unwrap();

    assert!(matches!(
        LocalHistory::open(tmpdir.path(), HistoryConfig::default()).await,
        Err(Error::Corruption(_))
    ));
}

#[tokio::test]
async fn missing_summaries_are_recomputed() {
    let tmpdir = TempDir::new().unwrap();

    let history = LocalHistory::open(tmpdir.path(), HistoryConfig::default())
        .await
        .unwrap();
    write_versions(&history, 3).await;
    let log_before = history.log().await.unwrap();
    history.close().await.unwrap();

    // the index is derived data, except for explicit labels
    std::fs::remove_file(tmpdir.path().join("index.redb")).unwrap();

    let history = LocalHistory::open(tmpdir.path(), HistoryConfig::default())
        .await
        .unwrap();
    assert_eq!(log_before, history.log().await.unwrap());
    assert_eq!(
        vec![3, 2, 1],
        history
            .labels_for(&p("f"))
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.version)
            .collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn damaged_frame_length_is_reported() {
    let tmpdir = TempDir::new().unwrap();
    let log_path = tmpdir.path().join("changes.log");

    let history = LocalHistory::open(tmpdir.path(), HistoryConfig::default())
        .await
        .unwrap();
    history
        .apply(Command::new(vec![created("f", vec![0u8])]))
        .await
        .unwrap();
    let first_end = std::fs::metadata(&log_path).unwrap().len();
    write_versions_from(&history, 1, 3).await;
    history.close().await.unwrap();

    // the length of the second frame now runs past the end of the file
    let mut data = std::fs::read(&log_path).unwrap();
    data[first_end as usize + 3] ^= 0x01;
    std::fs::write(&log_path, &data).unwrap();

    assert!(matches!(
        LocalHistory::open(tmpdir.path(), HistoryConfig::default()).await,
        Err(Error::Corruption(_))
    ));
    assert_eq!(
        data.len() as u64,
        std::fs::metadata(&log_path).unwrap().len()
    );
}

#[tokio::test]
async fn summary_gap_is_recomputed() {
    let tmpdir = TempDir::new().unwrap();

    let history = LocalHistory::open(tmpdir.path(), HistoryConfig::default())
        .await
        .unwrap();
    write_versions(&history, 3).await;
    let log_before = history.log().await.unwrap();
    history.close().await.unwrap();

    // a summary lost in the middle, the newest one is still there
    {
        let db = redb::Database::create(tmpdir.path().join("index.redb")).unwrap();
        let txn = db.begin_write().unwrap();
        {
            let mut table = txn.open_table(SUMMARIES_TABLE).unwrap();
            assert!(table.remove(2u64).unwrap().is_some());
        }
        txn.commit().unwrap();
    }

    let history = LocalHistory::open(tmpdir.path(), HistoryConfig::default())
        .await
        .unwrap();
    assert_eq!(log_before, history.log().await.unwrap());
    assert_eq!(
        vec![3, 2, 1],
        history
            .labels_for(&p("f"))
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.version)
            .collect::<Vec<_>>()
    );
}
