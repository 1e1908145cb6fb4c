use bytes::Bytes;
use tempfile::TempDir;

use super::{changed, created, current_content, moved, p, temporary};
use crate::feed::{Command, FeedEvent};
use crate::gateway::{Fault, FileSystemGateway, HostFsGateway, MemoryGateway};
use crate::revert::{RevertScope, RevertState};
use crate::{Error, HistoryConfig, LocalHistory};

/// Applies a command to both the history and the live tree.
async fn edit(history: &LocalHistory, gateway: &MemoryGateway, events: Vec<FeedEvent>) -> u64 {
    for event in &events {
        match event {
            FeedEvent::Created {
                path,
                payload: crate::feed::EventPayload::File(data),
            } => gateway.insert_file(path, data.clone()),
            FeedEvent::ContentChanged { path, contents } => {
                gateway.insert_file(path, contents.clone())
            }
            FeedEvent::Moved { from, to, .. } => gateway.rename(from, to).await.unwrap(),
            FeedEvent::Deleted { path } => gateway.delete(path).await.unwrap(),
            other => panic!("unsupported event {:?}", other),
        }
    }
    history
        .apply(Command::new(events))
        .await
        .unwrap()
        .expect("must produce a version")
}

#[tokio::test]
async fn revert_scenario() {
    let (history, _) = temporary().await;
    let gateway = MemoryGateway::new();

    let v1 = edit(&history, &gateway, vec![created("f.txt", vec![1u8])]).await;
    edit(&history, &gateway, vec![changed("f.txt", vec![2u8])]).await;

    let labels = history.labels_for(&p("f.txt")).await.unwrap();
    assert_eq!(
        vec![2, 1],
        labels.iter().map(|l| l.version).collect::<Vec<_>>()
    );

    let report = history
        .revert(v1, RevertScope::Everything, &gateway)
        .await
        .unwrap();
    assert_eq!(RevertState::Done, report.state);
    assert_eq!((1, 1), (report.applied, report.total));
    assert!(report.warnings.is_empty());
    assert_eq!(Some(3), report.recorded_version);

    assert_eq!(
        Some(Bytes::from(vec![1u8])),
        gateway.read(&p("f.txt")).await.unwrap()
    );
    assert_eq!(
        Some(Bytes::from(vec![1u8])),
        current_content(&history, "f.txt").await
    );

    let newest = &history.log().await.unwrap()[0];
    assert_eq!(Some("Revert to version 1"), newest.name.as_deref());
}

#[tokio::test]
async fn revert_swap() {
    let (history, _) = temporary().await;
    let gateway = MemoryGateway::new();

    let v1 = edit(
        &history,
        &gateway,
        vec![created("a", b"A".as_slice()), created("b", b"B".as_slice())],
    )
    .await;
    edit(
        &history,
        &gateway,
        vec![moved("a", "t"), moved("b", "a"), moved("t", "b")],
    )
    .await;
    let a_id = history.find_entry(&p("a")).unwrap().id;

    let report = history
        .revert(v1, RevertScope::Everything, &gateway)
        .await
        .unwrap();
    assert_eq!(RevertState::Done, report.state);

    assert_eq!(Some(Bytes::from_static(b"A")), gateway.read(&p("a")).await.unwrap());
    assert_eq!(Some(Bytes::from_static(b"B")), gateway.read(&p("b")).await.unwrap());
    assert_eq!(2, gateway.snapshot().len());

    // history followed the renames, ids included
    assert_eq!(Some(Bytes::from_static(b"A")), current_content(&history, "a").await);
    assert_eq!(a_id, history.find_entry(&p("b")).unwrap().id);
    assert_eq!(
        history.revision_at(v1).await.unwrap().unwrap().tree.len(),
        history.current().tree.len()
    );
}

#[tokio::test]
async fn revert_scoped_to_path() {
    let (history, _) = temporary().await;
    let gateway = MemoryGateway::new();

    let v1 = edit(
        &history,
        &gateway,
        vec![
            created("src/main.rs", b"old main".as_slice()),
            created("README", b"old readme".as_slice()),
        ],
    )
    .await;
    edit(
        &history,
        &gateway,
        vec![
            changed("src/main.rs", b"new main".as_slice()),
            changed("README", b"new readme".as_slice()),
        ],
    )
    .await;

    let report = history
        .revert(v1, RevertScope::Path(p("src/main.rs")), &gateway)
        .await
        .unwrap();
    assert_eq!(RevertState::Done, report.state);

    assert_eq!(
        Some(Bytes::from_static(b"old main")),
        current_content(&history, "src/main.rs").await
    );
    assert_eq!(
        Some(Bytes::from_static(b"new readme")),
        current_content(&history, "README").await
    );
    assert_eq!(
        Some(Bytes::from_static(b"new readme")),
        gateway.read(&p("README")).await.unwrap()
    );
}

#[tokio::test]
async fn gateway_failure_records_applied_prefix() {
    let (history, _) = temporary().await;
    let gateway = MemoryGateway::new();

    let v1 = edit(
        &history,
        &gateway,
        vec![created("a", b"a".as_slice()), created("b", b"b".as_slice())],
    )
    .await;
    edit(
        &history,
        &gateway,
        vec![
            FeedEvent::Deleted { path: p("a") },
            FeedEvent::Deleted { path: p("b") },
        ],
    )
    .await;

    gateway.inject_fault_after(1, Fault::Fail);
    let mut revert = history
        .start_revert(v1, RevertScope::Everything)
        .await
        .unwrap();
    // planned, nothing has touched the live tree or the history yet
    assert_eq!(RevertState::Diffing, revert.state());
    assert_eq!(2, revert.ops().len());
    assert!(gateway.snapshot().is_empty());
    assert_eq!(2, history.current_version());
    let report = history.run_revert(&mut revert, &gateway).await.unwrap();

    assert_eq!(RevertState::Failed, report.state);
    assert_eq!((1, 2), (report.applied, report.total));
    assert!(matches!(report.failure, Some(Error::Gateway { .. })));
    assert_eq!(Some(3), report.recorded_version);
    assert!(history.has_entry(&p("a")));
    assert!(!history.has_entry(&p("b")));

    // resuming picks up at the failed step
    gateway.clear_fault();
    let report = history.run_revert(&mut revert, &gateway).await.unwrap();
    assert_eq!(RevertState::Done, report.state);
    assert_eq!((2, 2), (report.applied, report.total));
    assert_eq!(Some(4), report.recorded_version);
    assert!(history.has_entry(&p("b")));
    assert_eq!(
        Some(Bytes::from_static(b"b")),
        gateway.read(&p("b")).await.unwrap()
    );
}

#[tokio::test]
async fn revert_to_unknown_version() {
    let (history, _) = temporary().await;
    assert!(matches!(
        history
            .revert(3, RevertScope::Everything, &MemoryGateway::new())
            .await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn revert_on_disk() {
    let live = TempDir::new().unwrap();
    let history = LocalHistory::new_temporary(HistoryConfig::default())
        .await
        .unwrap();
    let gateway = HostFsGateway::new(live.path());

    std::fs::create_dir(live.path().join("d")).unwrap();
    std::fs::write(live.path().join("d/f"), b"one").unwrap();
    let v1 = history
        .apply(Command::new(vec![created("d/f", b"one".as_slice())]))
        .await
        .unwrap()
        .unwrap();

    std::fs::remove_dir_all(live.path().join("d")).unwrap();
    std::fs::write(live.path().join("d"), b"a file now").unwrap();
    history
        .apply(Command::new(vec![
            FeedEvent::Deleted { path: p("d") },
            created("d", b"a file now".as_slice()),
        ]))
        .await
        .unwrap();

    let report = history
        .revert(v1, RevertScope::Everything, &gateway)
        .await
        .unwrap();
    assert_eq!(RevertState::Done, report.state, "{:?}", report.failure);
    assert!(live.path().join("d").is_dir());
    assert_eq!(b"one".to_vec(), std::fs::read(live.path().join("d/f")).unwrap());
    assert!(history.find_entry(&p("d")).unwrap().is_directory());
}
