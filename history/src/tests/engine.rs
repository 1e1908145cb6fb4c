use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use rstest::*;
use rstest_reuse::{self, *};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::{Notify, Semaphore};

use super::{changed, created, current_content, moved, p, persistent, temporary};
use crate::changelog::{ChangeLog, MemoryChangeLog};
use crate::changes::ChangeSet;
use crate::content::Content;
use crate::contentstore::{ContentStore, MemoryContentStore};
use crate::feed::{Command, EventPayload, FeedEvent, GroupingPolicy, TrackAll};
use crate::fixtures::{AT_THRESHOLD, HELLOWORLD_CONTENTS, PAST_THRESHOLD};
use crate::index::RedbIndex;
use crate::labels::LabelKind;
use crate::{B3Digest, Error, HistoryConfig, LocalHistory};

#[template]
#[rstest]
#[case::temporary(temporary().await)]
#[case::persistent(persistent().await)]
pub fn histories(#[case] history: (LocalHistory, Option<TempDir>)) {}

#[apply(histories)]
#[tokio::test]
async fn create_then_has_entry(history: (LocalHistory, Option<TempDir>)) {
    let (history, _tmpdir) = history;

    history
        .submit(Command::new(vec![created("a/b.txt", HELLOWORLD_CONTENTS)]))
        .expect("must submit");
    history.flush().await.expect("must flush");

    assert!(history.has_entry(&p("a")));
    assert!(history.has_entry(&p("a/b.txt")));
    assert_eq!(
        Some(Bytes::from_static(HELLOWORLD_CONTENTS)),
        current_content(&history, "a/b.txt").await
    );

    let listing = history.list_directory(&p("a")).expect("must be a directory");
    assert_eq!(1, listing.len());
    assert_eq!(Some(p("a/b.txt")), history.path_of(listing[0].id));
    assert_eq!(1, history.current_version());
}

#[apply(histories)]
#[tokio::test]
async fn snapshot_isolation(history: (LocalHistory, Option<TempDir>)) {
    let (history, _tmpdir) = history;

    let v1 = history
        .apply(Command::new(vec![created("f", b"1".as_slice())]))
        .await
        .unwrap()
        .expect("must produce a version");
    let v2 = history
        .apply(Command::new(vec![changed("f", b"2".as_slice()), created("g", b"g".as_slice())]))
        .await
        .unwrap()
        .expect("must produce a version");
    assert_eq!((1, 2), (v1, v2));

    let r1 = history.revision_at(v1).await.unwrap().expect("must exist");
    let r2 = history.revision_at(v2).await.unwrap().expect("must exist");

    let f1 = r1.find_entry(&p("f")).unwrap();
    let f2 = r2.find_entry(&p("f")).unwrap();
    assert_eq!(f1.id, f2.id);
    assert_eq!(Some(Bytes::from_static(b"1")), history.content(&f1).await.unwrap());
    assert_eq!(Some(Bytes::from_static(b"2")), history.content(&f2).await.unwrap());
    assert!(!r1.has_entry(&p("g")));
    assert!(r2.has_entry(&p("g")));

    assert!(history.revision_at(v2 + 1).await.unwrap().is_none());
    let empty = history.revision_at(0).await.unwrap().expect("version 0 exists");
    assert!(!empty.has_entry(&p("f")));
}

#[apply(histories)]
#[tokio::test]
async fn inline_threshold_boundary(history: (LocalHistory, Option<TempDir>)) {
    let (history, _tmpdir) = history;

    history
        .apply(Command::new(vec![
            created("at", AT_THRESHOLD.clone()),
            created("past", PAST_THRESHOLD.clone()),
        ]))
        .await
        .unwrap();

    let at = history.find_entry(&p("at")).unwrap();
    assert!(matches!(at.content(), Some(Content::Inline(_))));
    assert!(!history
        .store()
        .has(&B3Digest::of(&AT_THRESHOLD))
        .await
        .unwrap());

    let past = history.find_entry(&p("past")).unwrap();
    assert!(matches!(past.content(), Some(Content::Stored { .. })));
    assert!(history
        .store()
        .has(&B3Digest::of(&PAST_THRESHOLD))
        .await
        .unwrap());

    assert_eq!(Some(AT_THRESHOLD.clone()), history.content(&at).await.unwrap());
    assert_eq!(Some(PAST_THRESHOLD.clone()), history.content(&past).await.unwrap());
}

#[apply(histories)]
#[tokio::test]
async fn rename_scenario(history: (LocalHistory, Option<TempDir>)) {
    let (history, _tmpdir) = history;

    history
        .apply(Command::new(vec![created("a.txt", b"x".as_slice())]))
        .await
        .unwrap();
    history
        .apply(Command::new(vec![moved("a.txt", "b.txt")]))
        .await
        .unwrap();

    assert!(!history.has_entry(&p("a.txt")));
    assert!(history.has_entry(&p("b.txt")));

    let labels = history.labels_for(&p("b.txt")).await.unwrap();
    assert_eq!(1, labels.len());
    assert_eq!(2, labels[0].version);

    // the old name was touched by both
    assert_eq!(2, history.labels_for(&p("a.txt")).await.unwrap().len());
}

#[apply(histories)]
#[tokio::test]
async fn directory_changes_count_for_descendants(history: (LocalHistory, Option<TempDir>)) {
    let (history, _tmpdir) = history;

    history
        .apply(Command::new(vec![created("d/f", b"x".as_slice())]))
        .await
        .unwrap();
    history
        .apply(Command::new(vec![created("other", b"y".as_slice())]))
        .await
        .unwrap();
    history
        .apply(Command::new(vec![moved("d", "e")]))
        .await
        .unwrap();

    let versions = |labels: Vec<crate::labels::Label>| {
        labels.into_iter().map(|l| l.version).collect::<Vec<_>>()
    };
    assert_eq!(vec![3, 1], versions(history.labels_for(&p("d/f")).await.unwrap()));
    assert_eq!(vec![3], versions(history.labels_for(&p("e/f")).await.unwrap()));
    assert_eq!(vec![3, 2, 1], versions(history.log().await.unwrap()));
}

#[apply(histories)]
#[tokio::test]
async fn labels(history: (LocalHistory, Option<TempDir>)) {
    let (history, _tmpdir) = history;

    history
        .apply(Command::named(vec![created("f", b"1".as_slice())], "first"))
        .await
        .unwrap();
    history
        .apply(Command::new(vec![created("g", b"1".as_slice())]))
        .await
        .unwrap();
    let checkpoint = history.put_label("checkpoint").await.unwrap();
    assert_eq!(3, checkpoint);

    let explicit = history
        .label_change_set(1, Some("release".into()))
        .await
        .unwrap();
    assert_eq!(LabelKind::Explicit, explicit.kind);

    let labels = history.labels_for(&p("f")).await.unwrap();
    let summary = labels
        .iter()
        .map(|l| (l.version, l.name.as_deref(), l.kind))
        .collect::<Vec<_>>();
    assert_eq!(
        vec![
            (3, Some("checkpoint"), LabelKind::Implicit),
            (1, Some("release"), LabelKind::Explicit),
            (1, Some("first"), LabelKind::Implicit),
        ],
        summary
    );

    // the checkpoint label shows up for any path, even unknown ones
    assert_eq!(1, history.labels_for(&p("nope")).await.unwrap().len());

    assert!(matches!(
        history.label_change_set(0, None).await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        history.label_change_set(4, None).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn submit_errors_surface_on_flush() {
    let (history, _) = temporary().await;

    history
        .submit(Command::new(vec![FeedEvent::Created {
            path: p("d"),
            payload: EventPayload::Directory,
        }]))
        .unwrap();
    // a directory has no content
    history
        .submit(Command::new(vec![changed("d", b"x".as_slice())]))
        .unwrap();
    history
        .submit(Command::new(vec![created("f", b"x".as_slice())]))
        .unwrap();

    assert!(matches!(history.flush().await, Err(Error::Conflict(_))));
    // later commands went through, and the error was reported once
    assert!(history.has_entry(&p("f")));
    assert_eq!(2, history.current_version());
    history.flush().await.expect("nothing new failed");
}

#[tokio::test]
async fn rejected_batch_publishes_nothing() {
    let (history, _) = temporary().await;
    history
        .apply(Command::new(vec![FeedEvent::Created {
            path: p("d"),
            payload: EventPayload::Directory,
        }]))
        .await
        .unwrap();

    let result = history
        .apply(Command::new(vec![
            created("f", b"x".as_slice()),
            changed("d", b"x".as_slice()),
        ]))
        .await;
    assert!(matches!(result, Err(Error::Conflict(_))));
    assert!(!history.has_entry(&p("f")));
    assert_eq!(1, history.current_version());
}

#[tokio::test]
async fn unchanged_content_produces_nothing() {
    let (history, _) = temporary().await;
    history
        .apply(Command::new(vec![created("f", b"x".as_slice())]))
        .await
        .unwrap();

    assert_eq!(
        None,
        history
            .apply(Command::new(vec![changed("f", b"x".as_slice())]))
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn excluded_paths_are_not_tracked() {
    let (history, _) = temporary().await;
    history
        .apply(Command::new(vec![
            created(".git/HEAD", b"ref".as_slice()),
            created("src/lib.rs", b"".as_slice()),
        ]))
        .await
        .unwrap();

    assert!(!history.has_entry(&p(".git")));
    assert!(history.has_entry(&p("src/lib.rs")));
}

#[rstest]
#[case::per_command(GroupingPolicy::PerCommand, 1)]
#[case::per_event(GroupingPolicy::PerEvent, 3)]
#[tokio::test]
async fn grouping_policy(#[case] policy: GroupingPolicy, #[case] exp_versions: u64) {
    let config = HistoryConfig {
        grouping: policy,
        ..Default::default()
    };
    let history = LocalHistory::new_temporary(config).await.unwrap();

    let version = history
        .apply(Command::named(
            vec![
                created("a", b"a".as_slice()),
                created("b", b"b".as_slice()),
                created("c", b"c".as_slice()),
            ],
            "three files",
        ))
        .await
        .unwrap();

    assert_eq!(Some(exp_versions), version);
    let log = history.log().await.unwrap();
    assert_eq!(exp_versions as usize, log.len());
    assert!(log.iter().all(|l| l.name.as_deref() == Some("three files")));
}

/// Wraps a [MemoryChangeLog], holding every append until a permit is added.
struct GatedChangeLog {
    log: MemoryChangeLog,
    entered: Arc<Notify>,
    gate: Arc<Semaphore>,
}

#[async_trait]
impl ChangeLog for GatedChangeLog {
    async fn append(&self, change_set: &ChangeSet) -> Result<(), Error> {
        self.entered.notify_one();
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| Error::StorageError(e.to_string()))?;
        self.log.append(change_set).await
    }

    fn read_from(&self, version: u64) -> BoxStream<'static, Result<ChangeSet, Error>> {
        self.log.read_from(version)
    }

    fn current_version(&self) -> u64 {
        self.log.current_version()
    }
}

#[tokio::test]
async fn in_flight_is_invisible() {
    let entered = Arc::new(Notify::new());
    let gate = Arc::new(Semaphore::new(0));

    let history = LocalHistory::from_parts(
        HistoryConfig::default(),
        Arc::new(GatedChangeLog {
            log: MemoryChangeLog::default(),
            entered: entered.clone(),
            gate: gate.clone(),
        }),
        Arc::new(MemoryContentStore::default()),
        RedbIndex::new_temporary().unwrap(),
        Arc::new(TrackAll),
    )
    .await
    .unwrap();

    history
        .submit(Command::new(vec![created("f", b"x".as_slice())]))
        .unwrap();

    // the writer is in the middle of appending
    entered.notified().await;
    assert!(!history.has_entry(&p("f")));
    assert_eq!(0, history.current_version());
    assert!(history.revision_at(1).await.unwrap().is_none());

    gate.add_permits(1);
    history.flush().await.unwrap();
    assert!(history.has_entry(&p("f")));
    assert_eq!(1, history.current_version());
}

#[tokio::test]
async fn close_processes_pending() {
    let (history, _) = temporary().await;
    history
        .submit(Command::new(vec![created("f", b"x".as_slice())]))
        .unwrap();
    history.close().await.expect("must close");
}
