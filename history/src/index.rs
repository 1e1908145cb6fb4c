use prost::Message;
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::BTreeMap;
use std::{path::PathBuf, sync::Arc};
use tracing::{debug, instrument, warn};

use crate::labels::{Label, LabelKind, Summary};
use crate::path;
use crate::tree::EntryTree;
use crate::{proto, Error};

/// version -> [proto::Summary]
pub(crate) const SUMMARIES_TABLE: TableDefinition<u64, Vec<u8>> = TableDefinition::new("summaries");
/// label id -> [proto::Label]
const LABELS_TABLE: TableDefinition<u64, Vec<u8>> = TableDefinition::new("labels");
/// version -> [proto::Tree]
const CHECKPOINTS_TABLE: TableDefinition<u64, Vec<u8>> = TableDefinition::new("checkpoints");

/// Summaries, explicit labels and checkpointed trees, kept in a redb database.
///
/// Everything in here can be rebuilt from the change log, except for explicit
/// labels.
#[derive(Clone)]
pub struct RedbIndex {
    // We wrap the db in an Arc to be able to move it into spawn_blocking,
    // as discussed in https://github.com/cberner/redb/issues/789
    db: Arc<Database>,
}

impl RedbIndex {
    /// Opens (or creates) the index at the given path.
    pub async fn new(path: PathBuf) -> Result<Self, Error> {
        if path == PathBuf::from("/") {
            return Err(Error::StorageError(
                "cowardly refusing to open / with redb".to_string(),
            ));
        }

        let db = tokio::task::spawn_blocking(|| -> Result<_, redb::Error> {
            let db = redb::Database::create(path)?;
            create_schema(&db)?;
            Ok(db)
        })
        .await??;

        Ok(Self { db: Arc::new(db) })
    }

    /// Constructs a new instance using the in-memory backend.
    pub fn new_temporary() -> Result<Self, Error> {
        let db =
            redb::Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;

        create_schema(&db)?;

        Ok(Self { db: Arc::new(db) })
    }

    #[instrument(skip_all, err, fields(summary.version = summary.version))]
    pub async fn put_summary(&self, summary: Summary) -> Result<(), Error> {
        self.put_summaries(vec![summary]).await
    }

    /// Stores several summaries in one transaction.
    pub async fn put_summaries(&self, summaries: Vec<Summary>) -> Result<(), Error> {
        let db = self.db.clone();

        tokio::task::spawn_blocking(move || -> Result<(), Error> {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(SUMMARIES_TABLE)?;
                for summary in summaries {
                    let encoded = proto::Summary {
                        timestamp: summary.timestamp,
                        name: summary.name,
                        touched: summary
                            .touched
                            .into_iter()
                            .map(|p| p.into_bytes().into())
                            .collect(),
                    }
                    .encode_to_vec();
                    table.insert(summary.version, encoded)?;
                }
            }
            Ok(txn.commit()?)
        })
        .await?
    }

    /// The highest version `v` at or below `up_to` such that every version in
    /// `1..=v` has a summary. 0 if version 1 has none.
    pub async fn summarized_up_to(&self, up_to: u64) -> Result<u64, Error> {
        let db = self.db.clone();

        tokio::task::spawn_blocking(move || -> Result<u64, Error> {
            let txn = db.begin_read()?;
            let table = txn.open_table(SUMMARIES_TABLE)?;

            let mut contiguous = 0;
            for elem in table.range(1..=up_to)? {
                let (version, _) = elem?;
                if version.value() != contiguous + 1 {
                    debug!(missing = contiguous + 1, "gap in summaries");
                    break;
                }
                contiguous += 1;
            }
            Ok(contiguous)
        })
        .await?
    }

    /// Summaries at or below `up_to`, newest first. With a path given, only
    /// those of change sets touching the path (or one of its ancestors).
    #[instrument(skip(self), err)]
    pub async fn summaries(
        &self,
        up_to: u64,
        path: Option<path::PathBuf>,
    ) -> Result<Vec<Summary>, Error> {
        let db = self.db.clone();

        tokio::task::spawn_blocking(move || -> Result<Vec<Summary>, Error> {
            let txn = db.begin_read()?;
            let table = txn.open_table(SUMMARIES_TABLE)?;

            let mut summaries = Vec::new();
            for elem in table.range(..=up_to)?.rev() {
                let (version, data) = elem?;
                let summary = decode_summary(version.value(), &data.value())?;
                if path.as_ref().map_or(true, |p| summary.touches(p)) {
                    summaries.push(summary);
                }
            }
            Ok(summaries)
        })
        .await?
    }

    /// Stores an explicit label.
    #[instrument(skip_all, err, fields(label.version = label.version))]
    pub async fn put_label(&self, label: Label) -> Result<(), Error> {
        let db = self.db.clone();

        tokio::task::spawn_blocking(move || -> Result<(), Error> {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(LABELS_TABLE)?;
                let id = table.last()?.map(|(k, _)| k.value() + 1).unwrap_or(0);
                table.insert(
                    id,
                    proto::Label {
                        version: label.version,
                        name: label.name,
                        timestamp: label.timestamp,
                    }
                    .encode_to_vec(),
                )?;
            }
            Ok(txn.commit()?)
        })
        .await?
    }

    /// All explicit labels, grouped by version, in creation order.
    pub async fn explicit_labels(&self) -> Result<BTreeMap<u64, Vec<Label>>, Error> {
        let db = self.db.clone();

        tokio::task::spawn_blocking(move || -> Result<_, Error> {
            let txn = db.begin_read()?;
            let table = txn.open_table(LABELS_TABLE)?;

            let mut labels: BTreeMap<u64, Vec<Label>> = BTreeMap::new();
            for elem in table.iter()? {
                let (_, data) = elem?;
                let label = proto::Label::decode(data.value().as_slice()).map_err(|e| {
                    warn!(err=%e, "failed to decode label");
                    Error::Corruption(format!("invalid label: {}", e))
                })?;
                labels.entry(label.version).or_default().push(Label {
                    version: label.version,
                    name: label.name,
                    timestamp: label.timestamp,
                    kind: LabelKind::Explicit,
                });
            }
            Ok(labels)
        })
        .await?
    }

    #[instrument(skip(self, tree), err)]
    pub async fn put_checkpoint(&self, version: u64, tree: &EntryTree) -> Result<(), Error> {
        let encoded = proto::Tree::from(tree).encode_to_vec();
        let db = self.db.clone();

        tokio::task::spawn_blocking(move || -> Result<(), Error> {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(CHECKPOINTS_TABLE)?;
                table.insert(version, encoded)?;
            }
            Ok(txn.commit()?)
        })
        .await?
    }

    /// The newest checkpoint at or below `version`.
    #[instrument(skip(self), err)]
    pub async fn checkpoint_at_or_below(
        &self,
        version: u64,
    ) -> Result<Option<(u64, EntryTree)>, Error> {
        let db = self.db.clone();

        tokio::task::spawn_blocking(move || -> Result<_, Error> {
            let txn = db.begin_read()?;
            let table = txn.open_table(CHECKPOINTS_TABLE)?;

            let Some(elem) = table.range(..=version)?.next_back() else {
                return Ok(None);
            };
            let (version, data) = elem?;

            let tree: EntryTree = proto::Tree::decode(data.value().as_slice())
                .map_err(|e| Error::Corruption(format!("invalid checkpoint: {}", e)))?
                .try_into()?;

            Ok(Some((version.value(), tree)))
        })
        .await?
    }

    /// Drops everything that refers to versions above `version`, which the
    /// change log no longer has.
    #[instrument(skip(self), err)]
    pub async fn truncate_above(&self, version: u64) -> Result<(), Error> {
        let db = self.db.clone();

        tokio::task::spawn_blocking(move || -> Result<(), Error> {
            let txn = db.begin_write()?;
            let mut dropped = 0;
            {
                for definition in [SUMMARIES_TABLE, CHECKPOINTS_TABLE] {
                    let mut table = txn.open_table(definition)?;
                    let stale = table
                        .range(version + 1..)?
                        .map(|elem| elem.map(|(k, _)| k.value()))
                        .collect::<Result<Vec<_>, _>>()?;
                    for key in stale {
                        table.remove(key)?;
                        dropped += 1;
                    }
                }

                let mut table = txn.open_table(LABELS_TABLE)?;
                let mut stale = Vec::new();
                for elem in table.iter()? {
                    let (id, data) = elem?;
                    let label = proto::Label::decode(data.value().as_slice())
                        .map_err(|e| Error::Corruption(format!("invalid label: {}", e)))?;
                    if label.version > version {
                        stale.push(id.value());
                    }
                }
                for id in stale {
                    table.remove(id)?;
                    dropped += 1;
                }
            }
            txn.commit()?;

            if dropped > 0 {
                warn!(dropped, "dropped index entries above the change log");
            } else {
                debug!("index consistent with change log");
            }
            Ok(())
        })
        .await?
    }
}

fn decode_summary(version: u64, data: &[u8]) -> Result<Summary, Error> {
    let summary = proto::Summary::decode(data).map_err(|e| {
        warn!(err=%e, version, "failed to decode summary");
        Error::Corruption(format!("invalid summary for version {}: {}", version, e))
    })?;

    Ok(Summary {
        version,
        timestamp: summary.timestamp,
        name: summary.name,
        touched: proto::decode_touched(&summary.touched)?,
    })
}

/// Ensures all tables are present.
fn create_schema(db: &redb::Database) -> Result<(), redb::Error> {
    let txn = db.begin_write()?;
    txn.open_table(SUMMARIES_TABLE)?;
    txn.open_table(LABELS_TABLE)?;
    txn.open_table(CHECKPOINTS_TABLE)?;
    txn.commit()?;

    Ok(())
}
