use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::instrument;

use super::ChangeLog;
use crate::{changes::ChangeSet, Error};

/// Keeps all change sets in memory. Nothing survives the process.
#[derive(Clone, Default)]
pub struct MemoryChangeLog {
    change_sets: Arc<RwLock<Vec<ChangeSet>>>,
}

#[async_trait]
impl ChangeLog for MemoryChangeLog {
    #[instrument(skip_all, err, fields(change_set.version = change_set.version))]
    async fn append(&self, change_set: &ChangeSet) -> Result<(), Error> {
        let mut change_sets = self.change_sets.write();
        super::check_next_version(change_sets.len() as u64, change_set)?;
        change_sets.push(change_set.clone());

        Ok(())
    }

    fn read_from(&self, version: u64) -> BoxStream<'static, Result<ChangeSet, Error>> {
        let skip = version.saturating_sub(1) as usize;
        let change_sets = self
            .change_sets
            .read()
            .iter()
            .skip(skip)
            .cloned()
            .collect::<Vec<_>>();

        stream::iter(change_sets.into_iter().map(Ok)).boxed()
    }

    fn current_version(&self) -> u64 {
        self.change_sets.read().len() as u64
    }
}
