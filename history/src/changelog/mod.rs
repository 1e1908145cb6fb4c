use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::{changes::ChangeSet, Error};

mod file;
mod memory;

#[cfg(test)]
mod tests;

pub use self::file::FileChangeLog;
pub use self::memory::MemoryChangeLog;

/// The ordered, durable sequence of change sets.
///
/// There is exactly one writer per log. Readers may stream the log
/// concurrently; a stream covers the versions present when it was created.
#[async_trait]
pub trait ChangeLog: Send + Sync {
    /// Appends a change set, returning once it is durable.
    /// Its version must be exactly one above [ChangeLog::current_version],
    /// anything else is rejected with [Error::Conflict].
    async fn append(&self, change_set: &ChangeSet) -> Result<(), Error>;

    /// Streams all change sets with a version at or above `version`, in
    /// ascending order.
    fn read_from(&self, version: u64) -> BoxStream<'static, Result<ChangeSet, Error>>;

    /// The version of the last appended change set, 0 for an empty log.
    fn current_version(&self) -> u64;
}

#[async_trait]
impl<A> ChangeLog for A
where
    A: AsRef<dyn ChangeLog> + Send + Sync,
{
    async fn append(&self, change_set: &ChangeSet) -> Result<(), Error> {
        self.as_ref().append(change_set).await
    }

    fn read_from(&self, version: u64) -> BoxStream<'static, Result<ChangeSet, Error>> {
        self.as_ref().read_from(version)
    }

    fn current_version(&self) -> u64 {
        self.as_ref().current_version()
    }
}

fn check_next_version(current: u64, change_set: &ChangeSet) -> Result<(), Error> {
    if change_set.version != current + 1 {
        return Err(Error::Conflict(format!(
            "can't append version {} after {}",
            change_set.version, current
        )));
    }
    Ok(())
}
