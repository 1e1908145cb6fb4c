use async_trait::async_trait;
use bytes::Bytes;

use crate::{B3Digest, Error};

mod from_addr;
mod memory;
mod simplefs;


pub use self::from_addr::from_addr;
pub use self::memory::MemoryContentStore;
pub use self::simplefs::SimpleFilesystemContentStore;

/// The base trait all content stores need to implement.
///
/// Payloads are addressed by their blake3 digest and are immutable once
/// written. Every digest ever returned by [ContentStore::put] must stay
/// readable for the lifetime of the store; nothing is garbage collected.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Check if the store has the payload, by its content hash.
    async fn has(&self, digest: &B3Digest) -> Result<bool, Error>;

    /// Request a payload from the store, by its content hash.
    /// Returns Ok(None) if there's no such payload.
    /// Implementations must not hand out bytes that don't match the digest.
    async fn get(&self, digest: &B3Digest) -> Result<Option<Bytes>, Error>;

    /// Insert a payload into the store and return its digest.
    /// Writing a payload that's already present is a no-op.
    async fn put(&self, data: Bytes) -> Result<B3Digest, Error>;
}

#[async_trait]
impl<A> ContentStore for A
where
    A: AsRef<dyn ContentStore> + Send + Sync,
{
    async fn has(&self, digest: &B3Digest) -> Result<bool, Error> {
        self.as_ref().has(digest).await
    }

    async fn get(&self, digest: &B3Digest) -> Result<Option<Bytes>, Error> {
        self.as_ref().get(digest).await
    }

    async fn put(&self, data: Bytes) -> Result<B3Digest, Error> {
        self.as_ref().put(data).await
    }
}

/// Checks a payload read back from a backend against the digest it was
/// requested by.
pub(crate) fn verify(digest: &B3Digest, data: &[u8]) -> Result<(), Error> {
    let actual = B3Digest::of(data);
    if &actual != digest {
        return Err(Error::Corruption(format!(
            "requested content {} but got {}",
            digest, actual
        )));
    }
    Ok(())
}
