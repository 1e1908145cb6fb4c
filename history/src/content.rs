use bytes::Bytes;
use tracing::{instrument, trace};

use crate::{contentstore::ContentStore, B3Digest, Error};

/// Payloads of at most this many bytes are kept inline.
pub const DEFAULT_INLINE_THRESHOLD: usize = 4096;

/// The payload of a file entry.
///
/// Small payloads live directly in the entry (and in the log record that
/// produced it). Larger ones are written to a [ContentStore] and referenced by
/// their digest.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Content {
    Inline(Bytes),
    Stored { digest: B3Digest, size: u64 },
}

impl Content {
    /// Builds the content reference for a payload, writing it to the store if
    /// it's larger than `threshold`.
    #[instrument(skip_all, err, fields(content.size = data.len()))]
    pub async fn from_bytes<CS: ContentStore + ?Sized>(
        data: Bytes,
        threshold: usize,
        store: &CS,
    ) -> Result<Self, Error> {
        if data.len() <= threshold {
            return Ok(Content::Inline(data));
        }

        let size = data.len() as u64;
        let digest = store.put(data).await?;
        trace!(content.digest=%digest, "stored externally");

        Ok(Content::Stored { digest, size })
    }

    /// Returns the payload.
    /// A stored payload that the store can't produce is [Error::Corruption].
    pub async fn load<CS: ContentStore + ?Sized>(&self, store: &CS) -> Result<Bytes, Error> {
        match self {
            Content::Inline(data) => Ok(data.clone()),
            Content::Stored { digest, size } => {
                let data = store.get(digest).await?.ok_or_else(|| {
                    Error::Corruption(format!("content {} missing from store", digest))
                })?;

                if data.len() as u64 != *size {
                    return Err(Error::Corruption(format!(
                        "content {} has size {}, expected {}",
                        digest,
                        data.len(),
                        size
                    )));
                }

                Ok(data)
            }
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            Content::Inline(data) => data.len() as u64,
            Content::Stored { size, .. } => *size,
        }
    }

    /// Whether this reference describes exactly the given payload.
    pub fn matches(&self, data: &[u8]) -> bool {
        match self {
            Content::Inline(inline) => inline.as_ref() == data,
            Content::Stored { digest, size } => {
                *size == data.len() as u64 && B3Digest::of(data) == *digest
            }
        }
    }
}

impl std::fmt::Debug for Content {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Content::Inline(data) => write!(f, "Inline({} bytes)", data.len()),
            Content::Stored { digest, size } => write!(f, "Stored({}, {} bytes)", digest, size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Content, DEFAULT_INLINE_THRESHOLD};
    use crate::contentstore::MemoryContentStore;
    use crate::fixtures::{AT_THRESHOLD, HELLOWORLD_CONTENTS, PAST_THRESHOLD};
    use crate::Error;
    use bytes::Bytes;

    #[tokio::test]
    async fn small_payload_stays_inline() {
        let store = MemoryContentStore::default();
        let content = Content::from_bytes(
            Bytes::from_static(HELLOWORLD_CONTENTS),
            DEFAULT_INLINE_THRESHOLD,
            &store,
        )
        .await
        .unwrap();

        assert_eq!(Content::Inline(Bytes::from_static(HELLOWORLD_CONTENTS)), content);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn threshold_boundary() {
        let store = MemoryContentStore::default();

        let at = Content::from_bytes(AT_THRESHOLD.clone(), DEFAULT_INLINE_THRESHOLD, &store)
            .await
            .unwrap();
        assert!(matches!(at, Content::Inline(_)));
        assert!(store.is_empty(), "no store entry at the threshold");

        let past = Content::from_bytes(PAST_THRESHOLD.clone(), DEFAULT_INLINE_THRESHOLD, &store)
            .await
            .unwrap();
        assert!(matches!(past, Content::Stored { .. }));
        assert_eq!(1, store.len());

        assert_eq!(*PAST_THRESHOLD, past.load(&store).await.unwrap());
        assert!(past.matches(&PAST_THRESHOLD));
        assert!(!past.matches(&AT_THRESHOLD));
    }

    #[tokio::test]
    async fn missing_blob_is_corruption() {
        let writer = MemoryContentStore::default();
        let content = Content::from_bytes(PAST_THRESHOLD.clone(), 0, &writer)
            .await
            .unwrap();

        let empty = MemoryContentStore::default();
        assert!(matches!(
            content.load(&empty).await,
            Err(Error::Corruption(_))
        ));
    }
}
